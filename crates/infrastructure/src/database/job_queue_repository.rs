use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use transcoder_core::{
    models::QueueEntry, traits::JobQueueRepository, TranscoderError, TranscoderResult,
};

use super::claim::{self, QUEUED_JOBS};
use super::manager::{with_pool, DatabasePool};

pub struct SqlJobQueueRepository {
    pool: DatabasePool,
}

impl SqlJobQueueRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueueRepository for SqlJobQueueRepository {
    async fn push(&self, entry: &QueueEntry) -> TranscoderResult<()> {
        with_pool!(&self.pool, p => {
            sqlx::query(
                "INSERT INTO jobs_queue (key, priority, locked_by, created_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(&entry.key)
            .bind(entry.priority)
            .bind(entry.locked_by.as_deref())
            .bind(entry.created_at)
            .execute(p)
            .await
            .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;

        debug!("任务入队: {}", entry.key);
        Ok(())
    }

    async fn get(&self, key: &str) -> TranscoderResult<Option<QueueEntry>> {
        let entry = with_pool!(&self.pool, p => {
            sqlx::query_as::<_, QueueEntry>(
                "SELECT key, priority, locked_by, created_at FROM jobs_queue WHERE key = $1",
            )
            .bind(key)
            .fetch_optional(p)
            .await
        })
        .map_err(TranscoderError::Database)?;
        Ok(entry)
    }

    async fn claim(
        &self,
        owner: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>> {
        claim::claim_batch(&self.pool, &QUEUED_JOBS, owner, limit, now).await
    }

    async fn remove(&self, key: &str) -> TranscoderResult<()> {
        with_pool!(&self.pool, p => {
            sqlx::query("DELETE FROM jobs_queue WHERE key = $1")
                .bind(key)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(())
    }

    async fn release_claims(&self, owner: &str, keys: &[String]) -> TranscoderResult<u64> {
        claim::release_claims(&self.pool, &QUEUED_JOBS, owner, keys).await
    }

    async fn delete_by_jobs(&self, job_keys: &[String]) -> TranscoderResult<u64> {
        let mut affected = 0;
        for key in job_keys {
            affected += with_pool!(&self.pool, p => {
                sqlx::query("DELETE FROM jobs_queue WHERE key = $1")
                    .bind(key)
                    .execute(p)
                    .await
                    .map(|r| r.rows_affected())
            })
            .map_err(TranscoderError::Database)?;
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;

    #[tokio::test]
    async fn test_duplicate_push_is_rejected() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.job_queue_repository();
        let entry = QueueEntry::new("job-1", 0, Utc::now());

        repo.push(&entry).await.unwrap();
        assert!(repo.push(&entry).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_remove_release_cycle() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.job_queue_repository();
        let now = Utc::now();
        for (key, priority) in [("a", 5), ("b", 1), ("c", 3)] {
            repo.push(&QueueEntry::new(key, priority, now)).await.unwrap();
        }

        let mut claimed = repo.claim("i-1", 2, now).await.unwrap();
        claimed.sort();
        assert_eq!(claimed, vec!["b".to_string(), "c".to_string()]);

        repo.remove("b").await.unwrap();
        let released = repo.release_claims("i-1", &claimed).await.unwrap();
        assert_eq!(released, 1);

        assert!(repo.get("b").await.unwrap().is_none());
        assert!(repo.get("c").await.unwrap().unwrap().locked_by.is_none());
    }
}
