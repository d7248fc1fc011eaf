use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tracing::debug;
use transcoder_core::{
    models::{Job, JobStatus},
    traits::JobRepository,
    TranscoderError, TranscoderResult,
};

use super::claim::{self, PENDING_JOBS};
use super::manager::{with_pool, DatabasePool};

const JOB_COLUMNS: &str = "key, priority, input, destination, notification, metadata, config, \
    outcome, status, progress, locked_by, try_count, try_max, retry_in, retry_at, started_at, \
    analyzed_at, completed_at, updated_at, created_at";

pub struct SqlJobRepository {
    pool: DatabasePool,
}

impl SqlJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    fn in_flight_list() -> String {
        JobStatus::IN_FLIGHT
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[async_trait]
impl JobRepository for SqlJobRepository {
    async fn get(&self, key: &str) -> TranscoderResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE key = $1");
        let job = with_pool!(&self.pool, p => {
            sqlx::query_as::<_, Job>(&sql).bind(key).fetch_optional(p).await
        })
        .map_err(TranscoderError::Database)?;
        Ok(job)
    }

    async fn create(&self, job: &Job) -> TranscoderResult<()> {
        let sql = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        );
        with_pool!(&self.pool, p => {
            sqlx::query(&sql)
                .bind(&job.key)
                .bind(job.priority)
                .bind(Json(&job.input))
                .bind(Json(&job.destination))
                .bind(Json(&job.notification))
                .bind(Json(&job.metadata))
                .bind(Json(&job.config))
                .bind(Json(&job.outcome))
                .bind(job.status)
                .bind(job.progress)
                .bind(job.locked_by.as_deref())
                .bind(job.try_count)
                .bind(job.try_max)
                .bind(job.retry_in)
                .bind(job.retry_at)
                .bind(job.started_at)
                .bind(job.analyzed_at)
                .bind(job.completed_at)
                .bind(job.updated_at)
                .bind(job.created_at)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;

        debug!("创建任务成功: {}", job.key);
        Ok(())
    }

    async fn update(&self, job: &Job) -> TranscoderResult<()> {
        let affected = with_pool!(&self.pool, p => {
            sqlx::query(
                r#"
                UPDATE jobs SET
                    priority = $2, input = $3, destination = $4, notification = $5,
                    metadata = $6, config = $7, outcome = $8, status = $9, progress = $10,
                    locked_by = $11, try_count = $12, try_max = $13, retry_in = $14,
                    retry_at = $15, started_at = $16, analyzed_at = $17, completed_at = $18,
                    updated_at = $19
                WHERE key = $1
                "#,
            )
            .bind(&job.key)
            .bind(job.priority)
            .bind(Json(&job.input))
            .bind(Json(&job.destination))
            .bind(Json(&job.notification))
            .bind(Json(&job.metadata))
            .bind(Json(&job.config))
            .bind(Json(&job.outcome))
            .bind(job.status)
            .bind(job.progress)
            .bind(job.locked_by.as_deref())
            .bind(job.try_count)
            .bind(job.try_max)
            .bind(job.retry_in)
            .bind(job.retry_at)
            .bind(job.started_at)
            .bind(job.analyzed_at)
            .bind(job.completed_at)
            .bind(job.updated_at)
            .execute(p)
            .await
            .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;

        if affected == 0 {
            return Err(TranscoderError::JobNotFound {
                key: job.key.clone(),
            });
        }
        debug!("更新任务 {} -> {} ({:.1}%)", job.key, job.status, job.progress);
        Ok(())
    }

    async fn touch(&self, key: &str, progress: f64, now: DateTime<Utc>) -> TranscoderResult<()> {
        with_pool!(&self.pool, p => {
            sqlx::query("UPDATE jobs SET progress = $2, updated_at = $3 WHERE key = $1")
                .bind(key)
                .bind(progress)
                .bind(now)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(())
    }

    async fn claim_pending(
        &self,
        owner: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>> {
        claim::claim_batch(&self.pool, &PENDING_JOBS, owner, limit, now).await
    }

    async fn release_claims(&self, owner: &str, keys: &[String]) -> TranscoderResult<u64> {
        claim::release_claims(&self.pool, &PENDING_JOBS, owner, keys).await
    }

    async fn timeout_queued(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<(String, JobStatus)>> {
        let (requeued, failed) = with_pool!(&self.pool, p => {
            let requeued = sqlx::query_scalar::<_, String>(
                r#"
                UPDATE jobs SET status = $1, try_count = try_count + 1, locked_by = NULL, updated_at = $2
                WHERE status = $3 AND updated_at < $4 AND try_count < try_max
                RETURNING key
                "#,
            )
            .bind(JobStatus::Pending)
            .bind(now)
            .bind(JobStatus::Queued)
            .bind(cutoff)
            .fetch_all(p)
            .await;

            match requeued {
                Ok(requeued) => sqlx::query_scalar::<_, String>(
                    r#"
                    UPDATE jobs SET status = $1, locked_by = NULL, updated_at = $2
                    WHERE status = $3 AND updated_at < $4 AND try_count >= try_max
                    RETURNING key
                    "#,
                )
                .bind(JobStatus::Failed)
                .bind(now)
                .bind(JobStatus::Queued)
                .bind(cutoff)
                .fetch_all(p)
                .await
                .map(|failed| (requeued, failed)),
                Err(e) => Err(e),
            }
        })
        .map_err(TranscoderError::Database)?;

        let swept = requeued
            .into_iter()
            .map(|key| (key, JobStatus::Pending))
            .chain(failed.into_iter().map(|key| (key, JobStatus::Failed)))
            .collect::<Vec<_>>();
        Ok(swept)
    }

    async fn timeout_processing(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>> {
        let sql = format!(
            "UPDATE jobs SET status = $1, progress = 0, updated_at = $2 \
             WHERE status IN ({}) AND updated_at < $3 AND try_count > 0 \
             RETURNING key",
            Self::in_flight_list()
        );
        let keys = with_pool!(&self.pool, p => {
            sqlx::query_scalar::<_, String>(&sql)
                .bind(JobStatus::Timeout)
                .bind(now)
                .bind(cutoff)
                .fetch_all(p)
                .await
        })
        .map_err(TranscoderError::Database)?;
        Ok(keys)
    }

    async fn find_completed_before(&self, cutoff: DateTime<Utc>) -> TranscoderResult<Vec<String>> {
        let keys = with_pool!(&self.pool, p => {
            sqlx::query_scalar::<_, String>(
                "SELECT key FROM jobs WHERE status = $1 AND COALESCE(completed_at, updated_at) < $2",
            )
            .bind(JobStatus::Completed)
            .bind(cutoff)
            .fetch_all(p)
            .await
        })
        .map_err(TranscoderError::Database)?;
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> TranscoderResult<u64> {
        let mut affected = 0;
        for key in keys {
            affected += with_pool!(&self.pool, p => {
                sqlx::query("DELETE FROM jobs WHERE key = $1")
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
    use chrono::Duration;
    use transcoder_core::models::{InputSource, JobInput, JobOutcome};

    fn job(key: &str, priority: i32, created_at: DateTime<Utc>) -> Job {
        let mut job = Job::new(
            key,
            JobInput::new(InputSource::Http {
                url: format!("https://cdn.example.com/{key}.mp4"),
                headers: Default::default(),
            }),
            created_at,
        );
        job.priority = priority;
        job
    }

    #[tokio::test]
    async fn test_job_round_trips_through_database() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.job_repository();
        let now = Utc::now();

        let mut original = job("job-1", 5, now);
        original.outcome = Some(JobOutcome::new("boom"));
        original.metadata = serde_json::json!({"tenant": "acme"});
        repo.create(&original).await.unwrap();

        let loaded = repo.get("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.priority, 5);
        assert_eq!(loaded.input, original.input);
        assert_eq!(loaded.outcome, original.outcome);
        assert!(loaded.notification.is_none());
        assert_eq!(loaded.metadata["tenant"], "acme");
        assert_eq!(loaded.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_update_missing_job_fails() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.job_repository();
        let result = repo.update(&job("ghost", 0, Utc::now())).await;
        assert!(matches!(result, Err(TranscoderError::JobNotFound { .. })));
    }

    #[tokio::test]
    async fn test_claim_respects_priority_and_retry_at() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.job_repository();
        let now = Utc::now();

        repo.create(&job("low", 10, now - Duration::seconds(30)))
            .await
            .unwrap();
        repo.create(&job("high", 1, now)).await.unwrap();

        let mut waiting = job("waiting", 0, now);
        waiting.status = JobStatus::Retrying;
        waiting.retry_at = Some(now + Duration::minutes(1));
        repo.create(&waiting).await.unwrap();

        let mut due = job("due", 0, now);
        due.status = JobStatus::Retrying;
        due.retry_at = Some(now - Duration::seconds(1));
        repo.create(&due).await.unwrap();

        let mut claimed = repo.claim_pending("i-1", 2, now).await.unwrap();
        claimed.sort();
        assert_eq!(claimed, vec!["due".to_string(), "high".to_string()]);

        // 已被认领的行不会被其他实例拿到
        let other = repo.claim_pending("i-2", 10, now).await.unwrap();
        assert_eq!(other, vec!["low".to_string()]);

        let released = repo.release_claims("i-1", &claimed).await.unwrap();
        assert_eq!(released, 2);
        assert!(repo.get("high").await.unwrap().unwrap().locked_by.is_none());
        // 他人的锁不能被释放
        assert_eq!(
            repo.release_claims("i-1", &["low".to_string()]).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_timeout_queued_requeues_within_budget() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.job_repository();
        let now = Utc::now();
        let stale_at = now - Duration::minutes(10);

        let mut retryable = job("retryable", 0, stale_at);
        retryable.status = JobStatus::Queued;
        retryable.try_count = 1;
        retryable.locked_by = Some("i-1".to_string());
        repo.create(&retryable).await.unwrap();

        let mut exhausted = job("exhausted", 0, stale_at);
        exhausted.status = JobStatus::Queued;
        exhausted.try_count = 3;
        repo.create(&exhausted).await.unwrap();

        let mut swept = repo
            .timeout_queued(now - Duration::minutes(5), now)
            .await
            .unwrap();
        swept.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            swept,
            vec![
                ("exhausted".to_string(), JobStatus::Failed),
                ("retryable".to_string(), JobStatus::Pending),
            ]
        );

        let retryable = repo.get("retryable").await.unwrap().unwrap();
        assert_eq!(retryable.status, JobStatus::Pending);
        assert_eq!(retryable.try_count, 2);
        assert!(retryable.locked_by.is_none());
        assert_eq!(repo.get("exhausted").await.unwrap().unwrap().try_count, 3);
    }

    #[tokio::test]
    async fn test_timeout_processing_only_touches_in_flight_jobs() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.job_repository();
        let now = Utc::now();
        let stale_at = now - Duration::hours(1);

        let mut hung = job("hung", 0, stale_at);
        hung.status = JobStatus::Processing;
        hung.try_count = 1;
        hung.progress = 60.0;
        repo.create(&hung).await.unwrap();

        let mut never_tried = job("never-tried", 0, stale_at);
        never_tried.status = JobStatus::Processing;
        repo.create(&never_tried).await.unwrap();

        let mut done = job("done", 0, stale_at);
        done.status = JobStatus::Completed;
        done.try_count = 1;
        repo.create(&done).await.unwrap();

        let keys = repo
            .timeout_processing(now - Duration::minutes(30), now)
            .await
            .unwrap();
        assert_eq!(keys, vec!["hung".to_string()]);

        let hung = repo.get("hung").await.unwrap().unwrap();
        assert_eq!(hung.status, JobStatus::Timeout);
        assert_eq!(hung.progress, 0.0);
    }
}
