use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use transcoder_core::{
    models::{Worker, WorkerStatus},
    traits::WorkerRepository,
    TranscoderError, TranscoderResult,
};

use super::manager::{with_pool, DatabasePool};

const WORKER_COLUMNS: &str =
    "key, idx, instance_key, job_key, status, outcome, updated_at, created_at";

pub struct SqlWorkerRepository {
    pool: DatabasePool,
}

impl SqlWorkerRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn select(&self, sql: &str, bind: &str) -> TranscoderResult<Vec<Worker>> {
        let workers = with_pool!(&self.pool, p => {
            sqlx::query_as::<_, Worker>(sql).bind(bind).fetch_all(p).await
        })
        .map_err(TranscoderError::Database)?;
        Ok(workers)
    }

    async fn execute_status_update(
        &self,
        sql: &str,
        key: &str,
        status: WorkerStatus,
        outcome: Option<&str>,
        now: DateTime<Utc>,
    ) -> TranscoderResult<u64> {
        let affected = with_pool!(&self.pool, p => {
            sqlx::query(sql)
                .bind(key)
                .bind(status)
                .bind(outcome)
                .bind(now)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(affected)
    }
}

#[async_trait]
impl WorkerRepository for SqlWorkerRepository {
    async fn get(&self, key: &str) -> TranscoderResult<Option<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE key = $1");
        Ok(self.select(&sql, key).await?.into_iter().next())
    }

    async fn list_by_instance(&self, instance_key: &str) -> TranscoderResult<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE instance_key = $1 ORDER BY idx ASC"
        );
        self.select(&sql, instance_key).await
    }

    async fn create(&self, worker: &Worker) -> TranscoderResult<bool> {
        let affected = with_pool!(&self.pool, p => {
            sqlx::query(
                r#"
                INSERT INTO workers (key, idx, instance_key, job_key, status, outcome, updated_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(&worker.key)
            .bind(worker.index)
            .bind(&worker.instance_key)
            .bind(worker.job_key.as_deref())
            .bind(worker.status)
            .bind(worker.outcome.as_deref())
            .bind(worker.updated_at)
            .bind(worker.created_at)
            .execute(p)
            .await
            .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;

        if affected > 0 {
            debug!("创建Worker成功: {} (index {})", worker.key, worker.index);
        }
        Ok(affected > 0)
    }

    async fn reset_pool(
        &self,
        instance_key: &str,
        max: i32,
        now: DateTime<Utc>,
    ) -> TranscoderResult<(u64, u64)> {
        let (idle, terminated) = with_pool!(&self.pool, p => {
            let idle = sqlx::query(
                r#"
                UPDATE workers SET status = $3, job_key = NULL, outcome = NULL, updated_at = $4
                WHERE instance_key = $1 AND idx < $2
                "#,
            )
            .bind(instance_key)
            .bind(max)
            .bind(WorkerStatus::Idle)
            .bind(now)
            .execute(p)
            .await
            .map(|r| r.rows_affected());

            match idle {
                Ok(idle) => sqlx::query(
                    r#"
                    UPDATE workers SET status = $3, updated_at = $4
                    WHERE instance_key = $1 AND idx >= $2
                    "#,
                )
                .bind(instance_key)
                .bind(max)
                .bind(WorkerStatus::Terminated)
                .bind(now)
                .execute(p)
                .await
                .map(|r| (idle, r.rows_affected())),
                Err(e) => Err(e),
            }
        })
        .map_err(TranscoderError::Database)?;

        debug!(
            "重置实例 {} 的Worker池: {} 个空闲, {} 个终止",
            instance_key, idle, terminated
        );
        Ok((idle, terminated))
    }

    async fn touch_idle(&self, instance_key: &str, now: DateTime<Utc>) -> TranscoderResult<u64> {
        let affected = with_pool!(&self.pool, p => {
            sqlx::query("UPDATE workers SET updated_at = $3 WHERE instance_key = $1 AND status = $2")
                .bind(instance_key)
                .bind(WorkerStatus::Idle)
                .bind(now)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(affected)
    }

    async fn touch(&self, key: &str, now: DateTime<Utc>) -> TranscoderResult<()> {
        with_pool!(&self.pool, p => {
            sqlx::query("UPDATE workers SET updated_at = $2 WHERE key = $1")
                .bind(key)
                .bind(now)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(())
    }

    async fn find_idle(&self, instance_key: &str) -> TranscoderResult<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE instance_key = $1 AND status = 'IDLE' ORDER BY idx ASC"
        );
        self.select(&sql, instance_key).await
    }

    async fn mark_busy(
        &self,
        key: &str,
        job_key: &str,
        now: DateTime<Utc>,
    ) -> TranscoderResult<()> {
        let affected = self
            .execute_status_update(
                "UPDATE workers SET status = $2, job_key = $3, outcome = NULL, updated_at = $4 WHERE key = $1",
                key,
                WorkerStatus::Busy,
                Some(job_key),
                now,
            )
            .await?;

        if affected == 0 {
            return Err(TranscoderError::WorkerNotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_idle(
        &self,
        key: &str,
        outcome: Option<&str>,
        now: DateTime<Utc>,
    ) -> TranscoderResult<()> {
        // 已被终止的Worker保持 TERMINATED
        self.execute_status_update(
            "UPDATE workers SET status = $2, job_key = NULL, outcome = $3, updated_at = $4 WHERE key = $1 AND status <> 'TERMINATED'",
            key,
            WorkerStatus::Idle,
            outcome,
            now,
        )
        .await?;
        Ok(())
    }

    async fn timeout_busy(
        &self,
        cutoff: DateTime<Utc>,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>> {
        let keys = with_pool!(&self.pool, p => {
            sqlx::query_scalar::<_, String>(
                r#"
                UPDATE workers SET status = $1, outcome = $2, updated_at = $3
                WHERE status = $4 AND updated_at < $5
                RETURNING key
                "#,
            )
            .bind(WorkerStatus::Timeout)
            .bind(outcome)
            .bind(now)
            .bind(WorkerStatus::Busy)
            .bind(cutoff)
            .fetch_all(p)
            .await
        })
        .map_err(TranscoderError::Database)?;
        Ok(keys)
    }

    async fn release_timed_out(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>> {
        let keys = with_pool!(&self.pool, p => {
            sqlx::query_scalar::<_, String>(
                r#"
                UPDATE workers SET status = $1, job_key = NULL, updated_at = $2
                WHERE status = $3 AND updated_at < $4
                RETURNING key
                "#,
            )
            .bind(WorkerStatus::Idle)
            .bind(now)
            .bind(WorkerStatus::Timeout)
            .bind(cutoff)
            .fetch_all(p)
            .await
        })
        .map_err(TranscoderError::Database)?;
        Ok(keys)
    }

    async fn terminate_by_instances(
        &self,
        instance_keys: &[String],
        outcome: &str,
        now: DateTime<Utc>,
    ) -> TranscoderResult<u64> {
        let mut affected = 0;
        for instance_key in instance_keys {
            affected += with_pool!(&self.pool, p => {
                sqlx::query(
                    "UPDATE workers SET status = $2, outcome = $3, updated_at = $4 WHERE instance_key = $1",
                )
                .bind(instance_key)
                .bind(WorkerStatus::Terminated)
                .bind(outcome)
                .bind(now)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
            })
            .map_err(TranscoderError::Database)?;
        }
        Ok(affected)
    }

    async fn delete_by_instances(&self, instance_keys: &[String]) -> TranscoderResult<u64> {
        let mut affected = 0;
        for instance_key in instance_keys {
            affected += with_pool!(&self.pool, p => {
                sqlx::query("DELETE FROM workers WHERE instance_key = $1")
                    .bind(instance_key)
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

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.worker_repository();
        let worker = Worker::new("i-1", 0, Utc::now());

        assert!(repo.create(&worker).await.unwrap());
        assert!(!repo.create(&worker).await.unwrap());
        assert_eq!(repo.list_by_instance("i-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_busy_idle_transitions() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.worker_repository();
        let now = Utc::now();
        let worker = Worker::new("i-1", 0, now);
        repo.create(&worker).await.unwrap();

        repo.mark_busy(&worker.key, "job-1", now).await.unwrap();
        assert!(repo.find_idle("i-1").await.unwrap().is_empty());
        let busy = repo.get(&worker.key).await.unwrap().unwrap();
        assert_eq!(busy.status, WorkerStatus::Busy);
        assert_eq!(busy.job_key.as_deref(), Some("job-1"));

        repo.mark_idle(&worker.key, Some("exited with code 0"), now)
            .await
            .unwrap();
        let idle = repo.get(&worker.key).await.unwrap().unwrap();
        assert_eq!(idle.status, WorkerStatus::Idle);
        assert!(idle.job_key.is_none());
        assert_eq!(idle.outcome.as_deref(), Some("exited with code 0"));
    }

    #[tokio::test]
    async fn test_terminated_worker_is_not_revived_by_exit() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.worker_repository();
        let now = Utc::now();
        let worker = Worker::new("i-1", 0, now);
        repo.create(&worker).await.unwrap();
        repo.mark_busy(&worker.key, "job-1", now).await.unwrap();

        repo.terminate_by_instances(&["i-1".to_string()], "SIGTERM", now)
            .await
            .unwrap();
        repo.mark_idle(&worker.key, Some("exited with code 0"), now)
            .await
            .unwrap();

        let worker = repo.get(&worker.key).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Terminated);
    }

    #[tokio::test]
    async fn test_busy_timeout_and_cooldown() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.worker_repository();
        let start = Utc::now();
        let worker = Worker::new("i-1", 0, start);
        repo.create(&worker).await.unwrap();
        repo.mark_busy(&worker.key, "job-1", start).await.unwrap();

        let later = start + Duration::minutes(6);
        let timed_out = repo
            .timeout_busy(later - Duration::minutes(5), "busy timeout", later)
            .await
            .unwrap();
        assert_eq!(timed_out, vec![worker.key.clone()]);

        // 冷却期未到
        let released = repo
            .release_timed_out(later - Duration::seconds(10), later)
            .await
            .unwrap();
        assert!(released.is_empty());

        let after = later + Duration::seconds(11);
        let released = repo
            .release_timed_out(after - Duration::seconds(10), after)
            .await
            .unwrap();
        assert_eq!(released, vec![worker.key.clone()]);
        assert_eq!(repo.find_idle("i-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_pool_terminates_surplus() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.worker_repository();
        let now = Utc::now();
        for index in 0..6 {
            repo.create(&Worker::new("i-1", index, now)).await.unwrap();
        }

        let (idle, terminated) = repo.reset_pool("i-1", 4, now).await.unwrap();
        assert_eq!((idle, terminated), (4, 2));

        let workers = repo.list_by_instance("i-1").await.unwrap();
        assert_eq!(workers[4].status, WorkerStatus::Terminated);
        assert_eq!(workers[3].status, WorkerStatus::Idle);
    }
}
