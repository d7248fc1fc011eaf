//! 通知审计表 `jobs_notifications` 与重试队列 `jobs_notifications_queue`
//!
//! 两张表列结构相同：审计表保存每条通知的最终结果，队列表只保存等待重试的通知。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tracing::debug;
use transcoder_core::{
    models::Notification, traits::NotificationRepository, TranscoderError, TranscoderResult,
};

use super::claim::{self, DUE_NOTIFICATIONS};
use super::manager::{with_pool, DatabasePool};

const AUDIT_TABLE: &str = "jobs_notifications";
const QUEUE_TABLE: &str = "jobs_notifications_queue";

const NOTIFICATION_COLUMNS: &str = "key, job_key, specs, payload, outcome, status, priority, \
    try_max, try_count, retry_in, retry_at, locked_by, updated_at, created_at";

pub struct SqlNotificationRepository {
    pool: DatabasePool,
}

impl SqlNotificationRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn insert(
        &self,
        table: &str,
        on_conflict: &str,
        notification: &Notification,
        locked_by: Option<&str>,
    ) -> TranscoderResult<()> {
        let sql = format!(
            "INSERT INTO {table} ({NOTIFICATION_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14){on_conflict}"
        );
        with_pool!(&self.pool, p => {
            sqlx::query(&sql)
                .bind(&notification.key)
                .bind(&notification.job_key)
                .bind(Json(&notification.specs))
                .bind(Json(&notification.payload))
                .bind(Json(&notification.outcome))
                .bind(notification.status)
                .bind(notification.priority)
                .bind(notification.try_max)
                .bind(notification.try_count)
                .bind(notification.retry_in)
                .bind(notification.retry_at)
                .bind(locked_by)
                .bind(notification.updated_at)
                .bind(notification.created_at)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(())
    }

    async fn fetch(&self, table: &str, key: &str) -> TranscoderResult<Option<Notification>> {
        let sql = format!("SELECT {NOTIFICATION_COLUMNS} FROM {table} WHERE key = $1");
        let notification = with_pool!(&self.pool, p => {
            sqlx::query_as::<_, Notification>(&sql)
                .bind(key)
                .fetch_optional(p)
                .await
        })
        .map_err(TranscoderError::Database)?;
        Ok(notification)
    }

    async fn delete_where(&self, sql: &str, value: &str) -> TranscoderResult<u64> {
        let affected = with_pool!(&self.pool, p => {
            sqlx::query(sql)
                .bind(value)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(affected)
    }
}

#[async_trait]
impl NotificationRepository for SqlNotificationRepository {
    async fn record(&self, notification: &Notification) -> TranscoderResult<()> {
        self.insert(AUDIT_TABLE, "", notification, None).await?;
        debug!(
            "记录通知 {} (任务 {}): {}",
            notification.key, notification.job_key, notification.status
        );
        Ok(())
    }

    async fn update_record(&self, notification: &Notification) -> TranscoderResult<()> {
        let affected = with_pool!(&self.pool, p => {
            sqlx::query(
                r#"
                UPDATE jobs_notifications SET
                    outcome = $2, status = $3, try_count = $4, retry_at = $5, updated_at = $6
                WHERE key = $1
                "#,
            )
            .bind(&notification.key)
            .bind(Json(&notification.outcome))
            .bind(notification.status)
            .bind(notification.try_count)
            .bind(notification.retry_at)
            .bind(notification.updated_at)
            .execute(p)
            .await
            .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;

        if affected == 0 {
            return Err(TranscoderError::DatabaseOperation(format!(
                "通知记录不存在: {}",
                notification.key
            )));
        }
        Ok(())
    }

    async fn get_record(&self, key: &str) -> TranscoderResult<Option<Notification>> {
        self.fetch(AUDIT_TABLE, key).await
    }

    async fn list_by_job(&self, job_key: &str) -> TranscoderResult<Vec<Notification>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM {AUDIT_TABLE} WHERE job_key = $1 \
             ORDER BY created_at ASC, key ASC"
        );
        let notifications = with_pool!(&self.pool, p => {
            sqlx::query_as::<_, Notification>(&sql)
                .bind(job_key)
                .fetch_all(p)
                .await
        })
        .map_err(TranscoderError::Database)?;
        Ok(notifications)
    }

    async fn enqueue_retry(&self, notification: &Notification) -> TranscoderResult<()> {
        let on_conflict = " ON CONFLICT (key) DO UPDATE SET \
            outcome = excluded.outcome, status = excluded.status, \
            try_count = excluded.try_count, retry_at = excluded.retry_at, \
            locked_by = NULL, updated_at = excluded.updated_at";
        self.insert(QUEUE_TABLE, on_conflict, notification, None)
            .await?;
        debug!(
            "通知 {} 进入重试队列，第 {} 次尝试，重试时间 {:?}",
            notification.key, notification.try_count, notification.retry_at
        );
        Ok(())
    }

    async fn get_queued(&self, key: &str) -> TranscoderResult<Option<Notification>> {
        self.fetch(QUEUE_TABLE, key).await
    }

    async fn claim_due(
        &self,
        owner: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>> {
        claim::claim_batch(&self.pool, &DUE_NOTIFICATIONS, owner, limit, now).await
    }

    async fn dequeue(&self, key: &str) -> TranscoderResult<()> {
        self.delete_where("DELETE FROM jobs_notifications_queue WHERE key = $1", key)
            .await?;
        Ok(())
    }

    async fn release_claims(&self, owner: &str, keys: &[String]) -> TranscoderResult<u64> {
        claim::release_claims(&self.pool, &DUE_NOTIFICATIONS, owner, keys).await
    }

    async fn delete_by_jobs(&self, job_keys: &[String]) -> TranscoderResult<u64> {
        let mut affected = 0;
        for job_key in job_keys {
            affected += self
                .delete_where(
                    "DELETE FROM jobs_notifications_queue WHERE job_key = $1",
                    job_key,
                )
                .await?;
            affected += self
                .delete_where("DELETE FROM jobs_notifications WHERE job_key = $1", job_key)
                .await?;
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use transcoder_core::models::{NotificationOutcome, NotificationStatus, NotificationTarget};

    fn notification(key: &str, now: DateTime<Utc>) -> Notification {
        Notification {
            key: key.to_string(),
            job_key: "job-1".to_string(),
            specs: NotificationTarget::Http {
                url: "http://hooks.local/job".to_string(),
                method: "POST".to_string(),
                headers: BTreeMap::new(),
            },
            payload: serde_json::json!({ "key": "job-1", "status": "COMPLETED" }),
            outcome: None,
            status: NotificationStatus::Pending,
            priority: 0,
            try_max: 3,
            try_count: 0,
            retry_in: 30,
            retry_at: None,
            locked_by: None,
            updated_at: now,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_record_and_update_audit_row() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.notification_repository();
        let now = Utc::now();

        let mut n = notification("n-1", now);
        repo.record(&n).await.unwrap();

        n.status = NotificationStatus::Successful;
        n.try_count = 1;
        n.outcome = Some(NotificationOutcome {
            message: "ok".to_string(),
            status_code: Some(200),
        });
        repo.update_record(&n).await.unwrap();

        let stored = repo.get_record("n-1").await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Successful);
        assert_eq!(stored.outcome.unwrap().status_code, Some(200));
        assert_eq!(repo.list_by_job("job-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_queue_respects_retry_at() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.notification_repository();
        let now = Utc::now();

        let mut n = notification("n-1", now);
        n.status = NotificationStatus::Retrying;
        n.try_count = 1;
        n.retry_at = Some(now + Duration::seconds(30));
        repo.enqueue_retry(&n).await.unwrap();

        assert!(repo.claim_due("i-1", 10, now).await.unwrap().is_empty());
        let claimed = repo
            .claim_due("i-1", 10, now + Duration::seconds(31))
            .await
            .unwrap();
        assert_eq!(claimed, vec!["n-1".to_string()]);

        // 重新入队会覆盖重试信息并清除锁
        n.try_count = 2;
        n.retry_at = Some(now + Duration::seconds(90));
        repo.enqueue_retry(&n).await.unwrap();
        let queued = repo.get_queued("n-1").await.unwrap().unwrap();
        assert_eq!(queued.try_count, 2);
        assert!(queued.locked_by.is_none());

        repo.dequeue("n-1").await.unwrap();
        assert!(repo.get_queued("n-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_by_jobs_clears_both_tables() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.notification_repository();
        let now = Utc::now();

        let n = notification("n-1", now);
        repo.record(&n).await.unwrap();
        repo.enqueue_retry(&n).await.unwrap();

        let deleted = repo.delete_by_jobs(&["job-1".to_string()]).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(repo.get_record("n-1").await.unwrap().is_none());
    }
}
