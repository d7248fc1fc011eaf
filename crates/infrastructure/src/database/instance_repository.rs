use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tracing::debug;
use transcoder_core::{
    models::{Instance, InstanceSpecs, InstanceStatus, InstanceType},
    traits::InstanceRepository,
    TranscoderError, TranscoderResult,
};

use super::manager::{with_pool, DatabasePool};

const INSTANCE_COLUMNS: &str =
    "key, type, status, specs, outcome, restart_count, updated_at, created_at";

pub struct SqlInstanceRepository {
    pool: DatabasePool,
}

impl SqlInstanceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceRepository for SqlInstanceRepository {
    async fn get(&self, key: &str) -> TranscoderResult<Option<Instance>> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE key = $1");
        let instance = with_pool!(&self.pool, p => {
            sqlx::query_as::<_, Instance>(&sql)
                .bind(key)
                .fetch_optional(p)
                .await
        })
        .map_err(TranscoderError::Database)?;
        Ok(instance)
    }

    async fn create(&self, instance: &Instance) -> TranscoderResult<()> {
        with_pool!(&self.pool, p => {
            sqlx::query(
                r#"
                INSERT INTO instances (key, type, status, specs, outcome, restart_count, updated_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(&instance.key)
            .bind(instance.instance_type)
            .bind(instance.status)
            .bind(Json(&instance.specs))
            .bind(instance.outcome.as_deref())
            .bind(instance.restart_count)
            .bind(instance.updated_at)
            .bind(instance.created_at)
            .execute(p)
            .await
            .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;

        debug!("注册实例成功: {}", instance.key);
        Ok(())
    }

    async fn restart(
        &self,
        key: &str,
        specs: &InstanceSpecs,
        now: DateTime<Utc>,
    ) -> TranscoderResult<()> {
        let affected = with_pool!(&self.pool, p => {
            sqlx::query(
                r#"
                UPDATE instances
                SET status = $2, specs = $3, outcome = NULL,
                    restart_count = restart_count + 1, updated_at = $4
                WHERE key = $1
                "#,
            )
            .bind(key)
            .bind(InstanceStatus::Online)
            .bind(Json(specs))
            .bind(now)
            .execute(p)
            .await
            .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;

        if affected == 0 {
            return Err(TranscoderError::InstanceNotFound {
                key: key.to_string(),
            });
        }
        debug!("实例重新上线: {}", key);
        Ok(())
    }

    async fn heartbeat(
        &self,
        key: &str,
        specs: &InstanceSpecs,
        now: DateTime<Utc>,
    ) -> TranscoderResult<bool> {
        let affected = with_pool!(&self.pool, p => {
            sqlx::query("UPDATE instances SET status = $2, specs = $3, updated_at = $4 WHERE key = $1")
                .bind(key)
                .bind(InstanceStatus::Online)
                .bind(Json(specs))
                .bind(now)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(affected > 0)
    }

    async fn list(&self) -> TranscoderResult<Vec<Instance>> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY created_at ASC, key ASC");
        let instances = with_pool!(&self.pool, p => {
            sqlx::query_as::<_, Instance>(&sql).fetch_all(p).await
        })
        .map_err(TranscoderError::Database)?;
        Ok(instances)
    }

    async fn set_type(&self, key: &str, instance_type: InstanceType) -> TranscoderResult<()> {
        with_pool!(&self.pool, p => {
            sqlx::query("UPDATE instances SET type = $2 WHERE key = $1")
                .bind(key)
                .bind(instance_type)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        debug!("实例 {} 角色变更为 {}", key, instance_type);
        Ok(())
    }

    async fn mark_offline(
        &self,
        key: &str,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> TranscoderResult<()> {
        with_pool!(&self.pool, p => {
            sqlx::query("UPDATE instances SET status = $2, outcome = $3, updated_at = $4 WHERE key = $1")
                .bind(key)
                .bind(InstanceStatus::Offline)
                .bind(outcome)
                .bind(now)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(())
    }

    async fn mark_stale_offline(
        &self,
        cutoff: DateTime<Utc>,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>> {
        let keys = with_pool!(&self.pool, p => {
            sqlx::query_scalar::<_, String>(
                r#"
                UPDATE instances SET status = $1, outcome = $2, updated_at = $3
                WHERE status = $4 AND updated_at < $5
                RETURNING key
                "#,
            )
            .bind(InstanceStatus::Offline)
            .bind(outcome)
            .bind(now)
            .bind(InstanceStatus::Online)
            .bind(cutoff)
            .fetch_all(p)
            .await
        })
        .map_err(TranscoderError::Database)?;

        if !keys.is_empty() {
            debug!("标记 {} 个实例为离线状态", keys.len());
        }
        Ok(keys)
    }

    async fn purge_offline(&self, cutoff: DateTime<Utc>) -> TranscoderResult<Vec<String>> {
        let keys = with_pool!(&self.pool, p => {
            sqlx::query_scalar::<_, String>(
                "DELETE FROM instances WHERE status = $1 AND updated_at < $2 RETURNING key",
            )
            .bind(InstanceStatus::Offline)
            .bind(cutoff)
            .fetch_all(p)
            .await
        })
        .map_err(TranscoderError::Database)?;

        if !keys.is_empty() {
            debug!("删除 {} 个离线实例", keys.len());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use chrono::Duration;

    fn specs() -> InstanceSpecs {
        InstanceSpecs {
            hostname: "edge-1".to_string(),
            cpu_count: 8,
            pid: 42,
            version: "1.0.0".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_restart_instance() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.instance_repository();
        let now = Utc::now();

        repo.create(&Instance::new("i-1", specs(), now)).await.unwrap();
        repo.mark_offline("i-1", "SIGTERM", now).await.unwrap();
        repo.restart("i-1", &specs(), now + Duration::seconds(5))
            .await
            .unwrap();

        let instance = repo.get("i-1").await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Online);
        assert_eq!(instance.restart_count, 1);
        assert!(instance.outcome.is_none());
        assert_eq!(instance.specs.hostname, "edge-1");
    }

    #[tokio::test]
    async fn test_restart_unknown_instance_fails() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.instance_repository();
        let result = repo.restart("missing", &specs(), Utc::now()).await;
        assert!(matches!(
            result,
            Err(TranscoderError::InstanceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_instances_go_offline_then_purge() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.instance_repository();
        let now = Utc::now();

        let mut stale = Instance::new("stale", specs(), now - Duration::seconds(60));
        stale.updated_at = now - Duration::seconds(60);
        repo.create(&stale).await.unwrap();
        repo.create(&Instance::new("fresh", specs(), now)).await.unwrap();

        let offline = repo
            .mark_stale_offline(now - Duration::seconds(15), "heartbeat timeout", now)
            .await
            .unwrap();
        assert_eq!(offline, vec!["stale".to_string()]);

        // 刚离线的实例还未超过 purge_after
        let purged = repo
            .purge_offline(now - Duration::seconds(60))
            .await
            .unwrap();
        assert!(purged.is_empty());

        let purged = repo
            .purge_offline(now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, vec!["stale".to_string()]);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }
}
