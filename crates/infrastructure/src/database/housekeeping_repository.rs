use async_trait::async_trait;
use chrono::{DateTime, Utc};
use transcoder_core::{
    models::{LogEntry, Stat},
    traits::HousekeepingRepository,
    TranscoderError, TranscoderResult,
};

use super::manager::{with_pool, DatabasePool};

pub struct SqlHousekeepingRepository {
    pool: DatabasePool,
}

impl SqlHousekeepingRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn delete_before(&self, sql: &str, cutoff: DateTime<Utc>) -> TranscoderResult<u64> {
        let affected = with_pool!(&self.pool, p => {
            sqlx::query(sql)
                .bind(cutoff)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(affected)
    }
}

#[async_trait]
impl HousekeepingRepository for SqlHousekeepingRepository {
    async fn record_stat(&self, stat: &Stat) -> TranscoderResult<()> {
        with_pool!(&self.pool, p => {
            sqlx::query(
                "INSERT INTO stats (key, name, instance_key, value, created_at) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&stat.key)
            .bind(&stat.name)
            .bind(stat.instance_key.as_deref())
            .bind(stat.value)
            .bind(stat.created_at)
            .execute(p)
            .await
            .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(())
    }

    async fn count_stats(&self, name: &str) -> TranscoderResult<i64> {
        let count = with_pool!(&self.pool, p => {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stats WHERE name = $1")
                .bind(name)
                .fetch_one(p)
                .await
        })
        .map_err(TranscoderError::Database)?;
        Ok(count)
    }

    async fn delete_stats_before(&self, cutoff: DateTime<Utc>) -> TranscoderResult<u64> {
        self.delete_before("DELETE FROM stats WHERE created_at < $1", cutoff)
            .await
    }

    async fn append_log(&self, entry: &LogEntry) -> TranscoderResult<()> {
        with_pool!(&self.pool, p => {
            sqlx::query(
                r#"
                INSERT INTO logs (key, job_key, instance_key, level, message, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&entry.key)
            .bind(entry.job_key.as_deref())
            .bind(entry.instance_key.as_deref())
            .bind(entry.level)
            .bind(&entry.message)
            .bind(entry.created_at)
            .execute(p)
            .await
            .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(())
    }

    async fn list_job_logs(&self, job_key: &str) -> TranscoderResult<Vec<LogEntry>> {
        let entries = with_pool!(&self.pool, p => {
            sqlx::query_as::<_, LogEntry>(
                r#"
                SELECT key, job_key, instance_key, level, message, created_at
                FROM logs WHERE job_key = $1
                ORDER BY created_at ASC
                "#,
            )
            .bind(job_key)
            .fetch_all(p)
            .await
        })
        .map_err(TranscoderError::Database)?;
        Ok(entries)
    }

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> TranscoderResult<u64> {
        self.delete_before(
            "DELETE FROM logs WHERE job_key IS NULL AND created_at < $1",
            cutoff,
        )
        .await
    }

    async fn delete_job_logs(&self, job_keys: &[String]) -> TranscoderResult<u64> {
        let mut affected = 0;
        for job_key in job_keys {
            affected += with_pool!(&self.pool, p => {
                sqlx::query("DELETE FROM logs WHERE job_key = $1")
                    .bind(job_key)
                    .execute(p)
                    .await
                    .map(|r| r.rows_affected())
            })
            .map_err(TranscoderError::Database)?;
        }
        Ok(affected)
    }
}
