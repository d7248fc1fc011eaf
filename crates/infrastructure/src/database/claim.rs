//! 基于 `locked_by` 列的批量认领
//!
//! 认领由一条 `UPDATE ... RETURNING key` 完成：只有仍未加锁的行会被写入 owner，
//! 返回的 key 集合就是本次真正拿到的行。PostgreSQL 在子查询上追加
//! `FOR UPDATE SKIP LOCKED`，多个实例并发认领时互不阻塞。

use chrono::{DateTime, Utc};
use tracing::debug;
use transcoder_core::{TranscoderError, TranscoderResult};

use super::manager::{with_pool, DatabasePool, DatabaseType};

/// 一张可认领的表：谓词中可以引用 `$3`（当前时间）
#[derive(Debug, Clone, Copy)]
pub struct ClaimSurface {
    pub table: &'static str,
    pub predicate: &'static str,
    pub order_by: &'static str,
}

/// PENDING 或已到重试时间的 RETRYING 任务
pub const PENDING_JOBS: ClaimSurface = ClaimSurface {
    table: "jobs",
    predicate: "(status = 'PENDING' OR (status = 'RETRYING' AND retry_at <= $3))",
    order_by: "priority ASC, created_at ASC",
};

pub const QUEUED_JOBS: ClaimSurface = ClaimSurface {
    table: "jobs_queue",
    predicate: "created_at <= $3",
    order_by: "priority ASC, created_at ASC",
};

pub const DUE_NOTIFICATIONS: ClaimSurface = ClaimSurface {
    table: "jobs_notifications_queue",
    predicate: "status IN ('PENDING', 'RETRYING') AND (retry_at IS NULL OR retry_at <= $3)",
    order_by: "priority ASC, created_at ASC",
};

impl ClaimSurface {
    pub fn claim_sql(&self, database_type: DatabaseType) -> String {
        let lock_clause = match database_type {
            DatabaseType::PostgreSQL => " FOR UPDATE SKIP LOCKED",
            DatabaseType::SQLite => "",
        };
        format!(
            "UPDATE {table} SET locked_by = $1 \
             WHERE key IN (\
                SELECT key FROM {table} \
                WHERE locked_by IS NULL AND {predicate} \
                ORDER BY {order_by} \
                LIMIT $2{lock_clause}\
             ) AND locked_by IS NULL \
             RETURNING key",
            table = self.table,
            predicate = self.predicate,
            order_by = self.order_by,
        )
    }

    pub fn release_sql(&self) -> String {
        format!(
            "UPDATE {} SET locked_by = NULL WHERE key = $1 AND locked_by = $2",
            self.table
        )
    }
}

/// 认领最多 `limit` 行，返回实际拿到的 key
pub async fn claim_batch(
    pool: &DatabasePool,
    surface: &ClaimSurface,
    owner: &str,
    limit: i64,
    now: DateTime<Utc>,
) -> TranscoderResult<Vec<String>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let sql = surface.claim_sql(pool.database_type());
    let keys = with_pool!(pool, p => {
        sqlx::query_scalar::<_, String>(&sql)
            .bind(owner)
            .bind(limit)
            .bind(now)
            .fetch_all(p)
            .await
    })
    .map_err(TranscoderError::Database)?;

    if !keys.is_empty() {
        debug!("{} 认领 {} 行 {}", owner, keys.len(), surface.table);
    }
    Ok(keys)
}

/// 释放 owner 持有的指定行，已被删除或已被他人持有的行会被跳过
pub async fn release_claims(
    pool: &DatabasePool,
    surface: &ClaimSurface,
    owner: &str,
    keys: &[String],
) -> TranscoderResult<u64> {
    let sql = surface.release_sql();
    let mut released = 0;
    for key in keys {
        released += with_pool!(pool, p => {
            sqlx::query(&sql)
                .bind(key)
                .bind(owner)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_claim_skips_locked_rows() {
        let sql = PENDING_JOBS.claim_sql(DatabaseType::PostgreSQL);
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("RETURNING key"));
        assert!(sql.starts_with("UPDATE jobs SET locked_by = $1"));
    }

    #[test]
    fn test_sqlite_claim_has_no_row_lock_clause() {
        let sql = QUEUED_JOBS.claim_sql(DatabaseType::SQLite);
        assert!(!sql.contains("FOR UPDATE"));
        assert!(sql.contains("LIMIT $2)"));
    }
}
