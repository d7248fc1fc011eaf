use std::sync::Arc;
use std::time::Duration;

use transcoder_core::{
    config::DatabaseConfig,
    traits::{
        HousekeepingRepository, InstanceRepository, JobOutputRepository, JobQueueRepository,
        JobRepository, NotificationRepository, WorkerRepository,
    },
    TranscoderError, TranscoderResult,
};
use tracing::{debug, info};

use super::{
    SqlHousekeepingRepository, SqlInstanceRepository, SqlJobOutputRepository,
    SqlJobQueueRepository, SqlJobRepository, SqlNotificationRepository, SqlWorkerRepository,
};

/// Database type detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseType::PostgreSQL
        } else {
            DatabaseType::SQLite
        }
    }
}

/// Database connection pool enum
#[derive(Debug, Clone)]
pub enum DatabasePool {
    PostgreSQL(sqlx::PgPool),
    SQLite(sqlx::SqlitePool),
}

/// 对两种后端执行同一段查询代码，每个分支独立做类型推导
macro_rules! with_pool {
    ($pool:expr, $p:ident => $body:expr) => {
        match $pool {
            $crate::database::DatabasePool::PostgreSQL($p) => $body,
            $crate::database::DatabasePool::SQLite($p) => $body,
        }
    };
}
pub(crate) use with_pool;

impl DatabasePool {
    /// Create pool from config with automatic type detection
    pub async fn new(config: &DatabaseConfig) -> TranscoderResult<Self> {
        let acquire_timeout = Duration::from_secs(config.connection_timeout_seconds);
        let idle_timeout = Duration::from_secs(config.idle_timeout_seconds);

        match DatabaseType::from_url(&config.url) {
            DatabaseType::PostgreSQL => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .connect(&config.url)
                    .await
                    .map_err(TranscoderError::Database)?;
                Ok(DatabasePool::PostgreSQL(pool))
            }
            DatabaseType::SQLite => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .connect(&config.url)
                    .await
                    .map_err(TranscoderError::Database)?;
                Ok(DatabasePool::SQLite(pool))
            }
        }
    }

    /// 单连接的内存SQLite，连接断开即丢失数据，因此不设空闲回收
    pub async fn in_memory() -> TranscoderResult<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(TranscoderError::Database)?;
        Ok(DatabasePool::SQLite(pool))
    }

    pub fn database_type(&self) -> DatabaseType {
        match self {
            DatabasePool::PostgreSQL(_) => DatabaseType::PostgreSQL,
            DatabasePool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn health_check(&self) -> TranscoderResult<()> {
        with_pool!(self, pool => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()))
            .map_err(TranscoderError::Database)?;
        Ok(())
    }

    /// 执行内嵌的迁移脚本，PostgreSQL 下由 sqlx 的 advisory lock 保证多实例并发安全
    pub async fn migrate(&self) -> TranscoderResult<()> {
        let result = match self {
            DatabasePool::PostgreSQL(pool) => {
                sqlx::migrate!("./migrations/postgres").run(pool).await
            }
            DatabasePool::SQLite(pool) => sqlx::migrate!("./migrations/sqlite").run(pool).await,
        };
        result.map_err(|e| TranscoderError::DatabaseOperation(format!("数据库迁移失败: {e}")))?;
        debug!("数据库迁移完成: {:?}", self.database_type());
        Ok(())
    }

    pub async fn close(&self) {
        match self {
            DatabasePool::PostgreSQL(pool) => pool.close().await,
            DatabasePool::SQLite(pool) => pool.close().await,
        }
    }
}

/// Unified database manager
pub struct DatabaseManager {
    pool: DatabasePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> TranscoderResult<Self> {
        let pool = DatabasePool::new(config).await?;
        info!("数据库连接已建立: {:?}", pool.database_type());
        Ok(Self { pool })
    }

    /// 已完成迁移的内存数据库，供测试与单机试运行使用
    pub async fn in_memory() -> TranscoderResult<Self> {
        let pool = DatabasePool::in_memory().await?;
        pool.migrate().await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    pub fn database_type(&self) -> DatabaseType {
        self.pool.database_type()
    }

    pub async fn migrate(&self) -> TranscoderResult<()> {
        self.pool.migrate().await
    }

    pub async fn health_check(&self) -> TranscoderResult<()> {
        self.pool.health_check().await
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    pub fn instance_repository(&self) -> Arc<dyn InstanceRepository> {
        Arc::new(SqlInstanceRepository::new(self.pool.clone()))
    }

    pub fn worker_repository(&self) -> Arc<dyn WorkerRepository> {
        Arc::new(SqlWorkerRepository::new(self.pool.clone()))
    }

    pub fn job_repository(&self) -> Arc<dyn JobRepository> {
        Arc::new(SqlJobRepository::new(self.pool.clone()))
    }

    pub fn job_output_repository(&self) -> Arc<dyn JobOutputRepository> {
        Arc::new(SqlJobOutputRepository::new(self.pool.clone()))
    }

    pub fn job_queue_repository(&self) -> Arc<dyn JobQueueRepository> {
        Arc::new(SqlJobQueueRepository::new(self.pool.clone()))
    }

    pub fn notification_repository(&self) -> Arc<dyn NotificationRepository> {
        Arc::new(SqlNotificationRepository::new(self.pool.clone()))
    }

    pub fn housekeeping_repository(&self) -> Arc<dyn HousekeepingRepository> {
        Arc::new(SqlHousekeepingRepository::new(self.pool.clone()))
    }
}
