use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use transcoder_core::{
    config::AppConfig,
    models::{LogEntry, LogLevel},
    traits::{HousekeepingRepository, ObjectStorage},
    Clock, SystemClock, TranscoderError,
};
use transcoder_dispatcher::{
    collect_specs, derive_instance_key, run_periodic, CleanupService, InstanceRegistry,
    JobScheduler, MaintenanceService, RetentionPolicy, WorkerCommand, WorkerLauncher,
    WorkerPool, WorkerSupervisor,
};
use transcoder_infrastructure::{
    CompositeTransport, DatabaseManager, LocalObjectStorage, NotificationService,
};

/// 实例守护进程
///
/// 启动时注册实例并收敛 worker 池，随后并行运行四个周期循环：
/// 任务调度、通知重试、数据清理和实例维护。
pub struct Application {
    config: AppConfig,
    db: DatabaseManager,
    clock: Arc<dyn Clock>,
    housekeeping: Arc<dyn HousekeepingRepository>,
    registry: Arc<InstanceRegistry>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<JobScheduler>,
    notifications: Arc<NotificationService>,
    cleanup: Arc<CleanupService>,
    maintenance: Arc<MaintenanceService>,
}

impl Application {
    /// 连接数据库、执行迁移并以子进程方式启动 worker
    pub async fn new(config: AppConfig, config_path: Option<&str>) -> Result<Self> {
        info!("连接数据库: {}", mask_database_url(&config.database.url));
        let db = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        db.migrate().await.context("运行数据库迁移失败")?;
        info!("数据库迁移完成");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let command = WorkerCommand::resolve(config.workers.command.as_deref(), config_path)
            .context("解析worker启动命令失败")?;
        let launcher = Arc::new(WorkerSupervisor::new(
            db.worker_repository(),
            clock.clone(),
            command,
        ));
        Ok(Self::with_launcher(config, db, clock, launcher))
    }

    /// 用给定的数据库、时钟和 worker 启动方式组装应用
    pub fn with_launcher(
        config: AppConfig,
        db: DatabaseManager,
        clock: Arc<dyn Clock>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let notifications_config = config.jobs.notifications.clone();
        let transport = Arc::new(CompositeTransport::new(
            notifications_config.timeout(),
            notifications_config.redis_url.clone(),
        ));
        let notifications = Arc::new(NotificationService::new(
            db.notification_repository(),
            transport,
            clock.clone(),
            notifications_config,
        ));
        Self::with_notifications(config, db, clock, launcher, notifications)
    }

    /// 同上，通知服务由调用方提供
    pub fn with_notifications(
        config: AppConfig,
        db: DatabaseManager,
        clock: Arc<dyn Clock>,
        launcher: Arc<dyn WorkerLauncher>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        let specs = collect_specs(env!("CARGO_PKG_VERSION"));
        let instance_key = derive_instance_key(config.runtime.instance_id.as_deref(), &specs);
        info!("实例 key: {} ({})", instance_key, specs.hostname);

        let storage: Arc<dyn ObjectStorage> =
            Arc::new(LocalObjectStorage::new(&config.storage.root));

        let registry = Arc::new(InstanceRegistry::new(
            instance_key.clone(),
            specs,
            db.instance_repository(),
            db.worker_repository(),
            clock.clone(),
            config.runtime.online_timeout(),
        ));
        let pool = Arc::new(WorkerPool::new(
            db.worker_repository(),
            clock.clone(),
            config.workers.clone(),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            instance_key,
            db.job_repository(),
            db.job_queue_repository(),
            db.worker_repository(),
            launcher,
            notifications.clone(),
            clock.clone(),
            config.jobs.clone(),
        ));
        let cleanup = Arc::new(CleanupService::new(
            db.job_repository(),
            db.job_output_repository(),
            db.job_queue_repository(),
            db.notification_repository(),
            db.housekeeping_repository(),
            storage,
            clock.clone(),
            RetentionPolicy {
                jobs: config.jobs.retention(),
                stats: config.stats.retention(),
                logs: config.logs.retention(),
            },
        ));
        let maintenance = Arc::new(MaintenanceService::new(
            registry.clone(),
            pool.clone(),
            db.instance_repository(),
            db.worker_repository(),
            clock.clone(),
            config.runtime.clone(),
        ));

        Self {
            housekeeping: db.housekeeping_repository(),
            config,
            db,
            clock,
            registry,
            pool,
            scheduler,
            notifications,
            cleanup,
            maintenance,
        }
    }

    pub fn instance_key(&self) -> &str {
        self.registry.key()
    }

    pub fn scheduler(&self) -> Arc<JobScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    /// 注册实例并补齐 worker 池
    pub async fn start(&self) -> Result<()> {
        self.registry
            .initialize()
            .await
            .context("注册实例失败")?;
        let stats = self
            .pool
            .reconcile(self.instance_key())
            .await
            .context("初始化worker池失败")?;
        debug!("worker池收敛结果: {:?}", stats);
        self.log(LogLevel::Info, "instance started".to_string()).await;
        Ok(())
    }

    /// 运行全部周期循环直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动实例 {} 的周期循环", self.instance_key());

        let jobs_handle = {
            let scheduler = Arc::clone(&self.scheduler);
            tokio::spawn(run_periodic(
                "任务调度",
                self.config.jobs.process_interval(),
                shutdown_rx.resubscribe(),
                move || {
                    let scheduler = Arc::clone(&scheduler);
                    async move { scheduler.run_once().await }
                },
            ))
        };

        let notifications_handle = {
            let notifications = Arc::clone(&self.notifications);
            let owner = self.instance_key().to_string();
            tokio::spawn(run_periodic(
                "通知重试",
                self.config.jobs.notifications.process_interval(),
                shutdown_rx.resubscribe(),
                move || {
                    let notifications = Arc::clone(&notifications);
                    let owner = owner.clone();
                    async move {
                        let processed = notifications.process_notifications_queue(&owner).await?;
                        if processed > 0 {
                            debug!("处理 {} 条待重试通知", processed);
                        }
                        Ok::<(), TranscoderError>(())
                    }
                },
            ))
        };

        let cleanup_handle = {
            let cleanup = Arc::clone(&self.cleanup);
            tokio::spawn(run_periodic(
                "数据清理",
                self.config.runtime.cleanup_interval(),
                shutdown_rx.resubscribe(),
                move || {
                    let cleanup = Arc::clone(&cleanup);
                    async move {
                        let stats = cleanup.cleanup_once().await?;
                        if stats.total_cleaned() > 0 {
                            info!(
                                "清理完成: 任务 {}, 统计 {}, 日志 {}, 耗时 {:?}",
                                stats.jobs_cleaned,
                                stats.stats_cleaned,
                                stats.logs_cleaned,
                                stats.duration
                            );
                        }
                        Ok::<(), TranscoderError>(())
                    }
                },
            ))
        };

        let maintenance_handle = {
            let maintenance = Arc::clone(&self.maintenance);
            tokio::spawn(run_periodic(
                "实例维护",
                self.config.runtime.maintain_interval(),
                shutdown_rx.resubscribe(),
                move || {
                    let maintenance = Arc::clone(&maintenance);
                    async move {
                        let report = maintenance.run_once().await?;
                        debug!("维护结果: {:?}", report);
                        Ok::<(), TranscoderError>(())
                    }
                },
            ))
        };

        let (jobs, notifications, cleanup, maintenance) = tokio::join!(
            jobs_handle,
            notifications_handle,
            cleanup_handle,
            maintenance_handle
        );
        for result in [jobs, notifications, cleanup, maintenance] {
            if let Err(e) = result {
                error!("周期循环异常退出: {}", e);
            }
        }

        info!("所有周期循环已停止");
        Ok(())
    }

    /// 终止本实例的 worker 并把实例标记为离线，正在运行的子进程不会被杀掉
    pub async fn stop(&self, reason: &str) -> Result<()> {
        let terminated = self
            .pool
            .terminate_instance_workers(self.instance_key(), reason)
            .await
            .context("终止worker失败")?;
        self.registry
            .mark_offline(reason)
            .await
            .context("标记实例离线失败")?;
        self.log(
            LogLevel::Info,
            format!("instance stopped: {reason}, {terminated} workers terminated"),
        )
        .await;
        Ok(())
    }

    async fn log(&self, level: LogLevel, message: String) {
        let entry = LogEntry::for_instance(self.instance_key(), level, message, self.clock.now());
        if let Err(e) = self.housekeeping.append_log(&entry).await {
            warn!("写入实例日志失败: {}", e);
        }
    }
}

/// 屏蔽数据库URL中的敏感信息
fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_database_url() {
        assert_eq!(
            mask_database_url("postgres://media:secret@db:5432/transcoder"),
            "postgres://media:***@db:5432/transcoder"
        );
        assert_eq!(mask_database_url("sqlite://data/t.db"), "sqlite://data/t.db");
    }
}
