//! 实例维护：心跳、选主以及主节点负责的集群级清扫

use std::sync::Arc;

use tracing::{info, warn};
use transcoder_core::{
    config::RuntimeConfig, traits::InstanceRepository, traits::WorkerRepository, Clock,
    TranscoderResult,
};
use transcoder_infrastructure::MetricsCollector;

use crate::instance_registry::InstanceRegistry;
use crate::worker_pool::WorkerPool;

/// 一轮维护的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub is_master: bool,
    pub timed_out_workers: usize,
    pub recovered_workers: usize,
    pub offline_instances: Vec<String>,
    pub purged_instances: Vec<String>,
}

pub struct MaintenanceService {
    registry: Arc<InstanceRegistry>,
    pool: Arc<WorkerPool>,
    instances: Arc<dyn InstanceRepository>,
    workers: Arc<dyn WorkerRepository>,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
    metrics: MetricsCollector,
}

impl MaintenanceService {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        pool: Arc<WorkerPool>,
        instances: Arc<dyn InstanceRepository>,
        workers: Arc<dyn WorkerRepository>,
        clock: Arc<dyn Clock>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            instances,
            workers,
            clock,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn run_once(&self) -> TranscoderResult<MaintenanceReport> {
        self.registry.ensure_registered().await?;
        self.registry.heartbeat().await?;

        let is_master = self.registry.elect_master().await?;
        self.metrics.update_master(is_master);
        if !is_master {
            return Ok(MaintenanceReport::default());
        }

        let mut report = MaintenanceReport {
            is_master,
            ..Default::default()
        };
        report.timed_out_workers = self.pool.timeout_busy_workers().await?.len();
        report.recovered_workers = self.pool.idle_timeout_workers().await?.len();

        let now = self.clock.now();
        report.offline_instances = self
            .instances
            .mark_stale_offline(now - self.config.online_timeout(), "heartbeat timeout", now)
            .await?;
        if !report.offline_instances.is_empty() {
            warn!("实例心跳超时，标记为离线: {:?}", report.offline_instances);
            self.pool
                .terminate_inactive_instance_workers(&report.offline_instances, "instance offline")
                .await?;
        }

        report.purged_instances = self
            .instances
            .purge_offline(now - self.config.purge_after())
            .await?;
        if !report.purged_instances.is_empty() {
            let deleted = self
                .workers
                .delete_by_instances(&report.purged_instances)
                .await?;
            info!(
                "删除 {} 个离线实例及其 {} 个worker",
                report.purged_instances.len(),
                deleted
            );
            self.metrics
                .record_instances_reaped(report.purged_instances.len());
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use transcoder_core::{
        config::WorkersConfig,
        models::{Instance, InstanceSpecs, InstanceStatus, InstanceType, Worker, WorkerStatus},
        ManualClock,
    };
    use transcoder_infrastructure::DatabaseManager;

    fn service(db: &DatabaseManager, clock: Arc<ManualClock>, key: &str) -> MaintenanceService {
        let registry = Arc::new(InstanceRegistry::new(
            key.to_string(),
            InstanceSpecs::default(),
            db.instance_repository(),
            db.worker_repository(),
            clock.clone(),
            RuntimeConfig::default().online_timeout(),
        ));
        let pool = Arc::new(WorkerPool::new(
            db.worker_repository(),
            clock.clone(),
            WorkersConfig {
                max: 2,
                ..Default::default()
            },
        ));
        MaintenanceService::new(
            registry,
            pool,
            db.instance_repository(),
            db.worker_repository(),
            clock,
            RuntimeConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_master_reaps_stale_instance() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let instances = db.instance_repository();
        let workers = db.worker_repository();

        let mut stale = Instance::new("stale", InstanceSpecs::default(), clock.now());
        stale.instance_type = InstanceType::Master;
        stale.updated_at = clock.now() - Duration::seconds(30);
        stale.created_at = clock.now() - Duration::seconds(600);
        instances.create(&stale).await.unwrap();
        workers
            .create(&Worker::new("stale", 0, clock.now()))
            .await
            .unwrap();

        let maintenance = service(&db, clock.clone(), "live");
        let report = maintenance.run_once().await.unwrap();
        assert!(report.is_master);
        assert_eq!(report.offline_instances, vec!["stale".to_string()]);
        assert!(report.purged_instances.is_empty());

        let row = instances.get("stale").await.unwrap().unwrap();
        assert_eq!(row.status, InstanceStatus::Offline);
        assert_eq!(row.instance_type, InstanceType::Slave);
        let orphan = workers.list_by_instance("stale").await.unwrap();
        assert_eq!(orphan[0].status, WorkerStatus::Terminated);

        // 超过 purge_after 之后连同worker一起删除
        clock.advance(Duration::seconds(61));
        let report = maintenance.run_once().await.unwrap();
        assert_eq!(report.purged_instances, vec!["stale".to_string()]);
        assert!(instances.get("stale").await.unwrap().is_none());
        assert!(workers.list_by_instance("stale").await.unwrap().is_empty());

        // 再执行一轮没有变化
        let report = maintenance.run_once().await.unwrap();
        assert!(report.offline_instances.is_empty());
        assert!(report.purged_instances.is_empty());
    }

    #[tokio::test]
    async fn test_slave_skips_cluster_sweeps() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let master = service(&db, clock.clone(), "a");
        master.run_once().await.unwrap();
        clock.advance(Duration::seconds(1));

        let slave = service(&db, clock.clone(), "b");
        let report = slave.run_once().await.unwrap();
        assert_eq!(report, MaintenanceReport::default());

        let rows = db.instance_repository().list().await.unwrap();
        let masters: Vec<_> = rows.iter().filter(|i| i.is_master()).collect();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].key, "a");
    }
}
