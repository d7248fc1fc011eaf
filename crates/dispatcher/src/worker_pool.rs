use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use transcoder_core::{
    config::WorkersConfig,
    models::Worker,
    traits::WorkerRepository,
    Clock, TranscoderResult,
};
use transcoder_infrastructure::MetricsCollector;

/// 一次 reconcile 的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolReconcileStats {
    pub inserted: usize,
    pub idle: u64,
    pub terminated: u64,
}

/// 管理 worker 行：池大小收敛与超时处理
pub struct WorkerPool {
    workers: Arc<dyn WorkerRepository>,
    clock: Arc<dyn Clock>,
    config: WorkersConfig,
    metrics: MetricsCollector,
}

impl WorkerPool {
    pub fn new(
        workers: Arc<dyn WorkerRepository>,
        clock: Arc<dyn Clock>,
        config: WorkersConfig,
    ) -> Self {
        Self {
            workers,
            clock,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// 补齐 0..max 的 worker，并把 index >= max 的 worker 终止
    pub async fn reconcile(&self, instance_key: &str) -> TranscoderResult<PoolReconcileStats> {
        let now = self.clock.now();
        let max = self.config.max as i32;
        let existing: HashSet<i32> = self
            .workers
            .list_by_instance(instance_key)
            .await?
            .into_iter()
            .map(|w| w.index)
            .collect();

        let mut inserted = 0;
        for index in (0..max).filter(|i| !existing.contains(i)) {
            if self
                .workers
                .create(&Worker::new(instance_key, index, now))
                .await?
            {
                inserted += 1;
            }
        }

        let (idle, terminated) = self.workers.reset_pool(instance_key, max, now).await?;
        info!(
            "实例 {} worker池已就绪: 新增 {}, 空闲 {}, 终止 {}",
            instance_key, inserted, idle, terminated
        );
        self.metrics.update_idle_workers(idle as usize);
        Ok(PoolReconcileStats {
            inserted,
            idle,
            terminated,
        })
    }

    pub async fn idle_workers(&self, instance_key: &str) -> TranscoderResult<Vec<Worker>> {
        let idle = self.workers.find_idle(instance_key).await?;
        self.metrics.update_idle_workers(idle.len());
        Ok(idle)
    }

    /// BUSY 超过 busy_timeout 未刷新的 worker 置为 TIMEOUT
    pub async fn timeout_busy_workers(&self) -> TranscoderResult<Vec<String>> {
        let now = self.clock.now();
        let outcome = format!("busy timeout after {}s", self.config.busy_timeout_seconds);
        let keys = self
            .workers
            .timeout_busy(now - self.config.busy_timeout(), &outcome, now)
            .await?;
        if !keys.is_empty() {
            warn!("{} 个worker执行超时: {:?}", keys.len(), keys);
        }
        Ok(keys)
    }

    /// TIMEOUT 冷却 idle_after 之后回到 IDLE
    pub async fn idle_timeout_workers(&self) -> TranscoderResult<Vec<String>> {
        let now = self.clock.now();
        let keys = self
            .workers
            .release_timed_out(now - self.config.idle_after(), now)
            .await?;
        if !keys.is_empty() {
            debug!("{} 个超时worker恢复空闲", keys.len());
        }
        Ok(keys)
    }

    pub async fn terminate_instance_workers(
        &self,
        instance_key: &str,
        outcome: &str,
    ) -> TranscoderResult<u64> {
        self.terminate_inactive_instance_workers(&[instance_key.to_string()], outcome)
            .await
    }

    pub async fn terminate_inactive_instance_workers(
        &self,
        instance_keys: &[String],
        outcome: &str,
    ) -> TranscoderResult<u64> {
        if instance_keys.is_empty() {
            return Ok(0);
        }
        let terminated = self
            .workers
            .terminate_by_instances(instance_keys, outcome, self.clock.now())
            .await?;
        info!("终止 {} 个worker: {}", terminated, outcome);
        Ok(terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use transcoder_core::{models::WorkerStatus, ManualClock};
    use transcoder_infrastructure::DatabaseManager;

    fn pool(
        db: &DatabaseManager,
        clock: Arc<ManualClock>,
        max: u32,
    ) -> WorkerPool {
        let config = WorkersConfig {
            max,
            ..Default::default()
        };
        WorkerPool::new(db.worker_repository(), clock, config)
    }

    #[tokio::test]
    async fn test_reconcile_grows_pool_to_max() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let repo = db.worker_repository();
        for index in 0..2 {
            repo.create(&Worker::new("i-1", index, clock.now()))
                .await
                .unwrap();
        }

        let stats = pool(&db, clock, 4).reconcile("i-1").await.unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.terminated, 0);

        let workers = repo.list_by_instance("i-1").await.unwrap();
        assert_eq!(workers.len(), 4);
        assert!(workers.iter().all(|w| w.status == WorkerStatus::Idle));
    }

    #[tokio::test]
    async fn test_reconcile_shrinks_pool() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        pool(&db, clock.clone(), 6).reconcile("i-1").await.unwrap();

        let stats = pool(&db, clock.clone(), 2).reconcile("i-1").await.unwrap();
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.terminated, 4);

        // 再次执行结果不变
        let again = pool(&db, clock, 2).reconcile("i-1").await.unwrap();
        assert_eq!(again, stats);
        assert_eq!(
            db.worker_repository().find_idle("i-1").await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_busy_timeout_then_cooldown() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let pool = pool(&db, clock.clone(), 1);
        pool.reconcile("i-1").await.unwrap();

        let key = Worker::key_for("i-1", 0);
        let repo = db.worker_repository();
        repo.mark_busy(&key, "job-1", clock.now()).await.unwrap();

        clock.advance(Duration::seconds(301));
        assert_eq!(pool.timeout_busy_workers().await.unwrap(), vec![key.clone()]);
        assert_eq!(
            repo.get(&key).await.unwrap().unwrap().status,
            WorkerStatus::Timeout
        );

        clock.advance(Duration::seconds(5));
        assert!(pool.idle_timeout_workers().await.unwrap().is_empty());
        clock.advance(Duration::seconds(6));
        assert_eq!(pool.idle_timeout_workers().await.unwrap(), vec![key.clone()]);
        assert_eq!(pool.idle_workers("i-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_instance_workers() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let pool = pool(&db, clock, 3);
        pool.reconcile("i-1").await.unwrap();
        pool.reconcile("i-2").await.unwrap();

        assert_eq!(pool.terminate_instance_workers("i-1", "SIGTERM").await.unwrap(), 3);
        assert!(pool.idle_workers("i-1").await.unwrap().is_empty());
        assert_eq!(pool.idle_workers("i-2").await.unwrap().len(), 3);
        assert_eq!(
            pool.terminate_inactive_instance_workers(&[], "offline")
                .await
                .unwrap(),
            0
        );
    }
}
