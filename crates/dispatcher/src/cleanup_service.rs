use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use tracing::{debug, info, warn};
use transcoder_core::{
    models::job_storage_prefix,
    traits::{
        HousekeepingRepository, JobOutputRepository, JobQueueRepository, JobRepository,
        NotificationRepository, ObjectStorage,
    },
    Clock, TranscoderResult,
};

/// 各类数据的保留时长
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub jobs: Duration,
    pub stats: Duration,
    pub logs: Duration,
}

/// 数据清理服务
///
/// 删除超过保留期的已完成任务（连同输出、队列、通知、任务日志和存储对象）、
/// 过期统计以及与任务无关的过期日志。
pub struct CleanupService {
    jobs: Arc<dyn JobRepository>,
    outputs: Arc<dyn JobOutputRepository>,
    queue: Arc<dyn JobQueueRepository>,
    notifications: Arc<dyn NotificationRepository>,
    housekeeping: Arc<dyn HousekeepingRepository>,
    storage: Arc<dyn ObjectStorage>,
    clock: Arc<dyn Clock>,
    retention: RetentionPolicy,
}

impl CleanupService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        outputs: Arc<dyn JobOutputRepository>,
        queue: Arc<dyn JobQueueRepository>,
        notifications: Arc<dyn NotificationRepository>,
        housekeeping: Arc<dyn HousekeepingRepository>,
        storage: Arc<dyn ObjectStorage>,
        clock: Arc<dyn Clock>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            jobs,
            outputs,
            queue,
            notifications,
            housekeeping,
            storage,
            clock,
            retention,
        }
    }

    /// 执行一次清理操作
    pub async fn cleanup_once(&self) -> TranscoderResult<CleanupStats> {
        let started = Instant::now();
        let now = self.clock.now();
        let mut stats = CleanupStats::default();

        let expired = self
            .jobs
            .find_completed_before(now - self.retention.jobs)
            .await?;
        if !expired.is_empty() {
            for key in &expired {
                // 存储对象尽力删除，失败不影响数据库清理
                if let Err(e) = self.storage.delete(&job_storage_prefix(key)).await {
                    warn!(job_key = %key, "删除任务存储对象失败: {}", e);
                    stats.storage_failures += 1;
                }
            }
            self.outputs.delete_by_jobs(&expired).await?;
            self.queue.delete_by_jobs(&expired).await?;
            self.notifications.delete_by_jobs(&expired).await?;
            self.housekeeping.delete_job_logs(&expired).await?;
            stats.jobs_cleaned = self.jobs.delete(&expired).await?;
            debug!("删除过期任务: {:?}", expired);
        }

        stats.stats_cleaned = self
            .housekeeping
            .delete_stats_before(now - self.retention.stats)
            .await?;
        stats.logs_cleaned = self
            .housekeeping
            .delete_logs_before(now - self.retention.logs)
            .await?;

        stats.duration = started.elapsed();
        if stats.total_cleaned() > 0 {
            info!(
                "清理完成: 共 {} 条记录，耗时 {:?} (任务: {}, 统计: {}, 日志: {})",
                stats.total_cleaned(),
                stats.duration,
                stats.jobs_cleaned,
                stats.stats_cleaned,
                stats.logs_cleaned
            );
        }
        Ok(stats)
    }
}

/// 清理统计信息
#[derive(Debug, Default)]
pub struct CleanupStats {
    /// 删除的已完成任务数
    pub jobs_cleaned: u64,
    pub stats_cleaned: u64,
    pub logs_cleaned: u64,
    /// 存储对象删除失败的任务数
    pub storage_failures: usize,
    pub duration: std::time::Duration,
}

impl CleanupStats {
    pub fn total_cleaned(&self) -> u64 {
        self.jobs_cleaned + self.stats_cleaned + self.logs_cleaned
    }
}
