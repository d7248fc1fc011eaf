use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::TranscoderResult;
use crate::models::{
    Instance, InstanceSpecs, InstanceType, Job, JobOutput, JobStatus, LogEntry, Notification,
    QueueEntry, Stat, Worker,
};

/// 实例仓储
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn get(&self, key: &str) -> TranscoderResult<Option<Instance>>;
    async fn create(&self, instance: &Instance) -> TranscoderResult<()>;
    /// 重新上线：restart_count + 1，清空 outcome
    async fn restart(
        &self,
        key: &str,
        specs: &InstanceSpecs,
        now: DateTime<Utc>,
    ) -> TranscoderResult<()>;
    /// 返回实例行是否存在
    async fn heartbeat(
        &self,
        key: &str,
        specs: &InstanceSpecs,
        now: DateTime<Utc>,
    ) -> TranscoderResult<bool>;
    /// 按 created_at、key 升序
    async fn list(&self) -> TranscoderResult<Vec<Instance>>;
    /// 只改角色，不刷新 updated_at
    async fn set_type(&self, key: &str, instance_type: InstanceType) -> TranscoderResult<()>;
    async fn mark_offline(
        &self,
        key: &str,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> TranscoderResult<()>;
    async fn mark_stale_offline(
        &self,
        cutoff: DateTime<Utc>,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>>;
    async fn purge_offline(&self, cutoff: DateTime<Utc>) -> TranscoderResult<Vec<String>>;
}

/// Worker仓储
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn get(&self, key: &str) -> TranscoderResult<Option<Worker>>;
    /// 按 index 升序
    async fn list_by_instance(&self, instance_key: &str) -> TranscoderResult<Vec<Worker>>;
    /// 已存在时不做任何修改，返回是否插入
    async fn create(&self, worker: &Worker) -> TranscoderResult<bool>;
    /// index < max 的重置为 IDLE，其余置为 TERMINATED，返回 (idle, terminated)
    async fn reset_pool(
        &self,
        instance_key: &str,
        max: i32,
        now: DateTime<Utc>,
    ) -> TranscoderResult<(u64, u64)>;
    async fn touch_idle(&self, instance_key: &str, now: DateTime<Utc>) -> TranscoderResult<u64>;
    async fn touch(&self, key: &str, now: DateTime<Utc>) -> TranscoderResult<()>;
    async fn find_idle(&self, instance_key: &str) -> TranscoderResult<Vec<Worker>>;
    async fn mark_busy(&self, key: &str, job_key: &str, now: DateTime<Utc>)
        -> TranscoderResult<()>;
    async fn mark_idle(
        &self,
        key: &str,
        outcome: Option<&str>,
        now: DateTime<Utc>,
    ) -> TranscoderResult<()>;
    async fn timeout_busy(
        &self,
        cutoff: DateTime<Utc>,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>>;
    async fn release_timed_out(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>>;
    async fn terminate_by_instances(
        &self,
        instance_keys: &[String],
        outcome: &str,
        now: DateTime<Utc>,
    ) -> TranscoderResult<u64>;
    async fn delete_by_instances(&self, instance_keys: &[String]) -> TranscoderResult<u64>;
}

/// 任务仓储
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get(&self, key: &str) -> TranscoderResult<Option<Job>>;
    async fn create(&self, job: &Job) -> TranscoderResult<()>;
    /// 整行写回
    async fn update(&self, job: &Job) -> TranscoderResult<()>;
    /// 刷新进度与 updated_at，供长时间转码保活
    async fn touch(&self, key: &str, progress: f64, now: DateTime<Utc>) -> TranscoderResult<()>;
    /// 认领 PENDING 或到期的 RETRYING 任务
    async fn claim_pending(
        &self,
        owner: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>>;
    async fn release_claims(&self, owner: &str, keys: &[String]) -> TranscoderResult<u64>;
    /// QUEUED 超时：重试预算内回到 PENDING，否则 FAILED
    async fn timeout_queued(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<(String, JobStatus)>>;
    async fn timeout_processing(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>>;
    async fn find_completed_before(&self, cutoff: DateTime<Utc>) -> TranscoderResult<Vec<String>>;
    async fn delete(&self, keys: &[String]) -> TranscoderResult<u64>;
}

#[async_trait]
pub trait JobOutputRepository: Send + Sync {
    async fn create(&self, output: &JobOutput) -> TranscoderResult<()>;
    /// 按 index 升序
    async fn list_by_job(&self, job_key: &str) -> TranscoderResult<Vec<JobOutput>>;
    async fn update(&self, output: &JobOutput) -> TranscoderResult<()>;
    async fn delete_by_jobs(&self, job_keys: &[String]) -> TranscoderResult<u64>;
}

/// jobs_queue 认领面
#[async_trait]
pub trait JobQueueRepository: Send + Sync {
    async fn push(&self, entry: &QueueEntry) -> TranscoderResult<()>;
    async fn get(&self, key: &str) -> TranscoderResult<Option<QueueEntry>>;
    async fn claim(
        &self,
        owner: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>>;
    async fn remove(&self, key: &str) -> TranscoderResult<()>;
    async fn release_claims(&self, owner: &str, keys: &[String]) -> TranscoderResult<u64>;
    async fn delete_by_jobs(&self, job_keys: &[String]) -> TranscoderResult<u64>;
}

/// 通知审计表与通知重试队列
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn record(&self, notification: &Notification) -> TranscoderResult<()>;
    async fn update_record(&self, notification: &Notification) -> TranscoderResult<()>;
    async fn get_record(&self, key: &str) -> TranscoderResult<Option<Notification>>;
    async fn list_by_job(&self, job_key: &str) -> TranscoderResult<Vec<Notification>>;

    /// 写入或覆盖重试队列行，locked_by 被清空
    async fn enqueue_retry(&self, notification: &Notification) -> TranscoderResult<()>;
    async fn get_queued(&self, key: &str) -> TranscoderResult<Option<Notification>>;
    async fn claim_due(
        &self,
        owner: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> TranscoderResult<Vec<String>>;
    async fn dequeue(&self, key: &str) -> TranscoderResult<()>;
    async fn release_claims(&self, owner: &str, keys: &[String]) -> TranscoderResult<u64>;
    async fn delete_by_jobs(&self, job_keys: &[String]) -> TranscoderResult<u64>;
}

/// 统计与日志
#[async_trait]
pub trait HousekeepingRepository: Send + Sync {
    async fn record_stat(&self, stat: &Stat) -> TranscoderResult<()>;
    async fn count_stats(&self, name: &str) -> TranscoderResult<i64>;
    async fn delete_stats_before(&self, cutoff: DateTime<Utc>) -> TranscoderResult<u64>;
    async fn append_log(&self, entry: &LogEntry) -> TranscoderResult<()>;
    async fn list_job_logs(&self, job_key: &str) -> TranscoderResult<Vec<LogEntry>>;
    /// 只删除实例级日志，任务日志随任务一起清理
    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> TranscoderResult<u64>;
    async fn delete_job_logs(&self, job_keys: &[String]) -> TranscoderResult<u64>;
}
