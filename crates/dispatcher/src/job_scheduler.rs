//! 任务调度：入队、派发与超时处理
//!
//! 所有跨实例共享的行都通过 `locked_by` 认领，每一轮结束前无条件释放本轮认领的行。

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use transcoder_core::{
    config::JobsConfig,
    models::{Job, JobOutcome, JobStatus, QueueEntry},
    traits::{JobNotifier, JobQueueRepository, JobRepository, WorkerRepository},
    Clock, TranscoderResult,
};
use transcoder_infrastructure::MetricsCollector;

use crate::supervisor::WorkerLauncher;

pub struct JobScheduler {
    instance_key: String,
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn JobQueueRepository>,
    workers: Arc<dyn WorkerRepository>,
    launcher: Arc<dyn WorkerLauncher>,
    notifier: Arc<dyn JobNotifier>,
    clock: Arc<dyn Clock>,
    config: JobsConfig,
    metrics: MetricsCollector,
}

impl JobScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_key: String,
        jobs: Arc<dyn JobRepository>,
        queue: Arc<dyn JobQueueRepository>,
        workers: Arc<dyn WorkerRepository>,
        launcher: Arc<dyn WorkerLauncher>,
        notifier: Arc<dyn JobNotifier>,
        clock: Arc<dyn Clock>,
        config: JobsConfig,
    ) -> Self {
        Self {
            instance_key,
            jobs,
            queue,
            workers,
            launcher,
            notifier,
            clock,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// 一轮完整调度，单步失败不影响后续步骤
    pub async fn run_once(&self) -> TranscoderResult<()> {
        if let Err(e) = self.timeout_queued_jobs().await {
            error!("处理排队超时任务失败: {}", e);
        }
        if let Err(e) = self.enqueue_pending_jobs().await {
            error!("任务入队失败: {}", e);
        }
        if let Err(e) = self.process_jobs_queue().await {
            error!("派发队列任务失败: {}", e);
        }
        if let Err(e) = self.timeout_processing_jobs().await {
            error!("处理执行超时任务失败: {}", e);
        }
        Ok(())
    }

    async fn notify(&self, job_key: &str, status: JobStatus) {
        let job = match self.jobs.get(job_key).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!(job_key = %job_key, "读取任务失败，跳过通知: {}", e);
                return;
            }
        };
        if let Err(e) = self.notifier.notify(&job, status).await {
            warn!(job_key = %job_key, "发送 {} 通知失败: {}", status, e);
        }
    }

    /// QUEUED 超时的任务回到 PENDING 或直接失败，并删除残留的队列项
    pub async fn timeout_queued_jobs(&self) -> TranscoderResult<Vec<(String, JobStatus)>> {
        let now = self.clock.now();
        let swept = self
            .jobs
            .timeout_queued(now - self.config.queue_timeout(), now)
            .await?;
        if swept.is_empty() {
            return Ok(swept);
        }

        let keys: Vec<String> = swept.iter().map(|(key, _)| key.clone()).collect();
        self.queue.delete_by_jobs(&keys).await?;
        self.metrics.record_jobs_timed_out("queued", swept.len());
        warn!("{} 个任务排队超时", swept.len());

        for (key, status) in &swept {
            self.notify(key, *status).await;
        }
        Ok(swept)
    }

    /// 认领待执行任务并放入队列，返回入队数量
    pub async fn enqueue_pending_jobs(&self) -> TranscoderResult<usize> {
        let now = self.clock.now();
        let keys = self
            .jobs
            .claim_pending(&self.instance_key, self.config.enqueue_limit as i64, now)
            .await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut enqueued = 0;
        for key in &keys {
            match self.enqueue_one(key).await {
                Ok(true) => enqueued += 1,
                Ok(false) => {}
                Err(e) => error!(job_key = %key, "任务入队失败: {}", e),
            }
        }

        self.jobs.release_claims(&self.instance_key, &keys).await?;
        self.metrics.record_jobs_enqueued(enqueued);
        if enqueued > 0 {
            info!("{} 个任务已入队", enqueued);
        }
        Ok(enqueued)
    }

    async fn enqueue_one(&self, key: &str) -> TranscoderResult<bool> {
        let Some(mut job) = self.jobs.get(key).await? else {
            return Ok(false);
        };
        let now = self.clock.now();

        if job.attempts_exhausted() {
            job.outcome = Some(JobOutcome::new(format!(
                "retry budget exhausted after {} attempts",
                job.try_count
            )));
            job.transition(JobStatus::Failed, now);
            job.completed_at = Some(now);
            self.jobs.update(&job).await?;
            self.metrics.record_job_finished(JobStatus::Failed.as_str());
            warn!(job_key = %key, "重试次数已用尽，任务失败");
            self.notify_job(&job, JobStatus::Failed).await;
            return Ok(false);
        }

        job.try_count += 1;
        job.retry_at = None;
        job.transition(JobStatus::Queued, now);
        self.jobs.update(&job).await?;

        if let Err(e) = self
            .queue
            .push(&QueueEntry::new(&job.key, job.priority, now))
            .await
        {
            let fallback = if job.try_count < job.try_max {
                JobStatus::Pending
            } else {
                JobStatus::Failed
            };
            job.outcome = Some(JobOutcome::at_step(format!("enqueue failed: {e}"), JobStatus::Queued));
            job.transition(fallback, self.clock.now());
            self.jobs.update(&job).await?;
            self.notify_job(&job, fallback).await;
            return Err(e);
        }

        debug!(job_key = %key, "任务第 {} 次入队", job.try_count);
        self.notify_job(&job, JobStatus::Queued).await;
        Ok(true)
    }

    async fn notify_job(&self, job: &Job, status: JobStatus) {
        if let Err(e) = self.notifier.notify(job, status).await {
            warn!(job_key = %job.key, "发送 {} 通知失败: {}", status, e);
        }
    }

    /// 按空闲 worker 数认领队列项并一一派发，返回派发数量
    pub async fn process_jobs_queue(&self) -> TranscoderResult<usize> {
        let idle = self.workers.find_idle(&self.instance_key).await?;
        if idle.is_empty() {
            return Ok(0);
        }

        let keys = self
            .queue
            .claim(&self.instance_key, idle.len() as i64, self.clock.now())
            .await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut dispatched = 0;
        for (job_key, worker) in keys.iter().zip(idle.iter()) {
            match self
                .launcher
                .launch(&self.instance_key, worker, job_key)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.queue.remove(job_key).await {
                        error!(job_key = %job_key, "删除队列项失败: {}", e);
                    }
                    dispatched += 1;
                    self.metrics.record_job_dispatched();
                }
                Err(e) => error!(job_key = %job_key, "派发任务到 {} 失败: {}", worker.key, e),
            }
        }

        self.queue.release_claims(&self.instance_key, &keys).await?;
        if dispatched > 0 {
            info!("派发 {} 个任务", dispatched);
        }
        Ok(dispatched)
    }

    /// 执行中的任务长时间没有进度时置为 TIMEOUT
    pub async fn timeout_processing_jobs(&self) -> TranscoderResult<Vec<String>> {
        let now = self.clock.now();
        let keys = self
            .jobs
            .timeout_processing(now - self.config.process_timeout(), now)
            .await?;
        if keys.is_empty() {
            return Ok(keys);
        }

        self.metrics.record_jobs_timed_out("processing", keys.len());
        warn!("{} 个任务执行超时", keys.len());
        for key in &keys {
            self.notify(key, JobStatus::Timeout).await;
        }
        Ok(keys)
    }
}
