//! 单个转码任务的执行流程
//!
//! STARTED → DOWNLOADING → DOWNLOADED → [ANALYZING → ANALYZED] → PROCESSING → [UPLOADING] → 终态。
//! 下载与分析各占 20% 进度，转码与上传各占 20% 并按输出平均分配，只有成功结束时才置为 100。

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use transcoder_core::{
    config::AppConfig,
    models::{
        stat_names, Job, JobOutcome, JobOutput, JobStatus, LogEntry, LogLevel, OutputStatus, Stat,
    },
    traits::{
        HousekeepingRepository, JobNotifier, JobOutputRepository, JobRepository, ObjectStorage,
        WorkerRepository,
    },
    Clock, TranscoderError, TranscoderResult,
};
use transcoder_infrastructure::MetricsCollector;

use crate::classifier::ContentClassifier;
use crate::download::InputDownloader;
use crate::media::MediaToolkit;
use crate::upload::OutputUploader;

const STEP_PROGRESS: f64 = 20.0;

/// worker 子进程的寻址参数
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub instance_key: String,
    pub worker_key: String,
    pub job_key: String,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub temp_dir: PathBuf,
    pub preview_at_seconds: f64,
    pub progress_interval: Duration,
    pub transfer_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            temp_dir: PathBuf::from(&config.workers.temp_dir),
            preview_at_seconds: config.media.preview_at_seconds,
            progress_interval: config.jobs.progress_interval(),
            transfer_timeout: Duration::from_secs(config.media.download_timeout_seconds),
        }
    }
}

/// 流程用到的仓储
#[derive(Clone)]
pub struct PipelineRepositories {
    pub jobs: Arc<dyn JobRepository>,
    pub outputs: Arc<dyn JobOutputRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub housekeeping: Arc<dyn HousekeepingRepository>,
}

pub struct JobPipeline {
    repos: PipelineRepositories,
    notifier: Arc<dyn JobNotifier>,
    storage: Arc<dyn ObjectStorage>,
    toolkit: Arc<dyn MediaToolkit>,
    classifier: Option<Arc<dyn ContentClassifier>>,
    downloader: InputDownloader,
    uploader: OutputUploader,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
    metrics: MetricsCollector,
}

impl JobPipeline {
    pub fn new(
        repos: PipelineRepositories,
        notifier: Arc<dyn JobNotifier>,
        storage: Arc<dyn ObjectStorage>,
        toolkit: Arc<dyn MediaToolkit>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> TranscoderResult<Self> {
        Ok(Self {
            downloader: InputDownloader::new(storage.clone(), settings.transfer_timeout)?,
            uploader: OutputUploader::new(storage.clone(), settings.transfer_timeout)?,
            repos,
            notifier,
            storage,
            toolkit,
            classifier: None,
            clock,
            settings,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ContentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn work_dir(&self, job_key: &str) -> PathBuf {
        self.settings.temp_dir.join("jobs").join(job_key)
    }

    /// 执行任务并返回最终状态
    pub async fn run(&self, ctx: &WorkerContext) -> TranscoderResult<JobStatus> {
        let mut job = self
            .repos
            .jobs
            .get(&ctx.job_key)
            .await?
            .ok_or_else(|| TranscoderError::JobNotFound {
                key: ctx.job_key.clone(),
            })?;
        if matches!(job.status, JobStatus::Cancelled | JobStatus::Deleted) {
            warn!(job_key = %job.key, "任务已是 {} 状态，跳过执行", job.status);
            return Ok(job.status);
        }

        info!(job_key = %job.key, "worker {} 开始执行第 {} 次尝试", ctx.worker_key, job.try_count);
        let work_dir = self.work_dir(&job.key);
        let result = self.execute(&mut job, ctx, &work_dir).await;
        let status = self.finalize(&mut job, ctx, result).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_key = %job.key, "清理临时目录失败: {}", e);
            }
        }
        status
    }

    async fn execute(
        &self,
        job: &mut Job,
        ctx: &WorkerContext,
        work_dir: &Path,
    ) -> TranscoderResult<()> {
        job.started_at = Some(self.clock.now());
        job.outcome = None;
        job.progress = 0.0;
        self.advance(job, ctx, JobStatus::Started).await?;
        tokio::fs::create_dir_all(work_dir).await?;

        self.advance(job, ctx, JobStatus::Downloading).await?;
        let progress = job.progress;
        let input = match self
            .keep_alive(ctx, || progress, self.downloader.download(&job.input, work_dir))
            .await
        {
            Ok(input) => input,
            Err(e) => {
                self.record_input_failure(ctx).await;
                return Err(e);
            }
        };
        job.add_progress(STEP_PROGRESS);
        self.advance(job, ctx, JobStatus::Downloaded).await?;

        if !job.input.skip_analyze {
            self.analyze(job, ctx, &input).await?;
        }
        if !job.input.skip_preview {
            self.preview(job, ctx, &input, work_dir).await;
        }

        let mut outputs = self.repos.outputs.list_by_job(&job.key).await?;
        let share = if outputs.is_empty() {
            0.0
        } else {
            STEP_PROGRESS / outputs.len() as f64
        };
        let now = self.clock.now();
        for output in outputs
            .iter_mut()
            .filter(|o| o.status == OutputStatus::Failed)
        {
            output.reset(now);
            self.repos.outputs.update(output).await?;
        }
        // 之前尝试已完成的输出计入转码与上传两段进度
        let completed = outputs
            .iter()
            .filter(|o| o.status == OutputStatus::Completed)
            .count();
        job.add_progress(2.0 * share * completed as f64);
        self.process_outputs(job, ctx, &input, work_dir, &mut outputs, share)
            .await?;
        self.upload_outputs(job, ctx, work_dir, &mut outputs, share)
            .await?;

        let incomplete = outputs
            .iter()
            .filter(|o| o.status != OutputStatus::Completed)
            .count();
        if incomplete > 0 {
            return Err(TranscoderError::Media(format!(
                "{incomplete} of {} outputs not completed",
                outputs.len()
            )));
        }
        Ok(())
    }

    /// 分析失败只记录日志
    async fn analyze(&self, job: &mut Job, ctx: &WorkerContext, input: &Path) -> TranscoderResult<()> {
        self.advance(job, ctx, JobStatus::Analyzing).await?;
        let progress = job.progress;
        match self
            .keep_alive(ctx, || progress, self.toolkit.analyze(input))
            .await
        {
            Ok(info) => {
                debug!(job_key = %job.key, "媒体时长 {:?} 秒", info.duration_seconds);
                job.input.metadata = Some(info);
                job.analyzed_at = Some(self.clock.now());
            }
            Err(e) => {
                warn!(job_key = %job.key, "媒体分析失败: {}", e);
                self.log(ctx, LogLevel::Warn, format!("analyze failed: {e}"))
                    .await;
            }
        }
        job.add_progress(STEP_PROGRESS);
        self.advance(job, ctx, JobStatus::Analyzed).await
    }

    /// 截帧、上传预览图并按需分类，全部尽力而为
    async fn preview(&self, job: &mut Job, ctx: &WorkerContext, input: &Path, work_dir: &Path) {
        let mut at = job
            .config
            .preview_at_seconds
            .unwrap_or(self.settings.preview_at_seconds);
        if let Some(duration) = job.input.metadata.as_ref().and_then(|m| m.duration_seconds) {
            if duration > 0.0 && at >= duration {
                at = duration / 2.0;
            }
        }

        let frame = work_dir.join("preview.jpg");
        let uploaded = async {
            self.toolkit.preview(input, at, &frame).await?;
            self.storage.upload(&job.preview_path(), &frame).await
        }
        .await;
        if let Err(e) = uploaded {
            warn!(job_key = %job.key, "生成预览图失败: {}", e);
            self.log(ctx, LogLevel::Warn, format!("preview failed: {e}"))
                .await;
            return;
        }

        let Some(classifier) = self.classifier.as_ref().filter(|_| job.config.classify) else {
            return;
        };
        let classified = async {
            let image = tokio::fs::read(&frame).await?;
            classifier.classify(image).await
        }
        .await;
        match classified {
            Ok(labels) => {
                match job.metadata.as_object_mut() {
                    Some(metadata) => {
                        metadata.insert("classification".to_string(), labels);
                    }
                    None => {
                        job.metadata = serde_json::json!({ "classification": labels });
                    }
                }
                if let Err(e) = self.save(job).await {
                    warn!(job_key = %job.key, "保存分类结果失败: {}", e);
                }
            }
            Err(e) => {
                warn!(job_key = %job.key, "内容分类失败: {}", e);
                self.log(ctx, LogLevel::Warn, format!("classification failed: {e}"))
                    .await;
            }
        }
    }

    async fn process_outputs(
        &self,
        job: &mut Job,
        ctx: &WorkerContext,
        input: &Path,
        work_dir: &Path,
        outputs: &mut [JobOutput],
        share: f64,
    ) -> TranscoderResult<()> {
        if outputs.iter().all(JobOutput::is_settled) {
            return Ok(());
        }
        self.advance(job, ctx, JobStatus::Processing).await?;
        let duration = job.input.metadata.as_ref().and_then(|m| m.duration_seconds);

        for output in outputs.iter_mut().filter(|o| !o.is_settled()) {
            let now = self.clock.now();
            output.status = OutputStatus::Processing;
            output.started_at = Some(now);
            output.try_count += 1;
            output.outcome = None;
            output.updated_at = now;
            self.repos.outputs.update(output).await?;

            let fraction = AtomicU64::new(0f64.to_bits());
            let on_progress = |f: f64| fraction.store(f.to_bits(), Ordering::Relaxed);
            let base = job.progress;
            let result = match output.file_name() {
                Ok(name) => {
                    let target = work_dir.join(name);
                    self.keep_alive(
                        ctx,
                        || (base + share * f64::from_bits(fraction.load(Ordering::Relaxed))).min(100.0),
                        self.toolkit
                            .transcode(input, &target, &output.specs, duration, &on_progress),
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            let now = self.clock.now();
            match result {
                Ok(()) => {
                    output.status = OutputStatus::Processed;
                    output.processed_at = Some(now);
                    output.updated_at = now;
                    debug!(job_key = %job.key, "输出 {} 转码完成", output.index);
                }
                Err(e) => {
                    warn!(job_key = %job.key, "输出 {} 转码失败: {}", output.index, e);
                    self.log(
                        ctx,
                        LogLevel::Error,
                        format!("output {} transcode failed: {e}", output.index),
                    )
                    .await;
                    output.fail(e.to_string(), now);
                }
            }
            self.repos.outputs.update(output).await?;
            job.add_progress(share);
            self.save(job).await?;
        }
        Ok(())
    }

    async fn upload_outputs(
        &self,
        job: &mut Job,
        ctx: &WorkerContext,
        work_dir: &Path,
        outputs: &mut [JobOutput],
        share: f64,
    ) -> TranscoderResult<()> {
        if !outputs.iter().any(|o| o.status == OutputStatus::Processed) {
            return Ok(());
        }
        self.advance(job, ctx, JobStatus::Uploading).await?;

        for output in outputs
            .iter_mut()
            .filter(|o| o.status == OutputStatus::Processed)
        {
            let file = output.file_name().map(|name| work_dir.join(name));
            let result = match file {
                Ok(file) if tokio::fs::try_exists(&file).await.unwrap_or(false) => {
                    output.status = OutputStatus::Uploading;
                    output.updated_at = self.clock.now();
                    self.repos.outputs.update(output).await?;

                    let progress = job.progress;
                    self.keep_alive(ctx, || progress, self.uploader.upload(job, output, &file))
                        .await
                }
                Ok(file) => Err(TranscoderError::Upload(format!(
                    "output file missing: {}",
                    file.display()
                ))),
                Err(e) => Err(e),
            };

            let now = self.clock.now();
            match result {
                Ok(outcome) => {
                    output.status = OutputStatus::Completed;
                    output.outcome = Some(outcome);
                    output.uploaded_at = Some(now);
                    output.completed_at = Some(now);
                    output.updated_at = now;
                }
                Err(e) => {
                    warn!(job_key = %job.key, "输出 {} 上传失败: {}", output.index, e);
                    self.log(
                        ctx,
                        LogLevel::Error,
                        format!("output {} upload failed: {e}", output.index),
                    )
                    .await;
                    output.fail(e.to_string(), now);
                }
            }
            self.repos.outputs.update(output).await?;
            job.add_progress(share);
            self.save(job).await?;
        }
        Ok(())
    }

    /// 根据执行结果写入终态：成功为 COMPLETED，否则在重试预算内为 RETRYING
    async fn finalize(
        &self,
        job: &mut Job,
        ctx: &WorkerContext,
        result: TranscoderResult<()>,
    ) -> TranscoderResult<JobStatus> {
        if let Some(current) = self.repos.jobs.get(&job.key).await? {
            if matches!(current.status, JobStatus::Cancelled | JobStatus::Deleted) {
                info!(job_key = %job.key, "任务执行期间被置为 {}", current.status);
                return Ok(current.status);
            }
        }

        let now = self.clock.now();
        let status = match result {
            Ok(()) => {
                job.progress = 100.0;
                job.outcome = None;
                job.retry_at = None;
                job.completed_at = Some(now);
                JobStatus::Completed
            }
            Err(e) => {
                error!(job_key = %job.key, "任务在 {} 阶段失败: {}", job.status, e);
                self.log(ctx, LogLevel::Error, format!("{} failed: {e}", job.status))
                    .await;
                job.outcome = Some(JobOutcome::at_step(e.to_string(), job.status));
                if job.should_retry() {
                    job.retry_at = Some(now + job.retry_delay());
                    JobStatus::Retrying
                } else {
                    JobStatus::Failed
                }
            }
        };

        job.transition(status, now);
        self.repos.jobs.update(job).await?;
        match status {
            JobStatus::Completed => self.record_stat(ctx, stat_names::JOBS_COMPLETED).await,
            JobStatus::Failed => self.record_stat(ctx, stat_names::JOBS_FAILED).await,
            _ => {}
        }
        self.metrics.record_job_finished(status.as_str());
        self.notify(job, status).await;
        info!(job_key = %job.key, "任务结束: {}", status);
        Ok(status)
    }

    async fn advance(
        &self,
        job: &mut Job,
        ctx: &WorkerContext,
        status: JobStatus,
    ) -> TranscoderResult<()> {
        let now = self.clock.now();
        job.transition(status, now);
        self.repos.jobs.update(job).await?;
        if let Err(e) = self.repos.workers.touch(&ctx.worker_key, now).await {
            warn!("刷新worker {} 失败: {}", ctx.worker_key, e);
        }
        self.notify(job, status).await;
        Ok(())
    }

    async fn save(&self, job: &mut Job) -> TranscoderResult<()> {
        job.updated_at = self.clock.now();
        self.repos.jobs.update(job).await
    }

    /// 等待 `work` 完成，期间按 progress_interval 刷新任务进度与 worker 心跳
    async fn keep_alive<T, P, F>(&self, ctx: &WorkerContext, progress: P, work: F) -> TranscoderResult<T>
    where
        P: Fn() -> f64,
        F: Future<Output = TranscoderResult<T>>,
    {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.settings.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = ticker.tick() => {
                    let now = self.clock.now();
                    if let Err(e) = self.repos.jobs.touch(&ctx.job_key, progress(), now).await {
                        warn!(job_key = %ctx.job_key, "刷新任务进度失败: {}", e);
                    }
                    if let Err(e) = self.repos.workers.touch(&ctx.worker_key, now).await {
                        warn!("刷新worker {} 失败: {}", ctx.worker_key, e);
                    }
                }
            }
        }
    }

    async fn notify(&self, job: &Job, status: JobStatus) {
        if let Err(e) = self.notifier.notify(job, status).await {
            warn!(job_key = %job.key, "发送 {} 通知失败: {}", status, e);
        }
    }

    async fn log(&self, ctx: &WorkerContext, level: LogLevel, message: String) {
        let entry = LogEntry::for_job(
            &ctx.job_key,
            &ctx.instance_key,
            level,
            message,
            self.clock.now(),
        );
        if let Err(e) = self.repos.housekeeping.append_log(&entry).await {
            warn!(job_key = %ctx.job_key, "写入任务日志失败: {}", e);
        }
    }

    async fn record_stat(&self, ctx: &WorkerContext, name: &str) {
        let stat = Stat::increment(name, Some(&ctx.instance_key), self.clock.now());
        if let Err(e) = self.repos.housekeeping.record_stat(&stat).await {
            warn!("记录统计 {} 失败: {}", name, e);
        }
    }

    async fn record_input_failure(&self, ctx: &WorkerContext) {
        self.metrics.record_input_failed();
        self.record_stat(ctx, stat_names::INPUTS_FAILED).await;
    }
}

/// 供测试与外部调用方读取分类结果
pub fn classification(job: &Job) -> Option<&Value> {
    job.metadata.get("classification")
}
