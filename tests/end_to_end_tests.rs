//! 实例守护进程的端到端场景
//!
//! worker 在进程内执行流程而不是启动子进程，媒体工具用不依赖 ffmpeg 的替身。

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tempfile::TempDir;
use transcoder::Application;
use transcoder_core::{
    config::AppConfig,
    models::{
        InputSource, InstanceStatus, JobStatus, MediaInfo, NotificationStatus,
        NotificationTarget, OutputSpec, OutputStatus, Worker, WorkerStatus,
    },
    Clock, ManualClock, TranscoderError, TranscoderResult,
};
use transcoder_dispatcher::WorkerLauncher;
use transcoder_infrastructure::{
    DatabaseManager, Delivery, LocalObjectStorage, NotificationService, NotificationTransport,
};
use transcoder_testing_utils::{mp4_output, JobBuilder};
use transcoder_worker::{
    media::ProgressFn, JobPipeline, MediaToolkit, PipelineRepositories, PipelineSettings,
    WorkerContext,
};

struct StubToolkit;

#[async_trait]
impl MediaToolkit for StubToolkit {
    async fn analyze(&self, _input: &Path) -> TranscoderResult<MediaInfo> {
        Ok(MediaInfo {
            duration_seconds: Some(4.0),
            ..Default::default()
        })
    }

    async fn preview(&self, _input: &Path, _at: f64, output: &Path) -> TranscoderResult<()> {
        tokio::fs::write(output, b"jpeg").await?;
        Ok(())
    }

    async fn transcode(
        &self,
        _input: &Path,
        output: &Path,
        _spec: &OutputSpec,
        _duration: Option<f64>,
        on_progress: &ProgressFn<'_>,
    ) -> TranscoderResult<()> {
        tokio::fs::write(output, b"rendered").await?;
        on_progress(1.0);
        Ok(())
    }
}

/// 记录每次投递的任务状态，总是投递成功
#[derive(Default)]
struct RecordingTransport {
    delivered: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    fn statuses_for(&self, job_key: &str) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key == job_key)
            .map(|(_, status)| status.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn deliver(&self, _target: &NotificationTarget, payload: &Value) -> Delivery {
        let field = |name: &str| payload[name].as_str().unwrap_or_default().to_string();
        self.delivered
            .lock()
            .unwrap()
            .push((field("key"), field("status")));
        Delivery::delivered("200 OK", Some(200))
    }
}

/// 在当前任务内同步执行流程，返回前 worker 已回到空闲
struct InProcessLauncher {
    pipeline: JobPipeline,
    workers: Arc<dyn transcoder_core::traits::WorkerRepository>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(
        &self,
        instance_key: &str,
        worker: &Worker,
        job_key: &str,
    ) -> TranscoderResult<()> {
        self.workers
            .mark_busy(&worker.key, job_key, self.clock.now())
            .await?;
        let ctx = WorkerContext {
            instance_key: instance_key.to_string(),
            worker_key: worker.key.clone(),
            job_key: job_key.to_string(),
        };
        let outcome = match self.pipeline.run(&ctx).await {
            Ok(JobStatus::Completed) => "exited with code 0".to_string(),
            Ok(_) => "exited with code 1".to_string(),
            Err(e) => return Err(TranscoderError::Process(e.to_string())),
        };
        self.workers
            .mark_idle(&worker.key, Some(&outcome), self.clock.now())
            .await
    }
}

struct Harness {
    app: Application,
    clock: Arc<ManualClock>,
    transport: Arc<RecordingTransport>,
    media: TempDir,
    scratch: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let scratch = TempDir::new().unwrap();
        let media = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.runtime.instance_id = Some("edge-test".to_string());
        config.workers.max = 2;
        config.workers.temp_dir = scratch.path().join("tmp").to_string_lossy().into_owned();
        config.storage.root = scratch.path().join("storage").to_string_lossy().into_owned();

        let db = DatabaseManager::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(RecordingTransport::default());
        // 调度器与 worker 共用一个通知服务
        let notifications = Arc::new(NotificationService::new(
            db.notification_repository(),
            transport.clone(),
            clock.clone(),
            config.jobs.notifications.clone(),
        ));

        let mut settings = PipelineSettings::from_config(&config);
        settings.progress_interval = Duration::from_millis(20);
        let pipeline = JobPipeline::new(
            PipelineRepositories {
                jobs: db.job_repository(),
                outputs: db.job_output_repository(),
                workers: db.worker_repository(),
                housekeeping: db.housekeeping_repository(),
            },
            notifications.clone(),
            Arc::new(LocalObjectStorage::new(&config.storage.root)),
            Arc::new(StubToolkit),
            clock.clone(),
            settings,
        )
        .unwrap();
        let launcher = Arc::new(InProcessLauncher {
            pipeline,
            workers: db.worker_repository(),
            clock: clock.clone(),
        });

        let app =
            Application::with_notifications(config, db, clock.clone(), launcher, notifications);
        app.start().await.unwrap();
        Self {
            app,
            clock,
            transport,
            media,
            scratch,
        }
    }

    async fn source(&self, name: &str) -> String {
        let path = self.media.path().join(name);
        tokio::fs::write(&path, b"source").await.unwrap();
        path.to_string_lossy().into_owned()
    }
}

#[tokio::test]
async fn test_job_is_transcoded_through_the_scheduler() {
    let h = Harness::new().await;
    let db = h.app.database();
    let path = h.source("clip.mp4").await;

    let job = JobBuilder::new("job-ok")
        .with_input(InputSource::Local { path })
        .with_http_notification("http://hooks.local/jobs", None)
        .build();
    db.job_repository().create(&job).await.unwrap();
    db.job_output_repository()
        .create(&mp4_output("job-ok", 0))
        .await
        .unwrap();

    h.app.scheduler().run_once().await.unwrap();

    let job = db.job_repository().get("job-ok").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.try_count, 1);
    assert_eq!(job.progress, 100.0);
    assert!(job.locked_by.is_none());

    let outputs = db.job_output_repository().list_by_job("job-ok").await.unwrap();
    assert_eq!(outputs[0].status, OutputStatus::Completed);
    let stored = h
        .scratch
        .path()
        .join("storage/jobs/job-ok/output-0.mp4");
    assert!(stored.exists());

    let statuses = h.transport.statuses_for("job-ok");
    assert_eq!(statuses.first().map(String::as_str), Some("QUEUED"));
    assert!(statuses.iter().any(|s| s == "STARTED"));
    assert_eq!(statuses.last().map(String::as_str), Some("COMPLETED"));

    let workers = db
        .worker_repository()
        .list_by_instance(h.app.instance_key())
        .await
        .unwrap();
    assert_eq!(workers.len(), 2);
    assert!(workers.iter().all(|w| w.status == WorkerStatus::Idle));
}

#[tokio::test]
async fn test_failing_input_exhausts_retry_budget() {
    let h = Harness::new().await;
    let db = h.app.database();

    let job = JobBuilder::new("job-bad")
        .with_input(InputSource::Local {
            path: "/missing/clip.mp4".to_string(),
        })
        .with_tries(0, 3)
        .with_http_notification(
            "http://hooks.local/jobs",
            Some(vec![JobStatus::Retrying, JobStatus::Failed]),
        )
        .build();
    db.job_repository().create(&job).await.unwrap();
    db.job_output_repository()
        .create(&mp4_output("job-bad", 0))
        .await
        .unwrap();

    for _ in 0..4 {
        h.app.scheduler().run_once().await.unwrap();
        h.clock.advance(ChronoDuration::seconds(61));
    }

    let job = db.job_repository().get("job-bad").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.try_count, 3);
    assert!(job
        .outcome
        .as_ref()
        .is_some_and(|o| o.message.contains("retry budget exhausted")));

    // 三次 RETRYING 加一次 FAILED，其余状态不在 notify_on 内
    let audit = db
        .notification_repository()
        .list_by_job("job-bad")
        .await
        .unwrap();
    let count = |status: &str| audit.iter().filter(|n| n.payload["status"] == status).count();
    assert_eq!(audit.len(), 4);
    assert_eq!(count("RETRYING"), 3);
    assert_eq!(count("FAILED"), 1);
    assert!(audit
        .iter()
        .all(|n| n.status == NotificationStatus::Successful));
    assert_eq!(
        h.transport.statuses_for("job-bad"),
        vec!["RETRYING", "RETRYING", "RETRYING", "FAILED"]
    );

    // 再跑一轮也不会重新入队
    h.app.scheduler().run_once().await.unwrap();
    let job = db.job_repository().get("job-bad").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        db.notification_repository()
            .list_by_job("job-bad")
            .await
            .unwrap()
            .len(),
        4
    );
}

#[tokio::test]
async fn test_stop_marks_instance_offline_and_terminates_workers() {
    let h = Harness::new().await;
    let db = h.app.database();

    h.app.stop("SIGTERM").await.unwrap();

    let instance = db
        .instance_repository()
        .get(h.app.instance_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Offline);
    assert_eq!(instance.outcome.as_deref(), Some("SIGTERM"));

    let workers = db
        .worker_repository()
        .list_by_instance(h.app.instance_key())
        .await
        .unwrap();
    assert!(workers.iter().all(|w| w.status == WorkerStatus::Terminated));
}
