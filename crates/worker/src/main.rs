use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::{error, info};
use transcoder_core::{init_logging, models::JobStatus, AppConfig, SystemClock};
use transcoder_infrastructure::{
    CompositeTransport, DatabaseManager, LocalObjectStorage, NotificationService,
};
use transcoder_worker::{
    FfmpegToolkit, HttpClassifier, JobPipeline, PipelineRepositories, PipelineSettings,
    WorkerContext,
};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(JobStatus::Completed) => ExitCode::SUCCESS,
        Ok(status) => {
            info!("任务未成功结束: {}", status);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("worker执行失败: {:#}", e);
            eprintln!("worker执行失败: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<JobStatus> {
    let matches = Command::new("transcoder-worker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("执行单个转码任务的worker进程")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(Arg::new("instance").value_name("INSTANCE_KEY").required(true))
        .arg(Arg::new("worker").value_name("WORKER_KEY").required(true))
        .arg(Arg::new("job").value_name("JOB_KEY").required(true))
        .get_matches();

    let required = |name: &str| -> Result<String> {
        matches
            .get_one::<String>(name)
            .cloned()
            .with_context(|| format!("缺少参数: {name}"))
    };
    let ctx = WorkerContext {
        instance_key: required("instance")?,
        worker_key: required("worker")?,
        job_key: required("job")?,
    };

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path).context("加载配置失败")?;
    init_logging(&config.observability.log_level, &config.observability.log_format)?;
    info!(job_key = %ctx.job_key, "worker {} 启动", ctx.worker_key);

    // 迁移由实例守护进程负责
    let db = DatabaseManager::new(&config.database)
        .await
        .context("连接数据库失败")?;

    let clock = Arc::new(SystemClock);
    let notifications = config.jobs.notifications.clone();
    let transport = Arc::new(CompositeTransport::new(
        notifications.timeout(),
        notifications.redis_url.clone(),
    ));
    let notifier = Arc::new(NotificationService::new(
        db.notification_repository(),
        transport,
        clock.clone(),
        notifications,
    ));
    let storage = Arc::new(LocalObjectStorage::new(&config.storage.root));
    let toolkit = Arc::new(FfmpegToolkit::new(&config.media));

    let repos = PipelineRepositories {
        jobs: db.job_repository(),
        outputs: db.job_output_repository(),
        workers: db.worker_repository(),
        housekeeping: db.housekeeping_repository(),
    };
    let settings = PipelineSettings::from_config(&config);
    let mut pipeline = JobPipeline::new(repos, notifier, storage, toolkit, clock, settings)?;
    if let Some(url) = &config.media.classifier_url {
        let classifier = HttpClassifier::new(url.clone(), Duration::from_secs(30))?;
        pipeline = pipeline.with_classifier(Arc::new(classifier));
    }

    let result = pipeline.run(&ctx).await;
    db.close().await;
    Ok(result?)
}
