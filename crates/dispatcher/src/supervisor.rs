//! worker 进程的启动与回收
//!
//! 每个 worker 进程对应一个等待任务；进程退出（或等待出错）时由该任务把
//! worker 从存活表中移除并置回 IDLE，空闲转换只发生一次。

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use transcoder_core::{
    models::Worker, traits::WorkerRepository, Clock, TranscoderError, TranscoderResult,
};
use transcoder_infrastructure::MetricsCollector;

/// 把一个任务交给一个 worker 执行
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, instance_key: &str, worker: &Worker, job_key: &str)
        -> TranscoderResult<()>;
}

/// worker 可执行文件及其固定参数，三个位置参数追加在最后
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// `command` 未配置时使用与当前可执行文件同目录的 `transcoder-worker`
    pub fn resolve(command: Option<&str>, config_path: Option<&str>) -> TranscoderResult<Self> {
        let mut parts = command
            .map(|c| c.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default();

        let program = if parts.is_empty() {
            std::env::current_exe()?.with_file_name("transcoder-worker")
        } else {
            PathBuf::from(parts.remove(0))
        };

        let mut args = parts;
        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.to_string());
        }
        Ok(Self { program, args })
    }
}

/// 进程退出状态写入 worker.outcome
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "exited without status".to_string()
}

pub struct WorkerSupervisor {
    workers: Arc<dyn WorkerRepository>,
    clock: Arc<dyn Clock>,
    command: WorkerCommand,
    /// worker_key -> pid
    children: Arc<Mutex<HashMap<String, u32>>>,
    metrics: MetricsCollector,
}

impl WorkerSupervisor {
    pub fn new(
        workers: Arc<dyn WorkerRepository>,
        clock: Arc<dyn Clock>,
        command: WorkerCommand,
    ) -> Self {
        Self {
            workers,
            clock,
            command,
            children: Arc::new(Mutex::new(HashMap::new())),
            metrics: MetricsCollector::new(),
        }
    }

    /// 当前存活的 worker key
    pub fn live_workers(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn live_count(&self) -> usize {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl WorkerLauncher for WorkerSupervisor {
    async fn launch(
        &self,
        instance_key: &str,
        worker: &Worker,
        job_key: &str,
    ) -> TranscoderResult<()> {
        self.workers
            .mark_busy(&worker.key, job_key, self.clock.now())
            .await?;

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .arg(instance_key)
            .arg(&worker.key)
            .arg(job_key)
            .stdin(Stdio::null());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let outcome = format!("spawn failed: {e}");
                error!(job_key = %job_key, "启动worker进程失败: {}", e);
                self.workers
                    .mark_idle(&worker.key, Some(&outcome), self.clock.now())
                    .await?;
                self.metrics.record_worker_exited("error");
                return Err(TranscoderError::Process(outcome));
            }
        };

        let pid = child.id().unwrap_or_default();
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker.key.clone(), pid);
        self.metrics.record_worker_spawned();
        info!(job_key = %job_key, "worker {} 启动进程 {}", worker.key, pid);

        let worker_key = worker.key.clone();
        let job_key = job_key.to_string();
        let workers = Arc::clone(&self.workers);
        let clock = Arc::clone(&self.clock);
        let children = Arc::clone(&self.children);
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let (outcome, reason) = match child.wait().await {
                Ok(status) if status.code().is_some() => (describe_exit(&status), "exited"),
                Ok(status) => (describe_exit(&status), "signaled"),
                Err(e) => (format!("wait failed: {e}"), "error"),
            };
            children
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&worker_key);
            metrics.record_worker_exited(reason);

            if let Err(e) = workers
                .mark_idle(&worker_key, Some(&outcome), clock.now())
                .await
            {
                warn!("worker {} 置为空闲失败: {}", worker_key, e);
            }
            debug!(job_key = %job_key, "worker {} 进程结束: {}", worker_key, outcome);
        });

        Ok(())
    }
}
