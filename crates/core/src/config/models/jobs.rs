use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::JobStatus;

/// 任务调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub process_interval_ms: u64,
    pub queue_timeout_seconds: u64,
    pub process_timeout_seconds: u64,
    pub enqueue_limit: u32,
    pub retention_seconds: u64,
    /// worker进程刷新进度与保活的间隔
    pub progress_interval_ms: u64,
    pub notifications: NotificationsConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            process_interval_ms: 1_000,
            queue_timeout_seconds: 300,    // 5分钟
            process_timeout_seconds: 1_800, // 30分钟
            enqueue_limit: 10,
            retention_seconds: 7 * 24 * 3_600,
            progress_interval_ms: 5_000,
            notifications: NotificationsConfig::default(),
        }
    }
}

impl JobsConfig {
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    pub fn queue_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.queue_timeout_seconds as i64)
    }

    pub fn process_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.process_timeout_seconds as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_seconds as i64)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.process_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务处理间隔必须大于0"));
        }
        if self.queue_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("队列超时时间必须大于0"));
        }
        if self.process_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("处理超时时间必须大于0"));
        }
        if self.enqueue_limit == 0 {
            return Err(anyhow::anyhow!("单次入队数量必须大于0"));
        }
        if self.progress_interval_ms == 0 {
            return Err(anyhow::anyhow!("进度刷新间隔必须大于0"));
        }
        self.notifications.validate()
    }
}

/// 通知投递与重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub process_interval_ms: u64,
    pub timeout_seconds: u64,
    pub try_max: i32,
    pub retry_in_seconds: u64,
    pub retry_in_max_seconds: u64,
    pub enqueue_limit: u32,
    pub notify_on: Vec<JobStatus>,
    /// redis 目标未指定 url 时使用
    pub redis_url: Option<String>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            process_interval_ms: 5_000,
            timeout_seconds: 10,
            try_max: 5,
            retry_in_seconds: 30,
            retry_in_max_seconds: 3_600,
            enqueue_limit: 10,
            notify_on: JobStatus::all().to_vec(),
            redis_url: None,
        }
    }
}

impl NotificationsConfig {
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.process_interval_ms == 0 {
            return Err(anyhow::anyhow!("通知处理间隔必须大于0"));
        }
        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("通知超时时间必须大于0"));
        }
        if self.try_max <= 0 {
            return Err(anyhow::anyhow!("通知最大尝试次数必须大于0"));
        }
        if self.retry_in_max_seconds < self.retry_in_seconds {
            return Err(anyhow::anyhow!("最大重试间隔不能小于重试间隔"));
        }
        if self.enqueue_limit == 0 {
            return Err(anyhow::anyhow!("单次处理通知数量必须大于0"));
        }
        Ok(())
    }
}
