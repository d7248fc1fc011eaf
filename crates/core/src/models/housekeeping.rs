use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl_text_enum!(LogLevel {
    Debug => "DEBUG",
    Info => "INFO",
    Warn => "WARN",
    Error => "ERROR",
});

/// 计数类统计样本
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Stat {
    pub key: String,
    pub name: String,
    pub instance_key: Option<String>,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

impl Stat {
    pub fn increment(name: &str, instance_key: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            key: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            instance_key: instance_key.map(str::to_string),
            value: 1.0,
            created_at: now,
        }
    }
}

/// 持久化日志行，job_key 为空表示实例级日志
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LogEntry {
    pub key: String,
    pub job_key: Option<String>,
    pub instance_key: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn for_job(
        job_key: &str,
        instance_key: &str,
        level: LogLevel,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: uuid::Uuid::new_v4().to_string(),
            job_key: Some(job_key.to_string()),
            instance_key: Some(instance_key.to_string()),
            level,
            message: message.into(),
            created_at: now,
        }
    }

    /// 不属于任何任务的实例级日志，按 logs.retention 清理
    pub fn for_instance(
        instance_key: &str,
        level: LogLevel,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: uuid::Uuid::new_v4().to_string(),
            job_key: None,
            instance_key: Some(instance_key.to_string()),
            level,
            message: message.into(),
            created_at: now,
        }
    }
}

/// 统计名称
pub mod stat_names {
    pub const INPUTS_FAILED: &str = "inputs.failed";
    pub const JOBS_COMPLETED: &str = "jobs.completed";
    pub const JOBS_FAILED: &str = "jobs.failed";
}
