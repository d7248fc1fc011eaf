use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Retrying,
    Successful,
    Failed,
    Skipped,
}

impl_text_enum!(NotificationStatus {
    Pending => "PENDING",
    Retrying => "RETRYING",
    Successful => "SUCCESSFUL",
    Failed => "FAILED",
    Skipped => "SKIPPED",
});

/// 通知投递目标
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotificationTarget {
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Redis {
        #[serde(default)]
        url: Option<String>,
        channel: String,
    },
}

fn default_http_method() -> String {
    "POST".to_string()
}

impl NotificationTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationTarget::Http { .. } => "http",
            NotificationTarget::Redis { .. } => "redis",
        }
    }
}

/// 任务上携带的通知配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationSpec {
    pub target: NotificationTarget,
    #[serde(default)]
    pub notify_on: Option<Vec<JobStatus>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotificationOutcome {
    pub message: String,
    #[serde(default)]
    pub status_code: Option<u16>,
}

/// 通知审计行与重试队列行共用的结构
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub key: String,
    pub job_key: String,
    #[sqlx(json)]
    pub specs: NotificationTarget,
    #[sqlx(json)]
    pub payload: serde_json::Value,
    #[sqlx(json)]
    pub outcome: Option<NotificationOutcome>,
    pub status: NotificationStatus,
    pub priority: i32,
    pub try_max: i32,
    pub try_count: i32,
    pub retry_in: i64,
    pub retry_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
