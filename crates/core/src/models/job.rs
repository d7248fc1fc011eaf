use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::media::MediaInfo;
use super::notification::NotificationSpec;

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Started,
    Downloading,
    Downloaded,
    Analyzing,
    Analyzed,
    Processing,
    Uploading,
    Completed,
    Failed,
    Retrying,
    Timeout,
    Cancelled,
    Deleted,
}

impl_text_enum!(JobStatus {
    Pending => "PENDING",
    Queued => "QUEUED",
    Started => "STARTED",
    Downloading => "DOWNLOADING",
    Downloaded => "DOWNLOADED",
    Analyzing => "ANALYZING",
    Analyzed => "ANALYZED",
    Processing => "PROCESSING",
    Uploading => "UPLOADING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Retrying => "RETRYING",
    Timeout => "TIMEOUT",
    Cancelled => "CANCELLED",
    Deleted => "DELETED",
});

impl JobStatus {
    /// 由worker进程推进中的状态
    pub const IN_FLIGHT: [JobStatus; 7] = [
        JobStatus::Started,
        JobStatus::Downloading,
        JobStatus::Downloaded,
        JobStatus::Analyzing,
        JobStatus::Analyzed,
        JobStatus::Processing,
        JobStatus::Uploading,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Timeout
                | JobStatus::Cancelled
                | JobStatus::Deleted
        )
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }
}

/// 输入来源
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputSource {
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Local {
        path: String,
    },
    Storage {
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobInput {
    pub source: InputSource,
    #[serde(default)]
    pub skip_analyze: bool,
    #[serde(default)]
    pub skip_preview: bool,
    #[serde(default)]
    pub metadata: Option<MediaInfo>,
}

impl JobInput {
    pub fn new(source: InputSource) -> Self {
        Self {
            source,
            skip_analyze: false,
            skip_preview: false,
            metadata: None,
        }
    }
}

/// 输出上传目的地
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Destination {
    Storage {
        #[serde(default)]
        prefix: Option<String>,
    },
    Local {
        directory: String,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl Default for Destination {
    fn default() -> Self {
        Destination::Storage { prefix: None }
    }
}

/// 单个任务的执行选项
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    #[serde(default)]
    pub classify: bool,
    #[serde(default)]
    pub preview_at_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    pub message: String,
    #[serde(default)]
    pub step: Option<String>,
}

impl JobOutcome {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step: None,
        }
    }

    pub fn at_step(message: impl Into<String>, step: JobStatus) -> Self {
        Self {
            message: message.into(),
            step: Some(step.to_string()),
        }
    }
}

/// 转码任务
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub key: String,
    pub priority: i32,
    #[sqlx(json)]
    pub input: JobInput,
    #[sqlx(json)]
    pub destination: Destination,
    #[sqlx(json)]
    pub notification: Option<NotificationSpec>,
    #[sqlx(json)]
    pub metadata: serde_json::Value,
    #[sqlx(json)]
    pub config: JobConfig,
    #[sqlx(json)]
    pub outcome: Option<JobOutcome>,
    pub status: JobStatus,
    pub progress: f64,
    pub locked_by: Option<String>,
    pub try_count: i32,
    pub try_max: i32,
    /// 重试间隔（秒）
    pub retry_in: i64,
    pub retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(key: impl Into<String>, input: JobInput, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            priority: 0,
            input,
            destination: Destination::default(),
            notification: None,
            metadata: serde_json::json!({}),
            config: JobConfig::default(),
            outcome: None,
            status: JobStatus::Pending,
            progress: 0.0,
            locked_by: None,
            try_count: 0,
            try_max: 3,
            retry_in: 60,
            retry_at: None,
            started_at: None,
            analyzed_at: None,
            completed_at: None,
            updated_at: now,
            created_at: now,
        }
    }

    pub fn transition(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub fn add_progress(&mut self, delta: f64) {
        self.progress = (self.progress + delta).clamp(0.0, 100.0);
    }

    /// 重试次数已用尽，不能再次入队
    pub fn attempts_exhausted(&self) -> bool {
        self.try_count >= self.try_max
    }

    /// 失败后是否还应进入 RETRYING，由入队阶段最终判定为 FAILED
    pub fn should_retry(&self) -> bool {
        self.try_count <= self.try_max
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::seconds(self.retry_in.max(0))
    }

    /// 存储中属于该任务的对象前缀
    pub fn storage_prefix(&self) -> String {
        job_storage_prefix(&self.key)
    }

    pub fn preview_path(&self) -> String {
        format!("{}/preview.jpg", self.storage_prefix())
    }
}

pub fn job_storage_prefix(job_key: &str) -> String {
    format!("/jobs/{job_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::new(
            "job-1",
            JobInput::new(InputSource::Local {
                path: "/tmp/in.mp4".to_string(),
            }),
            Utc::now(),
        )
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut job = sample_job();
        job.add_progress(60.0);
        job.add_progress(60.0);
        assert_eq!(job.progress, 100.0);
        job.add_progress(-500.0);
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn test_retry_budget() {
        let mut job = sample_job();
        job.try_max = 3;
        job.try_count = 3;
        assert!(job.should_retry());
        assert!(job.attempts_exhausted());

        job.try_count = 2;
        assert!(!job.attempts_exhausted());
    }

    #[test]
    fn test_status_groups() {
        assert!(JobStatus::Downloading.is_in_flight());
        assert!(!JobStatus::Queued.is_in_flight());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_tagged_input_deserialization() {
        let input: JobInput = serde_json::from_value(serde_json::json!({
            "source": { "type": "http", "url": "https://cdn.example.com/a.mp4" },
            "skip_preview": true
        }))
        .unwrap();
        assert!(input.skip_preview);
        assert!(!input.skip_analyze);
        assert!(matches!(input.source, InputSource::Http { .. }));

        let bad = serde_json::from_value::<JobInput>(serde_json::json!({
            "source": { "type": "ftp", "url": "ftp://x" }
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_storage_paths() {
        let job = sample_job();
        assert_eq!(job.storage_prefix(), "/jobs/job-1");
        assert_eq!(job.preview_path(), "/jobs/job-1/preview.jpg");
    }
}
