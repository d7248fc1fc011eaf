use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TranscoderError, TranscoderResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputStatus {
    Pending,
    Processing,
    Processed,
    Uploading,
    Completed,
    Failed,
}

impl_text_enum!(OutputStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Processed => "PROCESSED",
    Uploading => "UPLOADING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VideoSpec {
    pub codec: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub bitrate: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioSpec {
    pub codec: String,
    #[serde(default)]
    pub bitrate: Option<String>,
    #[serde(default)]
    pub channels: Option<u32>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

/// 输出规格：容器格式与音视频编码参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputSpec {
    pub format: String,
    #[serde(default)]
    pub video: Option<VideoSpec>,
    #[serde(default)]
    pub audio: Option<AudioSpec>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl OutputSpec {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            video: None,
            audio: None,
            extra_args: Vec::new(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutputOutcome {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl OutputOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobOutput {
    pub key: String,
    pub job_key: String,
    #[sqlx(rename = "idx")]
    pub index: i32,
    #[sqlx(json)]
    pub specs: OutputSpec,
    #[sqlx(json)]
    pub outcome: Option<OutputOutcome>,
    pub status: OutputStatus,
    pub try_max: i32,
    pub try_count: i32,
    pub retry_in: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl JobOutput {
    pub fn new(job_key: &str, index: i32, specs: OutputSpec, now: DateTime<Utc>) -> Self {
        Self {
            key: format!("{job_key}-{index}"),
            job_key: job_key.to_string(),
            index,
            specs,
            outcome: None,
            status: OutputStatus::Pending,
            try_max: 1,
            try_count: 0,
            retry_in: 0,
            started_at: None,
            processed_at: None,
            uploaded_at: None,
            completed_at: None,
            updated_at: now,
            created_at: now,
        }
    }

    /// 输出文件名，未指定时按序号与格式生成；不允许带路径分隔符
    pub fn file_name(&self) -> TranscoderResult<String> {
        let name = self
            .specs
            .file_name
            .clone()
            .unwrap_or_else(|| format!("output-{}.{}", self.index, self.specs.format));
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
            || name.contains('\0')
        {
            return Err(TranscoderError::Configuration(format!(
                "非法的输出文件名: {name:?}"
            )));
        }
        Ok(name)
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, OutputStatus::Completed | OutputStatus::Failed)
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = OutputStatus::Failed;
        self.outcome = Some(OutputOutcome::error(message));
        self.updated_at = now;
    }

    /// 新一次尝试开始前把失败的输出放回待处理
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.status = OutputStatus::Pending;
        self.outcome = None;
        self.processed_at = None;
        self.uploaded_at = None;
        self.completed_at = None;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(file_name: Option<&str>) -> JobOutput {
        let spec = OutputSpec {
            format: "mp4".to_string(),
            video: None,
            audio: None,
            extra_args: Vec::new(),
            file_name: file_name.map(str::to_string),
        };
        JobOutput::new("job-1", 2, spec, Utc::now())
    }

    #[test]
    fn test_default_file_name() {
        assert_eq!(output(None).file_name().unwrap(), "output-2.mp4");
        assert_eq!(output(Some("clip 720p.mp4")).file_name().unwrap(), "clip 720p.mp4");
    }

    #[test]
    fn test_file_name_cannot_leave_its_directory() {
        for name in ["../escape.mp4", "/etc/passwd", "a/b.mp4", "..", "", "dir\\x.mp4"] {
            assert!(output(Some(name)).file_name().is_err(), "{name:?} 应被拒绝");
        }
    }

    #[test]
    fn test_reset_clears_failure() {
        let mut out = output(None);
        let now = Utc::now();
        out.fail("ffmpeg exited with code Some(1)", now);
        out.reset(now);
        assert_eq!(out.status, OutputStatus::Pending);
        assert!(out.outcome.is_none());
        assert!(!out.is_settled());
    }
}
