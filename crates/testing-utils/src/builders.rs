//! Test data builders with sensible defaults

use chrono::{DateTime, Duration, Utc};
use transcoder_core::models::{
    Destination, InputSource, Job, JobConfig, JobInput, JobOutput, JobStatus, NotificationSpec,
    NotificationTarget, OutputSpec, VideoSpec,
};

/// Builder for test jobs, defaults to a PENDING job reading a local file
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new(key: &str) -> Self {
        let input = JobInput::new(InputSource::Local {
            path: format!("/media/{key}.mp4"),
        });
        Self {
            job: Job::new(key, input, Utc::now()),
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.job.status = status;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn with_tries(mut self, try_count: i32, try_max: i32) -> Self {
        self.job.try_count = try_count;
        self.job.try_max = try_max;
        self
    }

    pub fn with_input(mut self, source: InputSource) -> Self {
        self.job.input.source = source;
        self
    }

    pub fn skip_analyze(mut self) -> Self {
        self.job.input.skip_analyze = true;
        self
    }

    pub fn skip_preview(mut self) -> Self {
        self.job.input.skip_preview = true;
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.job.destination = destination;
        self
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.job.config = config;
        self
    }

    pub fn with_http_notification(mut self, url: &str, notify_on: Option<Vec<JobStatus>>) -> Self {
        self.job.notification = Some(NotificationSpec {
            target: NotificationTarget::Http {
                url: url.to_string(),
                method: "POST".to_string(),
                headers: Default::default(),
            },
            notify_on,
        });
        self
    }

    pub fn with_retry_at(mut self, retry_at: DateTime<Utc>) -> Self {
        self.job.retry_at = Some(retry_at);
        self
    }

    /// 同时设置 created_at 与 updated_at
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.created_at = at;
        self.job.updated_at = at;
        self
    }

    pub fn updated_ago(mut self, ago: Duration) -> Self {
        self.job.updated_at = Utc::now() - ago;
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

/// 720p H.264 MP4 输出
pub fn mp4_output(job_key: &str, index: i32) -> JobOutput {
    let mut spec = OutputSpec::new("mp4");
    spec.video = Some(VideoSpec {
        codec: "libx264".to_string(),
        height: Some(720),
        ..Default::default()
    });
    JobOutput::new(job_key, index, spec, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_builder_defaults() {
        let job = JobBuilder::new("job-1")
            .with_priority(2)
            .with_tries(1, 3)
            .build();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 2);
        assert_eq!(job.try_count, 1);
        assert!(matches!(job.input.source, InputSource::Local { .. }));
    }

    #[test]
    fn test_mp4_output_key() {
        let output = mp4_output("job-1", 0);
        assert_eq!(output.key, "job-1-0");
        assert_eq!(output.file_name().unwrap(), "output-0.mp4");
    }
}
