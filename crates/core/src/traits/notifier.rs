use async_trait::async_trait;

use crate::errors::TranscoderResult;
use crate::models::{Job, JobStatus, NotificationStatus};

/// 在任务状态变化时通知外部系统
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn notify(&self, job: &Job, status: JobStatus) -> TranscoderResult<NotificationStatus>;
}
