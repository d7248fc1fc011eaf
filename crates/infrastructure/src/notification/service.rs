//! 任务状态通知
//!
//! `notify` 在每次状态变化时尝试一次投递并写入审计行；失败的通知进入重试队列，
//! 由 `process_notifications_queue` 按指数退避重试直到成功或用尽次数。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use transcoder_core::{
    config::NotificationsConfig,
    models::{Job, JobStatus, Notification, NotificationStatus, NotificationTarget},
    traits::{JobNotifier, NotificationRepository},
    Clock, TranscoderResult,
};

use super::transport::{Delivery, NotificationTransport};
use crate::observability::MetricsCollector;

/// 抖动比例
const JITTER_FACTOR: f64 = 0.1;

pub struct NotificationService {
    repository: Arc<dyn NotificationRepository>,
    transport: Arc<dyn NotificationTransport>,
    clock: Arc<dyn Clock>,
    config: NotificationsConfig,
    metrics: MetricsCollector,
}

impl NotificationService {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        transport: Arc<dyn NotificationTransport>,
        clock: Arc<dyn Clock>,
        config: NotificationsConfig,
    ) -> Self {
        Self {
            repository,
            transport,
            clock,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// 任务自带的 notify_on 优先于全局配置
    fn allows(&self, job: &Job, status: JobStatus) -> bool {
        match job.notification.as_ref().and_then(|n| n.notify_on.as_ref()) {
            Some(allowed) => allowed.contains(&status),
            None => self.config.notify_on.contains(&status),
        }
    }

    fn build_payload(job: &Job, status: JobStatus, now: DateTime<Utc>) -> Value {
        json!({
            "key": job.key,
            "status": status,
            "progress": job.progress,
            "try_count": job.try_count,
            "try_max": job.try_max,
            "outcome": job.outcome,
            "metadata": job.metadata,
            "timestamp": now.to_rfc3339(),
        })
    }

    async fn attempt(&self, target: &NotificationTarget, payload: &Value) -> Delivery {
        match tokio::time::timeout(self.config.timeout(), self.transport.deliver(target, payload))
            .await
        {
            Ok(delivery) => delivery,
            Err(_) => Delivery::failed(
                format!("投递超时 ({}秒)", self.config.timeout_seconds),
                None,
            ),
        }
    }

    fn next_retry_at(&self, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = backoff_seconds(
            self.config.retry_in_seconds,
            self.config.retry_in_max_seconds,
            attempt,
        );
        let jitter = base * JITTER_FACTOR * (rand::random::<f64>() - 0.5) * 2.0;
        let seconds = (base + jitter).max(self.config.retry_in_seconds as f64);
        now + chrono::Duration::milliseconds((seconds * 1_000.0) as i64)
    }

    /// 认领到期的重试通知并逐条重试，返回处理条数；认领在任何情况下都会释放
    pub async fn process_notifications_queue(&self, owner: &str) -> TranscoderResult<usize> {
        let now = self.clock.now();
        let keys = self
            .repository
            .claim_due(owner, self.config.enqueue_limit as i64, now)
            .await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut processed = 0;
        for key in &keys {
            match self.retry(key).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => warn!("重试通知 {} 失败: {}", key, e),
            }
        }

        self.repository.release_claims(owner, &keys).await?;
        debug!("本次处理 {} 条重试通知", processed);
        Ok(processed)
    }

    async fn retry(&self, key: &str) -> TranscoderResult<bool> {
        let Some(mut notification) = self.repository.get_queued(key).await? else {
            return Ok(false);
        };

        let delivery = self
            .attempt(&notification.specs, &notification.payload)
            .await;
        let now = self.clock.now();
        notification.try_count += 1;
        notification.outcome = Some(delivery.outcome);
        notification.updated_at = now;

        if delivery.delivered {
            notification.status = NotificationStatus::Successful;
            notification.retry_at = None;
        } else if notification.try_count >= notification.try_max {
            notification.status = NotificationStatus::Failed;
            notification.retry_at = None;
        } else {
            notification.status = NotificationStatus::Retrying;
            notification.retry_at = Some(self.next_retry_at(notification.try_count, now));
        }

        if let Err(e) = self.repository.update_record(&notification).await {
            warn!("更新通知审计记录 {} 失败: {}", notification.key, e);
        }

        match notification.status {
            NotificationStatus::Retrying => self.repository.enqueue_retry(&notification).await?,
            _ => self.repository.dequeue(&notification.key).await?,
        }

        self.metrics
            .record_notification(notification.specs.kind(), notification.status.as_str());
        info!(
            job_key = %notification.job_key,
            "通知 {} 第 {} 次尝试: {}",
            notification.key,
            notification.try_count,
            notification.status
        );
        Ok(true)
    }
}

#[async_trait]
impl JobNotifier for NotificationService {
    async fn notify(&self, job: &Job, status: JobStatus) -> TranscoderResult<NotificationStatus> {
        let Some(spec) = job.notification.as_ref() else {
            return Ok(NotificationStatus::Skipped);
        };
        if !self.allows(job, status) {
            debug!(job_key = %job.key, "状态 {} 不在通知范围内，跳过", status);
            self.metrics
                .record_notification(spec.target.kind(), NotificationStatus::Skipped.as_str());
            return Ok(NotificationStatus::Skipped);
        }

        let created_at = self.clock.now();
        let payload = Self::build_payload(job, status, created_at);
        let delivery = self.attempt(&spec.target, &payload).await;
        let now = self.clock.now();

        let mut notification = Notification {
            key: uuid::Uuid::new_v4().to_string(),
            job_key: job.key.clone(),
            specs: spec.target.clone(),
            payload,
            outcome: Some(delivery.outcome),
            status: NotificationStatus::Successful,
            priority: job.priority,
            try_max: self.config.try_max,
            try_count: 1,
            retry_in: self.config.retry_in_seconds as i64,
            retry_at: None,
            locked_by: None,
            updated_at: now,
            created_at,
        };

        if !delivery.delivered {
            notification.status = NotificationStatus::Retrying;
            notification.retry_at = Some(self.next_retry_at(1, now));
        }

        self.repository.record(&notification).await?;
        if notification.status == NotificationStatus::Retrying {
            self.repository.enqueue_retry(&notification).await?;
            warn!(
                job_key = %job.key,
                "通知投递失败，稍后重试: {}",
                notification.outcome.as_ref().map(|o| o.message.as_str()).unwrap_or_default()
            );
        }

        self.metrics
            .record_notification(spec.target.kind(), notification.status.as_str());
        Ok(notification.status)
    }
}

/// `retry_in · 2^(attempt-1)`，不超过 `retry_in_max`
pub fn backoff_seconds(retry_in: u64, retry_in_max: u64, attempt: i32) -> f64 {
    let exponent = attempt.saturating_sub(1).clamp(0, 30);
    let interval = retry_in as f64 * 2f64.powi(exponent);
    interval.min(retry_in_max as f64)
}
