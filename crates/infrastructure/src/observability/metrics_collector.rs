//! 转码集群的指标采集
//!
//! 指标通过 `metrics` 门面记录，未安装导出器时所有调用都是空操作。

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{counter, gauge, Counter, Gauge};
use tracing::{debug, info};

/// 指标名称
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "transcoder_jobs_enqueued_total";
    pub const JOBS_DISPATCHED_TOTAL: &str = "transcoder_jobs_dispatched_total";
    pub const JOBS_FINISHED_TOTAL: &str = "transcoder_jobs_finished_total";
    pub const JOBS_TIMED_OUT_TOTAL: &str = "transcoder_jobs_timed_out_total";
    pub const INPUTS_FAILED_TOTAL: &str = "transcoder_inputs_failed_total";
    pub const NOTIFICATIONS_TOTAL: &str = "transcoder_notifications_total";
    pub const WORKERS_SPAWNED_TOTAL: &str = "transcoder_workers_spawned_total";
    pub const WORKERS_EXITED_TOTAL: &str = "transcoder_workers_exited_total";
    pub const WORKERS_IDLE: &str = "transcoder_workers_idle";
    pub const INSTANCES_REAPED_TOTAL: &str = "transcoder_instances_reaped_total";
    pub const INSTANCE_IS_MASTER: &str = "transcoder_instance_is_master";
}

/// Metrics collector for the transcoding cluster
#[derive(Clone)]
pub struct MetricsCollector {
    jobs_enqueued: Counter,
    jobs_dispatched: Counter,
    inputs_failed: Counter,
    workers_spawned: Counter,
    instances_reaped: Counter,
    idle_workers: Gauge,
    is_master: Gauge,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            jobs_enqueued: counter!(names::JOBS_ENQUEUED_TOTAL),
            jobs_dispatched: counter!(names::JOBS_DISPATCHED_TOTAL),
            inputs_failed: counter!(names::INPUTS_FAILED_TOTAL),
            workers_spawned: counter!(names::WORKERS_SPAWNED_TOTAL),
            instances_reaped: counter!(names::INSTANCES_REAPED_TOTAL),
            idle_workers: gauge!(names::WORKERS_IDLE),
            is_master: gauge!(names::INSTANCE_IS_MASTER),
        }
    }

    pub fn record_jobs_enqueued(&self, count: usize) {
        self.jobs_enqueued.increment(count as u64);
    }

    pub fn record_job_dispatched(&self) {
        self.jobs_dispatched.increment(1);
    }

    /// 任务到达 COMPLETED / RETRYING / FAILED 等结束状态
    pub fn record_job_finished(&self, status: &str) {
        counter!(names::JOBS_FINISHED_TOTAL, "status" => status.to_string()).increment(1);
        debug!(status = status, "任务执行结束");
    }

    /// `stage` 为 queued 或 processing
    pub fn record_jobs_timed_out(&self, stage: &'static str, count: usize) {
        counter!(names::JOBS_TIMED_OUT_TOTAL, "stage" => stage).increment(count as u64);
    }

    pub fn record_input_failed(&self) {
        self.inputs_failed.increment(1);
    }

    pub fn record_notification(&self, transport: &'static str, status: &str) {
        counter!(
            names::NOTIFICATIONS_TOTAL,
            "transport" => transport,
            "status" => status.to_string()
        )
        .increment(1);
    }

    pub fn record_worker_spawned(&self) {
        self.workers_spawned.increment(1);
    }

    /// `reason` 为 exited / signaled / error
    pub fn record_worker_exited(&self, reason: &'static str) {
        counter!(names::WORKERS_EXITED_TOTAL, "reason" => reason).increment(1);
    }

    pub fn update_idle_workers(&self, count: usize) {
        self.idle_workers.set(count as f64);
    }

    pub fn update_master(&self, is_master: bool) {
        self.is_master.set(if is_master { 1.0 } else { 0.0 });
    }

    pub fn record_instances_reaped(&self, count: usize) {
        self.instances_reaped.increment(count as u64);
    }
}

/// 安装 Prometheus 导出器并在 `address` 上提供 `/metrics`，需在 tokio 运行时内调用
pub fn install_prometheus_exporter(address: &str) -> Result<()> {
    let addr: SocketAddr = address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {address}"))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    info!("Prometheus 指标导出器已启动: {}", addr);
    Ok(())
}
