//! 实例注册、心跳与主节点选举

use std::net::UdpSocket;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use transcoder_core::{
    models::{Instance, InstanceSpecs, InstanceType},
    traits::{InstanceRepository, WorkerRepository},
    Clock, TranscoderResult,
};

/// 采集本机信息
pub fn collect_specs(version: &str) -> InstanceSpecs {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);

    InstanceSpecs {
        hostname,
        ip_address: outbound_ip(),
        cpu_count,
        total_memory_mb: total_memory_mb(),
        pid: std::process::id(),
        version: version.to_string(),
    }
}

/// 通过 UDP connect 探测出站网卡地址，不会真正发包
fn outbound_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then(|| ip.to_string())
}

fn total_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_total_kb(&meminfo).map(|kb| kb / 1024)
}

fn parse_mem_total_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// 实例 key：优先使用配置的 instance_id，其次出站 IP，最后主机名
pub fn derive_instance_key(configured: Option<&str>, specs: &InstanceSpecs) -> String {
    let seed = configured
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .or_else(|| specs.ip_address.clone())
        .unwrap_or_else(|| specs.hostname.clone());
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

/// 一次选举需要写入的角色变更
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ElectionPlan {
    pub master: Option<String>,
    pub promote: Option<String>,
    pub demote: Vec<String>,
}

/// 保留仍活跃的主节点；没有时提升第一个活跃实例。其余标记为 MASTER 的行一律降级。
/// `instances` 需按 created_at、key 排序。
pub fn plan_election(
    instances: &[Instance],
    now: DateTime<Utc>,
    online_timeout: Duration,
) -> ElectionPlan {
    let mut active = instances.iter().filter(|i| i.is_active(now, online_timeout));
    let existing = active.clone().find(|i| i.is_master());

    let (master, promote) = match existing {
        Some(master) => (Some(master.key.clone()), None),
        None => match active.next() {
            Some(first) => (Some(first.key.clone()), Some(first.key.clone())),
            None => (None, None),
        },
    };

    let demote = instances
        .iter()
        .filter(|i| i.is_master() && Some(&i.key) != master.as_ref())
        .map(|i| i.key.clone())
        .collect();

    ElectionPlan {
        master,
        promote,
        demote,
    }
}

pub struct InstanceRegistry {
    key: String,
    specs: InstanceSpecs,
    instances: Arc<dyn InstanceRepository>,
    workers: Arc<dyn WorkerRepository>,
    clock: Arc<dyn Clock>,
    online_timeout: Duration,
}

impl InstanceRegistry {
    pub fn new(
        key: String,
        specs: InstanceSpecs,
        instances: Arc<dyn InstanceRepository>,
        workers: Arc<dyn WorkerRepository>,
        clock: Arc<dyn Clock>,
        online_timeout: Duration,
    ) -> Self {
        Self {
            key,
            specs,
            instances,
            workers,
            clock,
            online_timeout,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// 首次启动插入实例行，重启时累加 restart_count
    pub async fn initialize(&self) -> TranscoderResult<()> {
        let now = self.clock.now();
        match self.instances.get(&self.key).await? {
            None => {
                self.instances
                    .create(&Instance::new(&self.key, self.specs.clone(), now))
                    .await?;
                info!("实例 {} 注册成功 ({})", self.key, self.specs.hostname);
            }
            Some(existing) => {
                self.instances.restart(&self.key, &self.specs, now).await?;
                info!(
                    "实例 {} 重新上线，第 {} 次重启",
                    self.key,
                    existing.restart_count + 1
                );
            }
        }
        Ok(())
    }

    /// 实例行被其他主节点清理后重新插入
    pub async fn ensure_registered(&self) -> TranscoderResult<()> {
        if self.instances.get(&self.key).await?.is_none() {
            warn!("实例 {} 的记录不存在，重新注册", self.key);
            self.instances
                .create(&Instance::new(&self.key, self.specs.clone(), self.clock.now()))
                .await?;
        }
        Ok(())
    }

    /// 刷新心跳，同时刷新本实例空闲 worker 的 updated_at
    pub async fn heartbeat(&self) -> TranscoderResult<()> {
        let now = self.clock.now();
        if !self.instances.heartbeat(&self.key, &self.specs, now).await? {
            self.ensure_registered().await?;
        }
        let touched = self.workers.touch_idle(&self.key, now).await?;
        debug!("实例 {} 心跳，刷新 {} 个空闲worker", self.key, touched);
        Ok(())
    }

    /// 返回本实例是否为主节点
    pub async fn elect_master(&self) -> TranscoderResult<bool> {
        let now = self.clock.now();
        let instances = self.instances.list().await?;
        let plan = plan_election(&instances, now, self.online_timeout);

        if let Some(key) = &plan.promote {
            self.instances.set_type(key, InstanceType::Master).await?;
            info!("实例 {} 当选主节点", key);
        }
        for key in &plan.demote {
            self.instances.set_type(key, InstanceType::Slave).await?;
            info!("实例 {} 降级为从节点", key);
        }

        Ok(plan.master.as_deref() == Some(self.key.as_str()))
    }

    pub async fn mark_offline(&self, outcome: &str) -> TranscoderResult<()> {
        self.instances
            .mark_offline(&self.key, outcome, self.clock.now())
            .await?;
        info!("实例 {} 已下线: {}", self.key, outcome);
        Ok(())
    }
}
