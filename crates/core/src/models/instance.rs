use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 实例角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceType {
    Master,
    Slave,
}

impl_text_enum!(InstanceType {
    Master => "MASTER",
    Slave => "SLAVE",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Online,
    Offline,
}

impl_text_enum!(InstanceStatus {
    Online => "ONLINE",
    Offline => "OFFLINE",
});

/// 主机遥测信息，每次心跳刷新
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceSpecs {
    pub hostname: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub cpu_count: u32,
    #[serde(default)]
    pub total_memory_mb: Option<u64>,
    pub pid: u32,
    pub version: String,
}

/// 集群中的一个转码实例
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub key: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub instance_type: InstanceType,
    pub status: InstanceStatus,
    #[sqlx(json)]
    pub specs: InstanceSpecs,
    pub outcome: Option<String>,
    pub restart_count: i32,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(key: impl Into<String>, specs: InstanceSpecs, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            instance_type: InstanceType::Slave,
            status: InstanceStatus::Online,
            specs,
            outcome: None,
            restart_count: 0,
            updated_at: now,
            created_at: now,
        }
    }

    pub fn is_master(&self) -> bool {
        self.instance_type == InstanceType::Master
    }

    /// ONLINE 且心跳在 online_timeout 之内
    pub fn is_active(&self, now: DateTime<Utc>, online_timeout: Duration) -> bool {
        self.status == InstanceStatus::Online && self.updated_at >= now - online_timeout
    }
}
