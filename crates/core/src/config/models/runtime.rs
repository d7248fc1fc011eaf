use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 实例运行时配置：心跳、选主与清理节奏
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 显式实例标识，未设置时由本机IP或主机名推导
    pub instance_id: Option<String>,
    pub maintain_interval_ms: u64,
    pub online_timeout_seconds: u64,
    pub purge_after_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            maintain_interval_ms: 5_000,
            online_timeout_seconds: 15, // 15秒无心跳视为离线
            purge_after_seconds: 60,    // 离线1分钟后删除
            cleanup_interval_seconds: 3_600,
        }
    }
}

impl RuntimeConfig {
    pub fn maintain_interval(&self) -> Duration {
        Duration::from_millis(self.maintain_interval_ms)
    }

    pub fn online_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.online_timeout_seconds as i64)
    }

    pub fn purge_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.purge_after_seconds as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.maintain_interval_ms == 0 {
            return Err(anyhow::anyhow!("维护间隔必须大于0"));
        }
        if self.online_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("在线超时时间必须大于0"));
        }
        if self.online_timeout_seconds * 1_000 <= self.maintain_interval_ms {
            return Err(anyhow::anyhow!("在线超时时间必须大于维护间隔"));
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(anyhow::anyhow!("清理间隔必须大于0"));
        }
        if let Some(id) = &self.instance_id {
            if id.trim().is_empty() {
                return Err(anyhow::anyhow!("实例ID不能为空字符串"));
            }
        }
        Ok(())
    }
}

/// Worker池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub max: u32,
    pub busy_timeout_seconds: u64,
    pub idle_after_seconds: u64,
    /// worker可执行文件路径，默认与当前可执行文件同目录的 transcoder-worker
    pub command: Option<String>,
    pub temp_dir: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max: 4,
            busy_timeout_seconds: 300, // 5分钟未更新视为卡死
            idle_after_seconds: 10,
            command: None,
            temp_dir: std::env::temp_dir()
                .join("transcoder")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

impl WorkersConfig {
    pub fn busy_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.busy_timeout_seconds as i64)
    }

    pub fn idle_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_after_seconds as i64)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max == 0 {
            return Err(anyhow::anyhow!("Worker数量必须大于0"));
        }
        if self.busy_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Worker忙碌超时时间必须大于0"));
        }
        if self.temp_dir.is_empty() {
            return Err(anyhow::anyhow!("临时目录不能为空"));
        }
        Ok(())
    }
}

/// 保留期配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub retention_seconds: u64,
}

impl RetentionConfig {
    pub fn days(days: u64) -> Self {
        Self {
            retention_seconds: days * 24 * 3_600,
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_seconds as i64)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self::days(7)
    }
}
