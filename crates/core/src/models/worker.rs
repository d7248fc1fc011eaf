use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Timeout,
    Terminated,
}

impl_text_enum!(WorkerStatus {
    Idle => "IDLE",
    Busy => "BUSY",
    Timeout => "TIMEOUT",
    Terminated => "TERMINATED",
});

/// 实例上的一个工作槽位，同一时刻最多承载一个转码子进程
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Worker {
    pub key: String,
    #[sqlx(rename = "idx")]
    pub index: i32,
    pub instance_key: String,
    pub job_key: Option<String>,
    pub status: WorkerStatus,
    pub outcome: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(instance_key: &str, index: i32, now: DateTime<Utc>) -> Self {
        Self {
            key: Self::key_for(instance_key, index),
            index,
            instance_key: instance_key.to_string(),
            job_key: None,
            status: WorkerStatus::Idle,
            outcome: None,
            updated_at: now,
            created_at: now,
        }
    }

    /// 由 `instance_key:index` 推导出的确定性 key，重启后保持不变
    pub fn key_for(instance_key: &str, index: i32) -> String {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{instance_key}:{index}").as_bytes(),
        )
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_key_is_deterministic() {
        let a = Worker::key_for("instance-a", 0);
        assert_eq!(a, Worker::key_for("instance-a", 0));
        assert_ne!(a, Worker::key_for("instance-a", 1));
        assert_ne!(a, Worker::key_for("instance-b", 0));
    }

    #[test]
    fn test_new_worker_is_idle() {
        let worker = Worker::new("instance-a", 3, Utc::now());
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.index, 3);
        assert!(worker.job_key.is_none());
    }
}
