use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// jobs_queue 中的一行，key 与任务 key 相同
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueEntry {
    pub key: String,
    pub priority: i32,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(job_key: &str, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            key: job_key.to_string(),
            priority,
            locked_by: None,
            created_at: now,
        }
    }
}
