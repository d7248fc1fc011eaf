//! Hand-written collaborator doubles

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use transcoder_core::{
    models::{Job, JobStatus, NotificationStatus},
    traits::{JobNotifier, ObjectStorage},
    TranscoderError, TranscoderResult,
};

/// 记录每次通知的 (job_key, status)，始终返回 SUCCESSFUL
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(String, JobStatus)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, JobStatus)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn statuses_for(&self, job_key: &str) -> Vec<JobStatus> {
        self.calls()
            .into_iter()
            .filter(|(key, _)| key == job_key)
            .map(|(_, status)| status)
            .collect()
    }
}

#[async_trait]
impl JobNotifier for RecordingNotifier {
    async fn notify(&self, job: &Job, status: JobStatus) -> TranscoderResult<NotificationStatus> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((job.key.clone(), status));
        Ok(NotificationStatus::Successful)
    }
}

/// 内存对象存储
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl ObjectStorage for InMemoryStorage {
    async fn exists(&self, path: &str) -> TranscoderResult<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path))
    }

    async fn read(&self, path: &str) -> TranscoderResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
            .ok_or_else(|| TranscoderError::Storage(format!("对象不存在: {path}")))
    }

    async fn upload(&self, path: &str, source: &Path) -> TranscoderResult<u64> {
        let bytes = tokio::fs::read(source).await?;
        let size = bytes.len() as u64;
        self.put(path, &bytes);
        Ok(size)
    }

    async fn delete(&self, path: &str) -> TranscoderResult<()> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|key, _| key != path && !key.starts_with(&prefix));
        Ok(())
    }
}
