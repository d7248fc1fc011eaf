use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use transcoder_core::{
    models::{Destination, Job, JobOutput, OutputOutcome},
    traits::ObjectStorage,
    TranscoderError, TranscoderResult,
};

/// 把转码结果送到任务指定的目的地
pub struct OutputUploader {
    client: reqwest::Client,
    storage: Arc<dyn ObjectStorage>,
}

impl OutputUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>, timeout: Duration) -> TranscoderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TranscoderError::Upload(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { client, storage })
    }

    pub async fn upload(
        &self,
        job: &Job,
        output: &JobOutput,
        file: &Path,
    ) -> TranscoderResult<OutputOutcome> {
        let file_name = output
            .file_name()
            .map_err(|e| TranscoderError::Upload(e.to_string()))?;
        let (location, size) = match &job.destination {
            Destination::Storage { prefix } => {
                let prefix = prefix.clone().unwrap_or_else(|| job.storage_prefix());
                let path = format!("{}/{}", prefix.trim_end_matches('/'), file_name);
                let size = self
                    .storage
                    .upload(&path, file)
                    .await
                    .map_err(|e| TranscoderError::Upload(format!("写入存储 {path} 失败: {e}")))?;
                (path, size)
            }
            Destination::Local { directory } => {
                let dir = PathBuf::from(directory).join(&job.key);
                tokio::fs::create_dir_all(&dir).await?;
                let target = dir.join(&file_name);
                let size = tokio::fs::copy(file, &target).await.map_err(|e| {
                    TranscoderError::Upload(format!("复制到 {} 失败: {e}", target.display()))
                })?;
                (target.to_string_lossy().into_owned(), size)
            }
            Destination::Http { url, headers } => {
                let url = format!("{}/{}", url.trim_end_matches('/'), file_name);
                let size = self.put_http(&url, headers, file).await?;
                (url, size)
            }
        };

        info!(job_key = %job.key, "输出 {} 已上传到 {}", output.index, location);
        Ok(OutputOutcome {
            message: None,
            location: Some(location),
            size_bytes: Some(size),
        })
    }

    async fn put_http(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        file: &Path,
    ) -> TranscoderResult<u64> {
        let body = tokio::fs::read(file).await?;
        let size = body.len() as u64;

        let mut request = self.client.put(url).body(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| TranscoderError::Upload(format!("PUT {url} 失败: {e}")))?;
        if !response.status().is_success() {
            return Err(TranscoderError::Upload(format!(
                "PUT {url} 返回 {}",
                response.status()
            )));
        }
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use transcoder_testing_utils::{mp4_output, InMemoryStorage, JobBuilder};

    async fn rendered(dir: &TempDir) -> PathBuf {
        let file = dir.path().join("output-0.mp4");
        tokio::fs::write(&file, b"rendered").await.unwrap();
        file
    }

    #[tokio::test]
    async fn test_upload_to_storage_uses_job_prefix() {
        let scratch = TempDir::new().unwrap();
        let file = rendered(&scratch).await;
        let storage = Arc::new(InMemoryStorage::new());
        let uploader = OutputUploader::new(storage.clone(), Duration::from_secs(5)).unwrap();

        let job = JobBuilder::new("job-1").build();
        let outcome = uploader
            .upload(&job, &mp4_output("job-1", 0), &file)
            .await
            .unwrap();

        assert_eq!(outcome.location.as_deref(), Some("/jobs/job-1/output-0.mp4"));
        assert_eq!(outcome.size_bytes, Some(8));
        assert_eq!(storage.paths(), vec!["/jobs/job-1/output-0.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_upload_to_local_directory() {
        let scratch = TempDir::new().unwrap();
        let file = rendered(&scratch).await;
        let target = TempDir::new().unwrap();
        let uploader =
            OutputUploader::new(Arc::new(InMemoryStorage::new()), Duration::from_secs(5)).unwrap();

        let job = JobBuilder::new("job-2")
            .with_destination(Destination::Local {
                directory: target.path().to_string_lossy().into_owned(),
            })
            .build();
        uploader
            .upload(&job, &mp4_output("job-2", 0), &file)
            .await
            .unwrap();

        let copied = target.path().join("job-2").join("output-0.mp4");
        assert_eq!(tokio::fs::read(copied).await.unwrap(), b"rendered");
    }

    #[tokio::test]
    async fn test_file_name_with_parent_segment_is_rejected() {
        let scratch = TempDir::new().unwrap();
        let file = rendered(&scratch).await;
        let target = TempDir::new().unwrap();
        let uploader =
            OutputUploader::new(Arc::new(InMemoryStorage::new()), Duration::from_secs(5)).unwrap();

        let job = JobBuilder::new("job-3")
            .with_destination(Destination::Local {
                directory: target.path().join("out").to_string_lossy().into_owned(),
            })
            .build();
        let mut output = mp4_output("job-3", 0);
        output.specs.file_name = Some("../../escaped.mp4".to_string());

        let err = uploader.upload(&job, &output, &file).await.unwrap_err();
        assert!(matches!(err, TranscoderError::Upload(_)));
        assert!(!target.path().join("escaped.mp4").exists());
    }
}
