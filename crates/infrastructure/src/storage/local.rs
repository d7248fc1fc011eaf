use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use transcoder_core::{traits::ObjectStorage, TranscoderError, TranscoderResult};

/// 以本地目录为根的对象存储，对象路径 `/jobs/a/b` 映射为 `{root}/jobs/a/b`
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 拒绝 `..` 等逃逸出根目录的路径
    fn resolve(&self, path: &str) -> TranscoderResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(TranscoderError::Storage(format!("非法的存储路径: {path}")));
                }
            }
        }
        if resolved == self.root {
            return Err(TranscoderError::Storage(format!("存储路径为空: {path}")));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn exists(&self, path: &str) -> TranscoderResult<bool> {
        let target = self.resolve(path)?;
        Ok(fs::try_exists(&target).await?)
    }

    async fn read(&self, path: &str) -> TranscoderResult<Vec<u8>> {
        let target = self.resolve(path)?;
        fs::read(&target)
            .await
            .map_err(|e| TranscoderError::Storage(format!("读取对象 {path} 失败: {e}")))
    }

    async fn upload(&self, path: &str, source: &Path) -> TranscoderResult<u64> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let size = fs::copy(source, &target).await.map_err(|e| {
            TranscoderError::Storage(format!("上传 {} 到 {path} 失败: {e}", source.display()))
        })?;
        debug!("上传对象 {} ({} 字节)", path, size);
        Ok(size)
    }

    async fn delete(&self, path: &str) -> TranscoderResult<()> {
        let target = self.resolve(path)?;
        let metadata = match fs::metadata(&target).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
        }
        debug!("删除对象 {}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_read_and_delete_prefix() {
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let storage = LocalObjectStorage::new(root.path());

        let source = scratch.path().join("preview.jpg");
        std::fs::write(&source, b"jpeg-bytes").unwrap();

        let size = storage
            .upload("/jobs/job-1/preview.jpg", &source)
            .await
            .unwrap();
        assert_eq!(size, 10);
        assert!(storage.exists("/jobs/job-1/preview.jpg").await.unwrap());
        assert_eq!(
            storage.read("/jobs/job-1/preview.jpg").await.unwrap(),
            b"jpeg-bytes"
        );

        storage.delete("/jobs/job-1").await.unwrap();
        assert!(!storage.exists("/jobs/job-1/preview.jpg").await.unwrap());

        // 删除不存在的对象不报错
        storage.delete("/jobs/job-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_root() {
        let root = TempDir::new().unwrap();
        let storage = LocalObjectStorage::new(root.path());
        assert!(storage.read("/jobs/../../etc/passwd").await.is_err());
        assert!(storage.delete("/").await.is_err());
    }
}
