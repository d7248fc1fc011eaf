use std::path::Path;

use async_trait::async_trait;

use crate::errors::TranscoderResult;

/// 以路径为键的对象存储，例如 `/jobs/{key}/preview.jpg`
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn exists(&self, path: &str) -> TranscoderResult<bool>;
    async fn read(&self, path: &str) -> TranscoderResult<Vec<u8>>;
    /// 上传本地文件，返回写入的字节数
    async fn upload(&self, path: &str, source: &Path) -> TranscoderResult<u64>;
    /// 删除对象或以该路径为前缀的全部对象，不存在时不报错
    async fn delete(&self, path: &str) -> TranscoderResult<()>;
}
