use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::info;
use transcoder_core::{
    models::{InputSource, JobInput},
    traits::ObjectStorage,
    TranscoderError, TranscoderResult,
};

/// 把任务输入取到本地临时目录
pub struct InputDownloader {
    client: reqwest::Client,
    storage: Arc<dyn ObjectStorage>,
}

/// 输入文件名保留原扩展名，方便 ffmpeg 识别容器格式
fn input_file_name(location: &str) -> String {
    let path = location.split(['?', '#']).next().unwrap_or(location);
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() && ext.len() <= 8 => format!("input.{ext}"),
        _ => "input".to_string(),
    }
}

impl InputDownloader {
    pub fn new(storage: Arc<dyn ObjectStorage>, timeout: Duration) -> TranscoderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TranscoderError::Download(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { client, storage })
    }

    pub async fn download(&self, input: &JobInput, dest_dir: &Path) -> TranscoderResult<PathBuf> {
        let target = match &input.source {
            InputSource::Http { url, headers } => {
                let target = dest_dir.join(input_file_name(url));
                self.download_http(url, headers, &target).await?;
                target
            }
            InputSource::Local { path } => {
                let target = dest_dir.join(input_file_name(path));
                tokio::fs::copy(path, &target)
                    .await
                    .map_err(|e| TranscoderError::Download(format!("读取本地输入 {path} 失败: {e}")))?;
                target
            }
            InputSource::Storage { path } => {
                let target = dest_dir.join(input_file_name(path));
                let bytes = self
                    .storage
                    .read(path)
                    .await
                    .map_err(|e| TranscoderError::Download(format!("读取存储对象 {path} 失败: {e}")))?;
                tokio::fs::write(&target, bytes).await?;
                target
            }
        };

        let size = tokio::fs::metadata(&target).await?.len();
        if size == 0 {
            return Err(TranscoderError::Download("输入文件为空".to_string()));
        }
        info!("输入下载完成: {} ({} 字节)", target.display(), size);
        Ok(target)
    }

    async fn download_http(
        &self,
        url: &str,
        headers: &std::collections::BTreeMap<String, String>,
        target: &Path,
    ) -> TranscoderResult<()> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let mut response = request
            .send()
            .await
            .map_err(|e| TranscoderError::Download(format!("请求 {url} 失败: {e}")))?;
        if !response.status().is_success() {
            return Err(TranscoderError::Download(format!(
                "请求 {url} 返回 {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(target).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TranscoderError::Download(format!("读取 {url} 响应失败: {e}")))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}
