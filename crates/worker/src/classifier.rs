use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use transcoder_core::{TranscoderError, TranscoderResult};

/// 基于预览帧的内容分类
#[async_trait]
pub trait ContentClassifier: Send + Sync {
    async fn classify(&self, image: Vec<u8>) -> TranscoderResult<Value>;
}

/// 把 JPEG 以 POST 发送给分类服务，响应体原样作为分类结果
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> TranscoderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TranscoderError::Media(format!("创建分类客户端失败: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ContentClassifier for HttpClassifier {
    async fn classify(&self, image: Vec<u8>) -> TranscoderResult<Value> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(image)
            .send()
            .await
            .map_err(|e| TranscoderError::Media(format!("请求分类服务失败: {e}")))?;

        if !response.status().is_success() {
            return Err(TranscoderError::Media(format!(
                "分类服务返回 {}",
                response.status()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| TranscoderError::Media(format!("解析分类结果失败: {e}")))
    }
}
