use serde::{Deserialize, Serialize};

/// 本地对象存储
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "./data/storage".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.root.is_empty() {
            return Err(anyhow::anyhow!("存储根目录不能为空"));
        }
        Ok(())
    }
}

/// 媒体工具配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub preview_at_seconds: f64,
    pub download_timeout_seconds: u64,
    /// 内容分类服务地址，未配置时跳过分类
    pub classifier_url: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            preview_at_seconds: 1.0,
            download_timeout_seconds: 3_600,
            classifier_url: None,
        }
    }
}

impl MediaConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ffmpeg_path.is_empty() || self.ffprobe_path.is_empty() {
            return Err(anyhow::anyhow!("ffmpeg/ffprobe 路径不能为空"));
        }
        if self.preview_at_seconds < 0.0 {
            return Err(anyhow::anyhow!("预览截帧时间不能为负数"));
        }
        if let Some(url) = &self.classifier_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(anyhow::anyhow!("分类服务地址必须是HTTP(S): {}", url));
            }
        }
        Ok(())
    }
}
