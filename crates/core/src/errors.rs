use thiserror::Error;

/// 转码调度系统错误类型定义
#[derive(Debug, Error)]
pub enum TranscoderError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("任务未找到: {key}")]
    JobNotFound { key: String },

    #[error("Worker未找到: {key}")]
    WorkerNotFound { key: String },

    #[error("实例未找到: {key}")]
    InstanceNotFound { key: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("媒体处理错误: {0}")]
    Media(String),

    #[error("下载失败: {0}")]
    Download(String),

    #[error("上传失败: {0}")]
    Upload(String),

    #[error("通知发送失败: {0}")]
    Notification(String),

    #[error("子进程错误: {0}")]
    Process(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TranscoderError {
    fn from(err: serde_json::Error) -> Self {
        TranscoderError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for TranscoderError {
    fn from(err: config::ConfigError) -> Self {
        TranscoderError::Configuration(err.to_string())
    }
}

impl TranscoderError {
    /// 数据库连接类的瞬时错误，循环可以在下一个周期重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TranscoderError::Database(sqlx::Error::PoolTimedOut)
                | TranscoderError::Database(sqlx::Error::PoolClosed)
                | TranscoderError::Database(sqlx::Error::Io(_))
        )
    }
}

/// 统一的Result类型
pub type TranscoderResult<T> = std::result::Result<T, TranscoderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TranscoderError::JobNotFound {
            key: "job-1".to_string(),
        };
        assert_eq!(err.to_string(), "任务未找到: job-1");
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: TranscoderError = parse.unwrap_err().into();
        assert!(matches!(err, TranscoderError::Serialization(_)));
    }

    #[test]
    fn test_transient_detection() {
        assert!(TranscoderError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!TranscoderError::Internal("x".to_string()).is_transient());
    }
}
