use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    jobs::JobsConfig,
    media::{MediaConfig, StorageConfig},
    observability::ObservabilityConfig,
    runtime::{RetentionConfig, RuntimeConfig, WorkersConfig},
};

/// 环境变量前缀，例如 `TRANSCODER_JOBS__QUEUE_TIMEOUT_SECONDS=120`
pub const ENV_PREFIX: &str = "TRANSCODER";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub runtime: RuntimeConfig,
    pub workers: WorkersConfig,
    pub jobs: JobsConfig,
    pub stats: RetentionConfig,
    pub logs: RetentionConfig,
    pub storage: StorageConfig,
    pub media: MediaConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            runtime: RuntimeConfig::default(),
            workers: WorkersConfig::default(),
            jobs: JobsConfig::default(),
            stats: RetentionConfig::days(30),
            logs: RetentionConfig::days(7),
            storage: StorageConfig::default(),
            media: MediaConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TRANSCODER_, nesting: `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/transcoder.toml",
                "transcoder.toml",
                "/etc/transcoder/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("jobs.notifications.notify_on")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.runtime.validate().context("运行时配置验证失败")?;
        self.workers.validate().context("Worker配置验证失败")?;
        self.jobs.validate().context("任务配置验证失败")?;
        self.storage.validate().context("存储配置验证失败")?;
        self.media.validate().context("媒体配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers.max, 4);
        assert_eq!(config.jobs.queue_timeout_seconds, 300);
        assert_eq!(config.jobs.process_timeout_seconds, 1_800);
        assert_eq!(config.runtime.online_timeout_seconds, 15);
        assert_eq!(config.runtime.purge_after_seconds, 60);
        assert_eq!(config.stats.retention_seconds, 30 * 24 * 3_600);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [workers]
            max = 8

            [jobs.notifications]
            notify_on = ["COMPLETED", "FAILED"]
            "#,
        )
        .unwrap();

        assert_eq!(config.workers.max, 8);
        assert_eq!(config.workers.busy_timeout_seconds, 300);
        assert_eq!(
            config.jobs.notifications.notify_on,
            vec![JobStatus::Completed, JobStatus::Failed]
        );
        assert_eq!(config.jobs.enqueue_limit, 10);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(AppConfig::from_toml("[workers]\nmax = 0\n").is_err());
        assert!(AppConfig::from_toml(
            "[jobs.notifications]\nretry_in_seconds = 60\nretry_in_max_seconds = 10\n"
        )
        .is_err());
        assert!(AppConfig::from_toml("[database]\nurl = \"mysql://localhost/db\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[database]\nurl = \"sqlite::memory:\"\n\n[runtime]\ninstance_id = \"edge-1\"\n"
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.runtime.instance_id.as_deref(), Some("edge-1"));
    }

    #[test]
    fn test_bundled_config_file_is_valid() {
        let config =
            AppConfig::from_toml(include_str!("../../../../../config/transcoder.toml")).unwrap();
        assert_eq!(config.workers.max, AppConfig::default().workers.max);
        assert_eq!(config.stats.retention_seconds, 30 * 24 * 3_600);
        assert!(!config.jobs.notifications.notify_on.is_empty());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load(Some("/definitely/not/here.toml")).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.jobs.enqueue_limit, config.jobs.enqueue_limit);
    }
}
