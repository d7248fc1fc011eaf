pub mod app_config;
pub mod database;
pub mod jobs;
pub mod media;
pub mod observability;
pub mod runtime;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use jobs::{JobsConfig, NotificationsConfig};
pub use media::{MediaConfig, StorageConfig};
pub use observability::ObservabilityConfig;
pub use runtime::{RetentionConfig, RuntimeConfig, WorkersConfig};
