//! 配置管理
//!
//! 配置由三层组成：结构体默认值、可选的 TOML 文件、`TRANSCODER_` 前缀的环境变量。
//! 嵌套字段用 `__` 分隔，列表值用逗号分隔：
//!
//! ```text
//! TRANSCODER_WORKERS__MAX=8
//! TRANSCODER_JOBS__NOTIFICATIONS__NOTIFY_ON=COMPLETED,FAILED
//! ```

pub mod models;

pub use models::*;
