//! # Transcoder Testing Utils
//!
//! 工作区共享的测试工具：测试数据构建器、手写的协作者替身、
//! PostgreSQL 测试容器以及异步等待辅助函数。
//!
//! ```toml
//! [dev-dependencies]
//! transcoder-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod containers;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use containers::*;
pub use helpers::*;
pub use mocks::*;
