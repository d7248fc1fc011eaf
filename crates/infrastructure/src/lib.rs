pub mod database;
pub mod notification;
pub mod observability;
pub mod storage;

pub use database::*;
pub use notification::*;
pub use observability::*;
pub use storage::*;
