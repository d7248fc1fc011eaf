mod claim;
mod housekeeping_repository;
mod instance_repository;
mod job_output_repository;
mod job_queue_repository;
mod job_repository;
mod manager;
mod notification_repository;
mod worker_repository;

pub use claim::{ClaimSurface, DUE_NOTIFICATIONS, PENDING_JOBS, QUEUED_JOBS};
pub use housekeeping_repository::SqlHousekeepingRepository;
pub use instance_repository::SqlInstanceRepository;
pub use job_output_repository::SqlJobOutputRepository;
pub use job_queue_repository::SqlJobQueueRepository;
pub use job_repository::SqlJobRepository;
pub use manager::{DatabaseManager, DatabasePool, DatabaseType};
pub use notification_repository::SqlNotificationRepository;
pub use worker_repository::SqlWorkerRepository;
