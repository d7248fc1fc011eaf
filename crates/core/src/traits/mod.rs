pub mod notifier;
pub mod repository;
pub mod storage;

pub use notifier::JobNotifier;
pub use repository::{
    HousekeepingRepository, InstanceRepository, JobOutputRepository, JobQueueRepository,
    JobRepository, NotificationRepository, WorkerRepository,
};
pub use storage::ObjectStorage;
