pub mod cleanup_service;
pub mod instance_registry;
pub mod job_scheduler;
pub mod maintenance;
pub mod supervisor;
pub mod ticker;
pub mod worker_pool;

pub use cleanup_service::{CleanupService, CleanupStats, RetentionPolicy};
pub use instance_registry::{collect_specs, derive_instance_key, InstanceRegistry};
pub use job_scheduler::JobScheduler;
pub use maintenance::{MaintenanceReport, MaintenanceService};
pub use supervisor::{WorkerCommand, WorkerLauncher, WorkerSupervisor};
pub use ticker::run_periodic;
pub use worker_pool::{PoolReconcileStats, WorkerPool};
