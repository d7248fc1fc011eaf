#[macro_use]
mod macros;

pub mod housekeeping;
pub mod instance;
pub mod job;
pub mod job_output;
pub mod media;
pub mod notification;
pub mod queue;
pub mod worker;

pub use housekeeping::{stat_names, LogEntry, LogLevel, Stat};
pub use instance::{Instance, InstanceSpecs, InstanceStatus, InstanceType};
pub use job::{
    job_storage_prefix, Destination, InputSource, Job, JobConfig, JobInput, JobOutcome, JobStatus,
};
pub use job_output::{AudioSpec, JobOutput, OutputOutcome, OutputSpec, OutputStatus, VideoSpec};
pub use media::{MediaInfo, StreamInfo};
pub use notification::{
    Notification, NotificationOutcome, NotificationSpec, NotificationStatus, NotificationTarget,
};
pub use queue::QueueEntry;
pub use worker::{Worker, WorkerStatus};
