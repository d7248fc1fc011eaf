pub mod clock;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use errors::{TranscoderError, TranscoderResult};
pub use logging::init_logging;
