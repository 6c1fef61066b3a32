pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod log;
pub mod memory;
pub mod models;
pub mod processor;
pub mod report;
pub mod store;
pub mod worker;

pub use config::{ProcessorConfig, ThrottlePolicy, ThrottleTier};
pub use error::{ProcessorError, Result};
pub use processor::{CourseDataProcessor, DispatchOutcome};
pub use worker::Worker;
