//! Countdown Core Library
//!
//! Shared configuration, logging setup and error types for the countdown
//! offline worker and its runtime adapter.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{NotificationAction, NotificationConfig, WorkerConfig};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, LogConfig, LogFormat};
