//! Infrastructure layer module
//!
//! Cross-cutting support for the loop:
//! - Configuration management (figment)
//! - Logging infrastructure (tracing)
//! - Retry with exponential backoff for store and oracle calls

pub mod config;
pub mod logging;
pub mod retry;

pub use config::{ConfigError, ConfigLoader};
pub use logging::{LogConfig, LoggerImpl};
pub use retry::{RetryPolicy, RetryableError};
