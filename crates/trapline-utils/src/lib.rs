//! # Trapline Utilities
//!
//! Shared utilities for the Trapline workspace, currently the logging setup
//! built on `tracing`.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{LogFormat, LogLevel, LoggingError, init_logging, init_logging_with_level};
pub use tracing::{debug, error, info, trace, warn};
