//! # swkit Common
//!
//! Logging configuration and small helpers shared by the page side
//! (`swkit-update`) and the worker side (`swkit-cache`).
//!
//! ## Features
//!
//! - Log verbosity levels as accepted by the worker configuration
//! - Subscriber setup for hosts embedding swkit
//! - URL resolution against a worker or page location

use url::Url;

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, ParseLogLevelError};

/// Resolve `input` against `base`, the way `new URL(input, location)` does.
pub fn resolve_url(base: &Url, input: &str) -> Result<Url, url::ParseError> {
    base.join(input)
}
