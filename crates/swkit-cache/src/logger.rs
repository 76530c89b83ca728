//! Worker-scoped logger.

use std::fmt::Display;

use swkit_common::LogLevel;
use tracing::{debug, error, info, warn, Level};

/// Emits `tracing` events under target `sw`, filtered by the worker's own
/// `logLevel` before the subscriber sees them.
#[derive(Debug, Clone)]
pub struct WorkerLogger {
    level: LogLevel,
    background: String,
}

impl WorkerLogger {
    pub fn new(level: LogLevel, background: impl Into<String>) -> Self {
        Self {
            level,
            background: background.into(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, level: Level) -> bool {
        self.level.allows(level)
    }

    pub fn debug(&self, message: impl Display) {
        if self.enabled(Level::DEBUG) {
            debug!(target: "sw", background = %self.background, "{message}");
        }
    }

    pub fn info(&self, message: impl Display) {
        if self.enabled(Level::INFO) {
            info!(target: "sw", background = %self.background, "{message}");
        }
    }

    pub fn warn(&self, message: impl Display) {
        if self.enabled(Level::WARN) {
            warn!(target: "sw", background = %self.background, "{message}");
        }
    }

    pub fn error(&self, message: impl Display) {
        if self.enabled(Level::ERROR) {
            error!(target: "sw", background = %self.background, "{message}");
        }
    }
}

impl Default for WorkerLogger {
    fn default() -> Self {
        Self::new(LogLevel::default(), "#ffdc00")
    }
}
