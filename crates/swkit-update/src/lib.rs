//! # swkit Update
//!
//! Page side of the service worker: registration, update detection and
//! activation of a new worker version.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                UpdateTracker                  │
//! │  register / check_for_update / activate_update│
//! └───────────────┬──────────────────────────────┘
//!                 │ host traits
//! ┌───────────────▼──────────────────────────────┐
//! │ Container ── Registration ── ServiceWorker    │
//! │   (MemoryBrowser, or a real browser binding)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Worker lifecycle:
//!
//! ```text
//! parsed → installing → installed → activating → activated
//!               │            │            │
//!               └────────────┴────────────┴──► redundant
//! ```

use swkit_channel::ChannelError;
use thiserror::Error;

pub mod host;
pub mod memory;
pub mod signal;
pub mod tracker;

pub use host::{
    Container, PageReload, Registration, RegistrationOptions, RegistrationRef, ServiceWorker,
    WorkerHandle, WorkerId, WorkerState,
};
pub use memory::{MemoryBrowser, MemoryRegistration, MemoryWorker};
pub use signal::{ListenerId, Signal};
pub use tracker::{ActivateOptions, ControllerListener, RegistrationHandle, Update, UpdateTracker};

/// Errors raised by the browser objects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Service workers are not available")]
    Unavailable,

    #[error("Security error: {0}")]
    Security(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid URL {url}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Errors raised by [`UpdateTracker`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpdateError {
    #[error("register must be called first")]
    NotRegistered,

    #[error("No worker update")]
    NoUpdate,

    #[error("No service worker")]
    NoWorker,

    #[error("Worker became redundant")]
    Redundant,

    #[error("Worker was dropped")]
    WorkerGone,

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
