//! Browser objects the tracker drives.
//!
//! ```text
//! Container (navigator.serviceWorker)
//!     ├── controller
//!     └── Registration
//!             ├── installing (ServiceWorker)
//!             ├── waiting (ServiceWorker)
//!             └── active (ServiceWorker)
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use swkit_channel::MessageTarget;
use tokio::sync::{broadcast, watch};
use url::Url;

use crate::HostError;

// ==================== Types ====================

/// Identity of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Initial state, script being parsed.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active; may control pages.
    Activated,
    /// Replaced or failed to install.
    Redundant,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for [`Container::register`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationOptions {
    /// Scope URL. Defaults to the directory of the script.
    pub scope: Option<String>,
}

impl RegistrationOptions {
    pub fn scope(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
        }
    }
}

// ==================== Traits ====================

/// A worker instance as seen from the page.
///
/// Messages posted to it are delivered to the worker's message listener.
pub trait ServiceWorker: MessageTarget + Debug {
    fn id(&self) -> WorkerId;

    fn script_url(&self) -> &Url;

    fn state(&self) -> WorkerState;

    /// Receiver of `statechange` notifications. Intermediate states may be
    /// coalesced when several transitions happen between two polls.
    fn subscribe_state(&self) -> watch::Receiver<WorkerState>;
}

pub type WorkerHandle = Arc<dyn ServiceWorker>;

/// Binding between a worker script and a scope.
#[async_trait]
pub trait Registration: Send + Sync + Debug {
    fn scope(&self) -> &Url;

    fn installing(&self) -> Option<WorkerHandle>;

    fn waiting(&self) -> Option<WorkerHandle>;

    fn active(&self) -> Option<WorkerHandle>;

    /// Revalidate the worker script against the network. A changed script
    /// shows up as a new installing worker.
    async fn update(&self) -> Result<(), HostError>;

    async fn unregister(&self) -> Result<bool, HostError>;

    /// Receiver of `updatefound` notifications.
    fn subscribe_update_found(&self) -> broadcast::Receiver<()>;
}

pub type RegistrationRef = Arc<dyn Registration>;

/// `navigator.serviceWorker`.
#[async_trait]
pub trait Container: Send + Sync {
    async fn register(
        &self,
        script_url: &str,
        options: &RegistrationOptions,
    ) -> Result<RegistrationRef, HostError>;

    /// Worker controlling the page, if any.
    fn controller(&self) -> Option<WorkerHandle>;

    /// Receiver of `controllerchange` notifications.
    fn subscribe_controller_change(&self) -> broadcast::Receiver<()>;
}

/// `window.location.reload()`.
pub trait PageReload: Send + Sync {
    fn reload(&self);
}

impl<F> PageReload for F
where
    F: Fn() + Send + Sync,
{
    fn reload(&self) {
        self()
    }
}
