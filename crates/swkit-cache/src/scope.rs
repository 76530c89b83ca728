//! The worker global scope as seen by the engine.

use async_trait::async_trait;
use url::Url;

use crate::ScopeError;

/// `self.registration.navigationPreload`.
#[async_trait]
pub trait NavigationPreload: Send + Sync {
    async fn enable(&self) -> Result<(), ScopeError>;
}

/// Worker global scope.
#[async_trait]
pub trait WorkerScope: Send + Sync {
    /// Location of the worker script. Relative URLs resolve against it.
    fn location(&self) -> &Url;

    /// Ask the browser to activate this worker without waiting for clients
    /// of the previous one to close.
    async fn skip_waiting(&self) -> Result<(), ScopeError>;

    /// Navigation preload support, when the runtime has it.
    fn navigation_preload(&self) -> Option<&dyn NavigationPreload> {
        None
    }
}
