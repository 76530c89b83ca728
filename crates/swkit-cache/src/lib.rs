//! # swkit Cache
//!
//! Offline cache engine running inside a service worker.
//!
//! ## Architecture
//!
//! ```text
//! WorkerConfig ──► UrlPolicyTable (resolved, deduplicated URLs)
//!      │
//!      ▼
//! CacheEngine
//!   ├── install    fetch every pre-cache URL, store 200 responses
//!   ├── fetch      alias → policy → cache → preload → network
//!   ├── activate   enable preload, prune entries, drop old caches
//!   └── messages   {action, payload} → {status, value}
//!      │
//!      ├── CacheStorage  (named caches)
//!      ├── Network       (abortable fetch)
//!      └── WorkerScope   (skipWaiting, navigation preload)
//! ```
//!
//! Browser facilities are traits so the engine runs against any host;
//! [`MemoryCacheStorage`] and [`HttpNetwork`] are ready-made
//! implementations.

use thiserror::Error;

pub mod actions;
pub mod cache_control;
pub mod cache_name;
pub mod config;
pub mod engine;
pub mod logger;
pub mod network;
pub mod policy;
pub mod request;
pub mod scope;
pub mod storage;
pub mod urls;

pub use actions::{
    Action, ActionContext, ActionError, BuiltinAction, MessageInbox, MessageQueue, Ping,
};
pub use cache_control::{parse_max_age, response_uses_long_term_caching};
pub use cache_name::{cache_name, generate_cache_id};
pub use config::{ConfigError, WorkerConfig};
pub use engine::{CacheEngine, FetchEvent, Fetched, InstallFailure, InstallReport};
pub use logger::WorkerLogger;
pub use network::{fetch_using_network, HttpNetwork, Network};
pub use policy::{CachePolicy, DefaultPolicy, InstallContext, LongTermCachePolicy, RequestContext};
pub use request::{CacheMode, CredentialsMode, RedirectMode, Request, RequestMode, Response};
pub use scope::{NavigationPreload, WorkerScope};
pub use storage::{CacheStorage, MemoryCacheStorage};
pub use urls::{InstallUrl, UrlConfig, UrlConfigs, UrlDirectives, UrlPolicyTable};

/// Cache storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache storage unavailable: {0}")]
    Unavailable(String),

    #[error("Cache {cache} rejected the operation: {reason}")]
    Rejected { cache: String, reason: String },
}

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Network request failed: {0}")]
    Failed(String),

    #[error("Request aborted")]
    Aborted,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised by the worker global scope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("skipWaiting failed: {0}")]
    SkipWaiting(String),

    #[error("Navigation preload failed: {0}")]
    NavigationPreload(String),
}

/// Errors that fail a worker lifecycle phase.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Scope(#[from] ScopeError),
}
