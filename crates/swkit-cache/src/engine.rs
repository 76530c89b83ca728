//! Install, fetch and activate handlers.

use std::fmt;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use http::StatusCode;
use thiserror::Error;
use url::Url;

use crate::cache_name::cache_name;
use crate::config::{ConfigError, WorkerConfig};
use crate::logger::WorkerLogger;
use crate::network::{fetch_using_network, Network};
use crate::policy::{InstallContext, RequestContext};
use crate::request::{CacheMode, Request, Response};
use crate::scope::WorkerScope;
use crate::storage::CacheStorage;
use crate::urls::{InstallUrl, UrlPolicyTable};
use crate::{CacheError, NetworkError, WorkerError};

/// A request intercepted by the worker.
pub struct FetchEvent {
    pub request: Request,
    /// Navigation preload response, when the browser started one.
    pub preload_response: Option<BoxFuture<'static, Result<Option<Response>, NetworkError>>>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            preload_response: None,
        }
    }

    pub fn with_preload<F>(mut self, preload: F) -> Self
    where
        F: future::Future<Output = Result<Option<Response>, NetworkError>> + Send + 'static,
    {
        self.preload_response = Some(Box::pin(preload));
        self
    }
}

impl fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchEvent")
            .field("request", &self.request)
            .field("preload_response", &self.preload_response.is_some())
            .finish()
    }
}

/// Result of [`CacheEngine::fetch_and_cache`].
#[derive(Debug, Clone)]
pub struct Fetched {
    pub response: Response,
    /// The response was written to the current cache.
    pub cached: bool,
}

/// A pre-cache URL that did not make it into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallFailure {
    pub url: Url,
    pub reason: String,
}

/// Outcome of [`CacheEngine::install`].
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub installed: usize,
    pub total: usize,
    pub failures: Vec<InstallFailure>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.installed == self.total
    }
}

impl fmt::Display for InstallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_complete() {
            write!(f, "{} urls added in cache", self.total)
        } else {
            write!(f, "{}/{} urls added in cache", self.installed, self.total)
        }
    }
}

#[derive(Error, Debug)]
enum LookupError {
    #[error("cache lookup failed: {0}")]
    Cache(#[from] CacheError),
    #[error("preload failed: {0}")]
    Preload(#[from] NetworkError),
}

/// Offline cache engine running inside one worker version.
pub struct CacheEngine {
    config: WorkerConfig,
    cache_name: String,
    urls: UrlPolicyTable,
    logger: WorkerLogger,
    scope: Arc<dyn WorkerScope>,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
}

impl fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("cache_name", &self.cache_name)
            .field("urls", &self.urls)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CacheEngine {
    /// Validate `config`, resolve its URLs against the worker location and
    /// pick a fresh cache name.
    pub fn new(
        config: WorkerConfig,
        scope: Arc<dyn WorkerScope>,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let urls = UrlPolicyTable::build(
            scope.location(),
            &config.generated_urls,
            &config.manual_urls,
        )?;
        let logger = WorkerLogger::new(config.log_level, config.logs_background_color.clone());
        let cache_name = cache_name(&config.cache_prefix);
        logger.info(format_args!("cache key: {cache_name}"));

        Ok(Self {
            config,
            cache_name,
            urls,
            logger,
            scope,
            storage,
            network,
        })
    }

    /// Use a fixed cache name instead of a generated one.
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn urls(&self) -> &UrlPolicyTable {
        &self.urls
    }

    pub fn logger(&self) -> &WorkerLogger {
        &self.logger
    }

    pub fn scope(&self) -> &dyn WorkerScope {
        self.scope.as_ref()
    }

    pub fn storage(&self) -> &dyn CacheStorage {
        self.storage.as_ref()
    }

    // ==================== Install ====================

    /// Pre-cache every install URL concurrently.
    ///
    /// Per-URL failures are logged and reported; install itself never fails.
    pub async fn install(&self) -> InstallReport {
        self.logger.info("install start");

        let entries = self.urls.urls_to_cache_on_install();
        let outcomes = future::join_all(entries.iter().map(|entry| self.install_url(entry))).await;

        let mut report = InstallReport {
            total: entries.len(),
            ..InstallReport::default()
        };
        for (entry, outcome) in entries.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.installed += 1,
                Err(reason) => {
                    self.logger
                        .warn(format_args!("cannot put {} in cache: {reason}", entry.url));
                    report.failures.push(InstallFailure {
                        url: entry.url.clone(),
                        reason,
                    });
                }
            }
        }

        self.logger.info(format_args!("install done ({report})"));
        report
    }

    async fn install_url(&self, entry: &InstallUrl) -> Result<(), String> {
        let previous = match self.storage.match_any(entry.url.as_str()).await {
            Ok(previous) => previous,
            Err(err) => {
                self.logger
                    .debug(format_args!("no previous response for {}: {err}", entry.url));
                None
            }
        };

        let reload = self.config.policy.should_reload_on_install(&InstallContext {
            url: &entry.url,
            versioned: entry.versioned,
            previous_response: previous.as_ref(),
        });

        let mut request = Request::get(entry.url.clone());
        if reload {
            request = request.cache(CacheMode::Reload);
        }

        let fetched = self
            .fetch_and_cache(&request)
            .await
            .map_err(|err| format!("error while fetching: {err}"))?;

        if fetched.cached {
            Ok(())
        } else if fetched.response.status != StatusCode::OK {
            Err(format!("response status ({})", fetched.response.status.as_u16()))
        } else {
            Err("cache write failed".to_string())
        }
    }

    // ==================== Fetch ====================

    /// Rewrite `request` when its URL is aliased.
    pub fn remap_request(&self, request: Request) -> Request {
        match self.urls.alias_for(request.url.as_str()) {
            Some(target) => {
                self.logger
                    .debug(format_args!("redirect request from {} to {target}", request.url));
                request.redirect_to(target.clone())
            }
            None => request,
        }
    }

    /// Answer an intercepted request.
    ///
    /// Returns `None` when the policy leaves the request to the browser.
    pub async fn handle_fetch(&self, event: FetchEvent) -> Option<Result<Response, NetworkError>> {
        let FetchEvent {
            request,
            preload_response,
        } = event;

        let request = self.remap_request(request);
        let ctx = RequestContext {
            was_cached_on_install: self.urls.was_cached_on_install(request.url.as_str()),
        };
        if !self.config.policy.should_handle_request(&request, &ctx) {
            return None;
        }

        Some(self.respond(&request, preload_response).await)
    }

    async fn respond(
        &self,
        request: &Request,
        preload: Option<BoxFuture<'static, Result<Option<Response>, NetworkError>>>,
    ) -> Result<Response, NetworkError> {
        self.logger
            .debug(format_args!("received fetch event for {}", request.url));

        match self.lookup(request, preload).await {
            Ok(Some(response)) => return Ok(response),
            Ok(None) => {}
            Err(err) => {
                self.logger.warn(format_args!(
                    "error while trying to use cache for {}: {err}",
                    request.url
                ));
                return fetch_using_network(self.network.as_ref(), request).await;
            }
        }

        self.logger
            .debug(format_args!("no cache for {}, fetching it", request.url));
        Ok(self.fetch_and_cache(request).await?.response)
    }

    async fn lookup(
        &self,
        request: &Request,
        preload: Option<BoxFuture<'static, Result<Option<Response>, NetworkError>>>,
    ) -> Result<Option<Response>, LookupError> {
        if let Some(response) = self.storage.match_any(request.url.as_str()).await? {
            self.logger
                .debug(format_args!("respond with response from cache for {}", request.url));
            return Ok(Some(response));
        }

        if let Some(preload) = preload {
            if let Some(response) = preload.await? {
                self.logger
                    .debug(format_args!("respond with preloaded response for {}", request.url));
                return Ok(Some(response));
            }
        }

        Ok(None)
    }

    /// Fetch `request` from the network and store a `200` response in the
    /// current cache.
    pub async fn fetch_and_cache(&self, request: &Request) -> Result<Fetched, NetworkError> {
        let response = fetch_using_network(self.network.as_ref(), request).await?;

        if response.status != StatusCode::OK {
            self.logger.warn(format_args!(
                "cannot put {} in cache due to response status ({})",
                request.url,
                response.status.as_u16()
            ));
            return Ok(Fetched {
                response,
                cached: false,
            });
        }

        self.logger.debug(format_args!(
            "fresh response found for {}, put it in cache and respond with it",
            request.url
        ));
        let cached = match self
            .storage
            .put(&self.cache_name, request.url.as_str(), response.clone())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                self.logger
                    .warn(format_args!("cannot put {} in cache: {err}", request.url));
                false
            }
        };

        Ok(Fetched { response, cached })
    }

    // ==================== Activate ====================

    /// Enable navigation preload, clean the current cache and delete caches
    /// of previous versions, concurrently.
    pub async fn activate(&self) -> Result<(), WorkerError> {
        self.logger.info("activate start");
        future::try_join3(
            self.enable_navigation_preload(),
            self.delete_other_urls(),
            self.delete_other_caches(),
        )
        .await?;
        self.logger.info("activate done");
        Ok(())
    }

    async fn enable_navigation_preload(&self) -> Result<(), WorkerError> {
        if !self.config.navigation_preload_enabled {
            return Ok(());
        }
        if let Some(preload) = self.scope.navigation_preload() {
            preload.enable().await?;
        }
        Ok(())
    }

    async fn delete_other_urls(&self) -> Result<(), WorkerError> {
        let keys = self.storage.keys(&self.cache_name).await?;

        future::try_join_all(keys.iter().map(|url| async move {
            let Some(response) = self.storage.match_in(&self.cache_name, url).await? else {
                return Ok::<_, CacheError>(());
            };
            let ctx = RequestContext {
                was_cached_on_install: self.urls.was_cached_on_install(url),
            };
            if self.config.policy.should_clean_on_activate(&response, url, &ctx) {
                self.logger.info(format_args!("delete {url}"));
                self.storage.delete_entry(&self.cache_name, url).await?;
            }
            Ok::<_, CacheError>(())
        }))
        .await?;

        Ok(())
    }

    async fn delete_other_caches(&self) -> Result<(), WorkerError> {
        let names = self.storage.cache_names().await?;

        future::try_join_all(
            names
                .iter()
                .filter(|name| {
                    name.as_str() != self.cache_name && name.starts_with(&self.config.cache_prefix)
                })
                .map(|name| async move {
                    self.logger.info(format_args!("delete cache {name}"));
                    self.storage.delete_cache(name).await
                }),
        )
        .await?;

        Ok(())
    }
}
