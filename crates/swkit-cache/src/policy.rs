//! Caching decisions delegated to the embedder.

use std::fmt::Debug;

use http::Method;
use url::Url;

use crate::cache_control::response_uses_long_term_caching;
use crate::request::{Request, Response};

/// Facts about a URL that policies commonly need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    /// The URL belongs to the install-time pre-cache set.
    pub was_cached_on_install: bool,
}

/// Input to [`CachePolicy::should_reload_on_install`].
#[derive(Debug, Clone, Copy)]
pub struct InstallContext<'a> {
    pub url: &'a Url,
    /// The URL is flagged as versioned (immutable content).
    pub versioned: bool,
    /// What any existing cache currently holds for the URL.
    pub previous_response: Option<&'a Response>,
}

/// Decides which requests the engine handles and which entries it keeps.
pub trait CachePolicy: Send + Sync + Debug {
    /// Whether the worker answers `request` (cache first, then network).
    fn should_handle_request(&self, request: &Request, ctx: &RequestContext) -> bool;

    /// Whether a cached entry of the current cache is dropped on activation.
    fn should_clean_on_activate(&self, response: &Response, url: &str, ctx: &RequestContext)
        -> bool;

    /// Whether the install fetch for a URL must bypass the HTTP cache.
    fn should_reload_on_install(&self, ctx: &InstallContext<'_>) -> bool {
        !ctx.versioned
    }
}

/// Handles GET/HEAD requests for pre-cached URLs and drops every other entry
/// on activation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl CachePolicy for DefaultPolicy {
    fn should_handle_request(&self, request: &Request, ctx: &RequestContext) -> bool {
        if request.method != Method::GET && request.method != Method::HEAD {
            return false;
        }
        ctx.was_cached_on_install
    }

    fn should_clean_on_activate(
        &self,
        _response: &Response,
        _url: &str,
        ctx: &RequestContext,
    ) -> bool {
        !ctx.was_cached_on_install
    }
}

/// Like [`DefaultPolicy`], but skips the install-time reload when the
/// previously cached response carries a positive `max-age`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongTermCachePolicy;

impl CachePolicy for LongTermCachePolicy {
    fn should_handle_request(&self, request: &Request, ctx: &RequestContext) -> bool {
        DefaultPolicy.should_handle_request(request, ctx)
    }

    fn should_clean_on_activate(
        &self,
        response: &Response,
        url: &str,
        ctx: &RequestContext,
    ) -> bool {
        DefaultPolicy.should_clean_on_activate(response, url, ctx)
    }

    fn should_reload_on_install(&self, ctx: &InstallContext<'_>) -> bool {
        if ctx.versioned {
            return false;
        }
        !ctx.previous_response.is_some_and(response_uses_long_term_caching)
    }
}
