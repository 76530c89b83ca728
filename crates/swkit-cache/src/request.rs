//! Requests and responses as seen by the worker.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use url::Url;

/// Request mode (`request.mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level or frame navigation.
    Navigate,
    SameOrigin,
    NoCors,
    #[default]
    Cors,
}

/// HTTP cache interaction (`request.cache`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    NoStore,
    /// Bypass the HTTP cache and update it with the network response.
    Reload,
    NoCache,
    ForceCache,
}

/// Redirect handling (`request.redirect`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    #[default]
    Follow,
    Manual,
    Error,
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

/// A request intercepted or issued by the worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub cache: CacheMode,
    pub credentials: CredentialsMode,
    pub redirect: RedirectMode,
    pub referrer: Option<Url>,
    pub integrity: Option<String>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            cache: CacheMode::default(),
            credentials: CredentialsMode::default(),
            redirect: RedirectMode::default(),
            referrer: None,
            integrity: None,
        }
    }

    /// Create a navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            credentials: CredentialsMode::Include,
            ..Self::get(url)
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// The same request pointed at `url`.
    ///
    /// Navigation requests cannot be constructed with mode `navigate`, so
    /// they are rebuilt as `same-origin` with manual redirects, keeping
    /// body, credentials, headers, integrity and referrer.
    pub fn redirect_to(&self, url: Url) -> Self {
        if self.mode != RequestMode::Navigate {
            return Self {
                url,
                ..self.clone()
            };
        }

        Self {
            url,
            method: self.method.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            mode: RequestMode::SameOrigin,
            cache: CacheMode::default(),
            credentials: self.credentials,
            redirect: RedirectMode::Manual,
            referrer: self.referrer.clone(),
            integrity: self.integrity.clone(),
        }
    }
}

/// A response coming from the network, a preload or a cache.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whether the response was served from a worker cache.
    pub from_cache: bool,
}

impl Response {
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            from_cache: false,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Header value as a string, when present and visible ASCII.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}
