//! Network access from the worker.

use async_trait::async_trait;
use futures::future::{abortable, Aborted};
use http::header::{CACHE_CONTROL, PRAGMA};
use http::HeaderValue;
use reqwest::Client;
use tracing::{debug, trace};

use crate::request::{CacheMode, RedirectMode, Request, Response};
use crate::NetworkError;

/// Performs a request against the network, bypassing the worker.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Fetch `request`, aborting the in-flight transfer if the fetch fails.
pub async fn fetch_using_network(
    network: &dyn Network,
    request: &Request,
) -> Result<Response, NetworkError> {
    let (fetch, abort_handle) = abortable(network.fetch(request));

    match fetch.await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => {
            abort_handle.abort();
            Err(err)
        }
        Err(Aborted) => Err(NetworkError::Aborted),
    }
}

/// [`Network`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
    manual_redirect_client: Client,
}

impl HttpNetwork {
    pub fn new() -> Result<Self, NetworkError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        let manual_redirect_client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            manual_redirect_client,
        })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        debug!(url = %request.url, method = %request.method, "Fetching from network");

        let client = match request.redirect {
            RedirectMode::Manual => &self.manual_redirect_client,
            RedirectMode::Follow | RedirectMode::Error => &self.client,
        };

        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if matches!(request.cache, CacheMode::Reload | CacheMode::NoCache | CacheMode::NoStore) {
            builder = builder
                .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
                .header(PRAGMA, HeaderValue::from_static("no-cache"));
        }
        if let Some(ref referrer) = request.referrer {
            builder = builder.header(http::header::REFERER, referrer.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;

        if request.redirect == RedirectMode::Error && response.status().is_redirection() {
            return Err(NetworkError::Failed(format!(
                "redirect not allowed for {}",
                request.url
            )));
        }

        let url = response.url().clone();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        trace!(%url, %status, len = body.len(), "Network response");

        Ok(Response {
            url,
            status,
            headers,
            body,
            from_cache: false,
        })
    }
}
