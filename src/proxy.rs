//! Reverse proxy to deployed function services.
//!
//! Request routing is pure string work over the function id; the id is
//! never resolved through the store here, the substrate's service DNS is
//! the source of truth. Bodies stream through in both directions.

use std::fmt::Write as _;

use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderValue, Method};
use thiserror::Error;

use crate::substrate::service_name;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Upstream URL for a proxied request:
/// `http://<prefix>-<functionId>-srv:<port><path>[?<query>]`.
pub fn target_url(
    prefix: &str,
    function_id: &str,
    port: u16,
    path: &str,
    query: Option<&str>,
) -> String {
    let mut url = String::from("http://");
    url.push_str(&service_name(prefix, function_id));
    let _ = write!(url, ":{}", port);
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Rewrite hop headers for the upstream leg: the service resolves by its
/// own name, so the inbound `Host` moves to `X-Forwarded-Host`.
pub fn forward_headers(mut headers: HeaderMap) -> HeaderMap {
    if let Some(host) = headers.remove(HOST) {
        headers.insert("x-forwarded-host", host);
    } else {
        headers.insert("x-forwarded-host", HeaderValue::from_static(""));
    }
    headers
}

/// Streaming proxy client for `/serve` traffic.
#[derive(Clone)]
pub struct Proxy {
    client: reqwest::Client,
    prefix: String,
    port: u16,
}

impl Proxy {
    pub fn new(prefix: impl Into<String>, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            prefix: prefix.into(),
            port,
        }
    }

    /// Forward one request to the function's service and hand back the
    /// upstream response for streaming to the caller.
    pub async fn forward(
        &self,
        function_id: &str,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: HeaderMap,
        body: reqwest::Body,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = target_url(&self.prefix, function_id, self.port, path, query);
        let response = self
            .client
            .request(method, &url)
            .headers(forward_headers(headers))
            .body(body)
            .send()
            .await?;
        Ok(response)
    }
}
