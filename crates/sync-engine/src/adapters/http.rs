//! `reqwest` implementation of the HTTP transport port.

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;

use crate::domain::SyncError;
use crate::ports::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};

/// REST transport rooted at a base URL.
pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
}

impl ReqwestTransport {
    /// Transport for `base_url` with a per-attempt `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {}", e)))?;

        Self::with_client(client, base_url)
    }

    /// Transport sharing an existing client.
    pub fn with_client(client: Client, base_url: &str) -> Result<Self, SyncError> {
        // Url::join drops the last segment unless the base ends with '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| SyncError::Config(format!("api base url {}: {}", normalized, e)))?;

        Ok(Self { client, base_url })
    }

    /// Absolute URL of a resource path.
    pub fn url_for(&self, path: &str) -> Result<Url, SyncError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SyncError::Config(format!("bad resource path {}: {}", path, e)))
    }
}

fn transport_error(err: reqwest::Error) -> SyncError {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else {
        "request"
    };
    SyncError::TransportError(format!("{}: {}", kind, err))
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, SyncError> {
        let url = self.url_for(&request.path)?;

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Delete => self.client.delete(url),
        };

        if let Some(credential) = &request.bearer {
            builder = builder.bearer_auth(credential.token());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(transport_error)?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}
