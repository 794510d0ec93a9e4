//! HTTP backend performing internal fetches with reqwest

use crate::error::{RelayError, Result};
use crate::fetch_relay::{Backend, FetchBody, FetchRequest, FetchResponse, FetchResponseHead};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::RANGE;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Backend that issues each fetch as a ranged GET over HTTP
///
/// Redirects are never followed by the client library: relocations are
/// surfaced to the response composer, which decides where to go next.
pub struct HttpBackend {
    http_client: Client,
}

impl HttpBackend {
    /// Create a new HttpBackend
    ///
    /// # Arguments
    /// * `timeout` - Per-fetch timeout, covering headers and body
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| RelayError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpBackend { http_client })
    }

    /// Wrap an already configured client
    pub fn with_client(http_client: Client) -> Self {
        HttpBackend { http_client }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        debug!(
            "Backend fetch: request={}, seq={}, uri={}, range={}",
            request.request_id, request.sequence, request.uri, request.range
        );

        let response = self
            .http_client
            .get(&request.uri)
            .header(RANGE, &request.range)
            .send()
            .await
            .map_err(|e| {
                warn!("Backend request failed: uri={}, error={}", request.uri, e);
                RelayError::HttpError(format!("Request failed: {}", e))
            })?;

        let origin = response.url().origin();
        let origin = origin.is_tuple().then(|| origin.ascii_serialization());

        let raw_headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let head = FetchResponseHead {
            status: response.status(),
            headers: response.headers().clone(),
            raw_headers,
            origin,
        };

        Ok(FetchResponse {
            head,
            body: Box::new(ReqwestBody { response }),
        })
    }
}

/// Streamed body of a reqwest response
struct ReqwestBody {
    response: reqwest::Response,
}

#[async_trait]
impl FetchBody for ReqwestBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|e| RelayError::HttpError(format!("Failed to read response body: {}", e)))
    }
}
