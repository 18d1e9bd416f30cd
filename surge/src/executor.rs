//! HTTP execution: issues requests, captures timing and status, and feeds
//! the built-in `http_*` metrics. Transport failures are absorbed into the
//! metrics stream; a virtual user keeps serving iterations after its
//! requests fail.

use crate::metrics::{Counter, Rate, Registry, Trend};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use surge_core::{TagSet, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED};
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

pub use reqwest::Method;

/// Shared per-run HTTP client.
///
/// Wraps one `reqwest::Client` so connections are pooled and reused across
/// all virtual users and iterations.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: Option<Arc<str>>,
    reqs: Counter,
    duration: Trend,
    failed: Rate,
}

impl HttpClient {
    pub(crate) fn new(
        registry: &Registry,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').into()),
            reqs: registry.counter(HTTP_REQS),
            duration: registry.trend(HTTP_REQ_DURATION),
            failed: registry.rate(HTTP_REQ_FAILED),
        })
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestSpec<'_> {
        RequestSpec {
            client: self,
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            encode_error: None,
        }
    }

    pub fn get(&self, url: impl Into<String>) -> RequestSpec<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestSpec<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestSpec<'_> {
        self.request(Method::PUT, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestSpec<'_> {
        self.request(Method::DELETE, url)
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        match &self.base_url {
            Some(base) => format!("{base}/{}", url.trim_start_matches('/')),
            None => url.to_string(),
        }
    }

    fn record(&self, method: &Method, url: &str, response: &HttpResponse) {
        self.reqs.increment();
        self.failed.add(response.failed());

        let tags = TagSet::new()
            .with("method", method.as_str())
            .with("status", response.status.to_string())
            .with("url", url);
        self.duration.record_tagged(response.duration_ms(), tags);
    }
}

/// One request being built; `send` consumes it.
pub struct RequestSpec<'a> {
    client: &'a HttpClient,
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    timeout: Option<Duration>,
    encode_error: Option<String>,
}

impl RequestSpec<'_> {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// JSON-encode the body and set `Content-Type: application/json`.
    pub fn json<T: Serialize>(mut self, body: &T) -> Self {
        match serde_json::to_vec(body) {
            Ok(encoded) => {
                self.body = Some(encoded);
                self.headers
                    .push(("content-type".to_string(), "application/json".to_string()));
            }
            // Surfaces as a failed request at send time rather than
            // interrupting the iteration.
            Err(err) => self.encode_error = Some(err.to_string()),
        }
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Override the client-wide request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Perform the request.
    ///
    /// Never returns an error: transport failures (connection refused,
    /// timeout, DNS) come back as an [`HttpResponse`] with status 0 and the
    /// error message set, and are counted in `http_req_failed`.
    pub async fn send(self) -> HttpResponse {
        let url = self.client.resolve(&self.url);

        if let Some(error) = self.encode_error {
            debug!("request body encoding failed: {error}");
            let response = HttpResponse {
                status: 0,
                body: Vec::new(),
                duration: Duration::ZERO,
                error: Some(error),
            };
            self.client.record(&self.method, &url, &response);
            return response;
        }

        let mut request = self.client.client.request(self.method.clone(), &url);
        for (name, value) in self.headers {
            request = request.header(name, value);
        }
        if let Some(body) = self.body {
            request = request.body(body);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let started = Instant::now();
        let outcome = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body.to_vec()))
        }
        .await;
        let duration = started.elapsed();

        let response = match outcome {
            Ok((status, body)) => HttpResponse {
                status,
                body,
                duration,
                error: None,
            },
            Err(err) => {
                trace!("request to {url} failed: {err}");
                HttpResponse {
                    status: err.status().map(|s| s.as_u16()).unwrap_or(0),
                    body: Vec::new(),
                    duration,
                    error: Some(err.to_string()),
                }
            }
        };

        self.client.record(&self.method, &url, &response);
        response
    }
}

/// Captured outcome of one request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub duration: Duration,
    /// Transport-level error, if the request never produced a response.
    pub error: Option<String>,
}

impl HttpResponse {
    /// Transport error or non-2xx/3xx status.
    pub fn failed(&self) -> bool {
        self.error.is_some() || !(200..400).contains(&self.status)
    }

    pub fn ok(&self) -> bool {
        !self.failed()
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1e3
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
