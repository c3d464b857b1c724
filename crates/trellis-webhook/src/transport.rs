//! Pluggable HTTP transport for webhook delivery.
//!
//! [`ReqwestTransport`] is the production implementation; tests inject
//! [`MockTransport`] to script responses and capture requests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use trellis_core::defaults::WEBHOOK_TIMEOUT_SECS;
use trellis_core::{Error, Result};

/// A fully interpolated outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Serialized JSON body, when configured.
    pub body: Option<String>,
}

/// Response surface the queue needs for classification.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Fetch-equivalent seam used exclusively by the webhook queue.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Production transport backed by a shared `reqwest` client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| Error::InvalidInput(format!("invalid HTTP method: {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Scripted transport for tests: pops queued outcomes, records requests,
/// and answers `200 {}` once the script runs dry.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
    /// Artificial per-request latency, for overlap tests.
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    /// Queue a response with the given status and JSON body.
    pub fn push_status(&self, status: u16, body: &str) {
        self.push_response(status, "application/json", body);
    }

    /// Queue a response with an explicit content type.
    pub fn push_response(&self, status: u16, content_type: &str, body: &str) {
        self.script
            .lock()
            .expect("mock script lock poisoned")
            .push_back(Ok(HttpResponse {
                status,
                content_type: Some(content_type.to_string()),
                body: body.to_string(),
            }));
    }

    /// Queue a network-level failure.
    pub fn push_failure(&self, message: &str) {
        self.script
            .lock()
            .expect("mock script lock poisoned")
            .push_back(Err(Error::Request(message.to_string())));
    }

    /// Requests captured so far, in execution order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .expect("mock requests lock poisoned")
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .expect("mock requests lock poisoned")
            .len()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.requests
            .lock()
            .expect("mock requests lock poisoned")
            .push(request);
        self.script
            .lock()
            .expect("mock script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Ok(HttpResponse {
                    status: 200,
                    content_type: Some("application/json".to_string()),
                    body: "{}".to_string(),
                })
            })
    }
}
