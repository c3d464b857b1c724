//! Durable-in-memory webhook job queue with exponential backoff retry.
//!
//! `process_queue` is idempotent under concurrent callers: a run already in
//! flight is shared, so concurrent triggers never double-process a job.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use trellis_core::defaults::{
    WEBHOOK_BASE_DELAY_MS, WEBHOOK_JITTER_FACTOR, WEBHOOK_JOB_RETENTION_SECS, WEBHOOK_MAX_ATTEMPTS,
    WEBHOOK_MAX_DELAY_MS, WEBHOOK_PROCESS_INTERVAL_MS,
};

use crate::job::{JobStatus, WebhookAction, WebhookContext, WebhookJob};
use crate::template::{interpolate, interpolate_value};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Configuration for the webhook queue.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Maximum delivery attempts per job.
    pub max_attempts: u32,
    /// Base retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the retry delay in milliseconds.
    pub max_delay_ms: u64,
    /// Background processing interval in milliseconds.
    pub process_interval_ms: u64,
    /// Terminal job retention in seconds before purging.
    pub retention_secs: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: WEBHOOK_MAX_ATTEMPTS,
            base_delay_ms: WEBHOOK_BASE_DELAY_MS,
            max_delay_ms: WEBHOOK_MAX_DELAY_MS,
            process_interval_ms: WEBHOOK_PROCESS_INTERVAL_MS,
            retention_secs: WEBHOOK_JOB_RETENTION_SECS,
        }
    }
}

impl WebhookConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `TRELLIS_WEBHOOK_MAX_ATTEMPTS` | `3` | Delivery attempts per job |
    /// | `TRELLIS_WEBHOOK_BASE_DELAY_MS` | `1000` | Base retry delay |
    /// | `TRELLIS_WEBHOOK_MAX_DELAY_MS` | `30000` | Retry delay ceiling |
    /// | `TRELLIS_WEBHOOK_INTERVAL_MS` | `100` | Background pass interval |
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
        Self {
            max_attempts: parse("TRELLIS_WEBHOOK_MAX_ATTEMPTS", WEBHOOK_MAX_ATTEMPTS),
            base_delay_ms: parse("TRELLIS_WEBHOOK_BASE_DELAY_MS", WEBHOOK_BASE_DELAY_MS),
            max_delay_ms: parse("TRELLIS_WEBHOOK_MAX_DELAY_MS", WEBHOOK_MAX_DELAY_MS),
            process_interval_ms: parse("TRELLIS_WEBHOOK_INTERVAL_MS", WEBHOOK_PROCESS_INTERVAL_MS),
            retention_secs: WEBHOOK_JOB_RETENTION_SECS,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    pub fn with_process_interval_ms(mut self, ms: u64) -> Self {
        self.process_interval_ms = ms;
        self
    }

    pub fn with_retention_secs(mut self, secs: i64) -> Self {
        self.retention_secs = secs;
        self
    }

    /// Delay before the retry following attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1) * (1 + jitter), max)`, jitter in [0, 0.3),
    /// floored to whole milliseconds.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self.base_delay_ms as f64 * 2f64.powi(exponent as i32);
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..WEBHOOK_JITTER_FACTOR);
        let delay_ms = (base * jitter).min(self.max_delay_ms as f64).floor() as u64;
        Duration::from_millis(delay_ms)
    }
}

struct AttemptOutcome {
    success: bool,
    error: Option<String>,
    response_body: Option<Value>,
}

struct QueueInner {
    transport: Arc<dyn HttpTransport>,
    config: WebhookConfig,
    jobs: Mutex<Vec<WebhookJob>>,
    /// Shared in-flight pass; concurrent `process_queue` callers await this
    /// instead of starting a second pass.
    inflight: Mutex<Option<Shared<BoxFuture<'static, usize>>>>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

/// In-memory job queue executing webhook calls with retry and backoff.
#[derive(Clone)]
pub struct WebhookQueue {
    inner: Arc<QueueInner>,
}

impl WebhookQueue {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_config(transport, WebhookConfig::default())
    }

    pub fn with_config(transport: Arc<dyn HttpTransport>, config: WebhookConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                transport,
                config,
                jobs: Mutex::new(Vec::new()),
                inflight: Mutex::new(None),
                processor: Mutex::new(None),
            }),
        }
    }

    /// Add a delivery job, returning its id. Does not start processing.
    pub fn enqueue(
        &self,
        automation_id: Uuid,
        action: WebhookAction,
        context: WebhookContext,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let job = WebhookJob {
            id,
            automation_id,
            action,
            context,
            attempts: 0,
            max_attempts: self.inner.config.max_attempts,
            created_at: Utc::now(),
            next_retry_at: None,
            last_error: None,
            last_response: None,
            status: JobStatus::Pending,
            finished_at: None,
        };
        self.inner
            .jobs
            .lock()
            .expect("webhook jobs lock poisoned")
            .push(job);
        debug!(job_id = %id, automation_id = %automation_id, "Webhook job enqueued");
        id
    }

    /// Run one processing pass over every due job, in FIFO discovery order.
    ///
    /// Concurrent callers receive the same in-flight pass and its result.
    /// Returns the number of jobs attempted.
    pub async fn process_queue(&self) -> usize {
        let pass = {
            let mut slot = self
                .inner
                .inflight
                .lock()
                .expect("webhook inflight lock poisoned");
            match slot.as_ref() {
                Some(pass) => pass.clone(),
                None => {
                    let inner = self.inner.clone();
                    let pass = async move {
                        let processed = QueueInner::run_pass(&inner).await;
                        *inner
                            .inflight
                            .lock()
                            .expect("webhook inflight lock poisoned") = None;
                        processed
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pass.clone());
                    pass
                }
            }
        };
        pass.await
    }

    /// Kick off a processing pass without awaiting its completion.
    pub fn kick(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.process_queue().await;
        });
    }

    /// Jobs currently awaiting an attempt.
    pub fn pending_jobs(&self) -> Vec<WebhookJob> {
        self.inner
            .jobs
            .lock()
            .expect("webhook jobs lock poisoned")
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn job(&self, id: Uuid) -> Option<WebhookJob> {
        self.inner
            .jobs
            .lock()
            .expect("webhook jobs lock poisoned")
            .iter()
            .find(|j| j.id == id)
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .expect("webhook jobs lock poisoned")
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }

    /// Drop every job, including in-flight bookkeeping.
    pub fn clear(&self) {
        self.inner
            .jobs
            .lock()
            .expect("webhook jobs lock poisoned")
            .clear();
    }

    /// Arm the periodic background processor.
    pub fn start_processing(&self) {
        let mut slot = self
            .inner
            .processor
            .lock()
            .expect("webhook processor lock poisoned");
        if slot.is_some() {
            return;
        }
        let queue = self.clone();
        let interval_ms = self.inner.config.process_interval_ms;
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                queue.process_queue().await;
            }
        }));
    }

    /// Stop the periodic background processor.
    pub fn stop_processing(&self) {
        let handle = self
            .inner
            .processor
            .lock()
            .expect("webhook processor lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_processing(&self) -> bool {
        self.inner
            .processor
            .lock()
            .expect("webhook processor lock poisoned")
            .is_some()
    }
}

impl QueueInner {
    async fn run_pass(inner: &Arc<QueueInner>) -> usize {
        let now = Utc::now();
        let due: Vec<Uuid> = {
            let jobs = inner.jobs.lock().expect("webhook jobs lock poisoned");
            jobs.iter().filter(|j| j.is_due(now)).map(|j| j.id).collect()
        };

        let mut processed = 0;
        for id in due {
            let claimed = {
                let mut jobs = inner.jobs.lock().expect("webhook jobs lock poisoned");
                jobs.iter_mut()
                    .find(|j| j.id == id && j.status == JobStatus::Pending)
                    .map(|job| {
                        job.status = JobStatus::Processing;
                        job.attempts += 1;
                        (job.action.clone(), job.context.to_value())
                    })
            };
            let Some((action, context)) = claimed else {
                continue;
            };

            let outcome = Self::attempt(inner.transport.as_ref(), &action, &context).await;
            inner.settle(id, outcome);
            processed += 1;
        }

        inner.purge_expired(now);
        processed
    }

    async fn attempt(
        transport: &dyn HttpTransport,
        action: &WebhookAction,
        context: &Value,
    ) -> AttemptOutcome {
        let request = Self::build_request(action, context);
        debug!(method = %request.method, url = %request.url, "Dispatching webhook");

        match transport.execute(request).await {
            Ok(response) => {
                let response_body = Self::parse_body(&response);
                if response.is_success() {
                    AttemptOutcome {
                        success: true,
                        error: None,
                        response_body,
                    }
                } else {
                    AttemptOutcome {
                        success: false,
                        error: Some(format!("HTTP {}", response.status)),
                        response_body,
                    }
                }
            }
            Err(e) => AttemptOutcome {
                success: false,
                error: Some(e.to_string()),
                response_body: None,
            },
        }
    }

    fn build_request(action: &WebhookAction, context: &Value) -> HttpRequest {
        let method = action.method.to_uppercase();
        let url = interpolate(&action.url, context);
        let mut headers: std::collections::HashMap<String, String> = action
            .headers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| (name, interpolate(&value, context)))
            .collect();

        let body = if method == "POST" || method == "PUT" {
            action.body.as_ref().map(|template| {
                let interpolated = interpolate_value(template, context);
                serde_json::to_string(&interpolated).unwrap_or_default()
            })
        } else {
            None
        };

        if body.is_some() && !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }

        HttpRequest {
            method,
            url,
            headers,
            body,
        }
    }

    /// Response body per content type: JSON when declared, raw text
    /// otherwise; parse failures and empty bodies yield nothing.
    fn parse_body(response: &HttpResponse) -> Option<Value> {
        let declares_json = response
            .content_type
            .as_deref()
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);
        if declares_json {
            serde_json::from_str(&response.body).ok()
        } else if response.body.is_empty() {
            None
        } else {
            Some(Value::String(response.body.clone()))
        }
    }

    fn settle(&self, id: Uuid, outcome: AttemptOutcome) {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().expect("webhook jobs lock poisoned");
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            return;
        };

        job.last_response = outcome.response_body;
        if outcome.success {
            job.status = JobStatus::Completed;
            job.last_error = None;
            job.next_retry_at = None;
            job.finished_at = Some(now);
            debug!(job_id = %id, attempts = job.attempts, "Webhook delivered");
            return;
        }

        job.last_error = outcome.error;
        if job.attempts >= job.max_attempts {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
            warn!(
                job_id = %id,
                attempts = job.attempts,
                error = job.last_error.as_deref().unwrap_or(""),
                "Webhook failed terminally"
            );
        } else {
            let delay = self.config.backoff_delay(job.attempts);
            job.status = JobStatus::Pending;
            job.next_retry_at =
                Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
            debug!(
                job_id = %id,
                attempts = job.attempts,
                retry_in_ms = delay.as_millis() as u64,
                "Webhook attempt failed; retry scheduled"
            );
        }
    }

    fn purge_expired(&self, now: chrono::DateTime<Utc>) {
        let retention = chrono::Duration::seconds(self.config.retention_secs);
        let mut jobs = self.jobs.lock().expect("webhook jobs lock poisoned");
        jobs.retain(|job| {
            !(job.status.is_terminal()
                && job.finished_at.map_or(false, |at| now - at >= retention))
        });
    }
}
