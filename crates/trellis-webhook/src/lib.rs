//! # trellis-webhook
//!
//! Retrying webhook dispatch queue for the trellis automation core.
//!
//! This crate provides:
//! - An in-memory job queue with exponential backoff retry and jitter
//! - `{{ path.to.value }}` template interpolation for URLs, headers, bodies
//! - A pluggable HTTP transport (`reqwest` in production, a scripted mock
//!   in tests)
//! - A periodic background processor with an idempotent processing pass
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trellis_webhook::{ReqwestTransport, WebhookAction, WebhookContext, WebhookQueue};
//!
//! let queue = WebhookQueue::new(Arc::new(ReqwestTransport::new()));
//! queue.enqueue(automation_id, action, WebhookContext::new(automation_id, "notify"));
//! queue.start_processing();
//! ```

pub mod job;
pub mod queue;
pub mod template;
pub mod transport;

pub use job::{ComputedFieldValue, JobStatus, WebhookAction, WebhookContext, WebhookJob};
pub use queue::{WebhookConfig, WebhookQueue};
pub use template::{interpolate, interpolate_value};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, MockTransport, ReqwestTransport};
