//! Webhook job and context model.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_core::AssembledNode;
use uuid::Uuid;

/// Outbound HTTP call description, as configured on an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookAction {
    pub url: String,
    /// HTTP method (GET, POST, PUT, DELETE, ...).
    pub method: String,
    /// Flat header map; values may contain template tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// JSON body template, interpolated recursively. Serialized only for
    /// POST/PUT.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Computed-field value snapshot carried in a webhook context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComputedFieldValue {
    pub id: Uuid,
    pub value: f64,
}

/// Template interpolation environment for one webhook firing.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookContext {
    /// The triggering node, absent for threshold firings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<AssembledNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed_field: Option<ComputedFieldValue>,
    pub automation_id: Uuid,
    pub automation_name: String,
    pub timestamp: DateTime<Utc>,
}

impl WebhookContext {
    pub fn new(automation_id: Uuid, automation_name: impl Into<String>) -> Self {
        Self {
            node: None,
            computed_field: None,
            automation_id,
            automation_name: automation_name.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_node(mut self, node: AssembledNode) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_computed_field(mut self, id: Uuid, value: f64) -> Self {
        self.computed_field = Some(ComputedFieldValue { id, value });
        self
    }

    /// The JSON object template paths resolve against.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Delivery lifecycle of a webhook job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the job will never be attempted again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One queued webhook delivery, mutated in place by each attempt.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookJob {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub action: WebhookAction,
    pub context: WebhookContext,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest instant the next attempt may run; unset means immediately.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Parsed response body from the most recent attempt, when available.
    pub last_response: Option<Value>,
    pub status: JobStatus,
    /// When the job reached a terminal status; drives retention purging.
    pub finished_at: Option<DateTime<Utc>>,
}

impl WebhookJob {
    /// Whether the job is due for an attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_context_value_shape() {
        let id = Uuid::new_v4();
        let value = WebhookContext::new(id, "notify")
            .with_computed_field(Uuid::nil(), 7.5)
            .to_value();

        assert_eq!(value["automation_id"], Value::String(id.to_string()));
        assert_eq!(value["automation_name"], Value::String("notify".into()));
        assert_eq!(value["computed_field"]["value"], 7.5);
        assert!(value.get("node").is_none());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_job_due() {
        let now = Utc::now();
        let mut job = WebhookJob {
            id: Uuid::new_v4(),
            automation_id: Uuid::new_v4(),
            action: WebhookAction {
                url: "https://example.com".to_string(),
                method: "POST".to_string(),
                headers: None,
                body: None,
            },
            context: WebhookContext::new(Uuid::new_v4(), "a"),
            attempts: 0,
            max_attempts: 3,
            created_at: now,
            next_retry_at: None,
            last_error: None,
            last_response: None,
            status: JobStatus::Pending,
            finished_at: None,
        };
        assert!(job.is_due(now));

        job.next_retry_at = Some(now + chrono::Duration::seconds(10));
        assert!(!job.is_due(now));

        job.next_retry_at = Some(now - chrono::Duration::seconds(10));
        assert!(job.is_due(now));

        job.status = JobStatus::Completed;
        assert!(!job.is_due(now));
    }
}
