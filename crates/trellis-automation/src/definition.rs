//! Automation definitions: triggers, actions, and persisted state.
//!
//! Definitions persist as JSON on nodes tagged with the system `automation`
//! supertag, so every type here round-trips through serde. Triggers and
//! actions are sum types; adding a variant forces every dispatch site to
//! handle it.

use serde::{Deserialize, Serialize};
use trellis_core::{QueryDefinition, Result};
use trellis_webhook::WebhookAction;
use uuid::Uuid;

/// Which side of a query-membership diff fires the automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEvent {
    /// Node entered the result set (`added`).
    OnEnter,
    /// Node left the result set (`removed`).
    OnExit,
    /// Node stayed but its content signature moved (`changed`).
    OnChange,
}

/// Comparison operator for threshold conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

/// A numeric condition against a computed field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCondition {
    pub operator: ThresholdOperator,
    pub value: f64,
}

impl ThresholdCondition {
    /// Whether the condition holds for the given value.
    pub fn holds(&self, value: f64) -> bool {
        match self.operator {
            ThresholdOperator::Gt => value > self.value,
            ThresholdOperator::Gte => value >= self.value,
            ThresholdOperator::Lt => value < self.value,
            ThresholdOperator::Lte => value <= self.value,
            ThresholdOperator::Eq => value == self.value,
        }
    }
}

/// What causes an automation to fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire on nodes entering/leaving/changing within a query's result set.
    QueryMembership {
        query: QueryDefinition,
        event: MembershipEvent,
    },
    /// Fire when a computed field value crosses a condition.
    Threshold {
        computed_field_id: Uuid,
        condition: ThresholdCondition,
        #[serde(default)]
        fire_once: bool,
    },
}

/// What an automation does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationAction {
    /// Set a property on the triggering node. The reserved `$now` value is
    /// replaced with the current instant.
    SetProperty { field_id: Uuid, value: String },
    AddSupertag { supertag_id: Uuid },
    RemoveSupertag { supertag_id: Uuid },
    Webhook(WebhookAction),
}

/// A persisted automation: name, enablement, trigger, action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationDefinition {
    pub name: String,
    pub enabled: bool,
    pub trigger: Trigger,
    pub action: AutomationAction,
}

impl AutomationDefinition {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Runtime state persisted alongside the definition so `fire_once`
/// thresholds survive process restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationState {
    #[serde(default)]
    pub threshold_crossed: bool,
}

impl AutomationState {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A parsed automation node: id plus its persisted definition and state.
#[derive(Debug, Clone)]
pub struct AutomationRecord {
    pub id: Uuid,
    pub definition: AutomationDefinition,
    pub state: AutomationState,
}
