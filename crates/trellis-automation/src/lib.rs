//! # trellis-automation
//!
//! Rules engine for the trellis automation core.
//!
//! This crate provides:
//! - Automation definitions as persisted, serde-round-tripping sum types
//! - Membership triggers driven by the live-query subscription engine
//! - Threshold triggers driven by computed-field change notifications,
//!   with crossing detection and `fire_once` re-arm semantics
//! - Action execution with chain-based cycle and depth protection
//! - Webhook dispatch through the trellis-webhook queue
//!
//! ## Example
//!
//! ```ignore
//! use trellis_automation::{
//!     AutomationAction, AutomationDefinition, AutomationService, MembershipEvent, Trigger,
//! };
//!
//! let service = AutomationService::new(repo, subscriptions, computed, webhooks);
//! service.initialize().await?;
//!
//! let id = service
//!     .create(AutomationDefinition {
//!         name: "tag urgent".to_string(),
//!         enabled: true,
//!         trigger: Trigger::QueryMembership {
//!             query: overdue_tasks,
//!             event: MembershipEvent::OnEnter,
//!         },
//!         action: AutomationAction::AddSupertag { supertag_id: urgent },
//!     })
//!     .await?;
//! ```

mod chain;
pub mod definition;
pub mod service;

pub use definition::{
    AutomationAction, AutomationDefinition, AutomationRecord, AutomationState, MembershipEvent,
    ThresholdCondition, ThresholdOperator, Trigger,
};
pub use service::AutomationService;
