//! # trellis-reactive
//!
//! Live-query subscription engine for the trellis automation core.
//!
//! This crate provides:
//! - Standing query subscriptions with added/removed/changed diffing
//! - Dependency-based invalidation pruning (smart invalidation)
//! - Mutation batching behind an explicit debounce state machine
//! - Engine metrics (evaluations run/skipped, active subscriptions)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trellis_core::{EventBus, QueryDefinition, QueryFilter};
//! use trellis_core::mock::{MemoryNodeRepository, MemoryQueryEvaluator};
//! use trellis_reactive::{change_callback_fn, QuerySubscriptionService};
//!
//! let bus = Arc::new(EventBus::new());
//! let repo = Arc::new(MemoryNodeRepository::new(bus.clone()));
//! let evaluator = Arc::new(MemoryQueryEvaluator::new(repo.clone()));
//! let service = QuerySubscriptionService::new(bus, evaluator);
//!
//! let handle = service
//!     .subscribe(
//!         QueryDefinition::new(QueryFilter::Supertag { supertag_id: task_tag }),
//!         change_callback_fn(|change| async move {
//!             println!("added: {}", change.added.len());
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//! ```

pub mod dependency;
pub mod metrics;
pub mod signature;
pub mod subscription;

pub use dependency::{DependencyTracker, QueryDependencies};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use signature::{content_signature, diff_results, ResultDiff};
pub use subscription::{
    change_callback_fn, ChangeCallback, QuerySubscriptionService, SubscriptionConfig,
    SubscriptionHandle,
};
