//! # trellis-core
//!
//! Core types, traits, and abstractions for the trellis automation engine.
//!
//! This crate provides the shared data model (mutation events, query filter
//! trees, assembled nodes), the filtered event bus, the collaborator traits
//! the engine consumes, and in-memory mock collaborators for tests.

pub mod defaults;
pub mod error;
pub mod events;
pub mod mock;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{listener_fn, EventBus, MutationListener};
pub use models::{
    AssembledNode, AssembledProperty, EventFilter, MutationEvent, MutationKind, QueryDefinition,
    QueryFilter, QueryResult, QueryResultChangeEvent, SupertagRef,
};
pub use traits::{
    computed_listener_fn, ComputedFieldChange, ComputedFieldListener, ComputedFieldService,
    NodeRepository, QueryEvaluator,
};
