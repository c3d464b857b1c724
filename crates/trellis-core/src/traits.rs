//! Collaborator interfaces consumed by the engine.
//!
//! The node repository, query evaluator, and computed-field service are
//! owned by other subsystems; the engine only depends on these traits.
//! In-memory implementations for tests live in [`crate::mock`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{AssembledNode, QueryDefinition, QueryResult};

// =============================================================================
// NODE REPOSITORY
// =============================================================================

/// CRUD interface to the property-graph node store.
///
/// Implementations must provide read-your-writes (a `set_property` followed
/// by `assemble_node` on the same node reflects the write) and make deleted
/// nodes invisible to `assemble_node` and queries without necessarily
/// erasing storage.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Create a node with the given content, returning its id.
    async fn create_node(&self, content: &str) -> Result<Uuid>;

    /// Set a property's values on a node, replacing any existing values.
    async fn set_property(&self, node_id: Uuid, field_id: Uuid, values: Vec<String>) -> Result<()>;

    /// Remove a property from a node.
    async fn clear_property(&self, node_id: Uuid, field_id: Uuid) -> Result<()>;

    /// Attach a supertag to a node (no-op if already present).
    async fn add_supertag(&self, node_id: Uuid, supertag_id: Uuid) -> Result<()>;

    /// Detach a supertag from a node (no-op if absent).
    async fn remove_supertag(&self, node_id: Uuid, supertag_id: Uuid) -> Result<()>;

    /// Materialize a node with its properties and supertags.
    ///
    /// Returns `None` for unknown or deleted nodes.
    async fn assemble_node(&self, node_id: Uuid) -> Result<Option<AssembledNode>>;

    /// Soft-delete a node.
    async fn delete_node(&self, node_id: Uuid) -> Result<()>;

    /// Resolve a well-known system node (supertag or field) by its key.
    async fn get_system_node(&self, key: &str) -> Result<Option<Uuid>>;

    /// All live nodes carrying the given supertag.
    async fn find_nodes_by_supertag(&self, supertag_id: Uuid) -> Result<Vec<AssembledNode>>;
}

// =============================================================================
// QUERY EVALUATOR
// =============================================================================

/// Evaluates a query definition against current repository state.
///
/// Must be a pure function of repository state and the definition — no
/// hidden caching that could desynchronize from mutations.
#[async_trait]
pub trait QueryEvaluator: Send + Sync {
    async fn evaluate(&self, query: &QueryDefinition) -> Result<QueryResult>;
}

// =============================================================================
// COMPUTED FIELDS
// =============================================================================

/// A change notification for a derived numeric value.
#[derive(Debug, Clone, Copy)]
pub struct ComputedFieldChange {
    pub field_id: Uuid,
    pub current: f64,
    /// Absent on the first observed value.
    pub previous: Option<f64>,
}

/// Listener invoked when a computed field's value changes.
pub type ComputedFieldListener =
    Arc<dyn Fn(ComputedFieldChange) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure into a [`ComputedFieldListener`].
pub fn computed_listener_fn<F, Fut>(f: F) -> ComputedFieldListener
where
    F: Fn(ComputedFieldChange) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |change| f(change).boxed())
}

/// Maintains derived numeric values and notifies on change.
#[async_trait]
pub trait ComputedFieldService: Send + Sync {
    /// Current value of a computed field, if it has one.
    async fn get_value(&self, field_id: Uuid) -> Result<Option<f64>>;

    /// Register a change listener for a field, returning a listener id.
    fn on_value_change(&self, field_id: Uuid, listener: ComputedFieldListener) -> Uuid;

    /// Remove a change listener. Returns whether it was present.
    fn remove_listener(&self, listener_id: Uuid) -> bool;
}
