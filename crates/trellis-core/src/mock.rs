//! In-memory collaborator implementations for deterministic testing.
//!
//! [`MemoryNodeRepository`] applies mutations to an in-memory graph and
//! emits the corresponding [`MutationEvent`] on the bus it was constructed
//! with, giving tests the same write-then-notify ordering the production
//! store provides. [`MemoryQueryEvaluator`] evaluates the structural and
//! content filter kinds against that repository. [`MockComputedFieldService`]
//! holds scripted values and notifies listeners on `set_value`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::models::{
    AssembledNode, AssembledProperty, MutationEvent, QueryDefinition, QueryFilter, QueryResult,
    SupertagRef,
};
use crate::traits::{
    ComputedFieldChange, ComputedFieldListener, ComputedFieldService, NodeRepository,
    QueryEvaluator,
};

// =============================================================================
// NODE REPOSITORY
// =============================================================================

#[derive(Debug, Clone)]
struct NodeRecord {
    content: String,
    /// field id -> values in declared order
    properties: HashMap<Uuid, Vec<String>>,
    supertags: Vec<Uuid>,
    deleted: bool,
    updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
struct RepoState {
    nodes: HashMap<Uuid, NodeRecord>,
    field_names: HashMap<Uuid, String>,
    supertag_names: HashMap<Uuid, String>,
    system_nodes: HashMap<String, Uuid>,
}

/// In-memory node store emitting mutation events to an [`EventBus`].
pub struct MemoryNodeRepository {
    bus: Arc<EventBus>,
    state: Mutex<RepoState>,
}

impl MemoryNodeRepository {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            state: Mutex::new(RepoState::default()),
        }
    }

    /// Register a property field, returning its id.
    pub fn define_field(&self, name: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().field_names.insert(id, name.into());
        id
    }

    /// Register a supertag, returning its id.
    pub fn define_supertag(&self, name: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().supertag_names.insert(id, name.into());
        id
    }

    /// Register a supertag reachable through `get_system_node`.
    pub fn define_system_supertag(&self, key: &str) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.lock();
        state.supertag_names.insert(id, key.to_string());
        state.system_nodes.insert(key.to_string(), id);
        id
    }

    /// Register a field reachable through `get_system_node`.
    pub fn define_system_field(&self, key: &str) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.lock();
        state.field_names.insert(id, key.to_string());
        state.system_nodes.insert(key.to_string(), id);
        id
    }

    /// All live (non-deleted) nodes, assembled.
    pub fn all_nodes(&self) -> Vec<AssembledNode> {
        let state = self.lock();
        state
            .nodes
            .iter()
            .filter(|(_, rec)| !rec.deleted)
            .map(|(id, rec)| Self::assemble(&state, *id, rec))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RepoState> {
        self.state.lock().expect("repository lock poisoned")
    }

    fn assemble(state: &RepoState, id: Uuid, rec: &NodeRecord) -> AssembledNode {
        let mut properties: Vec<AssembledProperty> = rec
            .properties
            .iter()
            .map(|(field_id, values)| AssembledProperty {
                field_id: *field_id,
                field_name: state
                    .field_names
                    .get(field_id)
                    .cloned()
                    .unwrap_or_else(|| field_id.to_string()),
                values: values.clone(),
            })
            .collect();
        properties.sort_by(|a, b| a.field_name.cmp(&b.field_name));

        let supertags = rec
            .supertags
            .iter()
            .map(|tag_id| SupertagRef {
                id: *tag_id,
                name: state
                    .supertag_names
                    .get(tag_id)
                    .cloned()
                    .unwrap_or_else(|| tag_id.to_string()),
            })
            .collect();

        AssembledNode {
            id,
            content: rec.content.clone(),
            properties,
            supertags,
            updated_at: rec.updated_at,
        }
    }

    fn with_live_node<T>(
        &self,
        node_id: Uuid,
        f: impl FnOnce(&mut NodeRecord) -> T,
    ) -> Result<T> {
        let mut state = self.lock();
        let rec = state
            .nodes
            .get_mut(&node_id)
            .filter(|rec| !rec.deleted)
            .ok_or(Error::NodeNotFound(node_id))?;
        rec.updated_at = Utc::now();
        Ok(f(rec))
    }
}

#[async_trait]
impl NodeRepository for MemoryNodeRepository {
    async fn create_node(&self, content: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock().nodes.insert(
            id,
            NodeRecord {
                content: content.to_string(),
                properties: HashMap::new(),
                supertags: Vec::new(),
                deleted: false,
                updated_at: Utc::now(),
            },
        );
        self.bus.emit(MutationEvent::NodeCreated { node_id: id }).await;
        Ok(id)
    }

    async fn set_property(&self, node_id: Uuid, field_id: Uuid, values: Vec<String>) -> Result<()> {
        self.with_live_node(node_id, |rec| {
            rec.properties.insert(field_id, values);
        })?;
        self.bus
            .emit(MutationEvent::PropertySet { node_id, field_id })
            .await;
        Ok(())
    }

    async fn clear_property(&self, node_id: Uuid, field_id: Uuid) -> Result<()> {
        let removed = self.with_live_node(node_id, |rec| rec.properties.remove(&field_id))?;
        if removed.is_some() {
            self.bus
                .emit(MutationEvent::PropertyCleared { node_id, field_id })
                .await;
        }
        Ok(())
    }

    async fn add_supertag(&self, node_id: Uuid, supertag_id: Uuid) -> Result<()> {
        let added = self.with_live_node(node_id, |rec| {
            if rec.supertags.contains(&supertag_id) {
                false
            } else {
                rec.supertags.push(supertag_id);
                true
            }
        })?;
        if added {
            self.bus
                .emit(MutationEvent::SupertagAdded {
                    node_id,
                    supertag_id,
                })
                .await;
        }
        Ok(())
    }

    async fn remove_supertag(&self, node_id: Uuid, supertag_id: Uuid) -> Result<()> {
        let removed = self.with_live_node(node_id, |rec| {
            let before = rec.supertags.len();
            rec.supertags.retain(|t| *t != supertag_id);
            rec.supertags.len() < before
        })?;
        if removed {
            self.bus
                .emit(MutationEvent::SupertagRemoved {
                    node_id,
                    supertag_id,
                })
                .await;
        }
        Ok(())
    }

    async fn assemble_node(&self, node_id: Uuid) -> Result<Option<AssembledNode>> {
        let state = self.lock();
        Ok(state
            .nodes
            .get(&node_id)
            .filter(|rec| !rec.deleted)
            .map(|rec| Self::assemble(&state, node_id, rec)))
    }

    async fn delete_node(&self, node_id: Uuid) -> Result<()> {
        self.with_live_node(node_id, |rec| {
            rec.deleted = true;
        })?;
        self.bus.emit(MutationEvent::NodeDeleted { node_id }).await;
        Ok(())
    }

    async fn get_system_node(&self, key: &str) -> Result<Option<Uuid>> {
        Ok(self.lock().system_nodes.get(key).copied())
    }

    async fn find_nodes_by_supertag(&self, supertag_id: Uuid) -> Result<Vec<AssembledNode>> {
        let state = self.lock();
        Ok(state
            .nodes
            .iter()
            .filter(|(_, rec)| !rec.deleted && rec.supertags.contains(&supertag_id))
            .map(|(id, rec)| Self::assemble(&state, *id, rec))
            .collect())
    }
}

// =============================================================================
// QUERY EVALUATOR
// =============================================================================

/// Filter-tree evaluator over a [`MemoryNodeRepository`].
///
/// Supports the structural filter kinds plus content search. Temporal and
/// relation filters match nothing here; the mock graph does not model them.
pub struct MemoryQueryEvaluator {
    repo: Arc<MemoryNodeRepository>,
}

impl MemoryQueryEvaluator {
    pub fn new(repo: Arc<MemoryNodeRepository>) -> Self {
        Self { repo }
    }

    fn matches(filter: &QueryFilter, node: &AssembledNode) -> bool {
        match filter {
            QueryFilter::Supertag { supertag_id } => node.has_supertag(*supertag_id),
            QueryFilter::Property { field_id, value } => node
                .properties
                .iter()
                .any(|p| p.field_id == *field_id && p.values.iter().any(|v| v == value)),
            QueryFilter::Content { text } => node.content.contains(text.as_str()),
            QueryFilter::Temporal { .. } | QueryFilter::Relation { .. } => {
                debug!(?filter, "Mock evaluator does not model this filter kind");
                false
            }
            QueryFilter::And { filters } => filters.iter().all(|f| Self::matches(f, node)),
            QueryFilter::Or { filters } => filters.iter().any(|f| Self::matches(f, node)),
            QueryFilter::Not { filter } => !Self::matches(filter, node),
        }
    }
}

#[async_trait]
impl QueryEvaluator for MemoryQueryEvaluator {
    async fn evaluate(&self, query: &QueryDefinition) -> Result<QueryResult> {
        let mut nodes: Vec<AssembledNode> = self
            .repo
            .all_nodes()
            .into_iter()
            .filter(|n| Self::matches(&query.filter, n))
            .collect();
        nodes.sort_by_key(|n| n.id);
        let total_count = nodes.len();
        Ok(QueryResult {
            nodes,
            total_count,
            evaluated_at: Utc::now(),
        })
    }
}

// =============================================================================
// COMPUTED FIELDS
// =============================================================================

#[derive(Default)]
struct ComputedState {
    values: HashMap<Uuid, f64>,
    listeners: Vec<(Uuid, Uuid, ComputedFieldListener)>,
}

/// Scripted computed-field service: tests drive it with `set_value`.
#[derive(Default)]
pub struct MockComputedFieldService {
    state: Mutex<ComputedState>,
}

impl MockComputedFieldService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update a field's value and notify its listeners.
    pub async fn set_value(&self, field_id: Uuid, value: f64) {
        let (previous, listeners) = {
            let mut state = self.state.lock().expect("computed state lock poisoned");
            let previous = state.values.insert(field_id, value);
            let listeners: Vec<ComputedFieldListener> = state
                .listeners
                .iter()
                .filter(|(_, fid, _)| *fid == field_id)
                .map(|(_, _, l)| l.clone())
                .collect();
            (previous, listeners)
        };

        let change = ComputedFieldChange {
            field_id,
            current: value,
            previous,
        };
        for listener in listeners {
            if let Err(e) = listener(change).await {
                warn!(field_id = %field_id, error = %e, "Computed field listener failed");
            }
        }
    }
}

#[async_trait]
impl ComputedFieldService for MockComputedFieldService {
    async fn get_value(&self, field_id: Uuid) -> Result<Option<f64>> {
        Ok(self
            .state
            .lock()
            .expect("computed state lock poisoned")
            .values
            .get(&field_id)
            .copied())
    }

    fn on_value_change(&self, field_id: Uuid, listener: ComputedFieldListener) -> Uuid {
        let id = Uuid::new_v4();
        self.state
            .lock()
            .expect("computed state lock poisoned")
            .listeners
            .push((id, field_id, listener));
        id
    }

    fn remove_listener(&self, listener_id: Uuid) -> bool {
        let mut state = self.state.lock().expect("computed state lock poisoned");
        let before = state.listeners.len();
        state.listeners.retain(|(id, _, _)| *id != listener_id);
        state.listeners.len() < before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::computed_listener_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<EventBus>, Arc<MemoryNodeRepository>) {
        let bus = Arc::new(EventBus::new());
        let repo = Arc::new(MemoryNodeRepository::new(bus.clone()));
        (bus, repo)
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let (_bus, repo) = setup();
        let status = repo.define_field("status");
        let id = repo.create_node("a task").await.unwrap();

        repo.set_property(id, status, vec!["open".to_string()])
            .await
            .unwrap();

        let node = repo.assemble_node(id).await.unwrap().unwrap();
        assert_eq!(
            node.property_values("status"),
            Some(["open".to_string()].as_slice())
        );
    }

    #[tokio::test]
    async fn test_delete_makes_node_invisible() {
        let (_bus, repo) = setup();
        let id = repo.create_node("ephemeral").await.unwrap();
        repo.delete_node(id).await.unwrap();

        assert!(repo.assemble_node(id).await.unwrap().is_none());
        assert!(repo.all_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_mutations_emit_events() {
        let (bus, repo) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let count_ref = count.clone();
        bus.subscribe(
            None,
            crate::events::listener_fn(move |_| {
                let count = count_ref.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let tag = repo.define_supertag("task");
        let id = repo.create_node("n").await.unwrap();
        repo.add_supertag(id, tag).await.unwrap();
        // Duplicate add is not a logical change; no second event.
        repo.add_supertag(id, tag).await.unwrap();
        repo.remove_supertag(id, tag).await.unwrap();
        repo.delete_node(id).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_find_nodes_by_supertag() {
        let (_bus, repo) = setup();
        let tag = repo.define_supertag("task");
        let a = repo.create_node("a").await.unwrap();
        let _b = repo.create_node("b").await.unwrap();
        repo.add_supertag(a, tag).await.unwrap();

        let found = repo.find_nodes_by_supertag(tag).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a);
    }

    #[tokio::test]
    async fn test_system_nodes() {
        let (_bus, repo) = setup();
        let tag = repo.define_system_supertag("automation");

        assert_eq!(repo.get_system_node("automation").await.unwrap(), Some(tag));
        assert_eq!(repo.get_system_node("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_evaluator_structural_filters() {
        let (_bus, repo) = setup();
        let tag = repo.define_supertag("task");
        let status = repo.define_field("status");

        let open = repo.create_node("open task").await.unwrap();
        repo.add_supertag(open, tag).await.unwrap();
        repo.set_property(open, status, vec!["open".to_string()])
            .await
            .unwrap();

        let done = repo.create_node("done task").await.unwrap();
        repo.add_supertag(done, tag).await.unwrap();
        repo.set_property(done, status, vec!["done".to_string()])
            .await
            .unwrap();

        let evaluator = MemoryQueryEvaluator::new(repo.clone());
        let query = QueryDefinition::new(QueryFilter::And {
            filters: vec![
                QueryFilter::Supertag { supertag_id: tag },
                QueryFilter::Property {
                    field_id: status,
                    value: "open".to_string(),
                },
            ],
        });

        let result = evaluator.evaluate(&query).await.unwrap();
        assert_eq!(result.total_count, 1);
        assert_eq!(result.nodes[0].id, open);
    }

    #[tokio::test]
    async fn test_evaluator_not_and_content() {
        let (_bus, repo) = setup();
        let a = repo.create_node("groceries: milk").await.unwrap();
        let _b = repo.create_node("standup notes").await.unwrap();

        let evaluator = MemoryQueryEvaluator::new(repo.clone());
        let result = evaluator
            .evaluate(&QueryDefinition::new(QueryFilter::Content {
                text: "milk".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.nodes[0].id, a);

        let result = evaluator
            .evaluate(&QueryDefinition::new(QueryFilter::Not {
                filter: Box::new(QueryFilter::Content {
                    text: "milk".to_string(),
                }),
            }))
            .await
            .unwrap();
        assert_eq!(result.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_computed_field_notifications() {
        let service = MockComputedFieldService::new();
        let field = Uuid::new_v4();
        let seen: Arc<Mutex<Vec<(f64, Option<f64>)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = seen.clone();

        let listener_id = service.on_value_change(
            field,
            computed_listener_fn(move |change| {
                let seen = seen_ref.clone();
                async move {
                    seen.lock().unwrap().push((change.current, change.previous));
                    Ok(())
                }
            }),
        );

        service.set_value(field, 4.0).await;
        service.set_value(field, 6.0).await;
        assert_eq!(service.get_value(field).await.unwrap(), Some(6.0));
        assert_eq!(*seen.lock().unwrap(), vec![(4.0, None), (6.0, Some(4.0))]);

        assert!(service.remove_listener(listener_id));
        service.set_value(field, 9.0).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
