//! Shared data model for the trellis engine: graph mutations, assembled
//! nodes, query definitions, and query result diffs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// MUTATION EVENTS
// =============================================================================

/// Discriminant for [`MutationEvent`], used by event filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    PropertySet,
    PropertyCleared,
    SupertagAdded,
    SupertagRemoved,
}

/// A single logical change to the node graph.
///
/// Emitted once per change by the node repository and consumed by the event
/// bus. Immutable by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationEvent {
    NodeCreated { node_id: Uuid },
    NodeUpdated { node_id: Uuid },
    NodeDeleted { node_id: Uuid },
    PropertySet { node_id: Uuid, field_id: Uuid },
    PropertyCleared { node_id: Uuid, field_id: Uuid },
    SupertagAdded { node_id: Uuid, supertag_id: Uuid },
    SupertagRemoved { node_id: Uuid, supertag_id: Uuid },
}

impl MutationEvent {
    /// The event discriminant.
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationEvent::NodeCreated { .. } => MutationKind::NodeCreated,
            MutationEvent::NodeUpdated { .. } => MutationKind::NodeUpdated,
            MutationEvent::NodeDeleted { .. } => MutationKind::NodeDeleted,
            MutationEvent::PropertySet { .. } => MutationKind::PropertySet,
            MutationEvent::PropertyCleared { .. } => MutationKind::PropertyCleared,
            MutationEvent::SupertagAdded { .. } => MutationKind::SupertagAdded,
            MutationEvent::SupertagRemoved { .. } => MutationKind::SupertagRemoved,
        }
    }

    /// The node this mutation applies to.
    pub fn node_id(&self) -> Uuid {
        match self {
            MutationEvent::NodeCreated { node_id }
            | MutationEvent::NodeUpdated { node_id }
            | MutationEvent::NodeDeleted { node_id }
            | MutationEvent::PropertySet { node_id, .. }
            | MutationEvent::PropertyCleared { node_id, .. }
            | MutationEvent::SupertagAdded { node_id, .. }
            | MutationEvent::SupertagRemoved { node_id, .. } => *node_id,
        }
    }

    /// The property field involved, for property mutations.
    pub fn field_id(&self) -> Option<Uuid> {
        match self {
            MutationEvent::PropertySet { field_id, .. }
            | MutationEvent::PropertyCleared { field_id, .. } => Some(*field_id),
            _ => None,
        }
    }

    /// The supertag involved, for supertag mutations.
    pub fn supertag_id(&self) -> Option<Uuid> {
        match self {
            MutationEvent::SupertagAdded { supertag_id, .. }
            | MutationEvent::SupertagRemoved { supertag_id, .. } => Some(*supertag_id),
            _ => None,
        }
    }
}

/// Listener-side constraint on which mutation events are delivered.
///
/// An unset field imposes no constraint; all set constraints must match
/// (AND semantics).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Restrict to these event kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<MutationKind>>,
    /// Restrict to mutations of this node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Uuid>,
    /// Restrict to mutations of this property field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_id: Option<Uuid>,
    /// Restrict to mutations of this supertag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supertag_id: Option<Uuid>,
}

impl EventFilter {
    /// Filter matching every event.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to the given kinds.
    pub fn with_kinds(mut self, kinds: Vec<MutationKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Restrict to a single node.
    pub fn with_node(mut self, node_id: Uuid) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Restrict to a single property field.
    pub fn with_field(mut self, field_id: Uuid) -> Self {
        self.field_id = Some(field_id);
        self
    }

    /// Restrict to a single supertag.
    pub fn with_supertag(mut self, supertag_id: Uuid) -> Self {
        self.supertag_id = Some(supertag_id);
        self
    }

    /// Whether the event satisfies every set constraint.
    pub fn matches(&self, event: &MutationEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        if let Some(node_id) = self.node_id {
            if event.node_id() != node_id {
                return false;
            }
        }
        if let Some(field_id) = self.field_id {
            if event.field_id() != Some(field_id) {
                return false;
            }
        }
        if let Some(supertag_id) = self.supertag_id {
            if event.supertag_id() != Some(supertag_id) {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// ASSEMBLED NODES
// =============================================================================

/// A property materialized onto an assembled node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledProperty {
    pub field_id: Uuid,
    /// Display name of the field, used for deterministic signature ordering.
    pub field_name: String,
    /// Raw values in declared order.
    pub values: Vec<String>,
}

/// A supertag reference materialized onto an assembled node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupertagRef {
    pub id: Uuid,
    pub name: String,
}

/// A node with its content, properties, and supertags materialized into one
/// value. Produced by the node repository / query evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledNode {
    pub id: Uuid,
    pub content: String,
    pub properties: Vec<AssembledProperty>,
    pub supertags: Vec<SupertagRef>,
    pub updated_at: DateTime<Utc>,
}

impl AssembledNode {
    /// Values of the named property, if present.
    pub fn property_values(&self, field_name: &str) -> Option<&[String]> {
        self.properties
            .iter()
            .find(|p| p.field_name == field_name)
            .map(|p| p.values.as_slice())
    }

    /// Whether the node carries the given supertag.
    pub fn has_supertag(&self, supertag_id: Uuid) -> bool {
        self.supertags.iter().any(|t| t.id == supertag_id)
    }
}

// =============================================================================
// QUERY DEFINITIONS
// =============================================================================

/// A standing query over the node graph.
///
/// The filter tree is walked by the dependency tracker; matching semantics
/// belong to the external query evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    /// Optional display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub filter: QueryFilter,
}

impl QueryDefinition {
    pub fn new(filter: QueryFilter) -> Self {
        Self { name: None, filter }
    }

    pub fn named(name: impl Into<String>, filter: QueryFilter) -> Self {
        Self {
            name: Some(name.into()),
            filter,
        }
    }
}

/// One node of a query's filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryFilter {
    /// Node carries the supertag.
    Supertag { supertag_id: Uuid },
    /// Property has the exact value.
    Property { field_id: Uuid, value: String },
    /// Node content contains the text (evaluator-defined matching).
    Content { text: String },
    /// Temporal constraint on a date-valued field (evaluator-defined).
    Temporal {
        #[serde(skip_serializing_if = "Option::is_none")]
        field_id: Option<Uuid>,
        range: String,
    },
    /// Relation constraint through a reference-valued field (evaluator-defined).
    Relation {
        field_id: Uuid,
        target_node_id: Uuid,
    },
    And { filters: Vec<QueryFilter> },
    Or { filters: Vec<QueryFilter> },
    Not { filter: Box<QueryFilter> },
}

// =============================================================================
// QUERY RESULTS
// =============================================================================

/// Snapshot result of evaluating a query definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub nodes: Vec<AssembledNode>,
    pub total_count: usize,
    pub evaluated_at: DateTime<Utc>,
}

/// A membership/content diff between two evaluations of one subscription.
///
/// Only ever constructed with at least one non-empty list; a no-op
/// re-evaluation produces no event.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResultChangeEvent {
    pub subscription_id: Uuid,
    /// Nodes newly present in the result set.
    pub added: Vec<AssembledNode>,
    /// Nodes no longer present, materialized from the previous snapshot.
    pub removed: Vec<AssembledNode>,
    /// Nodes present in both sets whose content signature changed.
    pub changed: Vec<AssembledNode>,
    pub total_count: usize,
    pub evaluated_at: DateTime<Utc>,
}

impl QueryResultChangeEvent {
    /// Whether the diff carries any change at all.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: Uuid) -> AssembledNode {
        AssembledNode {
            id,
            content: "n".to_string(),
            properties: vec![],
            supertags: vec![],
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_mutation_event_accessors() {
        let node_id = Uuid::new_v4();
        let field_id = Uuid::new_v4();
        let event = MutationEvent::PropertySet { node_id, field_id };

        assert_eq!(event.kind(), MutationKind::PropertySet);
        assert_eq!(event.node_id(), node_id);
        assert_eq!(event.field_id(), Some(field_id));
        assert_eq!(event.supertag_id(), None);
    }

    #[test]
    fn test_mutation_event_supertag_accessor() {
        let node_id = Uuid::new_v4();
        let supertag_id = Uuid::new_v4();
        let event = MutationEvent::SupertagAdded {
            node_id,
            supertag_id,
        };

        assert_eq!(event.kind(), MutationKind::SupertagAdded);
        assert_eq!(event.supertag_id(), Some(supertag_id));
        assert_eq!(event.field_id(), None);
    }

    #[test]
    fn test_mutation_event_json_tag() {
        let event = MutationEvent::NodeCreated {
            node_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"node_created"#));
    }

    #[test]
    fn test_event_filter_empty_matches_all() {
        let filter = EventFilter::any();
        let event = MutationEvent::NodeDeleted {
            node_id: Uuid::new_v4(),
        };
        assert!(filter.matches(&event));
    }

    #[test]
    fn test_event_filter_kind_constraint() {
        let filter = EventFilter::any().with_kinds(vec![MutationKind::NodeCreated]);
        let created = MutationEvent::NodeCreated {
            node_id: Uuid::nil(),
        };
        let deleted = MutationEvent::NodeDeleted {
            node_id: Uuid::nil(),
        };
        assert!(filter.matches(&created));
        assert!(!filter.matches(&deleted));
    }

    #[test]
    fn test_event_filter_and_semantics() {
        let node_id = Uuid::new_v4();
        let field_id = Uuid::new_v4();
        let filter = EventFilter::any()
            .with_kinds(vec![MutationKind::PropertySet])
            .with_node(node_id)
            .with_field(field_id);

        assert!(filter.matches(&MutationEvent::PropertySet { node_id, field_id }));
        // Right kind and node, wrong field
        assert!(!filter.matches(&MutationEvent::PropertySet {
            node_id,
            field_id: Uuid::new_v4(),
        }));
        // Right kind and field, wrong node
        assert!(!filter.matches(&MutationEvent::PropertySet {
            node_id: Uuid::new_v4(),
            field_id,
        }));
    }

    #[test]
    fn test_event_filter_field_constraint_rejects_fieldless_events() {
        let filter = EventFilter::any().with_field(Uuid::new_v4());
        let event = MutationEvent::NodeUpdated {
            node_id: Uuid::new_v4(),
        };
        assert!(!filter.matches(&event));
    }

    #[test]
    fn test_assembled_node_property_lookup() {
        let mut n = node(Uuid::new_v4());
        n.properties.push(AssembledProperty {
            field_id: Uuid::new_v4(),
            field_name: "status".to_string(),
            values: vec!["open".to_string()],
        });

        assert_eq!(
            n.property_values("status"),
            Some(["open".to_string()].as_slice())
        );
        assert_eq!(n.property_values("missing"), None);
    }

    #[test]
    fn test_assembled_node_has_supertag() {
        let tag = Uuid::new_v4();
        let mut n = node(Uuid::new_v4());
        n.supertags.push(SupertagRef {
            id: tag,
            name: "task".to_string(),
        });

        assert!(n.has_supertag(tag));
        assert!(!n.has_supertag(Uuid::new_v4()));
    }

    #[test]
    fn test_query_filter_roundtrip() {
        let def = QueryDefinition::named(
            "open tasks",
            QueryFilter::And {
                filters: vec![
                    QueryFilter::Supertag {
                        supertag_id: Uuid::nil(),
                    },
                    QueryFilter::Property {
                        field_id: Uuid::nil(),
                        value: "open".to_string(),
                    },
                ],
            },
        );

        let json = serde_json::to_string(&def).unwrap();
        let parsed: QueryDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_change_event_is_empty() {
        let event = QueryResultChangeEvent {
            subscription_id: Uuid::new_v4(),
            added: vec![],
            removed: vec![],
            changed: vec![],
            total_count: 0,
            evaluated_at: Utc::now(),
        };
        assert!(event.is_empty());

        let event = QueryResultChangeEvent {
            added: vec![node(Uuid::new_v4())],
            ..event
        };
        assert!(!event.is_empty());
    }
}
