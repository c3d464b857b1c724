//! Static dependency analysis of query filter trees.
//!
//! For each registered subscription, the tracker extracts the set of field
//! ids and supertag ids that could influence the query's membership. Per
//! mutation, [`DependencyTracker::affected_subscriptions`] returns a
//! conservative candidate set: a false positive only costs one extra
//! evaluation, a false negative is a missed update, so filter kinds whose
//! dependencies cannot be proven (content, temporal, relation) depend on
//! everything.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use trellis_core::{MutationEvent, QueryDefinition, QueryFilter};
use uuid::Uuid;

/// Field/supertag dependency summary of one query definition.
#[derive(Debug, Clone, Default)]
pub struct QueryDependencies {
    pub fields: HashSet<Uuid>,
    pub supertags: HashSet<Uuid>,
    /// Set when the tree contains a filter kind with unprovable dependencies.
    pub depends_on_everything: bool,
}

impl QueryDependencies {
    /// Walk a query definition's filter tree into a dependency summary.
    pub fn of(query: &QueryDefinition) -> Self {
        let mut deps = Self::default();
        deps.collect(&query.filter);
        deps
    }

    fn collect(&mut self, filter: &QueryFilter) {
        match filter {
            QueryFilter::Supertag { supertag_id } => {
                self.supertags.insert(*supertag_id);
            }
            QueryFilter::Property { field_id, .. } => {
                self.fields.insert(*field_id);
            }
            // Matching semantics for these kinds live in the evaluator and
            // can hinge on state no structural analysis sees.
            QueryFilter::Content { .. }
            | QueryFilter::Temporal { .. }
            | QueryFilter::Relation { .. } => {
                self.depends_on_everything = true;
            }
            QueryFilter::And { filters } | QueryFilter::Or { filters } => {
                for f in filters {
                    self.collect(f);
                }
            }
            QueryFilter::Not { filter } => self.collect(filter),
        }
    }

    /// Whether the given mutation could change this query's membership.
    fn implicated_by(&self, event: &MutationEvent) -> bool {
        if self.depends_on_everything {
            return true;
        }
        match event {
            // A node appearing or disappearing can join or leave any result
            // set; NodeUpdated carries no field information to narrow on.
            MutationEvent::NodeCreated { .. }
            | MutationEvent::NodeUpdated { .. }
            | MutationEvent::NodeDeleted { .. } => true,
            MutationEvent::PropertySet { field_id, .. }
            | MutationEvent::PropertyCleared { field_id, .. } => self.fields.contains(field_id),
            MutationEvent::SupertagAdded { supertag_id, .. }
            | MutationEvent::SupertagRemoved { supertag_id, .. } => {
                self.supertags.contains(supertag_id)
            }
        }
    }
}

/// Per-subscription dependency registry.
#[derive(Default)]
pub struct DependencyTracker {
    registry: Mutex<HashMap<Uuid, QueryDependencies>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze and store the dependencies of a subscription's query.
    pub fn register(&self, subscription_id: Uuid, query: &QueryDefinition) {
        let deps = QueryDependencies::of(query);
        self.registry
            .lock()
            .expect("dependency registry lock poisoned")
            .insert(subscription_id, deps);
    }

    /// Drop a subscription's dependency summary.
    pub fn unregister(&self, subscription_id: Uuid) {
        self.registry
            .lock()
            .expect("dependency registry lock poisoned")
            .remove(&subscription_id);
    }

    /// Conservative set of subscriptions the mutation could affect.
    pub fn affected_subscriptions(&self, event: &MutationEvent) -> HashSet<Uuid> {
        self.registry
            .lock()
            .expect("dependency registry lock poisoned")
            .iter()
            .filter(|(_, deps)| deps.implicated_by(event))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn clear(&self) {
        self.registry
            .lock()
            .expect("dependency registry lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property_query(field_id: Uuid) -> QueryDefinition {
        QueryDefinition::new(QueryFilter::Property {
            field_id,
            value: "open".to_string(),
        })
    }

    #[test]
    fn test_dependencies_of_logical_tree() {
        let field = Uuid::new_v4();
        let tag = Uuid::new_v4();
        let query = QueryDefinition::new(QueryFilter::And {
            filters: vec![
                QueryFilter::Supertag { supertag_id: tag },
                QueryFilter::Not {
                    filter: Box::new(QueryFilter::Property {
                        field_id: field,
                        value: "done".to_string(),
                    }),
                },
            ],
        });

        let deps = QueryDependencies::of(&query);
        assert!(deps.fields.contains(&field));
        assert!(deps.supertags.contains(&tag));
        assert!(!deps.depends_on_everything);
    }

    #[test]
    fn test_content_filter_depends_on_everything() {
        let query = QueryDefinition::new(QueryFilter::Or {
            filters: vec![
                QueryFilter::Supertag {
                    supertag_id: Uuid::new_v4(),
                },
                QueryFilter::Content {
                    text: "milk".to_string(),
                },
            ],
        });
        assert!(QueryDependencies::of(&query).depends_on_everything);
    }

    #[test]
    fn test_property_mutation_prunes_unrelated_subscriptions() {
        let tracker = DependencyTracker::new();
        let watched_field = Uuid::new_v4();
        let other_field = Uuid::new_v4();
        let sub = Uuid::new_v4();
        tracker.register(sub, &property_query(watched_field));

        let node_id = Uuid::new_v4();
        let affected = tracker.affected_subscriptions(&MutationEvent::PropertySet {
            node_id,
            field_id: watched_field,
        });
        assert!(affected.contains(&sub));

        let affected = tracker.affected_subscriptions(&MutationEvent::PropertySet {
            node_id,
            field_id: other_field,
        });
        assert!(affected.is_empty());
    }

    #[test]
    fn test_supertag_mutation_matches_supertag_dependency() {
        let tracker = DependencyTracker::new();
        let tag = Uuid::new_v4();
        let sub = Uuid::new_v4();
        tracker.register(
            sub,
            &QueryDefinition::new(QueryFilter::Supertag { supertag_id: tag }),
        );

        let affected = tracker.affected_subscriptions(&MutationEvent::SupertagAdded {
            node_id: Uuid::new_v4(),
            supertag_id: tag,
        });
        assert_eq!(affected.len(), 1);

        let affected = tracker.affected_subscriptions(&MutationEvent::SupertagAdded {
            node_id: Uuid::new_v4(),
            supertag_id: Uuid::new_v4(),
        });
        assert!(affected.is_empty());
    }

    #[test]
    fn test_node_lifecycle_mutations_implicate_everyone() {
        let tracker = DependencyTracker::new();
        let sub = Uuid::new_v4();
        tracker.register(sub, &property_query(Uuid::new_v4()));

        for event in [
            MutationEvent::NodeCreated {
                node_id: Uuid::new_v4(),
            },
            MutationEvent::NodeUpdated {
                node_id: Uuid::new_v4(),
            },
            MutationEvent::NodeDeleted {
                node_id: Uuid::new_v4(),
            },
        ] {
            assert!(tracker.affected_subscriptions(&event).contains(&sub));
        }
    }

    #[test]
    fn test_unregister_and_clear() {
        let tracker = DependencyTracker::new();
        let field = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.register(a, &property_query(field));
        tracker.register(b, &property_query(field));

        tracker.unregister(a);
        let affected = tracker.affected_subscriptions(&MutationEvent::PropertySet {
            node_id: Uuid::new_v4(),
            field_id: field,
        });
        assert_eq!(affected.len(), 1);
        assert!(affected.contains(&b));

        tracker.clear();
        let affected = tracker.affected_subscriptions(&MutationEvent::PropertySet {
            node_id: Uuid::new_v4(),
            field_id: field,
        });
        assert!(affected.is_empty());
    }
}
