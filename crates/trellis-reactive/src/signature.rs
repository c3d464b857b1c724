//! Content signatures and result-set diffing.
//!
//! A content signature is a deterministic fingerprint of a node's content,
//! properties, and supertags. Signature equality means "no change worth
//! reporting", regardless of object identity, which keeps `changed`
//! detection cheap: no field-by-field comparison per re-evaluation.

use std::collections::HashMap;

use trellis_core::AssembledNode;
use uuid::Uuid;

/// Field separator for signature parts; keeps user content from colliding
/// with the structural layout.
const SEP: char = '\u{1f}';

/// Deterministic fingerprint of a node's observable state.
///
/// Layout: content, then each property as `name=v1|v2|...` sorted by field
/// name (values in declared order), then the sorted comma-joined supertag
/// ids.
pub fn content_signature(node: &AssembledNode) -> String {
    let mut parts = vec![node.content.clone()];

    let mut props: Vec<_> = node.properties.iter().collect();
    props.sort_by(|a, b| a.field_name.cmp(&b.field_name));
    for prop in props {
        parts.push(format!("{}={}", prop.field_name, prop.values.join("|")));
    }

    let mut tags: Vec<String> = node.supertags.iter().map(|t| t.id.to_string()).collect();
    tags.sort();
    parts.push(tags.join(","));

    parts.join(&SEP.to_string())
}

/// Membership/content diff between a cached result set and a fresh one.
#[derive(Debug, Default)]
pub struct ResultDiff {
    /// Present now, absent before.
    pub added: Vec<AssembledNode>,
    /// Present before, absent now (materialized from the cached snapshot).
    pub removed: Vec<AssembledNode>,
    /// Present in both, signature differs.
    pub changed: Vec<AssembledNode>,
}

impl ResultDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Diff a fresh evaluation against the previously cached node snapshots.
///
/// `added = current \ previous`, `removed = previous \ current`, `changed`
/// is the subset of the intersection whose content signature moved. Output
/// lists are sorted by node id for deterministic delivery.
pub fn diff_results(
    previous: &HashMap<Uuid, AssembledNode>,
    current: &[AssembledNode],
) -> ResultDiff {
    let mut diff = ResultDiff::default();

    for node in current {
        match previous.get(&node.id) {
            None => diff.added.push(node.clone()),
            Some(old) => {
                if content_signature(old) != content_signature(node) {
                    diff.changed.push(node.clone());
                }
            }
        }
    }

    let current_ids: std::collections::HashSet<Uuid> = current.iter().map(|n| n.id).collect();
    for (id, old) in previous {
        if !current_ids.contains(id) {
            diff.removed.push(old.clone());
        }
    }

    diff.added.sort_by_key(|n| n.id);
    diff.removed.sort_by_key(|n| n.id);
    diff.changed.sort_by_key(|n| n.id);
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trellis_core::{AssembledProperty, SupertagRef};

    fn node(id: Uuid, content: &str) -> AssembledNode {
        AssembledNode {
            id,
            content: content.to_string(),
            properties: vec![],
            supertags: vec![],
            updated_at: Utc::now(),
        }
    }

    fn prop(name: &str, values: &[&str]) -> AssembledProperty {
        AssembledProperty {
            field_id: Uuid::new_v4(),
            field_name: name.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_signature_ignores_property_order() {
        let id = Uuid::new_v4();
        let mut a = node(id, "x");
        a.properties = vec![prop("alpha", &["1"]), prop("beta", &["2"])];
        let mut b = node(id, "x");
        b.properties = vec![prop("beta", &["2"]), prop("alpha", &["1"])];

        assert_eq!(content_signature(&a), content_signature(&b));
    }

    #[test]
    fn test_signature_respects_value_order() {
        let id = Uuid::new_v4();
        let mut a = node(id, "x");
        a.properties = vec![prop("tags", &["1", "2"])];
        let mut b = node(id, "x");
        b.properties = vec![prop("tags", &["2", "1"])];

        assert_ne!(content_signature(&a), content_signature(&b));
    }

    #[test]
    fn test_signature_ignores_supertag_order() {
        let id = Uuid::new_v4();
        let t1 = SupertagRef {
            id: Uuid::new_v4(),
            name: "a".to_string(),
        };
        let t2 = SupertagRef {
            id: Uuid::new_v4(),
            name: "b".to_string(),
        };
        let mut a = node(id, "x");
        a.supertags = vec![t1.clone(), t2.clone()];
        let mut b = node(id, "x");
        b.supertags = vec![t2, t1];

        assert_eq!(content_signature(&a), content_signature(&b));
    }

    #[test]
    fn test_signature_changes_with_content() {
        let id = Uuid::new_v4();
        assert_ne!(
            content_signature(&node(id, "x")),
            content_signature(&node(id, "y"))
        );
    }

    #[test]
    fn test_signature_identical_for_equal_nodes_with_different_identity() {
        let id = Uuid::new_v4();
        let a = node(id, "same");
        let b = node(id, "same");
        assert_eq!(content_signature(&a), content_signature(&b));
    }

    #[test]
    fn test_diff_added_removed_changed() {
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        let mut previous = HashMap::new();
        previous.insert(keep, node(keep, "old content"));
        previous.insert(gone, node(gone, "going away"));

        let current = vec![node(keep, "new content"), node(fresh, "brand new")];
        let diff = diff_results(&previous, &current);

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, fresh);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].id, gone);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].id, keep);
    }

    #[test]
    fn test_diff_no_change_is_empty() {
        let id = Uuid::new_v4();
        let mut previous = HashMap::new();
        previous.insert(id, node(id, "stable"));

        let diff = diff_results(&previous, &[node(id, "stable")]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_diff_added_and_removed_are_disjoint() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut previous = HashMap::new();
        previous.insert(a, node(a, "a"));

        let diff = diff_results(&previous, &[node(b, "b")]);
        let added: std::collections::HashSet<Uuid> = diff.added.iter().map(|n| n.id).collect();
        let removed: std::collections::HashSet<Uuid> = diff.removed.iter().map(|n| n.id).collect();
        assert!(added.is_disjoint(&removed));
    }

    #[test]
    fn test_diff_changed_subset_of_intersection() {
        let shared = Uuid::new_v4();
        let mut with_prop = node(shared, "x");
        with_prop.properties = vec![prop("status", &["open"])];

        let mut previous = HashMap::new();
        previous.insert(shared, node(shared, "x"));

        let diff = diff_results(&previous, &[with_prop]);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].id, shared);
    }
}
