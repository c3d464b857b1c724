//! Execution-chain tracking for automation cycle protection.
//!
//! One chain spans a whole firing cascade: the root firing installs it,
//! nested firings (actions whose mutations re-trigger automations before
//! the root action returns) join it, and it clears when the root firing
//! ends. The chain carries the shared depth counter and the set of node
//! ids already acted on, so a recursive trigger on the same node is cut
//! off and runaway chains across distinct nodes stop at the depth limit.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::debug;
use trellis_core::defaults::MAX_EXECUTION_DEPTH;
use uuid::Uuid;

#[derive(Debug)]
pub(crate) struct ExecutionChain {
    depth: usize,
    source_automation_id: Uuid,
    triggering_node_ids: HashSet<Uuid>,
}

/// Outcome of attempting to run one action within the current chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainEntry {
    Entered,
    DepthExceeded,
    CycleDetected,
}

pub(crate) type ChainSlot = Mutex<Option<ExecutionChain>>;

pub(crate) fn new_slot() -> ChainSlot {
    Mutex::new(None)
}

/// Begin a firing. Installs a fresh chain when none is active and reports
/// whether this firing is the chain's root.
pub(crate) fn begin_firing(slot: &ChainSlot, automation_id: Uuid) -> bool {
    let mut chain = slot.lock().expect("execution chain lock poisoned");
    match chain.as_ref() {
        None => {
            *chain = Some(ExecutionChain {
                depth: 0,
                source_automation_id: automation_id,
                triggering_node_ids: HashSet::new(),
            });
            true
        }
        Some(existing) => {
            debug!(
                automation_id = %automation_id,
                source_automation_id = %existing.source_automation_id,
                depth = existing.depth,
                "Nested firing joins existing execution chain"
            );
            false
        }
    }
}

/// End a firing; the root firing clears the chain.
pub(crate) fn end_firing(slot: &ChainSlot, is_root: bool) {
    if is_root {
        *slot.lock().expect("execution chain lock poisoned") = None;
    }
}

/// Enter one action execution against an optional target node.
///
/// The node id is recorded **before** the action runs so nested triggers
/// within the same chain see it. Must be balanced with [`exit_action`]
/// when `Entered` is returned.
pub(crate) fn enter_action(slot: &ChainSlot, node_id: Option<Uuid>) -> ChainEntry {
    let mut guard = slot.lock().expect("execution chain lock poisoned");
    let chain = guard.as_mut().expect("enter_action outside a firing");
    if chain.depth >= MAX_EXECUTION_DEPTH {
        return ChainEntry::DepthExceeded;
    }
    if let Some(node_id) = node_id {
        if !chain.triggering_node_ids.insert(node_id) {
            return ChainEntry::CycleDetected;
        }
    }
    chain.depth += 1;
    ChainEntry::Entered
}

pub(crate) fn exit_action(slot: &ChainSlot) {
    let mut guard = slot.lock().expect("execution chain lock poisoned");
    if let Some(chain) = guard.as_mut() {
        chain.depth = chain.depth.saturating_sub(1);
    }
}
