//! Live-query subscription service.
//!
//! Owns the set of standing subscriptions, re-evaluates the ones a mutation
//! could affect, diffs the fresh result against the cached snapshot, and
//! delivers change events to subscriber callbacks.
//!
//! ## Invalidation
//!
//! Smart invalidation (the default) unions two rules per mutation: the
//! dependency tracker's candidates, plus every subscription whose last
//! result set already contains the mutated node — a property change on a
//! member node is not a membership dependency but must still surface as
//! `changed`. Brute force re-evaluates everything.
//!
//! ## Batching
//!
//! Mutations buffer for `debounce_ms` in an explicit timer state machine;
//! each new mutation re-arms the window. A zero debounce (default)
//! processes inline within the bus emission, so a mutation cascade settles
//! depth-first before control returns to the emitter; with a non-zero
//! window, nested mutations simply re-arm the timer.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use trellis_core::defaults::SUBSCRIPTION_DEBOUNCE_MS;
use trellis_core::{
    listener_fn, AssembledNode, EventBus, MutationEvent, QueryDefinition, QueryEvaluator,
    QueryResultChangeEvent, Result,
};

use crate::dependency::DependencyTracker;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::signature::diff_results;

/// Subscriber callback invoked with each non-empty result diff.
pub type ChangeCallback =
    Arc<dyn Fn(QueryResultChangeEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure into a [`ChangeCallback`].
pub fn change_callback_fn<F, Fut>(f: F) -> ChangeCallback
where
    F: Fn(QueryResultChangeEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Configuration for the subscription service.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Prune re-evaluations via the dependency tracker.
    pub smart_invalidation: bool,
    /// Mutation debounce window in milliseconds (0 = process inline).
    pub debounce_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            smart_invalidation: true,
            debounce_ms: SUBSCRIPTION_DEBOUNCE_MS,
        }
    }
}

impl SubscriptionConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `TRELLIS_SMART_INVALIDATION` | `true` | Dependency-based pruning |
    /// | `TRELLIS_DEBOUNCE_MS` | `0` | Mutation debounce window |
    pub fn from_env() -> Self {
        let smart_invalidation = std::env::var("TRELLIS_SMART_INVALIDATION")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        let debounce_ms = std::env::var("TRELLIS_DEBOUNCE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(SUBSCRIPTION_DEBOUNCE_MS);
        Self {
            smart_invalidation,
            debounce_ms,
        }
    }

    pub fn with_smart_invalidation(mut self, enabled: bool) -> Self {
        self.smart_invalidation = enabled;
        self
    }

    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }
}

struct SubscriptionState {
    query: QueryDefinition,
    callback: ChangeCallback,
    last_result_ids: HashSet<Uuid>,
    last_nodes: HashMap<Uuid, AssembledNode>,
    last_evaluated_at: DateTime<Utc>,
}

/// Debounce timer states.
enum DebounceTimer {
    Idle,
    Armed { generation: u64, handle: JoinHandle<()> },
}

struct BatchState {
    pending: Vec<MutationEvent>,
    timer: DebounceTimer,
    /// Bumped on every re-arm and flush; a firing timer whose generation no
    /// longer matches has been superseded.
    generation: u64,
}

struct Inner {
    bus: Arc<EventBus>,
    evaluator: Arc<dyn QueryEvaluator>,
    tracker: DependencyTracker,
    metrics: Arc<MetricsCollector>,
    subscriptions: Mutex<HashMap<Uuid, SubscriptionState>>,
    config: Mutex<SubscriptionConfig>,
    batch: Mutex<BatchState>,
    bus_listener: Mutex<Option<Uuid>>,
}

/// Handle returned by [`QuerySubscriptionService::subscribe`].
pub struct SubscriptionHandle {
    id: Uuid,
    inner: Weak<Inner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The cached result set from the most recent evaluation, sorted by id.
    pub fn last_results(&self) -> Vec<AssembledNode> {
        let Some(inner) = self.inner.upgrade() else {
            return Vec::new();
        };
        let subs = inner.subscriptions.lock().expect("subscriptions lock poisoned");
        let Some(sub) = subs.get(&self.id) else {
            return Vec::new();
        };
        let mut nodes: Vec<AssembledNode> = sub.last_nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// When the subscription last re-evaluated, if it still exists.
    pub fn last_evaluated_at(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.upgrade()?;
        let subs = inner.subscriptions.lock().expect("subscriptions lock poisoned");
        subs.get(&self.id).map(|sub| sub.last_evaluated_at)
    }

    /// Remove this subscription from the service.
    pub fn unsubscribe(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => Inner::remove_subscription(&inner, self.id),
            None => false,
        }
    }
}

/// Maintains standing queries and delivers result diffs as the graph mutates.
#[derive(Clone)]
pub struct QuerySubscriptionService {
    inner: Arc<Inner>,
}

impl QuerySubscriptionService {
    pub fn new(bus: Arc<EventBus>, evaluator: Arc<dyn QueryEvaluator>) -> Self {
        Self::with_config(bus, evaluator, SubscriptionConfig::default())
    }

    pub fn with_config(
        bus: Arc<EventBus>,
        evaluator: Arc<dyn QueryEvaluator>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                evaluator,
                tracker: DependencyTracker::new(),
                metrics: Arc::new(MetricsCollector::new()),
                subscriptions: Mutex::new(HashMap::new()),
                config: Mutex::new(config),
                batch: Mutex::new(BatchState {
                    pending: Vec::new(),
                    timer: DebounceTimer::Idle,
                    generation: 0,
                }),
                bus_listener: Mutex::new(None),
            }),
        }
    }

    /// Register a standing query.
    ///
    /// Evaluates once immediately (evaluator errors propagate), seeds the
    /// cached result set, and lazily attaches the service to the event bus
    /// when this is the first live subscription.
    pub async fn subscribe(
        &self,
        query: QueryDefinition,
        callback: ChangeCallback,
    ) -> Result<SubscriptionHandle> {
        let start = Instant::now();
        let result = self.inner.evaluator.evaluate(&query).await?;
        self.inner.metrics.record_evaluation(start.elapsed());

        let id = Uuid::new_v4();
        self.inner.tracker.register(id, &query);
        {
            let mut subs = self
                .inner
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            let last_nodes: HashMap<Uuid, AssembledNode> =
                result.nodes.iter().map(|n| (n.id, n.clone())).collect();
            subs.insert(
                id,
                SubscriptionState {
                    query,
                    callback,
                    last_result_ids: last_nodes.keys().copied().collect(),
                    last_nodes,
                    last_evaluated_at: result.evaluated_at,
                },
            );
            self.inner
                .metrics
                .set_active_subscriptions(subs.len() as u64);
        }
        Inner::attach_bus(&self.inner);

        debug!(subscription_id = %id, seed_count = result.total_count, "Subscription registered");
        Ok(SubscriptionHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Remove a subscription. Returns whether it was present.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        Inner::remove_subscription(&self.inner, id)
    }

    /// Re-evaluate every subscription, bypassing pruning and batching.
    ///
    /// Intended for manual refresh and recovery from missed events.
    /// Evaluator errors propagate to the caller.
    pub async fn refresh_all(&self) -> Result<()> {
        let mut ids: Vec<Uuid> = {
            let subs = self
                .inner
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            subs.keys().copied().collect()
        };
        ids.sort();
        for id in ids {
            self.inner.evaluate_subscription(id).await?;
        }
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .len()
    }

    /// Drop every subscription, detach from the bus, and discard pending work.
    pub fn clear(&self) {
        {
            let mut subs = self
                .inner
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            subs.clear();
            self.inner.metrics.set_active_subscriptions(0);
        }
        self.inner.tracker.clear();
        Inner::detach_bus(&self.inner);
        let mut batch = self.inner.batch.lock().expect("batch lock poisoned");
        batch.pending.clear();
        batch.generation += 1;
        if let DebounceTimer::Armed { handle, .. } =
            std::mem::replace(&mut batch.timer, DebounceTimer::Idle)
        {
            handle.abort();
        }
    }

    pub fn set_smart_invalidation(&self, enabled: bool) {
        self.inner
            .config
            .lock()
            .expect("config lock poisoned")
            .smart_invalidation = enabled;
    }

    pub fn set_debounce_ms(&self, ms: u64) {
        self.inner
            .config
            .lock()
            .expect("config lock poisoned")
            .debounce_ms = ms;
    }

    /// Cancel any armed debounce timer and process pending mutations now.
    pub async fn flush_pending_mutations(&self) {
        {
            let mut batch = self.inner.batch.lock().expect("batch lock poisoned");
            batch.generation += 1;
            if let DebounceTimer::Armed { handle, .. } =
                std::mem::replace(&mut batch.timer, DebounceTimer::Idle)
            {
                handle.abort();
            }
        }
        self.inner.drain_pending().await;
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        self.inner.metrics.clone()
    }
}

impl Inner {
    fn attach_bus(inner: &Arc<Inner>) {
        let mut slot = inner.bus_listener.lock().expect("bus listener lock poisoned");
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(inner);
        let listener_id = inner.bus.subscribe(
            None,
            listener_fn(move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_mutation(event).await;
                    }
                    Ok(())
                }
            }),
        );
        *slot = Some(listener_id);
    }

    fn detach_bus(inner: &Arc<Inner>) {
        let listener_id = inner
            .bus_listener
            .lock()
            .expect("bus listener lock poisoned")
            .take();
        if let Some(id) = listener_id {
            inner.bus.unsubscribe(id);
        }
    }

    fn remove_subscription(inner: &Arc<Inner>, id: Uuid) -> bool {
        let (removed, now_empty) = {
            let mut subs = inner
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            let removed = subs.remove(&id).is_some();
            inner.metrics.set_active_subscriptions(subs.len() as u64);
            (removed, subs.is_empty())
        };
        if removed {
            inner.tracker.unregister(id);
            debug!(subscription_id = %id, "Subscription removed");
        }
        if now_empty {
            Inner::detach_bus(inner);
        }
        removed
    }

    async fn handle_mutation(self: Arc<Self>, event: MutationEvent) {
        self.metrics.record_event();
        let debounce_ms = self
            .config
            .lock()
            .expect("config lock poisoned")
            .debounce_ms;

        {
            let mut batch = self.batch.lock().expect("batch lock poisoned");
            batch.pending.push(event);
            if debounce_ms > 0 {
                batch.generation += 1;
                let generation = batch.generation;
                if let DebounceTimer::Armed { handle, .. } =
                    std::mem::replace(&mut batch.timer, DebounceTimer::Idle)
                {
                    handle.abort();
                }
                let inner = self.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
                    inner.debounce_fired(generation).await;
                });
                batch.timer = DebounceTimer::Armed { generation, handle };
                return;
            }
        }
        self.drain_pending().await;
    }

    async fn debounce_fired(self: Arc<Self>, generation: u64) {
        {
            let mut batch = self.batch.lock().expect("batch lock poisoned");
            let current = matches!(
                &batch.timer,
                DebounceTimer::Armed { generation: g, .. } if *g == generation
            );
            // Superseded by a later mutation or an explicit flush.
            if !current {
                return;
            }
            batch.timer = DebounceTimer::Idle;
        }
        self.drain_pending().await;
    }

    /// Process pending mutations until the buffer is empty.
    ///
    /// With a zero debounce, a mutation emitted by a subscriber callback
    /// re-enters here inside the callback's own await, so a cascade settles
    /// depth-first before control returns to the original emitter. The
    /// automation engine's chain checks rely on that nesting; runaway
    /// cascades are cut off there, not here.
    async fn drain_pending(&self) {
        loop {
            let events = {
                let mut batch = self.batch.lock().expect("batch lock poisoned");
                if batch.pending.is_empty() {
                    break;
                }
                std::mem::take(&mut batch.pending)
            };
            self.process_batch(events).await;
        }
    }

    async fn process_batch(&self, events: Vec<MutationEvent>) {
        let smart = self
            .config
            .lock()
            .expect("config lock poisoned")
            .smart_invalidation;

        let mut tracker_hits: HashSet<Uuid> = HashSet::new();
        if smart {
            for event in &events {
                tracker_hits.extend(self.tracker.affected_subscriptions(event));
            }
        }

        let (mut to_evaluate, skipped) = {
            let subs = self.subscriptions.lock().expect("subscriptions lock poisoned");
            let total = subs.len();
            if !smart {
                (subs.keys().copied().collect::<Vec<Uuid>>(), 0u64)
            } else {
                let mut affected: HashSet<Uuid> = tracker_hits
                    .into_iter()
                    .filter(|id| subs.contains_key(id))
                    .collect();
                // A mutation on a node already inside a result set must
                // surface as `changed` even when no dependency matches.
                for event in &events {
                    let node_id = event.node_id();
                    for (id, sub) in subs.iter() {
                        if sub.last_result_ids.contains(&node_id) {
                            affected.insert(*id);
                        }
                    }
                }
                let skipped = (total - affected.len()) as u64;
                (affected.into_iter().collect(), skipped)
            }
        };

        if skipped > 0 {
            self.metrics.record_skipped(skipped);
        }

        to_evaluate.sort();
        debug!(
            batch_size = events.len(),
            evaluated = to_evaluate.len(),
            skipped,
            "Processing mutation batch"
        );

        for id in to_evaluate {
            if let Err(e) = self.evaluate_subscription(id).await {
                error!(
                    subscription_id = %id,
                    error = %e,
                    "Re-evaluation failed; keeping previous results"
                );
            }
        }
    }

    /// Re-evaluate one subscription, update its cached state, and deliver
    /// the diff if non-empty. Returns the evaluator error, if any.
    async fn evaluate_subscription(&self, id: Uuid) -> Result<()> {
        let query = {
            let subs = self.subscriptions.lock().expect("subscriptions lock poisoned");
            match subs.get(&id) {
                Some(sub) => sub.query.clone(),
                // Unsubscribed since the batch was computed.
                None => return Ok(()),
            }
        };

        let start = Instant::now();
        let result = self.evaluator.evaluate(&query).await?;
        self.metrics.record_evaluation(start.elapsed());

        let delivery = {
            let mut subs = self.subscriptions.lock().expect("subscriptions lock poisoned");
            let Some(sub) = subs.get_mut(&id) else {
                return Ok(());
            };
            let diff = diff_results(&sub.last_nodes, &result.nodes);
            sub.last_nodes = result.nodes.iter().map(|n| (n.id, n.clone())).collect();
            sub.last_result_ids = sub.last_nodes.keys().copied().collect();
            sub.last_evaluated_at = result.evaluated_at;
            if diff.is_empty() {
                None
            } else {
                Some((
                    sub.callback.clone(),
                    QueryResultChangeEvent {
                        subscription_id: id,
                        added: diff.added,
                        removed: diff.removed,
                        changed: diff.changed,
                        total_count: result.total_count,
                        evaluated_at: result.evaluated_at,
                    },
                ))
            }
        };

        if let Some((callback, event)) = delivery {
            let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(fut) => fut,
                Err(_) => {
                    warn!(subscription_id = %id, "Subscriber callback panicked during invocation");
                    return Ok(());
                }
            };
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscription_id = %id, error = %e, "Subscriber callback failed");
                }
                Err(_) => {
                    warn!(subscription_id = %id, "Subscriber callback panicked");
                }
            }
        }
        Ok(())
    }
}
