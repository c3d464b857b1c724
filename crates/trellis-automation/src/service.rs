//! The automation rules engine.
//!
//! Automations persist as nodes tagged with the system `automation`
//! supertag; the service keeps a runtime map of the enabled ones, each
//! holding exactly one live hook: a query subscription (membership
//! triggers) or a computed-field listener (threshold triggers). Firings
//! run through the execution chain in [`crate::chain`] so self-retriggering
//! automations cannot loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use trellis_core::defaults::{
    NOW_MARKER, SYS_AUTOMATION_TAG, SYS_FIELD_AUTOMATION_DEFINITION,
    SYS_FIELD_AUTOMATION_LAST_FIRED, SYS_FIELD_AUTOMATION_STATE,
};
use trellis_core::{
    computed_listener_fn, AssembledNode, ComputedFieldChange, ComputedFieldService, Error,
    NodeRepository, QueryResultChangeEvent, Result,
};
use trellis_reactive::{change_callback_fn, QuerySubscriptionService, SubscriptionHandle};
use trellis_webhook::{WebhookContext, WebhookQueue};

use crate::chain::{self, ChainEntry, ChainSlot};
use crate::definition::{
    AutomationAction, AutomationDefinition, AutomationRecord, AutomationState, MembershipEvent,
    Trigger,
};

/// Resolved ids of the well-known automation schema nodes.
#[derive(Debug, Clone, Copy)]
struct SystemIds {
    automation_tag: Uuid,
    definition_field: Uuid,
    state_field: Uuid,
    last_fired_field: Uuid,
}

/// The live hook an enabled automation holds.
enum LiveHook {
    Membership(SubscriptionHandle),
    Threshold { listener_id: Uuid },
}

/// Runtime entry for an enabled automation.
struct ActiveAutomation {
    definition: AutomationDefinition,
    hook: LiveHook,
    /// Mirror of the persisted `threshold_crossed` flag.
    threshold_crossed: bool,
    /// Most recent computed value seen, for threshold bookkeeping.
    previous_value: Option<f64>,
}

struct Inner {
    repo: Arc<dyn NodeRepository>,
    subscriptions: QuerySubscriptionService,
    computed: Arc<dyn ComputedFieldService>,
    webhooks: WebhookQueue,
    active: Mutex<HashMap<Uuid, ActiveAutomation>>,
    system: Mutex<Option<SystemIds>>,
    chain: ChainSlot,
}

/// Rules engine driving actions off membership and threshold triggers.
#[derive(Clone)]
pub struct AutomationService {
    inner: Arc<Inner>,
}

impl AutomationService {
    pub fn new(
        repo: Arc<dyn NodeRepository>,
        subscriptions: QuerySubscriptionService,
        computed: Arc<dyn ComputedFieldService>,
        webhooks: WebhookQueue,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                subscriptions,
                computed,
                webhooks,
                active: Mutex::new(HashMap::new()),
                system: Mutex::new(None),
                chain: chain::new_slot(),
            }),
        }
    }

    /// Load persisted automations and activate the enabled ones.
    ///
    /// Individual activation failures are logged and skipped so one broken
    /// automation cannot block the rest.
    pub async fn initialize(&self) -> Result<()> {
        let records = self.get_all().await?;
        let mut activated = 0usize;
        for record in records {
            if !record.definition.enabled {
                continue;
            }
            match Inner::activate(&self.inner, record.id, record.definition, record.state).await {
                Ok(()) => activated += 1,
                Err(e) => {
                    warn!(automation_id = %record.id, error = %e, "Failed to activate persisted automation");
                }
            }
        }
        info!(activated, "Automation service initialized");
        Ok(())
    }

    /// Persist a new automation node; activates it when `enabled`.
    pub async fn create(&self, definition: AutomationDefinition) -> Result<Uuid> {
        let sys = self.inner.system_ids().await?;
        let id = self.inner.repo.create_node(&definition.name).await?;
        self.inner.repo.add_supertag(id, sys.automation_tag).await?;
        self.inner
            .repo
            .set_property(id, sys.definition_field, vec![definition.to_json()?])
            .await?;
        self.inner
            .repo
            .set_property(id, sys.state_field, vec![AutomationState::default().to_json()?])
            .await?;

        if definition.enabled {
            Inner::activate(&self.inner, id, definition, AutomationState::default()).await?;
        }
        debug!(automation_id = %id, "Automation created");
        Ok(id)
    }

    /// Load one automation from the repository.
    pub async fn get(&self, id: Uuid) -> Result<Option<AutomationRecord>> {
        let sys = self.inner.system_ids().await?;
        let Some(node) = self.inner.repo.assemble_node(id).await? else {
            return Ok(None);
        };
        Ok(Some(Inner::parse_record(&sys, &node)?))
    }

    /// Every parseable automation node, discovered purely through the
    /// repository — disabled automations have no runtime entry to consult.
    pub async fn get_all(&self) -> Result<Vec<AutomationRecord>> {
        let sys = self.inner.system_ids().await?;
        let nodes = self
            .inner
            .repo
            .find_nodes_by_supertag(sys.automation_tag)
            .await?;
        let mut records = Vec::with_capacity(nodes.len());
        for node in nodes {
            match Inner::parse_record(&sys, &node) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Skipping unparseable automation node");
                }
            }
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Enable or disable an automation, persisting the flag.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let record = self.get(id).await?.ok_or(Error::NodeNotFound(id))?;
        if enabled {
            let mut definition = record.definition;
            if !definition.enabled {
                definition.enabled = true;
                self.inner.persist_definition(id, &definition).await?;
            }
            Inner::activate(&self.inner, id, definition, record.state).await?;
        } else {
            self.inner.deactivate(id);
            if record.definition.enabled {
                let mut definition = record.definition;
                definition.enabled = false;
                self.inner.persist_definition(id, &definition).await?;
            }
        }
        Ok(())
    }

    /// Deactivate and soft-delete an automation node.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.inner.deactivate(id);
        self.inner.repo.delete_node(id).await
    }

    /// Manually fire an automation through its stored trigger kind, at
    /// chain depth zero with an empty triggering set.
    pub async fn trigger(&self, id: Uuid) -> Result<()> {
        let record = self.get(id).await?.ok_or(Error::NodeNotFound(id))?;
        match &record.definition.trigger {
            Trigger::Threshold {
                computed_field_id,
                condition,
                ..
            } => {
                let Some(value) = self.inner.computed.get_value(*computed_field_id).await? else {
                    return Ok(());
                };
                if condition.holds(value) {
                    let is_root = chain::begin_firing(&self.inner.chain, id);
                    self.inner
                        .execute_action(
                            id,
                            &record.definition,
                            None,
                            Some((*computed_field_id, value)),
                        )
                        .await;
                    chain::end_firing(&self.inner.chain, is_root);
                }
                Ok(())
            }
            Trigger::QueryMembership { .. } => {
                let nodes = {
                    let active = self.inner.active.lock().expect("active map lock poisoned");
                    match active.get(&id).map(|a| &a.hook) {
                        Some(LiveHook::Membership(handle)) => handle.last_results(),
                        _ => {
                            return Err(Error::InvalidInput(
                                "cannot trigger a disabled membership automation".to_string(),
                            ))
                        }
                    }
                };
                let is_root = chain::begin_firing(&self.inner.chain, id);
                for node in &nodes {
                    self.inner
                        .execute_action(id, &record.definition, Some(node), None)
                        .await;
                }
                chain::end_firing(&self.inner.chain, is_root);
                Ok(())
            }
        }
    }

    /// Number of automations with a live hook.
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().expect("active map lock poisoned").len()
    }
}

impl Inner {
    /// Resolve and cache the automation schema node ids.
    async fn system_ids(&self) -> Result<SystemIds> {
        if let Some(ids) = *self.system.lock().expect("system ids lock poisoned") {
            return Ok(ids);
        }
        let resolve = |key: &'static str| {
            let repo = self.repo.clone();
            async move {
                repo.get_system_node(key)
                    .await?
                    .ok_or_else(|| Error::SystemNodeNotFound(key.to_string()))
            }
        };
        let ids = SystemIds {
            automation_tag: resolve(SYS_AUTOMATION_TAG).await?,
            definition_field: resolve(SYS_FIELD_AUTOMATION_DEFINITION).await?,
            state_field: resolve(SYS_FIELD_AUTOMATION_STATE).await?,
            last_fired_field: resolve(SYS_FIELD_AUTOMATION_LAST_FIRED).await?,
        };
        *self.system.lock().expect("system ids lock poisoned") = Some(ids);
        Ok(ids)
    }

    fn parse_record(sys: &SystemIds, node: &AssembledNode) -> Result<AutomationRecord> {
        let definition_json = node
            .properties
            .iter()
            .find(|p| p.field_id == sys.definition_field)
            .and_then(|p| p.values.first())
            .ok_or_else(|| Error::Definition("missing definition property".to_string()))?;
        let definition = AutomationDefinition::from_json(definition_json)?;

        let state = node
            .properties
            .iter()
            .find(|p| p.field_id == sys.state_field)
            .and_then(|p| p.values.first())
            .map(|json| AutomationState::from_json(json))
            .transpose()?
            .unwrap_or_default();

        Ok(AutomationRecord {
            id: node.id,
            definition,
            state,
        })
    }

    /// Register the live hook for an enabled automation.
    async fn activate(
        inner: &Arc<Inner>,
        id: Uuid,
        definition: AutomationDefinition,
        state: AutomationState,
    ) -> Result<()> {
        if inner
            .active
            .lock()
            .expect("active map lock poisoned")
            .contains_key(&id)
        {
            return Ok(());
        }

        match definition.trigger.clone() {
            Trigger::QueryMembership { query, .. } => {
                let weak = Arc::downgrade(inner);
                let handle = inner
                    .subscriptions
                    .subscribe(
                        query,
                        change_callback_fn(move |event| {
                            let weak: Weak<Inner> = weak.clone();
                            async move {
                                if let Some(inner) = weak.upgrade() {
                                    inner.handle_query_change(id, event).await;
                                }
                                Ok(())
                            }
                        }),
                    )
                    .await?;
                inner.active.lock().expect("active map lock poisoned").insert(
                    id,
                    ActiveAutomation {
                        definition,
                        hook: LiveHook::Membership(handle),
                        threshold_crossed: state.threshold_crossed,
                        previous_value: None,
                    },
                );
            }
            Trigger::Threshold {
                computed_field_id,
                condition,
                fire_once,
            } => {
                let current = inner.computed.get_value(computed_field_id).await?;
                let mut crossed = state.threshold_crossed;
                // Already past the threshold at startup: arm without firing
                // so a restart never replays an old crossing.
                if fire_once && !crossed {
                    if let Some(value) = current {
                        if condition.holds(value) {
                            crossed = true;
                            inner
                                .persist_state(id, AutomationState { threshold_crossed: true })
                                .await;
                        }
                    }
                }

                let weak = Arc::downgrade(inner);
                let listener_id = inner.computed.on_value_change(
                    computed_field_id,
                    computed_listener_fn(move |change| {
                        let weak: Weak<Inner> = weak.clone();
                        async move {
                            if let Some(inner) = weak.upgrade() {
                                inner.handle_threshold_change(id, change).await;
                            }
                            Ok(())
                        }
                    }),
                );
                inner.active.lock().expect("active map lock poisoned").insert(
                    id,
                    ActiveAutomation {
                        definition,
                        hook: LiveHook::Threshold { listener_id },
                        threshold_crossed: crossed,
                        previous_value: current,
                    },
                );
            }
        }
        debug!(automation_id = %id, "Automation activated");
        Ok(())
    }

    /// Remove the live hook, leaving the node persisted.
    fn deactivate(&self, id: Uuid) {
        let removed = self
            .active
            .lock()
            .expect("active map lock poisoned")
            .remove(&id);
        match removed {
            Some(auto) => {
                match auto.hook {
                    LiveHook::Membership(handle) => {
                        handle.unsubscribe();
                    }
                    LiveHook::Threshold { listener_id } => {
                        self.computed.remove_listener(listener_id);
                    }
                }
                debug!(automation_id = %id, "Automation deactivated");
            }
            None => {}
        }
    }

    async fn handle_query_change(&self, automation_id: Uuid, event: QueryResultChangeEvent) {
        let (definition, membership_event) = {
            let active = self.active.lock().expect("active map lock poisoned");
            let Some(auto) = active.get(&automation_id) else {
                return;
            };
            let Trigger::QueryMembership { event, .. } = &auto.definition.trigger else {
                return;
            };
            (auto.definition.clone(), *event)
        };

        let targets: Vec<AssembledNode> = match membership_event {
            MembershipEvent::OnEnter => event.added,
            MembershipEvent::OnExit => event.removed,
            MembershipEvent::OnChange => event.changed,
        };
        if targets.is_empty() {
            return;
        }
        debug!(
            automation_id = %automation_id,
            target_count = targets.len(),
            "Membership trigger fired"
        );

        let is_root = chain::begin_firing(&self.chain, automation_id);
        for node in &targets {
            self.execute_action(automation_id, &definition, Some(node), None)
                .await;
        }
        chain::end_firing(&self.chain, is_root);
    }

    async fn handle_threshold_change(&self, automation_id: Uuid, change: ComputedFieldChange) {
        let (definition, condition, fire_once, crossed) = {
            let mut active = self.active.lock().expect("active map lock poisoned");
            let Some(auto) = active.get_mut(&automation_id) else {
                return;
            };
            let Trigger::Threshold {
                condition,
                fire_once,
                ..
            } = &auto.definition.trigger
            else {
                return;
            };
            let (condition, fire_once) = (*condition, *fire_once);
            auto.previous_value = Some(change.current);
            (auto.definition.clone(), condition, fire_once, auto.threshold_crossed)
        };

        let held_before = change.previous.map(|p| condition.holds(p)).unwrap_or(false);
        let holds_now = condition.holds(change.current);

        if holds_now && !held_before {
            if fire_once && crossed {
                debug!(
                    automation_id = %automation_id,
                    "Threshold already crossed; fire_once suppresses re-fire"
                );
                return;
            }
            if fire_once {
                self.set_crossed(automation_id, true).await;
            }
            let is_root = chain::begin_firing(&self.chain, automation_id);
            self.execute_action(
                automation_id,
                &definition,
                None,
                Some((change.field_id, change.current)),
            )
            .await;
            chain::end_firing(&self.chain, is_root);
        } else if !holds_now && crossed {
            // Condition released: re-arm future fires.
            self.set_crossed(automation_id, false).await;
        }
    }

    /// Update the runtime crossed flag and persist it best-effort.
    async fn set_crossed(&self, automation_id: Uuid, crossed: bool) {
        {
            let mut active = self.active.lock().expect("active map lock poisoned");
            if let Some(auto) = active.get_mut(&automation_id) {
                auto.threshold_crossed = crossed;
            }
        }
        self.persist_state(
            automation_id,
            AutomationState {
                threshold_crossed: crossed,
            },
        )
        .await;
    }

    async fn persist_state(&self, automation_id: Uuid, state: AutomationState) {
        let result = async {
            let sys = self.system_ids().await?;
            self.repo
                .set_property(automation_id, sys.state_field, vec![state.to_json()?])
                .await
        }
        .await;
        if let Err(e) = result {
            warn!(automation_id = %automation_id, error = %e, "Failed to persist automation state");
        }
    }

    async fn persist_definition(
        &self,
        automation_id: Uuid,
        definition: &AutomationDefinition,
    ) -> Result<()> {
        let sys = self.system_ids().await?;
        self.repo
            .set_property(
                automation_id,
                sys.definition_field,
                vec![definition.to_json()?],
            )
            .await
    }

    /// Run one action through the execution chain's cycle and depth checks.
    async fn execute_action(
        &self,
        automation_id: Uuid,
        definition: &AutomationDefinition,
        node: Option<&AssembledNode>,
        computed: Option<(Uuid, f64)>,
    ) {
        match chain::enter_action(&self.chain, node.map(|n| n.id)) {
            ChainEntry::DepthExceeded => {
                warn!(
                    automation_id = %automation_id,
                    "Max execution chain depth exceeded; aborting action"
                );
                return;
            }
            ChainEntry::CycleDetected => {
                warn!(
                    automation_id = %automation_id,
                    node_id = ?node.map(|n| n.id),
                    "Execution cycle detected; aborting action"
                );
                return;
            }
            ChainEntry::Entered => {}
        }

        if let Err(e) = self.run_action(automation_id, definition, node, computed).await {
            warn!(automation_id = %automation_id, error = %e, "Automation action failed");
        }
        if node.is_some() {
            self.touch_last_fired(automation_id).await;
        }
        chain::exit_action(&self.chain);
    }

    async fn run_action(
        &self,
        automation_id: Uuid,
        definition: &AutomationDefinition,
        node: Option<&AssembledNode>,
        computed: Option<(Uuid, f64)>,
    ) -> Result<()> {
        match &definition.action {
            AutomationAction::SetProperty { field_id, value } => {
                let Some(node) = node else {
                    warn!(
                        automation_id = %automation_id,
                        "set_property action has no target node; skipping"
                    );
                    return Ok(());
                };
                let value = if value == NOW_MARKER {
                    Utc::now().to_rfc3339()
                } else {
                    value.clone()
                };
                self.repo.set_property(node.id, *field_id, vec![value]).await
            }
            AutomationAction::AddSupertag { supertag_id } => {
                let Some(node) = node else {
                    warn!(
                        automation_id = %automation_id,
                        "add_supertag action has no target node; skipping"
                    );
                    return Ok(());
                };
                self.repo.add_supertag(node.id, *supertag_id).await
            }
            AutomationAction::RemoveSupertag { supertag_id } => {
                let Some(node) = node else {
                    warn!(
                        automation_id = %automation_id,
                        "remove_supertag action has no target node; skipping"
                    );
                    return Ok(());
                };
                self.repo.remove_supertag(node.id, *supertag_id).await
            }
            AutomationAction::Webhook(action) => {
                let mut context = WebhookContext::new(automation_id, definition.name.clone());
                if let Some(node) = node {
                    context = context.with_node(node.clone());
                }
                if let Some((field_id, value)) = computed {
                    context = context.with_computed_field(field_id, value);
                }
                let job_id = self.webhooks.enqueue(automation_id, action.clone(), context);
                debug!(automation_id = %automation_id, job_id = %job_id, "Webhook job enqueued");
                self.webhooks.kick();
                Ok(())
            }
        }
    }

    /// Best-effort last-fired bookkeeping; never fails the firing.
    async fn touch_last_fired(&self, automation_id: Uuid) {
        let result = async {
            let sys = self.system_ids().await?;
            self.repo
                .set_property(
                    automation_id,
                    sys.last_fired_field,
                    vec![Utc::now().to_rfc3339()],
                )
                .await
        }
        .await;
        if let Err(e) = result {
            warn!(automation_id = %automation_id, error = %e, "Failed to update last-fired timestamp");
        }
    }
}
