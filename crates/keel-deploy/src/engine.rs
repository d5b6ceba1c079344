use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_bootstrap::{is_bootstrap_required, launch_dir_id, BootstrapTaskList, LaunchDirs};
use keel_config::{services, ConfigTree, TopicPath};
use keel_domain::{
    ComponentId, ComponentName, ComponentState, DependencyDecl, DeploymentDoc, DeploymentId,
    DeploymentResult, FailureHandlingPolicy, PlatformSelector, ResolvedComponent, TimestampMs,
    UpdateAction,
};
use keel_lifecycle::Clock;
use keel_scheduler::Scheduler;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DeployError;
use crate::events::{DeploymentEvent, EventLog};
use crate::ipc::{ComponentIpc, PreUpdateReply, ValidationReply};
use crate::store::PackageStore;

pub const BOOTSTRAP_TASKS_FILE: &str = "bootstrap_tasks.json";
pub const PENDING_DEPLOYMENT_FILE: &str = "pending_deployment.json";

/// Requests the merge engine raises to whatever supervises the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelSignal {
    RestartRequired,
    RebootRequired,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a merge may wait for the new component set to settle.
    pub convergence_timeout: Duration,
    /// Per-component stop timeout when a deployment removes a component.
    pub remove_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            convergence_timeout: Duration::from_secs(120),
            remove_timeout: Duration::from_secs(15),
        }
    }
}

/// The deployment persisted across a bootstrap restart, reloaded by the
/// kernel to finish activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDeployment {
    pub doc: DeploymentDoc,
    pub target: BTreeMap<ComponentName, ResolvedComponent>,
}

/// Caller-side handle to an enqueued deployment. Dropping it does not
/// cancel; cancellation is explicit and never produces a result.
pub struct DeploymentHandle {
    deployment_id: DeploymentId,
    result: oneshot::Receiver<DeploymentResult>,
    cancel: CancellationToken,
}

impl DeploymentHandle {
    pub fn id(&self) -> &DeploymentId {
        &self.deployment_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves with the deployment result, or None when the deployment
    /// was cancelled or handed over to a supervisor restart.
    pub async fn result(self) -> Option<DeploymentResult> {
        self.result.await.ok()
    }
}

struct Job {
    doc: DeploymentDoc,
    result: oneshot::Sender<DeploymentResult>,
    cancel: CancellationToken,
}

/// Accepts deployment documents and drives them through resolution,
/// validation, the disruption handshake, the bootstrap decision, the
/// transactional merge and convergence, with rollback on failure.
pub struct MergeEngine<C: Clock> {
    tree: ConfigTree,
    scheduler: Arc<Scheduler<C>>,
    packages: Arc<dyn PackageStore>,
    ipc: Arc<dyn ComponentIpc>,
    events: EventLog,
    config: EngineConfig,
    alts: LaunchDirs,
    root_dir: PathBuf,
    last_applied: Mutex<BTreeMap<String, TimestampMs>>,
    queue: mpsc::UnboundedSender<Job>,
    signals: mpsc::UnboundedSender<KernelSignal>,
}

impl<C: Clock> MergeEngine<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: ConfigTree,
        scheduler: Arc<Scheduler<C>>,
        packages: Arc<dyn PackageStore>,
        ipc: Arc<dyn ComponentIpc>,
        events: EventLog,
        config: EngineConfig,
        alts: LaunchDirs,
        root_dir: PathBuf,
        signals: mpsc::UnboundedSender<KernelSignal>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MergeEngine {
            tree,
            scheduler,
            packages,
            ipc,
            events,
            config,
            alts,
            root_dir,
            last_applied: Mutex::new(BTreeMap::new()),
            queue: tx,
            signals,
        });
        tokio::spawn(Self::worker(engine.clone(), rx));
        engine
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Enqueue a deployment. Deployments are processed one at a time in
    /// arrival order; the handle resolves when this one completes.
    pub fn deploy(&self, doc: DeploymentDoc) -> DeploymentHandle {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let deployment_id = doc.deployment_id.clone();
        let _ = self.queue.send(Job {
            doc,
            result: tx,
            cancel: cancel.clone(),
        });
        DeploymentHandle {
            deployment_id,
            result: rx,
            cancel,
        }
    }

    async fn worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            let deployment_id = job.doc.deployment_id.clone();
            let cancelled = job.cancel.clone();
            tokio::select! {
                outcome = self.process(job.doc) => {
                    match outcome {
                        Some(result) => {
                            self.events.emit(DeploymentEvent::DeploymentCompleted {
                                id: Uuid::new_v4(),
                                at: Utc::now(),
                                deployment_id,
                                result: result.to_string(),
                            });
                            let _ = job.result.send(result);
                        }
                        // handed over to a supervisor restart: no result
                        None => drop(job.result),
                    }
                }
                _ = cancelled.cancelled() => {
                    // abort every await; in-flight lifecycles stay owned by
                    // the scheduler; no result is ever written
                    info!(deployment_id = %deployment_id, "deployment cancelled");
                    drop(job.result);
                }
            }
        }
    }

    // ── The merge pipeline ────────────────────────────────────────────────────

    async fn process(&self, doc: DeploymentDoc) -> Option<DeploymentResult> {
        let deployment_id = doc.deployment_id.clone();
        info!(deployment_id = %deployment_id, group = %doc.group_name, "processing deployment");

        // 1. stale check, then record acceptance so older documents for
        //    this group are dropped even if this one later fails
        {
            let mut last = self.last_applied.lock();
            if let Some(&prev) = last.get(&doc.group_name) {
                if doc.timestamp <= prev {
                    let cause = format!(
                        "stale deployment: timestamp {} not newer than {}",
                        doc.timestamp, prev
                    );
                    drop(last);
                    self.events.emit(DeploymentEvent::DeploymentRejected {
                        id: Uuid::new_v4(),
                        at: Utc::now(),
                        deployment_id,
                        cause: cause.clone(),
                    });
                    return Some(DeploymentResult::Rejected { cause });
                }
            }
            last.insert(doc.group_name.clone(), doc.timestamp);
        }
        self.events.emit(DeploymentEvent::DeploymentAccepted {
            id: Uuid::new_v4(),
            at: Utc::now(),
            deployment_id: deployment_id.clone(),
            group_name: doc.group_name.clone(),
        });

        // 2. resolve roots and the transitive closure
        let roots: Vec<ComponentId> = doc
            .packages
            .iter()
            .map(|(name, spec)| ComponentId::new(name.as_str(), &spec.version))
            .collect();
        let recipes = match self.packages.resolve_transitive_closure(&roots).await {
            Ok(recipes) => recipes,
            Err(e) => {
                return Some(self.no_state_change(
                    &deployment_id,
                    format!("dependency resolution failed: {}", e),
                ))
            }
        };
        let all_ids: Vec<ComponentId> = recipes
            .iter()
            .map(|r| ComponentId::new(r.name.as_str(), &r.version))
            .collect();
        if let Err(e) = self.packages.prepare(&all_ids).await {
            return Some(
                self.no_state_change(&deployment_id, format!("artifact preparation failed: {}", e)),
            );
        }

        // 3. compute the target configuration
        let host = PlatformSelector::host();
        let mut target: BTreeMap<ComponentName, ResolvedComponent> = BTreeMap::new();
        for recipe in &recipes {
            if let Err(e) = recipe.validate() {
                return Some(self.no_state_change(&deployment_id, e.to_string()));
            }
            if !recipe.supports(&host) {
                return Some(self.no_state_change(
                    &deployment_id,
                    format!(
                        "component '{}@{}' supports no {}-{} platform",
                        recipe.name,
                        recipe.version,
                        std::env::consts::OS,
                        std::env::consts::ARCH
                    ),
                ));
            }
            let empty = BTreeMap::new();
            let overrides = doc
                .packages
                .get(&recipe.name)
                .map(|p| &p.parameters)
                .unwrap_or(&empty);
            target.insert(recipe.name.clone(), recipe.resolve(overrides));
        }

        let pre_names: BTreeSet<ComponentName> =
            services::list_services(&self.tree).into_iter().collect();
        let removed = self.removed_components(&pre_names, &target);
        let changes: BTreeMap<ComponentName, ChangeKind> = target
            .iter()
            .map(|(name, resolved)| (name.clone(), self.classify(name, resolved)))
            .collect();

        // 4. dynamic validation with running components
        let validation_timeout =
            Duration::from_secs(doc.configuration_validation_policy.timeout_in_seconds);
        for (name, resolved) in &target {
            if changes.get(name) != Some(&ChangeKind::ParamsOnly) || !self.is_running(name) {
                continue;
            }
            let proposed = parameters_value(&resolved.parameters);
            let reply = tokio::time::timeout(
                validation_timeout,
                self.ipc
                    .validate_configuration(name, &proposed, validation_timeout),
            )
            .await;
            match reply {
                Ok(ValidationReply::Accepted) => {}
                Ok(ValidationReply::Rejected(reason)) => {
                    self.events.emit(DeploymentEvent::ValidationRejected {
                        id: Uuid::new_v4(),
                        at: Utc::now(),
                        deployment_id: deployment_id.clone(),
                        component: name.clone(),
                        reason: reason.clone(),
                    });
                    return Some(self.no_state_change(
                        &deployment_id,
                        format!("configuration validation for '{}' rejected: {}", name, reason),
                    ));
                }
                Err(_) => {
                    return Some(self.no_state_change(
                        &deployment_id,
                        format!("configuration validation for '{}' timed out", name),
                    ));
                }
            }
        }

        // 5. update-disruption handshake with components about to restart
        if doc.component_update_policy.action == UpdateAction::NotifyComponents {
            let policy_timeout =
                Duration::from_secs(doc.component_update_policy.timeout_in_seconds);
            let disruptive: Vec<ComponentName> = target
                .keys()
                .filter(|name| {
                    matches!(
                        changes.get(*name),
                        Some(ChangeKind::VersionChanged) | Some(ChangeKind::LifecycleChanged)
                    )
                })
                .cloned()
                .chain(removed.iter().cloned())
                .filter(|name| self.is_running(name))
                .collect();
            for name in disruptive {
                self.await_update_consent(&deployment_id, &name, policy_timeout)
                    .await;
            }
        }

        // 6. bootstrap decision
        let requires_bootstrap =
            match is_bootstrap_required(&self.tree, &target, &BTreeSet::new()) {
                Ok(required) => required,
                Err(e) => return Some(self.no_state_change(&deployment_id, e.to_string())),
            };
        if requires_bootstrap {
            return match self.prepare_bootstrap(&doc, &target).await {
                Ok(()) => {
                    let _ = self.signals.send(KernelSignal::RestartRequired);
                    None
                }
                // persisting the plan failed: nothing was merged
                Err(e) => Some(self.no_state_change(&deployment_id, e.to_string())),
            };
        }

        // 7. in-process merge + convergence
        let pre_snapshot = match self.tree.snapshot_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return Some(self.no_state_change(&deployment_id, e.to_string())),
        };
        match self
            .apply_and_converge(&deployment_id, &doc, &target, &removed, &changes)
            .await
        {
            Ok(()) => Some(DeploymentResult::Successful),
            Err(cause) => {
                // 8. rollback per policy
                let result = match doc.failure_handling_policy {
                    FailureHandlingPolicy::DoNothing => DeploymentResult::FailedRollbackNotRequested {
                        cause: cause.clone(),
                    },
                    FailureHandlingPolicy::Rollback => {
                        self.rollback(&deployment_id, &pre_snapshot, &pre_names, &cause)
                            .await
                    }
                };
                Some(result)
            }
        }
    }

    /// Merge the target into the tree as one timestamped batch, line up
    /// the scheduler, issue intents and wait for the new set to settle.
    async fn apply_and_converge(
        &self,
        deployment_id: &DeploymentId,
        doc: &DeploymentDoc,
        target: &BTreeMap<ComponentName, ResolvedComponent>,
        removed: &[ComponentName],
        changes: &BTreeMap<ComponentName, ChangeKind>,
    ) -> Result<(), String> {
        // stop dropped components before their config disappears
        for name in removed {
            self.scheduler
                .remove_component(name, self.config.remove_timeout)
                .await;
        }

        let (writes, removes) = self.target_mutations(target, removed);
        self.tree
            .merge_batch(writes, removes, doc.timestamp)
            .map_err(|e| e.to_string())?;
        self.events.emit(DeploymentEvent::MergeApplied {
            id: Uuid::new_v4(),
            at: Utc::now(),
            deployment_id: deployment_id.clone(),
            components: target.len(),
            removed: removed.len(),
        });

        // components and edges, dependencies first
        for name in target_topo_order(target) {
            let resolved = &target[&name];
            self.scheduler.add_component(&name);
            self.scheduler
                .set_dependencies(&name, resolved.dependencies.clone())
                .map_err(|e| e.to_string())?;
        }

        // goals: components told to move must be observed moving before a
        // still-current state counts as converged
        let mut goals: BTreeMap<ComponentName, u64> = BTreeMap::new();
        for (name, kind) in changes {
            let handle = self.scheduler.locate(name).map_err(|e| e.to_string())?;
            // the floor is read before the intent posts, or the observed
            // transitions could already be behind us
            let floor = handle.seq() + 1;
            let moved = match kind {
                ChangeKind::New => {
                    handle.request_start();
                    false
                }
                ChangeKind::VersionChanged => {
                    handle.request_reinstall();
                    true
                }
                // restart picks the new lifecycle/parameters up from the tree
                ChangeKind::LifecycleChanged | ChangeKind::ParamsOnly => {
                    handle.request_restart();
                    true
                }
                ChangeKind::Unchanged => {
                    if handle.state() == ComponentState::New {
                        handle.request_start();
                    }
                    false
                }
            };
            goals.insert(name.clone(), if moved { floor } else { 0 });
        }

        self.wait_converged_with(deployment_id, &goals).await
    }

    /// Wait until every named component reaches its settle state
    /// (Running, or Finished for run-to-completion components). A Broken
    /// component fails convergence immediately.
    pub(crate) async fn wait_converged<'a>(
        &self,
        deployment_id: &DeploymentId,
        names: impl Iterator<Item = &'a ComponentName>,
    ) -> Result<(), String> {
        let goals = names.map(|n| (n.clone(), 0)).collect();
        self.wait_converged_with(deployment_id, &goals).await
    }

    /// Convergence with per-component transition floors: a component whose
    /// goal is non-zero must transition at least that far before its state
    /// counts, so a just-issued restart is not mistaken for already-done.
    async fn wait_converged_with(
        &self,
        deployment_id: &DeploymentId,
        goals: &BTreeMap<ComponentName, u64>,
    ) -> Result<(), String> {
        let deadline = tokio::time::Instant::now() + self.config.convergence_timeout;
        let names: Vec<&ComponentName> = goals.keys().collect();
        for name in &names {
            let handle = self.scheduler.locate(name).map_err(|e| e.to_string())?;
            let min_seq = goals.get(*name).copied().unwrap_or(0);
            let settled = tokio::time::timeout_at(
                deadline,
                handle.wait_for_after(min_seq, |s| {
                    matches!(
                        s,
                        ComponentState::Running | ComponentState::Finished | ComponentState::Broken
                    )
                }),
            )
            .await;
            match settled {
                Err(_) => return Err(format!("timed out waiting for '{}' to settle", name)),
                Ok(None) => return Err(format!("lifecycle driver for '{}' ended", name)),
                Ok(Some(ComponentState::Broken)) => {
                    self.events.emit(DeploymentEvent::ComponentBroken {
                        id: Uuid::new_v4(),
                        at: Utc::now(),
                        deployment_id: deployment_id.clone(),
                        component: (*name).clone(),
                    });
                    return Err(format!("component '{}' is broken", name));
                }
                Ok(Some(_)) => {}
            }
        }
        // a component may have broken while we waited on its peers
        for name in &names {
            if let Ok(handle) = self.scheduler.locate(name) {
                if handle.state().is_broken() {
                    self.events.emit(DeploymentEvent::ComponentBroken {
                        id: Uuid::new_v4(),
                        at: Utc::now(),
                        deployment_id: deployment_id.clone(),
                        component: (*name).clone(),
                    });
                    return Err(format!("component '{}' is broken", name));
                }
            }
        }
        Ok(())
    }

    /// Restore the pre-merge snapshot and converge back to it.
    async fn rollback(
        &self,
        deployment_id: &DeploymentId,
        pre_snapshot: &[u8],
        pre_names: &BTreeSet<ComponentName>,
        cause: &str,
    ) -> DeploymentResult {
        self.events.emit(DeploymentEvent::RollbackStarted {
            id: Uuid::new_v4(),
            at: Utc::now(),
            deployment_id: deployment_id.clone(),
            cause: cause.to_string(),
        });

        if let Err(e) = self.tree.restore_bytes(pre_snapshot) {
            return DeploymentResult::FailedRollbackNotRequested {
                cause: format!("{}; snapshot restore failed: {}", cause, e),
            };
        }

        // drop components the failed merge introduced
        for name in self.scheduler.component_names() {
            if !pre_names.contains(&name) {
                self.scheduler
                    .remove_component(&name, self.config.remove_timeout)
                    .await;
            }
        }

        // revive the previous set from the restored tree
        let mut goals: BTreeMap<ComponentName, u64> = BTreeMap::new();
        for name in pre_names {
            // a component broken during the failed merge needs a fresh driver
            if let Ok(handle) = self.scheduler.locate(name) {
                if handle.state().is_broken() {
                    self.scheduler
                        .remove_component(name, self.config.remove_timeout)
                        .await;
                }
            }
            self.scheduler.add_component(name);
            if let Some(deps) = self.dependencies_from_tree(name) {
                if let Err(e) = self.scheduler.set_dependencies(name, deps) {
                    warn!(component = %name, error = %e, "rollback dependency wiring failed");
                }
            }
            if let Ok(handle) = self.scheduler.locate(name) {
                let min_seq = match handle.state() {
                    // reverted config must be picked up from scratch
                    ComponentState::New => {
                        handle.request_start();
                        0
                    }
                    ComponentState::Errored => {
                        handle.request_reinstall();
                        0
                    }
                    _ => {
                        let floor = handle.seq() + 1;
                        handle.request_restart();
                        floor
                    }
                };
                goals.insert(name.clone(), min_seq);
            }
        }

        match self.wait_converged_with(deployment_id, &goals).await {
            Ok(()) => DeploymentResult::FailedRollbackComplete {
                cause: cause.to_string(),
            },
            Err(rollback_cause) => DeploymentResult::FailedRollbackNotRequested {
                cause: format!("{}; rollback did not converge: {}", cause, rollback_cause),
            },
        }
    }

    // ── Bootstrap hand-off ────────────────────────────────────────────────────

    /// Persist the bootstrap task list and the pending deployment, snapshot
    /// the target config into a fresh launch directory and flip `current`.
    /// The caller requests the supervisor restart.
    async fn prepare_bootstrap(
        &self,
        doc: &DeploymentDoc,
        target: &BTreeMap<ComponentName, ResolvedComponent>,
    ) -> Result<(), DeployError> {
        // target config snapshot, computed against a scratch tree so the
        // live tree stays untouched until after the restart
        let scratch = ConfigTree::new();
        scratch.restore_bytes(&self.tree.snapshot_bytes()?)?;
        let removed = self.removed_components(
            &services::list_services(&scratch).into_iter().collect(),
            target,
        );
        let (writes, removes) = self.target_mutations(target, &removed);
        scratch.merge_batch(writes, removes, doc.timestamp)?;
        let snapshot = scratch.snapshot_bytes()?;

        // ordered task list: every target component declaring bootstrap
        let tasks: Vec<ComponentName> = target_topo_order(target)
            .into_iter()
            .filter(|name| target[name].lifecycle.bootstrap.is_some())
            .collect();
        let task_count = tasks.len();
        let list = BootstrapTaskList::new(self.root_dir.join(BOOTSTRAP_TASKS_FILE), tasks);
        list.persist()?;

        let pending = PendingDeployment {
            doc: doc.clone(),
            target: target.clone(),
        };
        let pending_bytes = serde_json::to_vec_pretty(&pending)
            .map_err(|e| DeployError::Internal(e.to_string()))?;
        keel_config::write_atomically(
            &self.root_dir.join(PENDING_DEPLOYMENT_FILE),
            &pending_bytes,
        )?;

        let id = launch_dir_id(doc.deployment_id.as_str(), &snapshot);
        let new_dir = self.alts.prepare_bootstrap(&id)?;
        std::fs::write(new_dir.join("config.snapshot.json"), &snapshot).map_err(|e| {
            DeployError::Internal(format!("write launch snapshot: {}", e))
        })?;

        self.events.emit(DeploymentEvent::BootstrapPrepared {
            id: Uuid::new_v4(),
            at: Utc::now(),
            deployment_id: doc.deployment_id.clone(),
            tasks: task_count,
        });
        Ok(())
    }

    // ── Disruption handshake ──────────────────────────────────────────────────

    /// Ask one running component whether it may be updated; honor deferrals
    /// up to the policy timeout, then proceed regardless.
    async fn await_update_consent(
        &self,
        deployment_id: &DeploymentId,
        name: &ComponentName,
        policy_timeout: Duration,
    ) {
        let deadline = tokio::time::Instant::now() + policy_timeout;
        loop {
            match self.ipc.pre_component_update(name, policy_timeout).await {
                PreUpdateReply::Proceed => return,
                PreUpdateReply::Deferred(by) => {
                    self.events.emit(DeploymentEvent::UpdateDeferred {
                        id: Uuid::new_v4(),
                        at: Utc::now(),
                        deployment_id: deployment_id.clone(),
                        component: name.clone(),
                        deferred_ms: by.as_millis() as u64,
                    });
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        debug!(component = %name, "deferral window exhausted; proceeding");
                        return;
                    }
                    // re-poll at the deferral, capped by the remaining window
                    let wait = by.min(deadline - now).max(Duration::from_millis(100));
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    // ── Diff helpers ──────────────────────────────────────────────────────────

    fn removed_components(
        &self,
        pre_names: &BTreeSet<ComponentName>,
        target: &BTreeMap<ComponentName, ResolvedComponent>,
    ) -> Vec<ComponentName> {
        pre_names
            .iter()
            .filter(|name| !target.contains_key(*name))
            // the supervisor-self component is never removed by a deployment
            .filter(|name| {
                self.tree
                    .read(&services::component_type_path(name))
                    .and_then(|v| v.as_str().map(|s| s != "nucleus"))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    fn classify(&self, name: &ComponentName, resolved: &ResolvedComponent) -> ChangeKind {
        match services::service_version(&self.tree, name) {
            None => ChangeKind::New,
            Some(version) if version != resolved.version => ChangeKind::VersionChanged,
            Some(_) => {
                let old_lifecycle = self
                    .tree
                    .read(&services::lifecycle_path(name))
                    .unwrap_or(Value::Null);
                let new_lifecycle =
                    serde_json::to_value(&resolved.lifecycle).unwrap_or(Value::Null);
                if old_lifecycle != new_lifecycle {
                    return ChangeKind::LifecycleChanged;
                }
                let old_parameters = services::service_parameters(&self.tree, name);
                if old_parameters != parameters_value(&resolved.parameters) {
                    ChangeKind::ParamsOnly
                } else {
                    ChangeKind::Unchanged
                }
            }
        }
    }

    fn is_running(&self, name: &ComponentName) -> bool {
        self.scheduler
            .locate(name)
            .map(|h| h.state() == ComponentState::Running)
            .unwrap_or(false)
    }

    /// The tree mutations realizing the target: per-service leaves plus
    /// removals for dropped services and dropped parameter keys.
    fn target_mutations(
        &self,
        target: &BTreeMap<ComponentName, ResolvedComponent>,
        removed: &[ComponentName],
    ) -> (Vec<(TopicPath, Value)>, Vec<TopicPath>) {
        let mut writes = Vec::new();
        let mut removes: Vec<TopicPath> =
            removed.iter().map(services::service_root).collect();

        for (name, resolved) in target {
            writes.push((
                services::version_path(name),
                Value::String(resolved.version.clone()),
            ));
            writes.push((
                services::component_type_path(name),
                serde_json::to_value(resolved.component_type).unwrap_or(Value::Null),
            ));
            writes.push((
                services::lifecycle_path(name),
                serde_json::to_value(&resolved.lifecycle).unwrap_or(Value::Null),
            ));
            writes.push((
                services::dependencies_path(name),
                serde_json::to_value(&resolved.dependencies).unwrap_or(Value::Null),
            ));
            for (key, value) in &resolved.parameters {
                writes.push((services::parameter_path(name, key), value.clone()));
            }
            // parameter keys the new config no longer carries
            if let Some(Value::Object(old)) =
                self.tree.subtree(&services::parameters_path(name))
            {
                for key in old.keys() {
                    if !resolved.parameters.contains_key(key) {
                        removes.push(services::parameter_path(name, key));
                    }
                }
            }
        }
        (writes, removes)
    }

    fn dependencies_from_tree(
        &self,
        name: &ComponentName,
    ) -> Option<BTreeMap<ComponentName, DependencyDecl>> {
        self.tree
            .read(&services::dependencies_path(name))
            .and_then(|v| serde_json::from_value(v).ok())
    }

    fn no_state_change(&self, deployment_id: &DeploymentId, cause: String) -> DeploymentResult {
        warn!(deployment_id = %deployment_id, cause = %cause, "deployment failed with no state change");
        DeploymentResult::FailedNoStateChange { cause }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    New,
    VersionChanged,
    LifecycleChanged,
    ParamsOnly,
    Unchanged,
}

/// Topological order restricted to the target set, dependencies first,
/// peers by name.
fn target_topo_order(target: &BTreeMap<ComponentName, ResolvedComponent>) -> Vec<ComponentName> {
    let mut remaining: BTreeMap<ComponentName, BTreeSet<ComponentName>> = target
        .iter()
        .map(|(name, resolved)| {
            let deps = resolved
                .dependencies
                .keys()
                .filter(|d| target.contains_key(*d))
                .cloned()
                .collect();
            (name.clone(), deps)
        })
        .collect();

    let mut order = Vec::with_capacity(remaining.len());
    let mut frontier: BTreeSet<ComponentName> = remaining
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(n, _)| n.clone())
        .collect();
    while let Some(next) = frontier.iter().next().cloned() {
        frontier.remove(&next);
        remaining.remove(&next);
        order.push(next.clone());
        for (node, deps) in remaining.iter_mut() {
            if deps.remove(&next) && deps.is_empty() {
                frontier.insert(node.clone());
            }
        }
    }
    order.extend(remaining.into_keys());
    order
}

fn parameters_value(parameters: &BTreeMap<String, Value>) -> Value {
    Value::Object(parameters.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}
