use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_config::{services, ConfigTree};
use keel_domain::{ComponentName, ComponentState, ComponentType, DependencyDecl};
use keel_lifecycle::{
    spawn_driver, Clock, DepsWaiter, DriverConfig, LifecycleHandle, ScriptRunner,
};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::graph::DependencyGraph;

/// Owns the component set and the dependency DAG; creates and exclusively
/// owns every component's lifecycle driver; propagates dependency state.
pub struct Scheduler<C: Clock> {
    tree: ConfigTree,
    runner: ScriptRunner,
    clock: C,
    driver_config: DriverConfig,
    inner: Arc<Inner>,
}

struct Inner {
    graph: RwLock<DependencyGraph>,
    components: RwLock<BTreeMap<ComponentName, Arc<LifecycleHandle>>>,
    /// Fired on every component state change; dependency waiters re-check.
    state_changed: Notify,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(tree: ConfigTree, runner: ScriptRunner, clock: C, driver_config: DriverConfig) -> Self {
        Scheduler {
            tree,
            runner,
            clock,
            driver_config,
            inner: Arc::new(Inner {
                graph: RwLock::new(DependencyGraph::new()),
                components: RwLock::new(BTreeMap::new()),
                state_changed: Notify::new(),
            }),
        }
    }

    // ── Component set ─────────────────────────────────────────────────────────

    /// Create the component's lifecycle driver on first appearance;
    /// subsequent calls return the existing handle.
    pub fn add_component(&self, name: &ComponentName) -> Arc<LifecycleHandle> {
        if let Some(handle) = self.inner.components.read().get(name) {
            return handle.clone();
        }
        let mut components = self.inner.components.write();
        if let Some(handle) = components.get(name) {
            return handle.clone();
        }
        info!(component = %name, "creating lifecycle driver");
        self.inner.graph.write().add_component(name.clone());
        let deps: Arc<dyn DepsWaiter> = Arc::new(GraphDeps {
            inner: self.inner.clone(),
        });
        let handle = Arc::new(spawn_driver(
            name.clone(),
            self.tree.clone(),
            self.runner.clone(),
            deps,
            self.clock.clone(),
            self.driver_config.clone(),
        ));
        components.insert(name.clone(), handle.clone());
        drop(components);
        self.spawn_monitor(handle.clone());
        handle
    }

    /// Look up an existing component; unknown names are a caller error.
    pub fn locate(&self, name: &ComponentName) -> Result<Arc<LifecycleHandle>, SchedulerError> {
        self.inner
            .components
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::ServiceNotFound(name.clone()))
    }

    pub fn component_names(&self) -> Vec<ComponentName> {
        self.inner.components.read().keys().cloned().collect()
    }

    pub fn component_states(&self) -> BTreeMap<ComponentName, ComponentState> {
        self.inner
            .components
            .read()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.state()))
            .collect()
    }

    /// Stop and remove a component after a deployment dropped it. Waits for
    /// a closable state up to `timeout`, then aborts the driver regardless.
    pub async fn remove_component(&self, name: &ComponentName, timeout: Duration) {
        let handle = match self.locate(name) {
            Ok(h) => h,
            Err(_) => return,
        };
        info!(component = %name, "removing component");
        handle.request_stop();
        let closed =
            tokio::time::timeout(timeout, handle.wait_for(|s| s.is_closable())).await;
        if closed.is_err() {
            warn!(component = %name, "component did not close in time; aborting driver");
        }
        handle.abort();
        self.inner.components.write().remove(name);
        self.inner.graph.write().remove_component(name);
        self.inner.state_changed.notify_waiters();
    }

    // ── Dependency graph ──────────────────────────────────────────────────────

    pub fn add_or_update_edge(
        &self,
        dependent: &ComponentName,
        dependency: &ComponentName,
        decl: DependencyDecl,
    ) -> Result<(), SchedulerError> {
        self.inner
            .graph
            .write()
            .add_or_update_edge(dependent, dependency, decl)
    }

    pub fn set_dependencies(
        &self,
        dependent: &ComponentName,
        deps: BTreeMap<ComponentName, DependencyDecl>,
    ) -> Result<(), SchedulerError> {
        self.inner.graph.write().set_dependencies(dependent, deps)
    }

    pub fn ordered_dependencies(&self) -> Vec<ComponentName> {
        let components = self.inner.components.read();
        self.inner
            .graph
            .read()
            .ordered_dependencies()
            .into_iter()
            .filter(|name| components.contains_key(name))
            .collect()
    }

    pub fn dependency_closure(&self, name: &ComponentName) -> BTreeSet<ComponentName> {
        self.inner.graph.read().dependency_closure(name)
    }

    // ── Fleet-wide sequencing ─────────────────────────────────────────────────

    /// Request a start on every component, leaves first. The dependency
    /// gates inside each driver enforce the actual ordering.
    pub fn start_all(&self) {
        for name in self.ordered_dependencies() {
            if let Ok(handle) = self.locate(&name) {
                handle.request_start();
            }
        }
    }

    /// Shut everything down in reverse start order, honoring each
    /// component's shutdown timeout, until every GenericExternal component
    /// is closable.
    pub async fn stop_all(&self, per_component_timeout: Duration) {
        let mut order = self.ordered_dependencies();
        order.reverse();
        for name in order {
            let Ok(handle) = self.locate(&name) else { continue };
            if handle.state().is_closable() {
                continue;
            }
            handle.request_stop();
            let closed = tokio::time::timeout(
                per_component_timeout,
                handle.wait_for(|s| s.is_closable()),
            )
            .await;
            if closed.is_err() && self.component_type(&name) == ComponentType::GenericExternal {
                warn!(component = %name, "shutdown timeout; component left non-closable");
            }
        }
    }

    fn component_type(&self, name: &ComponentName) -> ComponentType {
        self.tree
            .read(&services::component_type_path(name))
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    // ── Dependency state propagation ──────────────────────────────────────────

    /// One monitor task per component: wakes dependency waiters on every
    /// state change and turns a HARD dependency failure into a restart of
    /// its dependents. Ends when the driver task does.
    fn spawn_monitor(&self, handle: Arc<LifecycleHandle>) {
        let inner = self.inner.clone();
        let name = handle.name().clone();
        let mut rx = handle.watch();
        tokio::spawn(async move {
            loop {
                let state = *rx.borrow();
                inner.state_changed.notify_waiters();
                if matches!(state, ComponentState::Errored | ComponentState::Broken) {
                    propagate_failure(&inner, &name);
                }
                if rx.changed().await.is_err() {
                    inner.state_changed.notify_waiters();
                    break;
                }
            }
            debug!(component = %name, "state monitor ended");
        });
    }
}

/// Restart every running dependent connected through a HARD edge.
fn propagate_failure(inner: &Inner, failed: &ComponentName) {
    let dependents = inner.graph.read().dependents_of(failed);
    let components = inner.components.read();
    for dependent in dependents {
        let is_hard = inner
            .graph
            .read()
            .hard_dependencies_of(&dependent)
            .iter()
            .any(|(dep, _)| dep == failed);
        if !is_hard {
            continue;
        }
        if let Some(handle) = components.get(&dependent) {
            if matches!(
                handle.state(),
                ComponentState::Starting | ComponentState::Running
            ) {
                info!(component = %dependent, dependency = %failed,
                      "hard dependency failed; restarting dependent");
                handle.request_restart();
            }
        }
    }
}

// ── DepsWaiter wired to the graph ─────────────────────────────────────────────

struct GraphDeps {
    inner: Arc<Inner>,
}

impl GraphDeps {
    fn ready(&self, name: &ComponentName) -> bool {
        let hard = self.inner.graph.read().hard_dependencies_of(name);
        let components = self.inner.components.read();
        hard.iter().all(|(dep, start_when)| {
            components
                .get(dep)
                .map(|h| h.state().satisfies(*start_when))
                .unwrap_or(false)
        })
    }
}

#[async_trait]
impl DepsWaiter for GraphDeps {
    async fn wait_ready(&self, name: &ComponentName) {
        loop {
            let notified = self.inner.state_changed.notified();
            if self.ready(name) {
                return;
            }
            notified.await;
        }
    }

    fn is_ready(&self, name: &ComponentName) -> bool {
        self.ready(name)
    }
}
