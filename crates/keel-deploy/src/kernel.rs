use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_bootstrap::{
    determine_deployment_stage, BootstrapOutcome, BootstrapTaskList, DeploymentStage, LaunchDirs,
};
use keel_config::{services, ConfigTree, TreeStore};
use keel_domain::{ComponentName, ComponentState, ComponentType, DeploymentDoc, DeploymentResult};
use keel_lifecycle::{Clock, DriverConfig, ScriptRunner, SystemClock};
use keel_scheduler::Scheduler;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{
    DeploymentHandle, EngineConfig, KernelSignal, MergeEngine, PendingDeployment,
    BOOTSTRAP_TASKS_FILE, PENDING_DEPLOYMENT_FILE,
};
use crate::error::DeployError;
use crate::events::{DeploymentEvent, EventLog};
use crate::ipc::{ComponentIpc, NullIpc};
use crate::store::{DirPackageStore, PackageStore};

/// The supervisor-self component present in every configuration.
pub const MAIN_COMPONENT: &str = "main";

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// The supervisor root; config, launch directories and the bootstrap
    /// task list live underneath.
    pub root_dir: PathBuf,
    pub driver: DriverConfig,
    pub engine: EngineConfig,
    /// Per-component timeout used during full shutdown.
    pub shutdown_timeout: Duration,
}

impl KernelConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        KernelConfig {
            root_dir: root_dir.into(),
            driver: DriverConfig::default(),
            engine: EngineConfig::default(),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

/// The composition root: config tree, scheduler, merge engine and the
/// bootstrap machinery, constructed once at startup and passed by
/// reference — no ambient singletons.
pub struct Kernel<C: Clock> {
    tree: ConfigTree,
    store: TreeStore,
    scheduler: Arc<Scheduler<C>>,
    engine: Arc<MergeEngine<C>>,
    events: EventLog,
    alts: LaunchDirs,
    root_dir: PathBuf,
    runner: ScriptRunner,
    config: KernelConfig,
    signal_tx: mpsc::UnboundedSender<KernelSignal>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<KernelSignal>>>,
}

impl Kernel<SystemClock> {
    /// Start with the system clock, the directory package store under
    /// `<root>/packages` and no component IPC transport.
    pub async fn start(config: KernelConfig) -> Result<Self, DeployError> {
        let packages = Arc::new(DirPackageStore::new(config.root_dir.join("packages")));
        Self::start_with(config, SystemClock, packages, Arc::new(NullIpc)).await
    }
}

impl<C: Clock> Kernel<C> {
    pub async fn start_with(
        config: KernelConfig,
        clock: C,
        packages: Arc<dyn PackageStore>,
        ipc: Arc<dyn ComponentIpc>,
    ) -> Result<Self, DeployError> {
        let root_dir = config.root_dir.clone();
        let store = TreeStore::new(root_dir.join("config"));
        let alts = LaunchDirs::new(root_dir.join("alts"))?;
        let task_list = BootstrapTaskList::load(root_dir.join(BOOTSTRAP_TASKS_FILE))?;
        let stage = determine_deployment_stage(&task_list, &alts);
        info!(%stage, root = %root_dir.display(), "kernel starting");

        let tree = store.open()?;

        // after a bootstrap restart the active launch directory carries the
        // authoritative config snapshot
        if !matches!(stage, DeploymentStage::Default) {
            if let Some(current) = alts.current_target() {
                let snapshot_path = current.join("config.snapshot.json");
                match std::fs::read(&snapshot_path) {
                    Ok(bytes) => {
                        tree.restore_bytes(&bytes)?;
                        store.checkpoint(&tree)?;
                    }
                    Err(e) => {
                        warn!(path = %snapshot_path.display(), error = %e,
                              "launch snapshot unreadable; continuing with stored config");
                    }
                }
            }
        }

        let runner = ScriptRunner::new();
        let scheduler = Arc::new(Scheduler::new(
            tree.clone(),
            runner.clone(),
            clock.clone(),
            config.driver.clone(),
        ));
        let events = EventLog::new();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let engine = MergeEngine::new(
            tree.clone(),
            scheduler.clone(),
            packages,
            ipc,
            events.clone(),
            config.engine.clone(),
            alts.clone(),
            root_dir.clone(),
            signal_tx.clone(),
        );

        let kernel = Kernel {
            tree,
            store,
            scheduler,
            engine,
            events,
            alts,
            root_dir,
            runner,
            config,
            signal_tx,
            signals: Mutex::new(Some(signal_rx)),
        };

        kernel.register_main_component();
        kernel.ensure_baseline_launch_dir()?;
        kernel.hydrate_from_tree();

        // pending bootstrap tasks run before any component starts
        match stage {
            DeploymentStage::Default => kernel.scheduler.start_all(),
            DeploymentStage::Bootstrap => kernel.resume_bootstrap(task_list).await?,
            DeploymentStage::KernelActivation => kernel.resume_activation().await?,
            DeploymentStage::KernelRollback => kernel.resume_rollback().await?,
        }
        Ok(kernel)
    }

    // ── Public surface ────────────────────────────────────────────────────────

    pub fn deploy(&self, doc: DeploymentDoc) -> DeploymentHandle {
        self.engine.deploy(doc)
    }

    pub fn tree(&self) -> &ConfigTree {
        &self.tree
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn component_states(&self) -> BTreeMap<ComponentName, ComponentState> {
        self.scheduler.component_states()
    }

    pub fn scheduler(&self) -> &Scheduler<C> {
        &self.scheduler
    }

    /// Restart/reboot requests raised by the merge engine. Take once; the
    /// binary acts on them (exit 100 / 101).
    pub fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<KernelSignal>> {
        self.signals.lock().take()
    }

    /// Orderly shutdown: reverse-order component stop, then a config
    /// checkpoint so the next start replays no stale log.
    pub async fn shutdown(&self) -> Result<(), DeployError> {
        self.scheduler.stop_all(self.config.shutdown_timeout).await;
        self.store.checkpoint(&self.tree)?;
        Ok(())
    }

    // ── Startup wiring ────────────────────────────────────────────────────────

    /// The supervisor itself appears as the `main` nucleus component so
    /// dependents can anchor on it.
    fn register_main_component(&self) {
        let main = ComponentName::new(MAIN_COMPONENT);
        if services::service_version(&self.tree, &main).is_some() {
            return;
        }
        let ts = 1; // before any deployment timestamp
        let _ = self.tree.write(
            &services::version_path(&main),
            json!(env!("CARGO_PKG_VERSION")),
            ts,
        );
        let _ = self.tree.write(
            &services::component_type_path(&main),
            serde_json::to_value(ComponentType::Nucleus).unwrap_or(json!("nucleus")),
            ts,
        );
    }

    /// The flip protocol needs a `current` link from day one: without it a
    /// later bootstrap has no previous target to record as `old`.
    fn ensure_baseline_launch_dir(&self) -> Result<(), DeployError> {
        if self.alts.current_target().is_some() {
            return Ok(());
        }
        let snapshot = self.tree.snapshot_bytes()?;
        let id = keel_bootstrap::launch_dir_id("base", &snapshot);
        let dir = self.alts.prepare_bootstrap(&id)?;
        std::fs::write(dir.join("config.snapshot.json"), &snapshot)
            .map_err(|e| DeployError::Internal(format!("write baseline snapshot: {}", e)))?;
        info!(dir = %dir.display(), "baseline launch directory created");
        Ok(())
    }

    /// Recreate scheduler state from the authoritative tree: one component
    /// and its dependency edges per `services/*` entry.
    fn hydrate_from_tree(&self) {
        for name in services::list_services(&self.tree) {
            self.scheduler.add_component(&name);
            let deps = self
                .tree
                .read(&services::dependencies_path(&name))
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if let Err(e) = self.scheduler.set_dependencies(&name, deps) {
                warn!(component = %name, error = %e, "stored dependencies rejected");
            }
        }
    }

    // ── Restart recovery ──────────────────────────────────────────────────────

    /// Stage BOOTSTRAP: the restart happened mid-task-list; run the
    /// pending tasks, then continue to activation.
    async fn resume_bootstrap(&self, mut tasks: BootstrapTaskList) -> Result<(), DeployError> {
        info!("resuming pending bootstrap tasks");
        match tasks
            .execute_all_tasks_sequentially(&self.tree, &self.runner)
            .await
        {
            Ok(BootstrapOutcome::Completed) => self.resume_activation().await,
            Ok(BootstrapOutcome::RestartRequired) => {
                self.engine_signal(KernelSignal::RestartRequired);
                Ok(())
            }
            Ok(BootstrapOutcome::RebootRequired) => {
                self.engine_signal(KernelSignal::RebootRequired);
                Ok(())
            }
            // a failed bootstrap task recovers to the pre-restart state
            Err(e) => {
                warn!(error = %e, "bootstrap task failed; rolling back to previous launch dir");
                self.alts.prepare_rollback()?;
                self.resume_rollback().await
            }
        }
    }

    /// Stage KERNEL_ACTIVATION: the new configuration is live on disk;
    /// converge the component set and settle the deployment.
    async fn resume_activation(&self) -> Result<(), DeployError> {
        let Some(pending) = self.load_pending()? else {
            // nothing recorded: clean up links and carry on
            self.alts.activation_succeeds()?;
            self.scheduler.start_all();
            return Ok(());
        };
        let deployment_id = pending.doc.deployment_id.clone();
        info!(deployment_id = %deployment_id, "resuming deployment activation");

        self.hydrate_from_tree();
        self.scheduler.start_all();
        let converged = self
            .engine
            .wait_converged(&deployment_id, pending.target.keys())
            .await;

        match converged {
            Ok(()) => {
                self.alts.activation_succeeds()?;
                self.clear_pending()?;
                self.events.emit(DeploymentEvent::DeploymentCompleted {
                    id: Uuid::new_v4(),
                    at: Utc::now(),
                    deployment_id,
                    result: DeploymentResult::Successful.to_string(),
                });
                Ok(())
            }
            Err(cause) => {
                warn!(deployment_id = %deployment_id, cause = %cause, "activation failed");
                match pending.doc.failure_handling_policy {
                    keel_domain::FailureHandlingPolicy::Rollback => {
                        self.alts.prepare_rollback()?;
                        self.resume_rollback().await?;
                        self.events.emit(DeploymentEvent::DeploymentCompleted {
                            id: Uuid::new_v4(),
                            at: Utc::now(),
                            deployment_id,
                            result: DeploymentResult::FailedRollbackComplete { cause }.to_string(),
                        });
                        Ok(())
                    }
                    keel_domain::FailureHandlingPolicy::DoNothing => {
                        self.alts.activation_succeeds()?;
                        self.clear_pending()?;
                        self.events.emit(DeploymentEvent::DeploymentCompleted {
                            id: Uuid::new_v4(),
                            at: Utc::now(),
                            deployment_id,
                            result: DeploymentResult::FailedRollbackNotRequested { cause }
                                .to_string(),
                        });
                        Ok(())
                    }
                }
            }
        }
    }

    /// Stage KERNEL_ROLLBACK: `current` points at the last good launch
    /// directory again; restore its config and converge back.
    async fn resume_rollback(&self) -> Result<(), DeployError> {
        info!("recovering pre-bootstrap state");
        if let Some(current) = self.alts.current_target() {
            if let Ok(bytes) = std::fs::read(current.join("config.snapshot.json")) {
                self.tree.restore_bytes(&bytes)?;
                self.store.checkpoint(&self.tree)?;
            }
        }
        self.hydrate_from_tree();
        self.scheduler.start_all();

        // best-effort convergence to the restored set
        let names: Vec<ComponentName> = services::list_services(&self.tree);
        let restored = self
            .engine
            .wait_converged(&keel_domain::DeploymentId::new("rollback"), names.iter())
            .await;
        if let Err(cause) = restored {
            warn!(cause = %cause, "rollback convergence incomplete");
        }
        self.alts.rollback_completes()?;
        self.clear_pending()?;
        Ok(())
    }

    fn load_pending(&self) -> Result<Option<PendingDeployment>, DeployError> {
        let path = self.root_dir.join(PENDING_DEPLOYMENT_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| DeployError::Internal(format!("corrupt pending deployment: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DeployError::Internal(format!(
                "read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn clear_pending(&self) -> Result<(), DeployError> {
        for file in [PENDING_DEPLOYMENT_FILE, BOOTSTRAP_TASKS_FILE] {
            let path = self.root_dir.join(file);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(DeployError::Internal(format!(
                        "remove {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Ok(())
    }

    fn engine_signal(&self, signal: KernelSignal) {
        warn!(?signal, "supervisor restart requested during resume");
        let _ = self.signal_tx.send(signal);
    }
}
