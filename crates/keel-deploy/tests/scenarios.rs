//! End-to-end deployment scenarios against a real kernel: shell-script
//! components, an in-memory package store and scripted component IPC.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keel_config::services;
use keel_deploy::{
    EngineConfig, Kernel, KernelConfig, KernelSignal, StaticIpc, InMemoryPackageStore,
};
use keel_domain::{
    ComponentName, ComponentState, ComponentUpdatePolicy, ConfigurationValidationPolicy,
    DependencyDecl, DeploymentDoc, DeploymentId, DeploymentResult, FailureHandlingPolicy,
    LifecycleSpec, LifecycleStep, PackageSpec, Recipe, UpdateAction,
};
use keel_lifecycle::{DriverConfig, ManualClock};
use tempfile::TempDir;

struct Rig {
    _tmp: TempDir,
    kernel: Kernel<ManualClock>,
    store: Arc<InMemoryPackageStore>,
    ipc: Arc<StaticIpc>,
    log: PathBuf,
}

impl Rig {
    async fn start() -> Rig {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("component_stdout.log");
        let store = Arc::new(InMemoryPackageStore::new());
        let ipc = Arc::new(StaticIpc::new());
        let kernel = Kernel::start_with(
            config_for(tmp.path()),
            ManualClock::new(),
            store.clone(),
            ipc.clone(),
        )
        .await
        .unwrap();
        Rig {
            _tmp: tmp,
            kernel,
            store,
            ipc,
            log,
        }
    }

    fn long_running(&self, name: &str, version: &str, deps: &[&str]) -> Recipe {
        recipe(
            name,
            version,
            deps,
            format!("echo {} >> {}; sleep 600", name, self.log.display()),
        )
    }

    async fn deploy_ok(&self, doc: DeploymentDoc) {
        let result = self.kernel.deploy(doc).result().await.unwrap();
        assert_eq!(result, DeploymentResult::Successful, "{result}");
    }

    fn states(&self) -> BTreeMap<String, ComponentState> {
        self.kernel
            .component_states()
            .into_iter()
            .map(|(name, state)| (name.to_string(), state))
            .collect()
    }

    fn stdout_lines(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .map(|s| s.lines().map(String::from).collect())
            .unwrap_or_default()
    }
}

fn config_for(root: &Path) -> KernelConfig {
    let mut config = KernelConfig::new(root);
    config.driver = DriverConfig {
        backoff_base: Duration::from_millis(10),
        ..Default::default()
    };
    config.engine = EngineConfig {
        convergence_timeout: Duration::from_secs(30),
        remove_timeout: Duration::from_secs(5),
    };
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

fn recipe(name: &str, version: &str, deps: &[&str], run: String) -> Recipe {
    Recipe {
        name: ComponentName::new(name),
        version: version.into(),
        component_type: Default::default(),
        dependencies: deps
            .iter()
            .map(|d| (ComponentName::new(*d), DependencyDecl::default()))
            .collect(),
        lifecycle: LifecycleSpec {
            run: Some(LifecycleStep::new(run)),
            ..Default::default()
        },
        parameters: BTreeMap::new(),
        platforms: Vec::new(),
    }
}

/// A component whose startup never succeeds: it errors on every attempt
/// and trips the three-errors rule.
fn breaking_recipe() -> Recipe {
    Recipe {
        name: ComponentName::new("BreakingService"),
        version: "1.0.0".into(),
        component_type: Default::default(),
        dependencies: BTreeMap::new(),
        lifecycle: LifecycleSpec {
            startup: Some(LifecycleStep::new("exit 1")),
            ..Default::default()
        },
        parameters: BTreeMap::new(),
        platforms: Vec::new(),
    }
}

fn doc(id: &str, ts: u64, packages: &[(&str, &str)]) -> DeploymentDoc {
    DeploymentDoc {
        deployment_id: DeploymentId::new(id),
        timestamp: ts,
        group_name: "default".into(),
        packages: packages
            .iter()
            .map(|(name, version)| {
                (
                    ComponentName::new(*name),
                    PackageSpec {
                        version: (*version).into(),
                        parameters: BTreeMap::new(),
                    },
                )
            })
            .collect(),
        failure_handling_policy: FailureHandlingPolicy::DoNothing,
        component_update_policy: ComponentUpdatePolicy::default(),
        configuration_validation_policy: ConfigurationValidationPolicy::default(),
    }
}

// ── 1. Happy path ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_starts_in_topological_order() {
    let rig = Rig::start().await;
    rig.store
        .insert(rig.long_running("CustomerApp", "1.0.0", &["Mosquitto"]));
    rig.store
        .insert(rig.long_running("Mosquitto", "1.0.0", &["GreenSignal"]));
    rig.store.insert(rig.long_running("GreenSignal", "1.0.0", &[]));

    rig.deploy_ok(doc(
        "d-1",
        2_000_000,
        &[
            ("CustomerApp", "1.0.0"),
            ("Mosquitto", "1.0.0"),
            ("GreenSignal", "1.0.0"),
        ],
    ))
    .await;

    let states = rig.states();
    for name in ["main", "CustomerApp", "Mosquitto", "GreenSignal"] {
        assert_eq!(states.get(name), Some(&ComponentState::Running), "{name}");
    }

    // first-seen stdout order follows the dependency order
    let lines = rig.stdout_lines();
    let first = |n: &str| lines.iter().position(|l| l == n).unwrap();
    assert!(first("GreenSignal") < first("Mosquitto"));
    assert!(first("Mosquitto") < first("CustomerApp"));
}

// ── 2. Parameter update ───────────────────────────────────────────────────────

#[tokio::test]
async fn parameter_update_restarts_with_new_value() {
    let rig = Rig::start().await;
    let mut app = recipe(
        "CustomerApp",
        "1.0.0",
        &[],
        format!(
            "echo ${{KEEL_PARAM_TEXT:-unset}} >> {}; sleep 600",
            rig.log.display()
        ),
    );
    app.parameters
        .insert("text".into(), serde_json::json!("original"));
    rig.store.insert(app);

    rig.deploy_ok(doc("d-1", 2_000_000, &[("CustomerApp", "1.0.0")]))
        .await;

    let mut update = doc("d-2", 3_000_000, &[("CustomerApp", "1.0.0")]);
    update
        .packages
        .get_mut(&ComponentName::new("CustomerApp"))
        .unwrap()
        .parameters
        .insert("text".into(), serde_json::json!("new"));
    rig.deploy_ok(update).await;

    let lines = rig.stdout_lines();
    assert!(lines.contains(&"original".to_string()), "{lines:?}");
    assert!(lines.contains(&"new".to_string()), "{lines:?}");
    assert_eq!(
        rig.states().get("CustomerApp"),
        Some(&ComponentState::Running)
    );
}

// ── 3. Add + remove ───────────────────────────────────────────────────────────

#[tokio::test]
async fn add_and_remove_components() {
    let rig = Rig::start().await;
    rig.store.insert(rig.long_running("CustomerApp", "1.0.0", &[]));
    rig.store.insert(rig.long_running("YellowSignal", "1.0.0", &[]));
    rig.store.insert(rig.long_running("RedSignal", "1.0.0", &[]));

    rig.deploy_ok(doc(
        "d-1",
        2_000_000,
        &[("CustomerApp", "1.0.0"), ("YellowSignal", "1.0.0")],
    ))
    .await;
    rig.deploy_ok(doc(
        "d-2",
        3_000_000,
        &[("YellowSignal", "1.0.0"), ("RedSignal", "1.0.0")],
    ))
    .await;

    let states = rig.states();
    assert_eq!(
        states.keys().cloned().collect::<Vec<_>>(),
        vec!["RedSignal", "YellowSignal", "main"]
    );
    let names = services::list_services(rig.kernel.tree());
    assert!(!names.contains(&ComponentName::new("CustomerApp")));
}

// ── 4. Breakage under DO_NOTHING ──────────────────────────────────────────────

#[tokio::test]
async fn broken_component_with_do_nothing_leaves_partial_state() {
    let rig = Rig::start().await;
    rig.store.insert(rig.long_running("YellowSignal", "1.0.0", &[]));
    rig.store.insert(rig.long_running("RedSignal", "1.0.0", &[]));
    rig.store
        .insert(breaking_recipe());

    rig.deploy_ok(doc(
        "d-1",
        2_000_000,
        &[("YellowSignal", "1.0.0"), ("RedSignal", "1.0.0")],
    ))
    .await;

    let result = rig
        .kernel
        .deploy(doc(
            "d-2",
            3_000_000,
            &[("RedSignal", "1.0.0"), ("BreakingService", "1.0.0")],
        ))
        .result()
        .await
        .unwrap();
    assert!(
        matches!(result, DeploymentResult::FailedRollbackNotRequested { .. }),
        "{result}"
    );

    let states = rig.states();
    assert_eq!(states.get("BreakingService"), Some(&ComponentState::Broken));
    assert_eq!(states.get("RedSignal"), Some(&ComponentState::Running));
    assert!(!states.contains_key("YellowSignal"));
}

// ── 5. Breakage under ROLLBACK ────────────────────────────────────────────────

#[tokio::test]
async fn broken_component_with_rollback_restores_previous_state() {
    let rig = Rig::start().await;
    rig.store.insert(rig.long_running("YellowSignal", "1.0.0", &[]));
    rig.store.insert(rig.long_running("RedSignal", "1.0.0", &[]));
    rig.store
        .insert(breaking_recipe());

    rig.deploy_ok(doc(
        "d-1",
        2_000_000,
        &[("YellowSignal", "1.0.0"), ("RedSignal", "1.0.0")],
    ))
    .await;
    let pre_services = services::list_services(rig.kernel.tree());

    let mut breaking = doc(
        "d-2",
        3_000_000,
        &[("BreakingService", "1.0.0"), ("RedSignal", "1.0.0")],
    );
    breaking.failure_handling_policy = FailureHandlingPolicy::Rollback;
    let result = rig.kernel.deploy(breaking).result().await.unwrap();
    assert!(
        matches!(result, DeploymentResult::FailedRollbackComplete { .. }),
        "{result}"
    );

    let states = rig.states();
    assert_eq!(states.get("YellowSignal"), Some(&ComponentState::Running));
    assert_eq!(states.get("RedSignal"), Some(&ComponentState::Running));
    assert!(!states.contains_key("BreakingService"));
    assert_eq!(services::list_services(rig.kernel.tree()), pre_services);
    assert_eq!(
        services::service_version(rig.kernel.tree(), &ComponentName::new("YellowSignal")),
        Some("1.0.0".into())
    );
}

// ── 6. Deferred update, cancel, then SKIP_CHECK ───────────────────────────────

#[tokio::test]
async fn deferred_update_cancelled_then_skip_check_succeeds() {
    let rig = Rig::start().await;
    rig.store
        .insert(rig.long_running("NonDisruptable", "1.0.0", &[]));
    rig.store
        .insert(rig.long_running("NonDisruptable", "1.0.1", &[]));

    rig.deploy_ok(doc("d-1", 2_000_000, &[("NonDisruptable", "1.0.0")]))
        .await;

    // the running component keeps deferring its update
    rig.ipc.defer(
        ComponentName::new("NonDisruptable"),
        Duration::from_secs(5),
    );
    let handle = rig
        .kernel
        .deploy(doc("d-2", 3_000_000, &[("NonDisruptable", "1.0.1")]));
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.cancel();

    // cancellation writes no result and leaves the running version alone
    let cancelled = rig
        .kernel
        .deploy(doc("noop", 3_500_000, &[("NonDisruptable", "1.0.0")]));
    drop(cancelled); // queue another no-op so the worker definitely moved on
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        services::service_version(rig.kernel.tree(), &ComponentName::new("NonDisruptable")),
        Some("1.0.0".into())
    );

    // skipping the check moves to the new version
    rig.ipc.clear(&ComponentName::new("NonDisruptable"));
    let mut skip = doc("d-3", 4_000_000, &[("NonDisruptable", "1.0.1")]);
    skip.component_update_policy = ComponentUpdatePolicy {
        action: UpdateAction::SkipCheck,
        timeout_in_seconds: 60,
    };
    rig.deploy_ok(skip).await;
    assert_eq!(
        services::service_version(rig.kernel.tree(), &ComponentName::new("NonDisruptable")),
        Some("1.0.1".into())
    );
    assert_eq!(
        rig.states().get("NonDisruptable"),
        Some(&ComponentState::Running)
    );
}

// ── 7. Dynamic validation rejection ───────────────────────────────────────────

#[tokio::test]
async fn validation_rejection_changes_nothing() {
    let rig = Rig::start().await;
    let mut app = recipe(
        "CustomerApp",
        "1.0.0",
        &[],
        "sleep 600".into(),
    );
    app.parameters
        .insert("text".into(), serde_json::json!("original"));
    rig.store.insert(app);

    rig.deploy_ok(doc("d-1", 2_000_000, &[("CustomerApp", "1.0.0")]))
        .await;
    rig.ipc.reject(ComponentName::new("CustomerApp"), "bad");

    let mut update = doc("d-2", 3_000_000, &[("CustomerApp", "1.0.0")]);
    update
        .packages
        .get_mut(&ComponentName::new("CustomerApp"))
        .unwrap()
        .parameters
        .insert("text".into(), serde_json::json!("rejected-change"));
    let result = rig.kernel.deploy(update).result().await.unwrap();
    match &result {
        DeploymentResult::FailedNoStateChange { cause } => {
            assert!(cause.contains("bad"), "{cause}");
        }
        other => panic!("expected FAILED_NO_STATE_CHANGE, got {other}"),
    }

    // running parameters unchanged
    assert_eq!(
        services::service_parameters(rig.kernel.tree(), &ComponentName::new("CustomerApp")),
        serde_json::json!({ "text": "original" })
    );
    assert_eq!(
        rig.states().get("CustomerApp"),
        Some(&ComponentState::Running)
    );
}

// ── Stale deployments ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stale_deployment_is_rejected() {
    let rig = Rig::start().await;
    rig.store.insert(rig.long_running("RedSignal", "1.0.0", &[]));

    rig.deploy_ok(doc("d-2", 3_000_000, &[("RedSignal", "1.0.0")]))
        .await;
    let result = rig
        .kernel
        .deploy(doc("d-1", 2_000_000, &[("RedSignal", "1.0.0")]))
        .result()
        .await
        .unwrap();
    assert!(matches!(result, DeploymentResult::Rejected { .. }), "{result}");
}

// ── Bootstrap hand-off across a restart ───────────────────────────────────────

#[tokio::test]
async fn bootstrap_deployment_survives_supervisor_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let log = tmp.path().join("component_stdout.log");
    let marker = tmp.path().join("bootstrapped");
    let store = Arc::new(InMemoryPackageStore::new());
    let ipc = Arc::new(StaticIpc::new());

    store.insert(recipe(
        "Base",
        "1.0.0",
        &[],
        format!("echo Base >> {}; sleep 600", log.display()),
    ));
    let mut booted = recipe(
        "Booted",
        "1.0.0",
        &[],
        format!("echo Booted >> {}; sleep 600", log.display()),
    );
    booted.lifecycle.bootstrap = Some(LifecycleStep::new(format!(
        "touch {}",
        marker.display()
    )));
    store.insert(booted);

    // first supervisor: base running, then a deployment that needs bootstrap
    let kernel = Kernel::start_with(
        config_for(tmp.path()),
        ManualClock::new(),
        store.clone(),
        ipc.clone(),
    )
    .await
    .unwrap();
    let mut signals = kernel.take_signals().unwrap();

    let ok = kernel
        .deploy(doc("d-1", 2_000_000, &[("Base", "1.0.0")]))
        .result()
        .await
        .unwrap();
    assert_eq!(ok, DeploymentResult::Successful);

    let handle = kernel.deploy(doc(
        "d-2",
        3_000_000,
        &[("Base", "1.0.0"), ("Booted", "1.0.0")],
    ));
    assert_eq!(signals.recv().await, Some(KernelSignal::RestartRequired));
    assert_eq!(handle.result().await, None, "handed over to restart");

    // the plan is on disk, the launch links flipped, nothing merged yet
    assert!(tmp.path().join("bootstrap_tasks.json").exists());
    assert!(tmp.path().join("pending_deployment.json").exists());
    assert!(!marker.exists());
    kernel.shutdown().await.unwrap();
    drop(kernel);

    // "restarted" supervisor picks the staged deployment up from disk
    let kernel = Kernel::start_with(
        config_for(tmp.path()),
        ManualClock::new(),
        store.clone(),
        ipc.clone(),
    )
    .await
    .unwrap();

    assert!(marker.exists(), "bootstrap task ran after restart");
    let states: BTreeMap<String, ComponentState> = kernel
        .component_states()
        .into_iter()
        .map(|(n, s)| (n.to_string(), s))
        .collect();
    assert_eq!(states.get("Base"), Some(&ComponentState::Running));
    assert_eq!(states.get("Booted"), Some(&ComponentState::Running));
    assert_eq!(
        services::service_version(kernel.tree(), &ComponentName::new("Booted")),
        Some("1.0.0".into())
    );
    // clean activation: old link and the staged files are gone
    assert!(!tmp.path().join("bootstrap_tasks.json").exists());
    assert!(!tmp.path().join("pending_deployment.json").exists());
    kernel.shutdown().await.unwrap();
}
