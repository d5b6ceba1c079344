use std::path::{Path, PathBuf};

use std::time::Duration;

use anyhow::{Context, Result};
use keel_config::{services, TreeStore};
use keel_deploy::{DeploymentSpool, Kernel, KernelConfig, KernelSignal};
use keel_domain::DeploymentDoc;
use tracing::info;

use crate::cli::GraphOutput;

/// Exit code asking the process supervisor to restart us.
pub const EXIT_RESTART: i32 = 100;
/// Exit code asking the process supervisor to reboot the device.
pub const EXIT_REBOOT: i32 = 101;

/// Start the kernel and serve the deployment spool until interrupted or
/// until a deployment requests a restart/reboot, which maps onto our own
/// exit code.
pub async fn run(root: PathBuf) -> Result<i32> {
    let kernel = Kernel::start(KernelConfig::new(&root))
        .await
        .with_context(|| format!("starting kernel under {}", root.display()))?;
    let mut signals = kernel
        .take_signals()
        .context("kernel signals already taken")?;
    let spool = DeploymentSpool::new(root.join("deployments"))?;

    info!(root = %root.display(), spool = %spool.dir().display(),
          "keel running; ctrl-c to stop");
    let code = tokio::select! {
        _ = spool.serve(&kernel, Duration::from_secs(2)) => 0,
        signal = signals.recv() => match signal {
            Some(KernelSignal::RestartRequired) => EXIT_RESTART,
            Some(KernelSignal::RebootRequired) => EXIT_REBOOT,
            None => 0,
        },
        _ = tokio::signal::ctrl_c() => 0,
    };

    kernel.shutdown().await?;
    Ok(code)
}

/// Start the kernel, enqueue one document, wait for the result and shut
/// down again. A restart request surfaces as exit code 100.
pub async fn deploy(root: PathBuf, doc_path: PathBuf) -> Result<i32> {
    let content = std::fs::read_to_string(&doc_path)
        .with_context(|| format!("reading {}", doc_path.display()))?;
    let doc: DeploymentDoc = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", doc_path.display()))?;

    let kernel = Kernel::start(KernelConfig::new(&root)).await?;
    let mut signals = kernel
        .take_signals()
        .context("kernel signals already taken")?;

    let handle = kernel.deploy(doc);
    let code = tokio::select! {
        result = handle.result() => {
            match result {
                Some(result) => {
                    println!("{}", result);
                    if result.is_successful() { 0 } else { 1 }
                }
                None => {
                    println!("deployment handed over (cancelled or restart pending)");
                    1
                }
            }
        }
        signal = signals.recv() => match signal {
            Some(KernelSignal::RebootRequired) => {
                println!("deployment staged; reboot required");
                EXIT_REBOOT
            }
            _ => {
                println!("deployment staged; supervisor restart required");
                EXIT_RESTART
            }
        },
    };

    kernel.shutdown().await?;
    Ok(code)
}

/// Read the persisted config and print each service with its last
/// recorded runtime state. Works without a running supervisor.
pub fn status(root: PathBuf) -> Result<i32> {
    let tree = open_tree(&root)?;
    let names = services::list_services(&tree);
    if names.is_empty() {
        println!("no services configured");
        return Ok(0);
    }
    println!("{:<24} {:<12} {}", "SERVICE", "VERSION", "STATE");
    for name in names {
        let version = services::service_version(&tree, &name).unwrap_or_else(|| "-".into());
        let state = tree
            .read(&services::runtime_state_path(&name))
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "unknown".into());
        println!("{:<24} {:<12} {}", name, version, state);
    }
    Ok(0)
}

/// Print the dependency edges stored in config, as text or DOT.
pub fn graph(root: PathBuf, output: GraphOutput) -> Result<i32> {
    let tree = open_tree(&root)?;
    let names = services::list_services(&tree);
    let edges: Vec<(String, String, String)> = names
        .iter()
        .flat_map(|name| {
            let deps: std::collections::BTreeMap<String, keel_domain::DependencyDecl> = tree
                .read(&services::dependencies_path(name))
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            deps.into_iter()
                .map(|(dep, decl)| (name.to_string(), dep, decl.kind.to_string()))
                .collect::<Vec<_>>()
        })
        .collect();

    match output {
        GraphOutput::Text => {
            for name in &names {
                println!("{}", name);
            }
            for (from, to, kind) in &edges {
                println!("{} -> {} [{}]", from, to, kind);
            }
        }
        GraphOutput::Dot => {
            println!("digraph keel {{");
            for name in &names {
                println!("  \"{}\";", name);
            }
            for (from, to, kind) in &edges {
                let style = if kind == "soft" { " [style=dashed]" } else { "" };
                println!("  \"{}\" -> \"{}\"{};", from, to, style);
            }
            println!("}}");
        }
    }
    Ok(0)
}

fn open_tree(root: &Path) -> Result<keel_config::ConfigTree> {
    TreeStore::new(root.join("config"))
        .open()
        .with_context(|| format!("opening config under {}", root.display()))
}
