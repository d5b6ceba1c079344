use std::path::{Path, PathBuf};

use keel_config::{services, write_atomically, ConfigTree};
use keel_domain::{ComponentName, LifecyclePhase, LifecycleSpec};
use keel_lifecycle::ScriptRunner;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BootstrapError;

/// Exit code a bootstrap task uses to request a supervisor restart.
pub const EXIT_RESTART: i32 = 100;
/// Exit code a bootstrap task uses to request an OS reboot.
pub const EXIT_REBOOT: i32 = 101;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapTask {
    pub component_name: ComponentName,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl BootstrapTask {
    pub fn pending(name: ComponentName) -> Self {
        BootstrapTask {
            component_name: name,
            status: TaskStatus::Pending,
            exit_code: None,
        }
    }
}

/// What the whole task list asked of the supervisor once every task ran.
/// The strongest request wins when tasks disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapOutcome {
    Completed,
    RestartRequired,
    RebootRequired,
}

/// The ordered, persisted list of per-component bootstrap tasks. Persisted
/// atomically (write-temp-then-rename) after every task so a crash at any
/// point resumes where it left off.
#[derive(Debug)]
pub struct BootstrapTaskList {
    path: PathBuf,
    tasks: Vec<BootstrapTask>,
}

impl BootstrapTaskList {
    pub fn new(path: impl Into<PathBuf>, components: Vec<ComponentName>) -> Self {
        BootstrapTaskList {
            path: path.into(),
            tasks: components.into_iter().map(BootstrapTask::pending).collect(),
        }
    }

    /// Reload a persisted list. A missing file is an empty list; a corrupt
    /// file is an error (the caller decides whether to roll back).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BootstrapError> {
        let path = path.into();
        let tasks = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                BootstrapError::CorruptTaskList {
                    path: path.display().to_string(),
                    message: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(BootstrapError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        Ok(BootstrapTaskList { path, tasks })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tasks(&self) -> &[BootstrapTask] {
        &self.tasks
    }

    pub fn has_pending(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Pending)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn persist(&self) -> Result<(), BootstrapError> {
        let bytes = serde_json::to_vec_pretty(&self.tasks)?;
        write_atomically(&self.path, &bytes).map_err(BootstrapError::from)
    }

    pub fn discard(&self) -> Result<(), BootstrapError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BootstrapError::Io {
                path: self.path.display().to_string(),
                source: e,
            }),
        }
    }

    /// Run every pending task in order, persisting after each one.
    ///
    /// Exit code 0 continues; 100 records a restart request; 101 records a
    /// reboot request; anything else aborts with the failing component.
    pub async fn execute_all_tasks_sequentially(
        &mut self,
        tree: &ConfigTree,
        runner: &ScriptRunner,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let mut outcome = BootstrapOutcome::Completed;
        for idx in 0..self.tasks.len() {
            if self.tasks[idx].status == TaskStatus::Done {
                continue;
            }
            let name = self.tasks[idx].component_name.clone();
            let exit_code = run_bootstrap_step(&name, tree, runner).await?;

            self.tasks[idx].status = TaskStatus::Done;
            self.tasks[idx].exit_code = Some(exit_code);
            self.persist()?;

            match exit_code {
                0 => {}
                EXIT_RESTART => {
                    info!(component = %name, "bootstrap task requests supervisor restart");
                    outcome = outcome.max(BootstrapOutcome::RestartRequired);
                }
                EXIT_REBOOT => {
                    info!(component = %name, "bootstrap task requests OS reboot");
                    outcome = outcome.max(BootstrapOutcome::RebootRequired);
                }
                other => {
                    warn!(component = %name, exit_code = other, "bootstrap task failed");
                    return Err(BootstrapError::TaskFailed {
                        component: name,
                        exit_code: other,
                    });
                }
            }
        }
        Ok(outcome)
    }
}

/// Run one component's `bootstrap` step as declared in the config tree.
/// A component with no bootstrap step is a no-op (exit 0).
async fn run_bootstrap_step(
    name: &ComponentName,
    tree: &ConfigTree,
    runner: &ScriptRunner,
) -> Result<i32, BootstrapError> {
    let spec: LifecycleSpec = tree
        .read(&services::lifecycle_path(name))
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let Some(step) = spec.step(LifecyclePhase::Bootstrap) else {
        return Ok(0);
    };

    let version = services::service_version(tree, name).unwrap_or_default();
    let parameters = services::service_parameters(tree, name);
    let env = keel_lifecycle::script_env(&version, &parameters);

    let outcome = runner
        .run_phase(name, LifecyclePhase::Bootstrap, step, &env)
        .await
        .map_err(|_| BootstrapError::TaskFailed {
            component: name.clone(),
            exit_code: -1,
        })?;
    if outcome.timed_out {
        return Err(BootstrapError::TaskTimeout {
            component: name.clone(),
        });
    }
    Ok(outcome.exit_code)
}
