use std::collections::BTreeMap;
use std::process::Stdio;

use keel_domain::{ComponentName, LifecyclePhase, LifecycleStep};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::LifecycleError;

/// Outcome of a phase script that ran to completion (or was cut off).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ScriptOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Spawns component lifecycle scripts as `sh -c` children.
///
/// stdout/stderr are line-streamed into tracing under the component's
/// name so component output lands in the supervisor log.
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner {
    /// Extra environment applied to every script, e.g. the supervisor root.
    pub base_env: BTreeMap<String, String>,
}

impl ScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(
        &self,
        name: &ComponentName,
        step: &LifecycleStep,
        env: &BTreeMap<String, String>,
    ) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&step.script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&self.base_env)
            .envs(env)
            .env("KEEL_COMPONENT_NAME", name.as_str())
            .kill_on_drop(true);
        cmd
    }

    /// Spawn a long-lived `run` step. The caller supervises the child.
    pub fn spawn_supervised(
        &self,
        name: &ComponentName,
        step: &LifecycleStep,
        env: &BTreeMap<String, String>,
    ) -> Result<Child, LifecycleError> {
        let mut child = self
            .command(name, step, env)
            .spawn()
            .map_err(|e| LifecycleError::SpawnFailed {
                component: name.to_string(),
                phase: LifecyclePhase::Run,
                source: e,
            })?;
        stream_output(name, LifecyclePhase::Run, &mut child);
        Ok(child)
    }

    /// Run a bounded phase (`install`/`startup`/`shutdown`/`recover`/
    /// `bootstrap`) under its timeout. On timeout the child is killed and
    /// the outcome carries `timed_out`.
    pub async fn run_phase(
        &self,
        name: &ComponentName,
        phase: LifecyclePhase,
        step: &LifecycleStep,
        env: &BTreeMap<String, String>,
    ) -> Result<ScriptOutcome, LifecycleError> {
        let timeout = step.timeout_or(phase);
        debug!(component = %name, %phase, ?timeout, "running lifecycle phase");

        let mut child = self
            .command(name, step, env)
            .spawn()
            .map_err(|e| LifecycleError::SpawnFailed {
                component: name.to_string(),
                phase,
                source: e,
            })?;
        stream_output(name, phase, &mut child);

        let status = if timeout.is_zero() {
            child.wait().await
        } else {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(component = %name, %phase, ?timeout, "phase timed out; killing");
                    let _ = child.kill().await;
                    return Ok(ScriptOutcome {
                        exit_code: -1,
                        timed_out: true,
                    });
                }
            }
        };

        let status = status.map_err(|e| LifecycleError::SpawnFailed {
            component: name.to_string(),
            phase,
            source: e,
        })?;
        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            warn!(component = %name, %phase, exit_code, "phase exited non-zero");
        }
        Ok(ScriptOutcome {
            exit_code,
            timed_out: false,
        })
    }

    /// Kill a supervised child and wait for it to be reaped.
    pub async fn kill(child: &mut Child) {
        if let Err(e) = child.kill().await {
            debug!(error = %e, "kill on exited child");
        }
    }
}

/// Mirror a child's stdout and stderr into tracing, one task per stream.
fn stream_output(name: &ComponentName, phase: LifecyclePhase, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let component = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "keel::component", component = %component, phase = %phase, "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let component = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "keel::component", component = %component, phase = %phase, "stderr: {}", line);
            }
        });
    }
}

/// Build the environment a component's scripts see: its identity plus its
/// configured parameters as `KEEL_PARAM_<KEY>`.
pub fn script_env(
    version: &str,
    parameters: &serde_json::Value,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("KEEL_COMPONENT_VERSION".into(), version.to_string());
    if let Some(map) = parameters.as_object() {
        for (key, value) in map {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            env.insert(format!("KEEL_PARAM_{}", key.to_uppercase()), rendered);
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn name() -> ComponentName {
        ComponentName::new("test-comp")
    }

    #[tokio::test]
    async fn phase_success() {
        let runner = ScriptRunner::new();
        let step = LifecycleStep::new("true");
        let outcome = runner
            .run_phase(&name(), LifecyclePhase::Install, &step, &BTreeMap::new())
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn phase_failure_exit_code() {
        let runner = ScriptRunner::new();
        let step = LifecycleStep::new("exit 7");
        let outcome = runner
            .run_phase(&name(), LifecyclePhase::Startup, &step, &BTreeMap::new())
            .await
            .unwrap();
        assert!(!outcome.succeeded());
        assert_eq!(outcome.exit_code, 7);
    }

    #[tokio::test]
    async fn phase_timeout_kills_child() {
        let runner = ScriptRunner::new();
        let step = LifecycleStep {
            script: "sleep 30".into(),
            timeout: Some(1),
        };
        let started = std::time::Instant::now();
        let outcome = runner
            .run_phase(&name(), LifecyclePhase::Shutdown, &step, &BTreeMap::new())
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn parameters_reach_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let runner = ScriptRunner::new();
        let step = LifecycleStep::new(format!(
            "echo \"$KEEL_PARAM_TEXT:$KEEL_COMPONENT_VERSION\" > {}",
            out.display()
        ));
        let env = script_env("1.2.3", &json!({ "text": "hello" }));
        let outcome = runner
            .run_phase(&name(), LifecyclePhase::Run, &step, &env)
            .await
            .unwrap();
        assert!(outcome.succeeded());
        let content = std::fs::read_to_string(&out).unwrap();
        assert_eq!(content.trim(), "hello:1.2.3");
    }

    #[tokio::test]
    async fn supervised_child_can_be_killed() {
        let runner = ScriptRunner::new();
        let step = LifecycleStep::new("sleep 30");
        let mut child = runner
            .spawn_supervised(&name(), &step, &BTreeMap::new())
            .unwrap();
        ScriptRunner::kill(&mut child).await;
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
