use keel_domain::LifecyclePhase;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to spawn {phase} for '{component}': {source}")]
    SpawnFailed {
        component: String,
        phase: LifecyclePhase,
        #[source]
        source: std::io::Error,
    },

    #[error("{phase} for '{component}' exited with code {exit_code}")]
    PhaseFailed {
        component: String,
        phase: LifecyclePhase,
        exit_code: i32,
    },

    #[error("{phase} for '{component}' timed out")]
    PhaseTimeout {
        component: String,
        phase: LifecyclePhase,
    },

    #[error("config tree error: {0}")]
    ConfigTree(#[from] keel_config::ConfigTreeError),
}
