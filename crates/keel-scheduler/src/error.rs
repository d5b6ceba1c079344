use keel_domain::ComponentName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("service '{0}' is not defined")]
    ServiceNotFound(ComponentName),

    #[error("adding dependency '{dependent}' → '{dependency}' would create a cycle")]
    CycleDetected {
        dependent: ComponentName,
        dependency: ComponentName,
    },

    #[error("config tree error: {0}")]
    ConfigTree(#[from] keel_config::ConfigTreeError),
}
