use keel_domain::ComponentName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    /// Dynamic configuration validation rejected or timed out.
    #[error("configuration validation for '{component}' failed: {reason}")]
    ConfigurationValidation {
        component: ComponentName,
        reason: String,
    },

    /// Dependency resolution against the package store failed.
    #[error("dependency resolution failed: {0}")]
    Resolution(String),

    /// Convergence failed: a component broke or never reached its state.
    #[error("service update failed: {0}")]
    ServiceUpdate(String),

    #[error("domain error: {0}")]
    Domain(#[from] keel_domain::DomainError),

    #[error("config tree error: {0}")]
    ConfigTree(#[from] keel_config::ConfigTreeError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] keel_scheduler::SchedulerError),

    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] keel_bootstrap::BootstrapError),

    #[error("package store error: {0}")]
    PackageStore(#[from] crate::store::PackageStoreError),

    #[error("internal error: {0}")]
    Internal(String),
}
