mod alts;
mod check;
mod error;
mod tasks;

pub use alts::{
    determine_deployment_stage, launch_dir_id, DeploymentStage, LaunchDirs, BROKEN, CURRENT, OLD,
};
pub use check::{
    component_requires_bootstrap, is_bootstrap_required, RUN_WITH_KEY, SPOOLER_STORAGE_KEY,
};
pub use error::BootstrapError;
pub use tasks::{
    BootstrapOutcome, BootstrapTask, BootstrapTaskList, TaskStatus, EXIT_REBOOT, EXIT_RESTART,
};
