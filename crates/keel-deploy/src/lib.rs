pub mod engine;
pub mod error;
pub mod events;
pub mod ipc;
pub mod kernel;
pub mod spool;
pub mod store;

pub use engine::{
    DeploymentHandle, EngineConfig, KernelSignal, MergeEngine, PendingDeployment,
    BOOTSTRAP_TASKS_FILE, PENDING_DEPLOYMENT_FILE,
};
pub use error::DeployError;
pub use events::{DeploymentEvent, EventLog};
pub use ipc::{ComponentIpc, NullIpc, PreUpdateReply, StaticIpc, ValidationReply};
pub use kernel::{Kernel, KernelConfig, MAIN_COMPONENT};
pub use spool::DeploymentSpool;
pub use store::{DirPackageStore, InMemoryPackageStore, PackageStore, PackageStoreError};
