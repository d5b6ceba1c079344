mod deployment;
mod error;
mod recipe;
mod tests;
mod types;

pub use deployment::{
    ComponentUpdatePolicy, ConfigurationValidationPolicy, DeploymentDoc, DeploymentId,
    DeploymentResult, FailureHandlingPolicy, PackageSpec, UpdateAction,
};
pub use error::DomainError;
pub use recipe::{
    LifecyclePhase, LifecycleSpec, LifecycleStep, PlatformSelector, Recipe, ResolvedComponent,
};
pub use types::{
    ComponentId, ComponentName, ComponentState, ComponentType, DependencyDecl, DependencyKind,
    StartWhen, TimestampMs,
};
