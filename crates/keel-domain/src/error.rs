use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid component name: {0}")]
    InvalidComponentName(String),

    #[error("invalid version '{version}' for component '{name}'")]
    InvalidVersion { name: String, version: String },

    #[error("malformed recipe for '{name}': {message}")]
    MalformedRecipe { name: String, message: String },

    #[error("malformed deployment document: {0}")]
    InvalidDeployment(String),

    #[error("malformed device configuration: {0}")]
    DeviceConfiguration(String),
}
