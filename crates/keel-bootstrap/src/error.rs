use keel_domain::ComponentName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap task for '{component}' failed with exit code {exit_code}")]
    TaskFailed {
        component: ComponentName,
        exit_code: i32,
    },

    #[error("bootstrap task for '{component}' timed out")]
    TaskTimeout { component: ComponentName },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt bootstrap task list {path}: {message}")]
    CorruptTaskList { path: String, message: String },

    #[error("launch directory '{0}' has no target")]
    MissingLink(String),

    #[error("malformed device configuration: {0}")]
    DeviceConfiguration(String),

    #[error("config tree error: {0}")]
    ConfigTree(#[from] keel_config::ConfigTreeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
