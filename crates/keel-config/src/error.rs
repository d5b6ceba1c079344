use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigTreeError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unreadable config snapshot {path}: {message}")]
    CorruptSnapshot { path: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
