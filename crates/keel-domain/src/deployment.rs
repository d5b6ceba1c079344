use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ComponentName, TimestampMs};

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentId(pub String);

impl DeploymentId {
    pub fn new(s: impl Into<String>) -> Self {
        DeploymentId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Policies ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureHandlingPolicy {
    /// Leave the partial state in place on failure.
    #[default]
    DoNothing,
    /// Restore the pre-merge snapshot and converge back.
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateAction {
    /// Ask running, disruption-sensitive components before updating them.
    #[default]
    NotifyComponents,
    /// Apply immediately without the pre-update handshake.
    SkipCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentUpdatePolicy {
    #[serde(default)]
    pub action: UpdateAction,
    #[serde(default = "default_update_timeout_secs")]
    pub timeout_in_seconds: u64,
}

fn default_update_timeout_secs() -> u64 {
    60
}

impl Default for ComponentUpdatePolicy {
    fn default() -> Self {
        ComponentUpdatePolicy {
            action: UpdateAction::NotifyComponents,
            timeout_in_seconds: default_update_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationValidationPolicy {
    #[serde(default = "default_validation_timeout_secs")]
    pub timeout_in_seconds: u64,
}

fn default_validation_timeout_secs() -> u64 {
    20
}

impl Default for ConfigurationValidationPolicy {
    fn default() -> Self {
        ConfigurationValidationPolicy {
            timeout_in_seconds: default_validation_timeout_secs(),
        }
    }
}

// ── Deployment document ───────────────────────────────────────────────────────

/// One desired root component inside a deployment document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    pub version: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

/// The declarative request to move the device to a desired configuration.
/// Wire format is the JSON described in the external-interface contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDoc {
    pub deployment_id: DeploymentId,
    /// Milliseconds since epoch; monotonic per group. Older documents for
    /// the same group are stale and dropped.
    pub timestamp: TimestampMs,
    pub group_name: String,
    /// Desired root components, name → version + parameter overrides.
    pub packages: BTreeMap<ComponentName, PackageSpec>,
    #[serde(default)]
    pub failure_handling_policy: FailureHandlingPolicy,
    #[serde(default)]
    pub component_update_policy: ComponentUpdatePolicy,
    #[serde(default)]
    pub configuration_validation_policy: ConfigurationValidationPolicy,
}

// ── Result ────────────────────────────────────────────────────────────────────

/// The single user-visible outcome of a deployment. Exactly one value is
/// produced per accepted deployment; cancellation produces none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentResult {
    Successful,
    /// The device configuration was not touched.
    FailedNoStateChange { cause: String },
    /// The merge failed and the previous configuration was restored.
    FailedRollbackComplete { cause: String },
    /// The merge failed and policy said to leave the partial state.
    FailedRollbackNotRequested { cause: String },
    /// Dropped before any processing (stale timestamp, malformed doc).
    Rejected { cause: String },
}

impl DeploymentResult {
    pub fn is_successful(&self) -> bool {
        matches!(self, DeploymentResult::Successful)
    }
}

impl std::fmt::Display for DeploymentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentResult::Successful => write!(f, "SUCCESSFUL"),
            DeploymentResult::FailedNoStateChange { cause } => {
                write!(f, "FAILED_NO_STATE_CHANGE: {}", cause)
            }
            DeploymentResult::FailedRollbackComplete { cause } => {
                write!(f, "FAILED_ROLLBACK_COMPLETE: {}", cause)
            }
            DeploymentResult::FailedRollbackNotRequested { cause } => {
                write!(f, "FAILED_ROLLBACK_NOT_REQUESTED: {}", cause)
            }
            DeploymentResult::Rejected { cause } => write!(f, "REJECTED: {}", cause),
        }
    }
}
