use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use keel_domain::ComponentName;
use parking_lot::RwLock;
use serde_json::Value;

/// Reply to a dynamic configuration validation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationReply {
    Accepted,
    Rejected(String),
}

/// Reply to a pre-update disruption handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreUpdateReply {
    Proceed,
    /// The component asks to defer the update for this long.
    Deferred(Duration),
}

/// The IPC seam to running components. The real transport (component SDK
/// server) lives outside the core; tests and local runs plug in stubs.
#[async_trait]
pub trait ComponentIpc: Send + Sync + 'static {
    /// Ask a running component to validate proposed parameters. An elapsed
    /// `timeout` without a reply counts as a rejection.
    async fn validate_configuration(
        &self,
        component: &ComponentName,
        proposed: &Value,
        timeout: Duration,
    ) -> ValidationReply;

    /// Ask a running component whether it may be updated now.
    async fn pre_component_update(
        &self,
        component: &ComponentName,
        timeout: Duration,
    ) -> PreUpdateReply;
}

/// Accepts every validation and never defers. The default when no IPC
/// transport is wired in.
#[derive(Debug, Default, Clone)]
pub struct NullIpc;

#[async_trait]
impl ComponentIpc for NullIpc {
    async fn validate_configuration(
        &self,
        _component: &ComponentName,
        _proposed: &Value,
        _timeout: Duration,
    ) -> ValidationReply {
        ValidationReply::Accepted
    }

    async fn pre_component_update(
        &self,
        _component: &ComponentName,
        _timeout: Duration,
    ) -> PreUpdateReply {
        PreUpdateReply::Proceed
    }
}

/// Scripted per-component replies, for tests and local simulation.
#[derive(Debug, Default)]
pub struct StaticIpc {
    validations: RwLock<BTreeMap<ComponentName, ValidationReply>>,
    deferrals: RwLock<BTreeMap<ComponentName, Duration>>,
}

impl StaticIpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, component: ComponentName, reason: impl Into<String>) {
        self.validations
            .write()
            .insert(component, ValidationReply::Rejected(reason.into()));
    }

    pub fn defer(&self, component: ComponentName, by: Duration) {
        self.deferrals.write().insert(component, by);
    }

    pub fn clear(&self, component: &ComponentName) {
        self.validations.write().remove(component);
        self.deferrals.write().remove(component);
    }
}

#[async_trait]
impl ComponentIpc for StaticIpc {
    async fn validate_configuration(
        &self,
        component: &ComponentName,
        _proposed: &Value,
        _timeout: Duration,
    ) -> ValidationReply {
        self.validations
            .read()
            .get(component)
            .cloned()
            .unwrap_or(ValidationReply::Accepted)
    }

    async fn pre_component_update(
        &self,
        component: &ComponentName,
        _timeout: Duration,
    ) -> PreUpdateReply {
        match self.deferrals.read().get(component) {
            Some(by) => PreUpdateReply::Deferred(*by),
            None => PreUpdateReply::Proceed,
        }
    }
}
