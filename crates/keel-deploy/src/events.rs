use chrono::{DateTime, Utc};
use keel_domain::{ComponentName, DeploymentId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Structured record of a deployment stage transition, emitted for
/// observability collaborators. The user-visible outcome stays the
/// deployment result alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DeploymentEvent {
    DeploymentAccepted {
        id: Uuid,
        at: DateTime<Utc>,
        deployment_id: DeploymentId,
        group_name: String,
    },
    DeploymentRejected {
        id: Uuid,
        at: DateTime<Utc>,
        deployment_id: DeploymentId,
        cause: String,
    },
    ValidationRejected {
        id: Uuid,
        at: DateTime<Utc>,
        deployment_id: DeploymentId,
        component: ComponentName,
        reason: String,
    },
    UpdateDeferred {
        id: Uuid,
        at: DateTime<Utc>,
        deployment_id: DeploymentId,
        component: ComponentName,
        deferred_ms: u64,
    },
    BootstrapPrepared {
        id: Uuid,
        at: DateTime<Utc>,
        deployment_id: DeploymentId,
        tasks: usize,
    },
    MergeApplied {
        id: Uuid,
        at: DateTime<Utc>,
        deployment_id: DeploymentId,
        components: usize,
        removed: usize,
    },
    ComponentBroken {
        id: Uuid,
        at: DateTime<Utc>,
        deployment_id: DeploymentId,
        component: ComponentName,
    },
    RollbackStarted {
        id: Uuid,
        at: DateTime<Utc>,
        deployment_id: DeploymentId,
        cause: String,
    },
    DeploymentCompleted {
        id: Uuid,
        at: DateTime<Utc>,
        deployment_id: DeploymentId,
        result: String,
    },
}

impl DeploymentEvent {
    pub fn deployment_id(&self) -> &DeploymentId {
        match self {
            DeploymentEvent::DeploymentAccepted { deployment_id, .. }
            | DeploymentEvent::DeploymentRejected { deployment_id, .. }
            | DeploymentEvent::ValidationRejected { deployment_id, .. }
            | DeploymentEvent::UpdateDeferred { deployment_id, .. }
            | DeploymentEvent::BootstrapPrepared { deployment_id, .. }
            | DeploymentEvent::MergeApplied { deployment_id, .. }
            | DeploymentEvent::ComponentBroken { deployment_id, .. }
            | DeploymentEvent::RollbackStarted { deployment_id, .. }
            | DeploymentEvent::DeploymentCompleted { deployment_id, .. } => deployment_id,
        }
    }
}

/// In-memory, append-only event log. Every record is mirrored to tracing;
/// external observers read it through `list`/`for_deployment`.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<RwLock<Vec<DeploymentEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: DeploymentEvent) {
        info!(deployment_id = %event.deployment_id(), event = ?event, "deployment event");
        self.events.write().push(event);
    }

    pub fn list(&self) -> Vec<DeploymentEvent> {
        self.events.read().clone()
    }

    pub fn for_deployment(&self, deployment_id: &DeploymentId) -> Vec<DeploymentEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.deployment_id() == deployment_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_filter_by_deployment() {
        let log = EventLog::new();
        for (dep, group) in [("d-1", "g"), ("d-2", "g")] {
            log.emit(DeploymentEvent::DeploymentAccepted {
                id: Uuid::new_v4(),
                at: Utc::now(),
                deployment_id: DeploymentId::new(dep),
                group_name: group.into(),
            });
        }
        assert_eq!(log.list().len(), 2);
        assert_eq!(log.for_deployment(&DeploymentId::new("d-1")).len(), 1);
    }
}
