use std::collections::{BTreeMap, BTreeSet};

use keel_config::{services, ConfigTree};
use keel_domain::{ComponentName, ComponentType, ResolvedComponent};
use serde_json::Value;
use tracing::debug;

use crate::error::BootstrapError;

/// Nucleus parameter carrying the privileged run-with configuration.
pub const RUN_WITH_KEY: &str = "runWith";
/// Nucleus parameter selecting the transport-spooler storage kind.
pub const SPOOLER_STORAGE_KEY: &str = "spoolerStorageType";

const SPOOLER_STORAGE_KINDS: &[&str] = &["memory", "disk"];

/// Whether applying `target` needs an out-of-process bootstrap: true iff
/// any surviving component not listed in `exclusions` answers yes.
pub fn is_bootstrap_required(
    tree: &ConfigTree,
    target: &BTreeMap<ComponentName, ResolvedComponent>,
    exclusions: &BTreeSet<ComponentName>,
) -> Result<bool, BootstrapError> {
    for (name, resolved) in target {
        if exclusions.contains(name) {
            continue;
        }
        if component_requires_bootstrap(tree, resolved)? {
            debug!(component = %name, "component requires bootstrap");
            return Ok(true);
        }
    }
    Ok(false)
}

/// One component's bootstrap contract against its currently stored config.
pub fn component_requires_bootstrap(
    tree: &ConfigTree,
    resolved: &ResolvedComponent,
) -> Result<bool, BootstrapError> {
    // The supervisor-self component also bootstraps on privileged config
    // changes, independent of any scripted bootstrap step.
    if resolved.component_type == ComponentType::Nucleus && nucleus_config_changed(tree, resolved)?
    {
        return Ok(true);
    }

    if resolved.lifecycle.bootstrap.is_none() {
        return Ok(false);
    }

    let name = &resolved.name;
    match services::service_version(tree, name) {
        // not currently deployed: bootstrap runs on first install
        None => Ok(true),
        Some(version) if version != resolved.version => Ok(true),
        Some(_) => {
            let old_parameters = services::service_parameters(tree, name);
            let new_parameters = parameters_value(&resolved.parameters);
            let old_lifecycle = tree
                .read(&services::lifecycle_path(name))
                .unwrap_or(Value::Null);
            let new_lifecycle =
                serde_json::to_value(&resolved.lifecycle).unwrap_or(Value::Null);
            Ok(old_parameters != new_parameters || old_lifecycle != new_lifecycle)
        }
    }
}

/// Validate and diff the nucleus' privileged settings. Malformed values
/// are a device-configuration error, rejected before any merge happens.
fn nucleus_config_changed(
    tree: &ConfigTree,
    resolved: &ResolvedComponent,
) -> Result<bool, BootstrapError> {
    let new_run_with = resolved.parameters.get(RUN_WITH_KEY);
    if let Some(v) = new_run_with {
        if !v.is_object() {
            return Err(BootstrapError::DeviceConfiguration(format!(
                "{} must be an object, got {}",
                RUN_WITH_KEY, v
            )));
        }
    }
    let new_spooler = resolved.parameters.get(SPOOLER_STORAGE_KEY);
    if let Some(v) = new_spooler {
        match v.as_str() {
            Some(kind) if SPOOLER_STORAGE_KINDS.contains(&kind) => {}
            _ => {
                return Err(BootstrapError::DeviceConfiguration(format!(
                    "{} must be one of {:?}, got {}",
                    SPOOLER_STORAGE_KEY, SPOOLER_STORAGE_KINDS, v
                )))
            }
        }
    }

    let old = services::service_parameters(tree, &resolved.name);
    let changed = old.get(RUN_WITH_KEY) != new_run_with
        || old.get(SPOOLER_STORAGE_KEY) != new_spooler;
    Ok(changed)
}

fn parameters_value(parameters: &BTreeMap<String, Value>) -> Value {
    Value::Object(
        parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}
