//! Well-known layout of the `services/` subtree.
//!
//! ```text
//! services/<name>/version            leaf: version string
//! services/<name>/parameters/<key>   leaves: configured parameters
//! services/<name>/lifecycle          leaf: recipe lifecycle spec (JSON)
//! services/<name>/dependencies       leaf: name → {kind, start_when}
//! services/<name>/runtime/...        written by the component's lifecycle driver
//! ```

use keel_domain::ComponentName;
use serde_json::Value;

use crate::path::TopicPath;
use crate::tree::ConfigTree;

pub const SERVICES: &str = "services";

pub fn services_root() -> TopicPath {
    TopicPath::new([SERVICES])
}

pub fn service_root(name: &ComponentName) -> TopicPath {
    TopicPath::new([SERVICES, name.as_str()])
}

pub fn version_path(name: &ComponentName) -> TopicPath {
    service_root(name).join("version")
}

pub fn parameters_path(name: &ComponentName) -> TopicPath {
    service_root(name).join("parameters")
}

pub fn parameter_path(name: &ComponentName, key: &str) -> TopicPath {
    parameters_path(name).join(key)
}

pub fn lifecycle_path(name: &ComponentName) -> TopicPath {
    service_root(name).join("lifecycle")
}

pub fn component_type_path(name: &ComponentName) -> TopicPath {
    service_root(name).join("component_type")
}

pub fn dependencies_path(name: &ComponentName) -> TopicPath {
    service_root(name).join("dependencies")
}

pub fn runtime_path(name: &ComponentName) -> TopicPath {
    service_root(name).join("runtime")
}

pub fn runtime_state_path(name: &ComponentName) -> TopicPath {
    runtime_path(name).join("state")
}

pub fn runtime_exit_code_path(name: &ComponentName) -> TopicPath {
    runtime_path(name).join("last_exit_code")
}

/// Names of all services currently present in the tree.
pub fn list_services(tree: &ConfigTree) -> Vec<ComponentName> {
    tree.children(&services_root())
        .into_iter()
        .map(ComponentName::new)
        .collect()
}

pub fn service_version(tree: &ConfigTree, name: &ComponentName) -> Option<String> {
    tree.read(&version_path(name))
        .and_then(|v| v.as_str().map(String::from))
}

pub fn service_parameters(tree: &ConfigTree, name: &ComponentName) -> Value {
    tree.subtree(&parameters_path(name))
        .unwrap_or(Value::Object(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn layout_round_trip() {
        let tree = ConfigTree::new();
        let name = ComponentName::new("CustomerApp");
        tree.write(&version_path(&name), json!("1.0.0"), 1).unwrap();
        tree.write(&parameter_path(&name, "text"), json!("hello"), 1)
            .unwrap();

        assert_eq!(list_services(&tree), vec![name.clone()]);
        assert_eq!(service_version(&tree, &name), Some("1.0.0".into()));
        assert_eq!(service_parameters(&tree, &name), json!({ "text": "hello" }));
    }
}
