#[cfg(test)]
mod tests {
    use crate::deployment::*;
    use crate::recipe::*;
    use crate::types::*;

    #[test]
    fn running_satisfies_installed() {
        assert!(ComponentState::Running.satisfies(StartWhen::Installed));
        assert!(ComponentState::Running.satisfies(StartWhen::Running));
    }

    #[test]
    fn installed_does_not_satisfy_running() {
        assert!(ComponentState::Installed.satisfies(StartWhen::Installed));
        assert!(!ComponentState::Installed.satisfies(StartWhen::Running));
    }

    #[test]
    fn starting_satisfies_installed_only() {
        assert!(ComponentState::Starting.satisfies(StartWhen::Installed));
        assert!(!ComponentState::Starting.satisfies(StartWhen::Running));
    }

    #[test]
    fn finished_still_satisfies_but_stopping_does_not() {
        assert!(ComponentState::Finished.satisfies(StartWhen::Running));
        assert!(ComponentState::Finished.satisfies(StartWhen::Installed));
        assert!(!ComponentState::Stopping.satisfies(StartWhen::Running));
        assert!(!ComponentState::Stopping.satisfies(StartWhen::Installed));
    }

    #[test]
    fn closable_states() {
        assert!(ComponentState::Finished.is_closable());
        assert!(ComponentState::Errored.is_closable());
        assert!(ComponentState::Broken.is_closable());
        assert!(ComponentState::New.is_closable());
        assert!(!ComponentState::Running.is_closable());
        assert!(!ComponentState::Stopping.is_closable());
    }

    #[test]
    fn lifecycle_step_accepts_bare_string() {
        let step: LifecycleStep = serde_yaml::from_str("echo hello").unwrap();
        assert_eq!(step.script, "echo hello");
        assert_eq!(step.timeout, None);
    }

    #[test]
    fn lifecycle_step_accepts_phase_map() {
        let step: LifecycleStep =
            serde_yaml::from_str("{ script: \"sleep 1\", timeout: 5 }").unwrap();
        assert_eq!(step.script, "sleep 1");
        assert_eq!(step.timeout, Some(5));
        assert_eq!(
            step.timeout_or(LifecyclePhase::Startup),
            std::time::Duration::from_secs(5)
        );
    }

    #[test]
    fn recipe_rejects_self_dependency() {
        let yaml = r#"
name: loopy
version: 1.0.0
dependencies:
  loopy: { kind: hard }
"#;
        let recipe: Recipe = serde_yaml::from_str(yaml).unwrap();
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn recipe_defaults() {
        let yaml = r#"
name: minimal
version: 0.1.0
"#;
        let recipe: Recipe = serde_yaml::from_str(yaml).unwrap();
        recipe.validate().unwrap();
        assert_eq!(recipe.component_type, ComponentType::GenericExternal);
        assert!(recipe.lifecycle.step(LifecyclePhase::Run).is_none());
        assert!(!recipe.declares_bootstrap());
    }

    #[test]
    fn platform_selectors_narrow_supported_hosts() {
        let yaml = r#"
name: native
version: 1.0.0
platforms:
  - os: linux
  - os: macos
    architecture: aarch64
"#;
        let recipe: Recipe = serde_yaml::from_str(yaml).unwrap();
        let linux_any = PlatformSelector {
            os: Some("linux".into()),
            architecture: Some("x86_64".into()),
        };
        let mac_intel = PlatformSelector {
            os: Some("macos".into()),
            architecture: Some("x86_64".into()),
        };
        assert!(recipe.supports(&linux_any));
        assert!(!recipe.supports(&mac_intel));

        let anywhere: Recipe = serde_yaml::from_str("name: a\nversion: 1.0.0\n").unwrap();
        assert!(anywhere.supports(&PlatformSelector::host()));
    }

    #[test]
    fn dependency_decl_defaults_to_hard_running() {
        let decl: DependencyDecl = serde_yaml::from_str("{}").unwrap();
        assert_eq!(decl.kind, DependencyKind::Hard);
        assert_eq!(decl.start_when, StartWhen::Running);
    }

    #[test]
    fn deployment_doc_parses_wire_json() {
        let json = r#"{
            "deploymentId": "d-1",
            "timestamp": 1700000000000,
            "groupName": "thing/group",
            "packages": {
                "CustomerApp": { "version": "1.0.0", "parameters": { "text": "hi" } },
                "Mosquitto": { "version": "1.0.0" }
            },
            "failureHandlingPolicy": "ROLLBACK",
            "componentUpdatePolicy": { "action": "SKIP_CHECK", "timeoutInSeconds": 30 },
            "configurationValidationPolicy": { "timeoutInSeconds": 10 }
        }"#;
        let doc: DeploymentDoc = serde_json::from_str(json).unwrap();
        assert_eq!(doc.deployment_id.as_str(), "d-1");
        assert_eq!(doc.timestamp, 1_700_000_000_000);
        assert_eq!(doc.packages.len(), 2);
        assert_eq!(doc.failure_handling_policy, FailureHandlingPolicy::Rollback);
        assert_eq!(doc.component_update_policy.action, UpdateAction::SkipCheck);
        assert_eq!(doc.component_update_policy.timeout_in_seconds, 30);
        assert_eq!(doc.configuration_validation_policy.timeout_in_seconds, 10);
    }

    #[test]
    fn deployment_doc_policy_defaults() {
        let json = r#"{
            "deploymentId": "d-2",
            "timestamp": 1,
            "groupName": "g",
            "packages": {}
        }"#;
        let doc: DeploymentDoc = serde_json::from_str(json).unwrap();
        assert_eq!(doc.failure_handling_policy, FailureHandlingPolicy::DoNothing);
        assert_eq!(
            doc.component_update_policy.action,
            UpdateAction::NotifyComponents
        );
        assert_eq!(doc.component_update_policy.timeout_in_seconds, 60);
    }

    #[test]
    fn deployment_result_round_trips() {
        let r = DeploymentResult::FailedNoStateChange {
            cause: "validation rejected: bad".into(),
        };
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("FAILED_NO_STATE_CHANGE"));
        let back: DeploymentResult = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
    }
}
