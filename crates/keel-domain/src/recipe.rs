use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::types::{ComponentName, ComponentType, DependencyDecl};

// ── Lifecycle steps ───────────────────────────────────────────────────────────

/// The phases a recipe may script. `Run` is long-lived and supervised;
/// the others execute to completion under their timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Install,
    Startup,
    Run,
    Shutdown,
    Bootstrap,
    Recover,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Install => "install",
            LifecyclePhase::Startup => "startup",
            LifecyclePhase::Run => "run",
            LifecyclePhase::Shutdown => "shutdown",
            LifecyclePhase::Bootstrap => "bootstrap",
            LifecyclePhase::Recover => "recover",
        }
    }

    /// Default timeout applied when the recipe does not override it.
    pub fn default_timeout(&self) -> Duration {
        match self {
            LifecyclePhase::Install => Duration::from_secs(120),
            LifecyclePhase::Startup => Duration::from_secs(120),
            // The run step has no completion timeout; it is supervised, not awaited.
            LifecyclePhase::Run => Duration::from_secs(0),
            LifecyclePhase::Shutdown => Duration::from_secs(15),
            LifecyclePhase::Bootstrap => Duration::from_secs(120),
            LifecyclePhase::Recover => Duration::from_secs(60),
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One scripted phase: a shell snippet plus an optional timeout override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleStep {
    pub script: String,
    /// Seconds; None means the phase default.
    pub timeout: Option<u64>,
}

impl LifecycleStep {
    pub fn new(script: impl Into<String>) -> Self {
        LifecycleStep {
            script: script.into(),
            timeout: None,
        }
    }

    pub fn timeout_or(&self, phase: LifecyclePhase) -> Duration {
        self.timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| phase.default_timeout())
    }
}

// Recipes accept either a bare script string or a map with `script` and
// `timeout`, so the YAML can stay terse for the common case.
impl<'de> Deserialize<'de> for LifecycleStep {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bare(String),
            Full { script: String, timeout: Option<u64> },
        }
        Ok(match Raw::deserialize(d)? {
            Raw::Bare(script) => LifecycleStep { script, timeout: None },
            Raw::Full { script, timeout } => LifecycleStep { script, timeout },
        })
    }
}

/// The scripted phase map of a recipe. Absent phases are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LifecycleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<LifecycleStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<LifecycleStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<LifecycleStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<LifecycleStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<LifecycleStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recover: Option<LifecycleStep>,
}

impl LifecycleSpec {
    pub fn step(&self, phase: LifecyclePhase) -> Option<&LifecycleStep> {
        match phase {
            LifecyclePhase::Install => self.install.as_ref(),
            LifecyclePhase::Startup => self.startup.as_ref(),
            LifecyclePhase::Run => self.run.as_ref(),
            LifecyclePhase::Shutdown => self.shutdown.as_ref(),
            LifecyclePhase::Bootstrap => self.bootstrap.as_ref(),
            LifecyclePhase::Recover => self.recover.as_ref(),
        }
    }
}

// ── Platform selectors ────────────────────────────────────────────────────────

/// Narrows a recipe to hosts it supports. Absent fields match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlatformSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

impl PlatformSelector {
    /// The platform this supervisor was built for.
    pub fn host() -> Self {
        PlatformSelector {
            os: Some(std::env::consts::OS.to_string()),
            architecture: Some(std::env::consts::ARCH.to_string()),
        }
    }

    pub fn matches(&self, host: &PlatformSelector) -> bool {
        let os_ok = match (&self.os, &host.os) {
            (None, _) => true,
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => false,
        };
        let arch_ok = match (&self.architecture, &host.architecture) {
            (None, _) => true,
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => false,
        };
        os_ok && arch_ok
    }
}

// ── Recipe ────────────────────────────────────────────────────────────────────

/// Declarative per-(name, version) description of a component, as served
/// by the package store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: ComponentName,
    pub version: String,
    #[serde(default)]
    pub component_type: ComponentType,
    /// Declared dependencies, name → edge attributes.
    #[serde(default)]
    pub dependencies: BTreeMap<ComponentName, DependencyDecl>,
    #[serde(default)]
    pub lifecycle: LifecycleSpec,
    /// Default parameter values, overridable per deployment.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Platforms this recipe applies to; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<PlatformSelector>,
}

impl Recipe {
    /// Structural validation applied after parsing.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.as_str().is_empty() || self.name.as_str().contains('/') {
            return Err(DomainError::InvalidComponentName(self.name.to_string()));
        }
        if self.version.is_empty() {
            return Err(DomainError::InvalidVersion {
                name: self.name.to_string(),
                version: self.version.clone(),
            });
        }
        if self.dependencies.contains_key(&self.name) {
            return Err(DomainError::MalformedRecipe {
                name: self.name.to_string(),
                message: "component depends on itself".into(),
            });
        }
        Ok(())
    }

    /// Whether applying this recipe can require an out-of-process bootstrap.
    pub fn declares_bootstrap(&self) -> bool {
        self.lifecycle.bootstrap.is_some()
    }

    /// Whether this recipe may run on `host`.
    pub fn supports(&self, host: &PlatformSelector) -> bool {
        self.platforms.is_empty() || self.platforms.iter().any(|p| p.matches(host))
    }

    /// Resolve this recipe against per-deployment parameter overrides.
    pub fn resolve(&self, overrides: &BTreeMap<String, Value>) -> ResolvedComponent {
        let mut parameters = self.parameters.clone();
        for (key, value) in overrides {
            parameters.insert(key.clone(), value.clone());
        }
        ResolvedComponent {
            name: self.name.clone(),
            version: self.version.clone(),
            component_type: self.component_type,
            dependencies: self.dependencies.clone(),
            lifecycle: self.lifecycle.clone(),
            parameters,
        }
    }
}

/// A recipe with deployment parameter overrides applied: the desired shape
/// of one service as it will appear under `services/<name>/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedComponent {
    pub name: ComponentName,
    pub version: String,
    pub component_type: ComponentType,
    pub dependencies: BTreeMap<ComponentName, DependencyDecl>,
    pub lifecycle: LifecycleSpec,
    pub parameters: BTreeMap<String, Value>,
}
