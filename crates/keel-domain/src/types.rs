use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch. The wire format for deployment
/// timestamps and config-tree modtimes.
pub type TimestampMs = u64;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentName(pub String);

impl ComponentName {
    pub fn new(s: impl Into<String>) -> Self {
        ComponentName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A component's identity: name plus version. Versions are compared for
/// equality only; no semver range resolution happens in the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentId {
    pub name: ComponentName,
    pub version: String,
}

impl ComponentId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        ComponentId {
            name: ComponentName::new(name),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

// ── Lifecycle state ───────────────────────────────────────────────────────────

/// The lifecycle state of a component.
///
/// Transitions:
///   New → Installed → Starting → Running → Stopping → Finished
///   Starting | Running → Errored → (retry) Installed
///   any → Broken (three Errored entries within one hour; terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    /// Known but not yet installed.
    #[default]
    New,
    /// `install` succeeded; waiting for dependencies.
    Installed,
    /// `startup` in flight.
    Starting,
    /// The component's `run` process is up (or `startup` reported ready).
    Running,
    /// `shutdown` in flight.
    Stopping,
    /// Shut down cleanly; eligible for removal.
    Finished,
    /// A phase failed or timed out; recoverable.
    Errored,
    /// Three errors inside one hour; terminal.
    Broken,
}

impl ComponentState {
    /// States in which the component holds no supervised process and may
    /// be removed or the supervisor may exit.
    pub fn is_closable(&self) -> bool {
        matches!(
            self,
            ComponentState::New
                | ComponentState::Finished
                | ComponentState::Errored
                | ComponentState::Broken
        )
    }

    /// Terminal failure; only a new deployment replaces a broken component.
    pub fn is_broken(&self) -> bool {
        matches!(self, ComponentState::Broken)
    }

    /// Whether this state satisfies a dependent's `start-when` requirement,
    /// i.e. is the required state "or later". A dependency that ran to
    /// completion (Finished) still satisfies; one on its way down does not.
    pub fn satisfies(&self, start_when: StartWhen) -> bool {
        match start_when {
            StartWhen::Installed => matches!(
                self,
                ComponentState::Installed
                    | ComponentState::Starting
                    | ComponentState::Running
                    | ComponentState::Finished
            ),
            StartWhen::Running => {
                matches!(self, ComponentState::Running | ComponentState::Finished)
            }
        }
    }
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComponentState::New => "new",
            ComponentState::Installed => "installed",
            ComponentState::Starting => "starting",
            ComponentState::Running => "running",
            ComponentState::Stopping => "stopping",
            ComponentState::Finished => "finished",
            ComponentState::Errored => "errored",
            ComponentState::Broken => "broken",
        };
        write!(f, "{}", s)
    }
}

// ── Dependencies ──────────────────────────────────────────────────────────────

/// Hard edges force restart propagation when the dependency errors;
/// soft edges only gate initial startup ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Hard,
    Soft,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Hard => write!(f, "hard"),
            DependencyKind::Soft => write!(f, "soft"),
        }
    }
}

/// The dependency state a dependent waits for before starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartWhen {
    Installed,
    #[default]
    Running,
}

impl std::fmt::Display for StartWhen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartWhen::Installed => write!(f, "installed"),
            StartWhen::Running => write!(f, "running"),
        }
    }
}

/// One declared dependency edge as it appears in a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDecl {
    #[serde(default = "default_dependency_kind")]
    pub kind: DependencyKind,
    #[serde(default)]
    pub start_when: StartWhen,
}

fn default_dependency_kind() -> DependencyKind {
    DependencyKind::Hard
}

impl Default for DependencyDecl {
    fn default() -> Self {
        DependencyDecl {
            kind: DependencyKind::Hard,
            start_when: StartWhen::Running,
        }
    }
}

// ── Component type ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    /// An externally supplied process supervised through lifecycle scripts.
    #[default]
    GenericExternal,
    /// Runs inside the supervisor process; no child process of its own.
    Plugin,
    /// The supervisor itself, modeled as the root component.
    Nucleus,
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentType::GenericExternal => write!(f, "generic_external"),
            ComponentType::Plugin => write!(f, "plugin"),
            ComponentType::Nucleus => write!(f, "nucleus"),
        }
    }
}
