use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use keel_domain::{ComponentId, ComponentName, Recipe};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PackageStoreError {
    #[error("no recipe for {name}@{version}")]
    NotFound { name: String, version: String },

    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("recipe parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("recipe validation failed: {0}")]
    Invalid(#[from] keel_domain::DomainError),
}

/// The package-store seam: recipes and artifacts come from outside the
/// core (a cloud artifact service in production, a directory locally).
#[async_trait]
pub trait PackageStore: Send + Sync + 'static {
    /// The recipe for one exact (name, version).
    async fn recipe(&self, id: &ComponentId) -> Result<Recipe, PackageStoreError>;

    /// Resolve the roots plus every transitive dependency to concrete
    /// recipes. Dependency versions are the store's latest available.
    async fn resolve_transitive_closure(
        &self,
        roots: &[ComponentId],
    ) -> Result<Vec<Recipe>, PackageStoreError>;

    /// Make artifacts for the given components locally available.
    async fn prepare(&self, components: &[ComponentId]) -> Result<(), PackageStoreError>;
}

// ── In-memory store ───────────────────────────────────────────────────────────

/// Recipe registry held in memory. Used by tests and as the cache behind
/// [`DirPackageStore`].
#[derive(Debug, Default)]
pub struct InMemoryPackageStore {
    recipes: RwLock<BTreeMap<ComponentName, BTreeMap<String, Recipe>>>,
}

impl InMemoryPackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, recipe: Recipe) {
        self.recipes
            .write()
            .entry(recipe.name.clone())
            .or_default()
            .insert(recipe.version.clone(), recipe);
    }

    fn get(&self, id: &ComponentId) -> Result<Recipe, PackageStoreError> {
        self.recipes
            .read()
            .get(&id.name)
            .and_then(|versions| versions.get(&id.version))
            .cloned()
            .ok_or_else(|| PackageStoreError::NotFound {
                name: id.name.to_string(),
                version: id.version.clone(),
            })
    }

    fn latest(&self, name: &ComponentName) -> Result<Recipe, PackageStoreError> {
        self.recipes
            .read()
            .get(name)
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| PackageStoreError::NotFound {
                name: name.to_string(),
                version: "*".into(),
            })
    }

    fn closure(&self, roots: &[ComponentId]) -> Result<Vec<Recipe>, PackageStoreError> {
        let mut seen: BTreeSet<ComponentName> = BTreeSet::new();
        let mut out: Vec<Recipe> = Vec::new();
        let mut queue: VecDeque<Recipe> = VecDeque::new();
        for id in roots {
            queue.push_back(self.get(id)?);
        }
        while let Some(recipe) = queue.pop_front() {
            if !seen.insert(recipe.name.clone()) {
                continue;
            }
            for dep in recipe.dependencies.keys() {
                if !seen.contains(dep) {
                    queue.push_back(self.latest(dep)?);
                }
            }
            out.push(recipe);
        }
        Ok(out)
    }
}

#[async_trait]
impl PackageStore for InMemoryPackageStore {
    async fn recipe(&self, id: &ComponentId) -> Result<Recipe, PackageStoreError> {
        self.get(id)
    }

    async fn resolve_transitive_closure(
        &self,
        roots: &[ComponentId],
    ) -> Result<Vec<Recipe>, PackageStoreError> {
        self.closure(roots)
    }

    async fn prepare(&self, _components: &[ComponentId]) -> Result<(), PackageStoreError> {
        Ok(())
    }
}

// ── Directory store ───────────────────────────────────────────────────────────

/// Reads YAML recipes from `<dir>/<name>-<version>.yml` (or `.yaml`),
/// validating each on load. Artifacts are assumed co-located, so
/// `prepare` is a no-op.
pub struct DirPackageStore {
    dir: PathBuf,
    cache: InMemoryPackageStore,
}

impl DirPackageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirPackageStore {
            dir: dir.into(),
            cache: InMemoryPackageStore::new(),
        }
    }

    fn load(&self, id: &ComponentId) -> Result<Recipe, PackageStoreError> {
        if let Ok(recipe) = self.cache.get(id) {
            return Ok(recipe);
        }
        for ext in ["yml", "yaml"] {
            let path = self.dir.join(format!("{}-{}.{}", id.name, id.version, ext));
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(PackageStoreError::Io {
                        path: path.display().to_string(),
                        source: e,
                    })
                }
            };
            let recipe: Recipe =
                serde_yaml::from_str(&content).map_err(|e| PackageStoreError::Parse {
                    path: path.display().to_string(),
                    source: e,
                })?;
            recipe.validate()?;
            debug!(path = %path.display(), "recipe loaded");
            self.cache.insert(recipe.clone());
            return Ok(recipe);
        }
        Err(PackageStoreError::NotFound {
            name: id.name.to_string(),
            version: id.version.clone(),
        })
    }

    /// Latest version on disk for a bare dependency name.
    fn load_latest(&self, name: &ComponentName) -> Result<Recipe, PackageStoreError> {
        if let Ok(recipe) = self.cache.latest(name) {
            return Ok(recipe);
        }
        let prefix = format!("{}-", name);
        let mut best: Option<(String, ComponentId)> = None;
        let entries = std::fs::read_dir(&self.dir).map_err(|e| PackageStoreError::Io {
            path: self.dir.display().to_string(),
            source: e,
        })?;
        for entry in entries.flatten() {
            let file = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = file
                .strip_suffix(".yml")
                .or_else(|| file.strip_suffix(".yaml"))
            else {
                continue;
            };
            if let Some(version) = stem.strip_prefix(&prefix) {
                let candidate = (
                    version.to_string(),
                    ComponentId::new(name.as_str(), version),
                );
                if best.as_ref().map(|(v, _)| version > v.as_str()).unwrap_or(true) {
                    best = Some(candidate);
                }
            }
        }
        match best {
            Some((_, id)) => self.load(&id),
            None => Err(PackageStoreError::NotFound {
                name: name.to_string(),
                version: "*".into(),
            }),
        }
    }
}

#[async_trait]
impl PackageStore for DirPackageStore {
    async fn recipe(&self, id: &ComponentId) -> Result<Recipe, PackageStoreError> {
        self.load(id)
    }

    async fn resolve_transitive_closure(
        &self,
        roots: &[ComponentId],
    ) -> Result<Vec<Recipe>, PackageStoreError> {
        let mut seen: BTreeSet<ComponentName> = BTreeSet::new();
        let mut out: Vec<Recipe> = Vec::new();
        let mut queue: VecDeque<Recipe> = VecDeque::new();
        for id in roots {
            queue.push_back(self.load(id)?);
        }
        while let Some(recipe) = queue.pop_front() {
            if !seen.insert(recipe.name.clone()) {
                continue;
            }
            for dep in recipe.dependencies.keys() {
                if !seen.contains(dep) {
                    queue.push_back(self.load_latest(dep)?);
                }
            }
            out.push(recipe);
        }
        Ok(out)
    }

    async fn prepare(&self, _components: &[ComponentId]) -> Result<(), PackageStoreError> {
        Ok(())
    }
}
