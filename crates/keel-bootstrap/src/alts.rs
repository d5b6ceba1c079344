use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::BootstrapError;
use crate::tasks::BootstrapTaskList;

pub const CURRENT: &str = "current";
pub const OLD: &str = "old";
pub const BROKEN: &str = "broken";

/// The stage the supervisor finds itself in after (re)start, recovered
/// purely from the launch-directory links and the bootstrap task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStage {
    Default,
    Bootstrap,
    KernelActivation,
    KernelRollback,
}

impl std::fmt::Display for DeploymentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStage::Default => "default",
            DeploymentStage::Bootstrap => "bootstrap",
            DeploymentStage::KernelActivation => "kernel_activation",
            DeploymentStage::KernelRollback => "kernel_rollback",
        };
        write!(f, "{}", s)
    }
}

/// The launch-directory set: `current`, `old` and `broken` symlinks under
/// one alternatives directory, each pointing into a content-addressed
/// `<id>/` directory bundling a supervisor binary and config snapshot.
///
/// All flips are symlink-at-temp-path + atomic rename, so a crash at any
/// moment leaves a recoverable link set.
#[derive(Debug, Clone)]
pub struct LaunchDirs {
    alts_dir: PathBuf,
}

impl LaunchDirs {
    pub fn new(alts_dir: impl Into<PathBuf>) -> Result<Self, BootstrapError> {
        let alts_dir = alts_dir.into();
        std::fs::create_dir_all(&alts_dir).map_err(|e| BootstrapError::Io {
            path: alts_dir.display().to_string(),
            source: e,
        })?;
        Ok(LaunchDirs { alts_dir })
    }

    pub fn alts_dir(&self) -> &Path {
        &self.alts_dir
    }

    /// The content directory for a given deployment id.
    pub fn dir_for(&self, id: &str) -> PathBuf {
        self.alts_dir.join(id)
    }

    fn link(&self, name: &str) -> PathBuf {
        self.alts_dir.join(name)
    }

    fn target_of(&self, name: &str) -> Option<PathBuf> {
        std::fs::read_link(self.link(name)).ok()
    }

    pub fn current_target(&self) -> Option<PathBuf> {
        self.target_of(CURRENT)
    }

    pub fn old_target(&self) -> Option<PathBuf> {
        self.target_of(OLD)
    }

    pub fn broken_target(&self) -> Option<PathBuf> {
        self.target_of(BROKEN)
    }

    /// Point `link` at `target` atomically: symlink at a temp path, then
    /// rename over the link.
    fn set_link(&self, name: &str, target: &Path) -> Result<(), BootstrapError> {
        let link = self.link(name);
        let tmp = self.alts_dir.join(format!(".{}.tmp", name));
        let _ = std::fs::remove_file(&tmp);
        std::os::unix::fs::symlink(target, &tmp).map_err(|e| BootstrapError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
        std::fs::rename(&tmp, &link).map_err(|e| BootstrapError::Io {
            path: link.display().to_string(),
            source: e,
        })?;
        debug!(link = %link.display(), target = %target.display(), "launch link flipped");
        Ok(())
    }

    fn drop_link(&self, name: &str) -> Result<(), BootstrapError> {
        let link = self.link(name);
        match std::fs::remove_file(&link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BootstrapError::Io {
                path: link.display().to_string(),
                source: e,
            }),
        }
    }

    fn remove_target_dir(&self, target: &Path) -> Result<(), BootstrapError> {
        match std::fs::remove_dir_all(target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BootstrapError::Io {
                path: target.display().to_string(),
                source: e,
            }),
        }
    }

    // ── Flip protocol ─────────────────────────────────────────────────────────

    /// Create and return `alts/<new_id>`, remember the previous `current`
    /// target as `old`, and flip `current` to the new directory. The caller
    /// populates the directory before requesting a restart.
    pub fn prepare_bootstrap(&self, new_id: &str) -> Result<PathBuf, BootstrapError> {
        let new_dir = self.dir_for(new_id);
        std::fs::create_dir_all(&new_dir).map_err(|e| BootstrapError::Io {
            path: new_dir.display().to_string(),
            source: e,
        })?;
        if let Some(previous) = self.current_target() {
            self.set_link(OLD, &previous)?;
        }
        self.set_link(CURRENT, &new_dir)?;
        info!(id = new_id, "bootstrap prepared; current flipped");
        Ok(new_dir)
    }

    /// Mark the active launch directory as broken and reset `current` back
    /// to the previous one.
    pub fn prepare_rollback(&self) -> Result<(), BootstrapError> {
        let failed = self
            .current_target()
            .ok_or_else(|| BootstrapError::MissingLink(CURRENT.into()))?;
        let previous = self
            .old_target()
            .ok_or_else(|| BootstrapError::MissingLink(OLD.into()))?;
        self.set_link(BROKEN, &failed)?;
        self.set_link(CURRENT, &previous)?;
        self.drop_link(OLD)?;
        info!(failed = %failed.display(), restored = %previous.display(), "rollback prepared");
        Ok(())
    }

    /// The new supervisor came up cleanly: drop `old` and its directory.
    pub fn activation_succeeds(&self) -> Result<(), BootstrapError> {
        if let Some(old) = self.old_target() {
            self.drop_link(OLD)?;
            self.remove_target_dir(&old)?;
            info!(removed = %old.display(), "activation succeeded; old launch dir removed");
        }
        Ok(())
    }

    /// Rollback converged: drop `broken` and its directory.
    pub fn rollback_completes(&self) -> Result<(), BootstrapError> {
        if let Some(broken) = self.broken_target() {
            self.drop_link(BROKEN)?;
            self.remove_target_dir(&broken)?;
            info!(removed = %broken.display(), "rollback completed; broken launch dir removed");
        }
        Ok(())
    }
}

/// Content-addressed launch-directory id: the deployment id plus a digest
/// of the config snapshot it bundles, so re-preparing the same deployment
/// lands in the same directory.
pub fn launch_dir_id(deployment_id: &str, snapshot: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let hex = format!("{:x}", Sha256::digest(snapshot));
    format!("{}-{}", deployment_id, &hex[..12])
}

/// Recover the deployment stage from disk state after a restart.
/// Idempotent: inspects links and the task list, mutates nothing.
pub fn determine_deployment_stage(
    tasks: &BootstrapTaskList,
    dirs: &LaunchDirs,
) -> DeploymentStage {
    if dirs.broken_target().is_some() {
        return DeploymentStage::KernelRollback;
    }
    if dirs.old_target().is_some() {
        if tasks.has_pending() {
            return DeploymentStage::Bootstrap;
        }
        return DeploymentStage::KernelActivation;
    }
    DeploymentStage::Default
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_domain::ComponentName;

    fn dirs(root: &Path) -> LaunchDirs {
        LaunchDirs::new(root.join("alts")).unwrap()
    }

    /// No two of current/old/broken may share a physical target.
    fn assert_links_disjoint(d: &LaunchDirs) {
        let targets: Vec<_> = [d.current_target(), d.old_target(), d.broken_target()]
            .into_iter()
            .flatten()
            .collect();
        let mut unique = targets.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(targets.len(), unique.len(), "links share a target: {targets:?}");
    }

    #[test]
    fn bootstrap_then_activation_leaves_only_current() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dirs(tmp.path());
        d.prepare_bootstrap("gen-0").unwrap();
        assert_links_disjoint(&d);

        d.prepare_bootstrap("gen-1").unwrap();
        assert_eq!(d.current_target(), Some(d.dir_for("gen-1")));
        assert_eq!(d.old_target(), Some(d.dir_for("gen-0")));
        assert_links_disjoint(&d);

        d.activation_succeeds().unwrap();
        assert_eq!(d.current_target(), Some(d.dir_for("gen-1")));
        assert_eq!(d.old_target(), None);
        assert_eq!(d.broken_target(), None);
        assert!(!d.dir_for("gen-0").exists());
    }

    #[test]
    fn bootstrap_then_rollback_restores_previous() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dirs(tmp.path());
        d.prepare_bootstrap("gen-0").unwrap();
        d.prepare_bootstrap("gen-1").unwrap();

        d.prepare_rollback().unwrap();
        assert_eq!(d.current_target(), Some(d.dir_for("gen-0")));
        assert_eq!(d.broken_target(), Some(d.dir_for("gen-1")));
        assert_eq!(d.old_target(), None);
        assert_links_disjoint(&d);

        d.rollback_completes().unwrap();
        assert_eq!(d.current_target(), Some(d.dir_for("gen-0")));
        assert_eq!(d.old_target(), None);
        assert_eq!(d.broken_target(), None);
        assert!(!d.dir_for("gen-1").exists());
    }

    #[test]
    fn rollback_without_old_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dirs(tmp.path());
        d.prepare_bootstrap("gen-0").unwrap();
        assert!(matches!(
            d.prepare_rollback(),
            Err(BootstrapError::MissingLink(_))
        ));
    }

    #[test]
    fn stage_determination_is_idempotent_on_disk_state() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dirs(tmp.path());
        let empty = BootstrapTaskList::new(tmp.path().join("tasks.json"), vec![]);
        let pending = BootstrapTaskList::new(
            tmp.path().join("tasks2.json"),
            vec![ComponentName::new("x")],
        );

        assert_eq!(
            determine_deployment_stage(&empty, &d),
            DeploymentStage::Default
        );

        d.prepare_bootstrap("gen-0").unwrap();
        d.prepare_bootstrap("gen-1").unwrap();
        assert_eq!(
            determine_deployment_stage(&pending, &d),
            DeploymentStage::Bootstrap
        );
        assert_eq!(
            determine_deployment_stage(&pending, &d),
            DeploymentStage::Bootstrap
        );
        assert_eq!(
            determine_deployment_stage(&empty, &d),
            DeploymentStage::KernelActivation
        );

        d.prepare_rollback().unwrap();
        assert_eq!(
            determine_deployment_stage(&empty, &d),
            DeploymentStage::KernelRollback
        );

        d.rollback_completes().unwrap();
        assert_eq!(
            determine_deployment_stage(&empty, &d),
            DeploymentStage::Default
        );
    }

    #[test]
    fn activation_without_old_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dirs(tmp.path());
        d.prepare_bootstrap("gen-0").unwrap();
        d.activation_succeeds().unwrap();
        assert_eq!(d.current_target(), Some(d.dir_for("gen-0")));
    }
}
