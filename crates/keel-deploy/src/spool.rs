use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_domain::{DeploymentDoc, DeploymentResult};
use keel_lifecycle::Clock;
use tracing::{info, warn};

use crate::error::DeployError;
use crate::kernel::Kernel;

const REJECTED_SUFFIX: &str = "rejected";
const PROCESSED_DIR: &str = "processed";

/// A local drop-box of deployment documents: external collaborators (or
/// an operator) write `<name>.json` files into the spool directory; the
/// supervisor picks them up in name order, one at a time, and records the
/// result next to the processed document.
pub struct DeploymentSpool {
    dir: PathBuf,
}

impl DeploymentSpool {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, DeployError> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(PROCESSED_DIR))
            .map_err(|e| DeployError::Internal(format!("create spool dir: {}", e)))?;
        Ok(DeploymentSpool { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Documents waiting in the spool, oldest name first. A file that does
    /// not parse is renamed aside with a warning instead of wedging the
    /// queue.
    pub fn poll(&self) -> Result<Vec<(PathBuf, DeploymentDoc)>, DeployError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map_err(|e| DeployError::Internal(format!("read spool dir: {}", e)))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().map(|e| e == "json").unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut docs = Vec::new();
        for path in paths {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable spool entry skipped");
                    continue;
                }
            };
            match serde_json::from_str::<DeploymentDoc>(&content) {
                Ok(doc) => docs.push((path, doc)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed deployment document");
                    let aside = path.with_extension(REJECTED_SUFFIX);
                    if let Err(e) = std::fs::rename(&path, &aside) {
                        warn!(path = %path.display(), error = %e, "could not set aside");
                    }
                }
            }
        }
        Ok(docs)
    }

    /// Move a processed document out of the queue and record its result
    /// (or the hand-over to a restart) beside it.
    pub fn finish(
        &self,
        path: &Path,
        result: Option<&DeploymentResult>,
    ) -> Result<(), DeployError> {
        let name = path
            .file_name()
            .ok_or_else(|| DeployError::Internal("spool entry without a name".into()))?;
        let done = self.dir.join(PROCESSED_DIR).join(name);
        std::fs::rename(path, &done)
            .map_err(|e| DeployError::Internal(format!("archive spool entry: {}", e)))?;

        let outcome = match result {
            Some(result) => serde_json::to_vec_pretty(result)
                .map_err(|e| DeployError::Internal(e.to_string()))?,
            None => b"{\"status\":\"HANDED_OVER\"}".to_vec(),
        };
        keel_config::write_atomically(&done.with_extension("result.json"), &outcome)?;
        Ok(())
    }

    /// Serve the spool against a kernel until cancelled by dropping the
    /// future: poll, deploy each document in order, record results.
    pub async fn serve<C: Clock>(&self, kernel: &Kernel<C>, poll_interval: Duration) {
        loop {
            match self.poll() {
                Ok(docs) => {
                    for (path, doc) in docs {
                        info!(path = %path.display(), deployment_id = %doc.deployment_id,
                              "spooled deployment picked up");
                        let result = kernel.deploy(doc).result().await;
                        if let Err(e) = self.finish(&path, result.as_ref()) {
                            warn!(path = %path.display(), error = %e, "spool bookkeeping failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "spool poll failed"),
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_doc(dir: &Path, name: &str, id: &str, ts: u64) {
        let doc = json!({
            "deploymentId": id,
            "timestamp": ts,
            "groupName": "default",
            "packages": {}
        });
        std::fs::write(dir.join(name), serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn poll_returns_docs_in_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = DeploymentSpool::new(tmp.path()).unwrap();
        write_doc(tmp.path(), "002-second.json", "d-2", 2);
        write_doc(tmp.path(), "001-first.json", "d-1", 1);

        let docs = spool.poll().unwrap();
        let ids: Vec<&str> = docs.iter().map(|(_, d)| d.deployment_id.as_str()).collect();
        assert_eq!(ids, vec!["d-1", "d-2"]);
    }

    #[tokio::test]
    async fn malformed_doc_is_set_aside() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = DeploymentSpool::new(tmp.path()).unwrap();
        std::fs::write(tmp.path().join("bad.json"), b"{ nope").unwrap();
        write_doc(tmp.path(), "good.json", "d-1", 1);

        let docs = spool.poll().unwrap();
        assert_eq!(docs.len(), 1);
        assert!(tmp.path().join("bad.rejected").exists());
        // the rejected file does not come back on the next poll
        assert_eq!(spool.poll().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finish_archives_doc_and_records_result() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = DeploymentSpool::new(tmp.path()).unwrap();
        write_doc(tmp.path(), "one.json", "d-1", 1);
        let (path, _) = spool.poll().unwrap().remove(0);

        spool
            .finish(&path, Some(&DeploymentResult::Successful))
            .unwrap();
        assert!(!path.exists());
        let done = tmp.path().join(PROCESSED_DIR).join("one.json");
        assert!(done.exists());
        let result: DeploymentResult = serde_json::from_slice(
            &std::fs::read(done.with_extension("result.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(result, DeploymentResult::Successful);
    }
}
