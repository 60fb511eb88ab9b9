//! Per-run workspace directories.
//!
//! Each run gets an isolated directory `<root>/<run_id>` that is created empty
//! at the start of the run and removed when the run ends, whatever the outcome.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, warn};

use crate::error::PipelineError;

/// Provisions and wipes run workspaces.
pub trait WorkspaceManager: Send + Sync {
    /// Create a fresh, empty, writable directory for `run_id`.
    fn acquire(&self, run_id: &str) -> Result<PathBuf, PipelineError>;

    /// Remove a workspace and everything in it. A missing directory is not an error.
    fn release(&self, path: &Path) -> Result<(), PipelineError>;
}

/// Workspaces as subdirectories of a local root.
#[derive(Debug, Clone)]
pub struct DirWorkspaceManager {
    root: PathBuf,
}

impl DirWorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl WorkspaceManager for DirWorkspaceManager {
    fn acquire(&self, run_id: &str) -> Result<PathBuf, PipelineError> {
        fs::create_dir_all(&self.root).map_err(|e| {
            PipelineError::resource(format!("create workspace root {}", self.root.display()), e)
        })?;
        let dir = self.root.join(run_id);
        // `create_dir` (not `create_dir_all`) so an existing directory means another holder.
        fs::create_dir(&dir).map_err(|e| {
            let context = if e.kind() == ErrorKind::AlreadyExists {
                format!("workspace {} is already in use", dir.display())
            } else {
                format!("create workspace {}", dir.display())
            };
            PipelineError::resource(context, e)
        })?;
        // Tools run with other working directories, so hand out an absolute path.
        let dir = fs::canonicalize(&dir).map_err(|e| {
            PipelineError::resource(format!("resolve workspace {}", dir.display()), e)
        })?;

        let probe = dir.join(".write-probe");
        if let Err(e) = fs::write(&probe, b"").and_then(|()| fs::remove_file(&probe)) {
            let _ = fs::remove_dir_all(&dir);
            return Err(PipelineError::resource(
                format!("workspace {} is not writable", dir.display()),
                e,
            ));
        }

        info!(workspace = %dir.display(), "workspace acquired");
        Ok(dir)
    }

    fn release(&self, path: &Path) -> Result<(), PipelineError> {
        match fs::remove_dir_all(path) {
            Ok(()) => {
                info!(workspace = %path.display(), "workspace released");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(workspace = %path.display(), "workspace already gone");
                Ok(())
            }
            Err(e) => Err(PipelineError::resource(
                format!("remove workspace {}", path.display()),
                e,
            )),
        }
    }
}

/// Scoped workspace: released exactly once, on explicit [`release`](Self::release)
/// or on drop.
pub struct WorkspaceScope<'a> {
    manager: &'a dyn WorkspaceManager,
    path: PathBuf,
    released: bool,
}

impl<'a> WorkspaceScope<'a> {
    pub fn acquire(manager: &'a dyn WorkspaceManager, run_id: &str) -> Result<Self, PipelineError> {
        let path = manager.acquire(run_id)?;
        Ok(Self {
            manager,
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now and report the result.
    pub fn release(mut self) -> Result<(), PipelineError> {
        self.released = true;
        self.manager.release(&self.path)
    }
}

impl Drop for WorkspaceScope<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        warn!(workspace = %self.path.display(), "workspace dropped without release, cleaning up");
        if let Err(err) = self.manager.release(&self.path) {
            warn!(workspace = %self.path.display(), err = %err, "workspace cleanup failed");
        }
    }
}

/// New run identifier: `run-<YYYYmmdd_HHMMSS>-<6 lowercase alphanumerics>`.
pub fn generate_run_id() -> String {
    build_run_id(&generate_timestamp(), &generate_short_id())
}

pub fn build_run_id(timestamp: &str, short_id: &str) -> String {
    format!("run-{timestamp}-{short_id}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CountingWorkspaceManager;

    #[test]
    fn acquire_creates_empty_dir_and_rejects_reuse() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DirWorkspaceManager::new(temp.path().join("ws"));

        let dir = manager.acquire("run-a").expect("acquire");
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).expect("read dir").count(), 0);

        let err = manager.acquire("run-a").unwrap_err();
        assert!(err.to_string().contains("already in use"), "{err}");
    }

    #[test]
    fn release_removes_tree_and_tolerates_missing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DirWorkspaceManager::new(temp.path());
        let dir = manager.acquire("run-b").expect("acquire");
        fs::create_dir_all(dir.join("nested/deeper")).expect("mkdir");
        fs::write(dir.join("nested/deeper/file.txt"), "x").expect("write");

        manager.release(&dir).expect("release");
        assert!(!dir.exists());
        manager.release(&dir).expect("second release is a no-op");
    }

    #[test]
    fn scope_releases_once_on_explicit_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = CountingWorkspaceManager::new(temp.path());
        let scope = WorkspaceScope::acquire(&manager, "run-c").expect("scope");
        let path = scope.path().to_path_buf();
        scope.release().expect("release");
        assert!(!path.exists());
        assert_eq!(manager.releases(), 1);
    }

    /// Dropping a scope (early return, panic unwind) still wipes the workspace.
    #[test]
    fn scope_drop_releases_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = CountingWorkspaceManager::new(temp.path());
        let path = {
            let scope = WorkspaceScope::acquire(&manager, "run-d").expect("scope");
            scope.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(manager.releases(), 1);
    }

    #[test]
    fn run_ids_follow_expected_shape() {
        assert_eq!(
            build_run_id("20260101_120000", "ab12cd"),
            "run-20260101_120000-ab12cd"
        );
        let id = generate_run_id();
        let suffix = id.rsplit('-').next().expect("suffix");
        assert!(id.starts_with("run-"));
        assert_eq!(suffix.len(), 6);
        assert!(
            suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }
}
