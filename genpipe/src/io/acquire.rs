//! Repository checkout.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, instrument};

use crate::error::PipelineError;
use crate::io::cancel::CancelToken;
use crate::io::git::{Git, GitError};

/// One repository to check out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub repo_url: String,
    pub branch: String,
    /// Must not exist yet; the checkout creates it.
    pub target_dir: PathBuf,
}

/// Places a repository branch at a local directory.
pub trait SourceAcquirer: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<(), PipelineError>;
}

/// Checks out with `git clone --single-branch`.
#[derive(Debug, Clone)]
pub struct GitSourceAcquirer {
    timeout: Duration,
    depth: Option<u32>,
    cancel: CancelToken,
}

impl GitSourceAcquirer {
    pub fn new(timeout: Duration, depth: Option<u32>, cancel: CancelToken) -> Self {
        Self {
            timeout,
            depth,
            cancel,
        }
    }
}

impl SourceAcquirer for GitSourceAcquirer {
    #[instrument(skip_all, fields(repo = %request.repo_url, branch = %request.branch))]
    fn fetch(&self, request: &FetchRequest) -> Result<(), PipelineError> {
        let parent = request
            .target_dir
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let git = Git::new(parent, self.cancel.clone()).with_timeout(self.timeout);
        git.clone_branch(
            &request.repo_url,
            &request.branch,
            &request.target_dir,
            self.depth,
        )
        .map_err(|err| acquisition_error(request, err))?;
        info!(target = %request.target_dir.display(), "checkout complete");
        Ok(())
    }
}

fn acquisition_error(request: &FetchRequest, err: GitError) -> PipelineError {
    let reason = match err {
        GitError::Cancelled { .. } => {
            return PipelineError::aborted(format!("checkout of {} cancelled", request.repo_url));
        }
        GitError::Failed { stderr, code, .. } if stderr.is_empty() => {
            format!("git clone exited with {code:?}")
        }
        GitError::Failed { stderr, .. } => stderr,
        other => other.to_string(),
    };
    PipelineError::Acquisition {
        repo: request.repo_url.clone(),
        branch: request.branch.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::{commit_file, init_repo};

    fn acquirer(cancel: CancelToken) -> GitSourceAcquirer {
        GitSourceAcquirer::new(Duration::from_secs(60), Some(1), cancel)
    }

    #[test]
    fn fetch_places_branch_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin");
        init_repo(&origin, "master");
        commit_file(&origin, "GridCtrl.h", "// grid\n");

        let target = temp.path().join("ws/source_code");
        fs::create_dir_all(target.parent().expect("parent")).expect("mkdir");
        acquirer(CancelToken::new())
            .fetch(&FetchRequest {
                repo_url: origin.to_string_lossy().to_string(),
                branch: "master".to_string(),
                target_dir: target.clone(),
            })
            .expect("fetch");
        assert_eq!(
            fs::read_to_string(target.join("GridCtrl.h")).expect("read"),
            "// grid\n"
        );
    }

    #[test]
    fn unknown_branch_is_acquisition_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin");
        init_repo(&origin, "master");
        commit_file(&origin, "README.md", "hi\n");

        let err = acquirer(CancelToken::new())
            .fetch(&FetchRequest {
                repo_url: origin.to_string_lossy().to_string(),
                branch: "nope".to_string(),
                target_dir: temp.path().join("dest"),
            })
            .unwrap_err();
        match err {
            PipelineError::Acquisition { branch, .. } => assert_eq!(branch, "nope"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn cancelled_fetch_is_aborted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        cancel.cancel("operator abort");
        let err = acquirer(cancel)
            .fetch(&FetchRequest {
                repo_url: temp.path().join("missing").to_string_lossy().to_string(),
                branch: "main".to_string(),
                target_dir: temp.path().join("dest"),
            })
            .unwrap_err();
        assert!(err.is_aborted(), "{err}");
    }
}
