//! Force-publish of the generated code tree.
//!
//! The generated directory becomes a fresh repository whose single branch is
//! pushed over the remote branch. Before staging, HEAD is pointed at the
//! current remote tip so an unchanged tree produces no new commit.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::types::PublishResult;
use crate::error::PipelineError;
use crate::io::cancel::CancelToken;
use crate::io::credentials::CredentialRef;
use crate::io::git::{Author, Git, GitError};

const REMOTE: &str = "origin";
/// Carries the resolved secret to the credential helper; never passed on argv.
const SECRET_ENV: &str = "GENPIPE_GIT_SECRET";
const CREDENTIAL_HELPER: &str = "credential.helper=!f() { echo username=x-access-token; echo \"password=$GENPIPE_GIT_SECRET\"; }; f";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub code_dir: PathBuf,
    pub repo_url: String,
    pub branch: String,
    pub commit_message: String,
    pub author: Author,
    pub credential: CredentialRef,
}

/// Makes a remote branch mirror a local directory.
pub trait CodePublisher: Send + Sync {
    fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct GitPublisher {
    timeout: Duration,
    cancel: CancelToken,
}

impl GitPublisher {
    pub fn new(timeout: Duration, cancel: CancelToken) -> Self {
        Self { timeout, cancel }
    }

    fn git_for(&self, request: &PublishRequest) -> Result<Git, PipelineError> {
        let git = Git::new(&request.code_dir, self.cancel.clone()).with_timeout(self.timeout);
        let secret = request
            .credential
            .resolve()
            .map_err(|reason| PipelineError::publish(format!("credential: {reason}")))?;
        Ok(match secret {
            Some(secret) => {
                debug!("injecting publish credential");
                git.with_config("credential.helper=")
                    .with_config(CREDENTIAL_HELPER)
                    .with_env(SECRET_ENV, secret.expose())
            }
            None => git,
        })
    }
}

impl CodePublisher for GitPublisher {
    #[instrument(skip_all, fields(repo = %request.repo_url, branch = %request.branch))]
    fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PipelineError> {
        if !request.code_dir.is_dir() {
            return Err(PipelineError::publish(format!(
                "code directory {} does not exist",
                request.code_dir.display()
            )));
        }
        let git = self.git_for(request)?;
        let branch = request.branch.as_str();

        git.init().map_err(publish_error)?;
        git.add_remote(REMOTE, &request.repo_url)
            .map_err(publish_error)?;
        git.checkout_force_branch(branch).map_err(publish_error)?;

        if git.remote_branch_exists(REMOTE, branch).map_err(publish_error)? {
            debug!("remote branch exists, basing commit on its tip");
            git.fetch_tip(REMOTE, branch).map_err(publish_error)?;
            git.reset_mixed("FETCH_HEAD").map_err(publish_error)?;
        }

        git.add_all().map_err(publish_error)?;
        if !git
            .commit_staged(&request.commit_message, &request.author)
            .map_err(publish_error)?
        {
            return match git.head_sha().map_err(publish_error)? {
                Some(commit) => {
                    info!(%commit, "no changes to publish");
                    Ok(PublishResult::NoChanges { commit })
                }
                None => Err(PipelineError::publish(
                    "generated tree is empty and the remote branch does not exist",
                )),
            };
        }

        let commit = git
            .head_sha()
            .map_err(publish_error)?
            .ok_or_else(|| PipelineError::publish("commit did not produce a HEAD"))?;
        git.push_force(REMOTE, branch).map_err(publish_error)?;
        info!(%commit, "pushed");
        Ok(PublishResult::Pushed { commit })
    }
}

fn publish_error(err: GitError) -> PipelineError {
    match err {
        GitError::Cancelled { command } => {
            PipelineError::aborted(format!("git {command} cancelled"))
        }
        other => {
            warn!(err = %other, "publish git call failed");
            PipelineError::publish(other.to_string())
        }
    }
}
