//! Orchestration of one pipeline run.
//!
//! [`Orchestrator::trigger`] takes the run lock, provisions a workspace, walks
//! the standard stage plan through [`execute_plan`], writes the run report and
//! releases the workspace on every exit path.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use crate::core::engine::{StageOutcome, execute_plan};
use crate::core::stages::StagePlan;
use crate::core::types::{JobKind, PublishResult, RunState, RunStatus, StageId, StageResult};
use crate::error::PipelineError;
use crate::io::acquire::{FetchRequest, GitSourceAcquirer, SourceAcquirer};
use crate::io::archive::{ArchiveReceipt, ArtifactStore, DirArtifactStore};
use crate::io::assemble::{MergedArtifact, assemble};
use crate::io::cancel::CancelToken;
use crate::io::config::PipelineConfig;
use crate::io::credentials::CredentialRef;
use crate::io::generate::{
    GenerateRequest, GeneratedOutput, Generator, ToolchainGenerator, collect_results, run_jobs,
    write_job_log,
};
use crate::io::lock::{RunGate, RunLock};
use crate::io::process::run_command;
use crate::io::publish::{CodePublisher, GitPublisher, PublishRequest};
use crate::io::run_report::{RUN_REPORT_FILE, RunReport, write_run_report};
use crate::io::workspace::{
    DirWorkspaceManager, WorkspaceManager, WorkspaceScope, generate_run_id,
};

/// Checkout directory of the native sources inside a run workspace.
pub const SOURCE_DIR: &str = "source_code";
/// Checkout directory of the generation toolchain inside a run workspace.
pub const TOOLCHAIN_DIR: &str = "toolchain";
/// Merged artifact file name inside a run workspace.
pub const MERGED_ARTIFACT: &str = "merged.cpp";
const LOG_DIR: &str = "logs";

/// External collaborators of a run.
pub struct Collaborators {
    pub workspace: Box<dyn WorkspaceManager>,
    pub acquirer: Box<dyn SourceAcquirer>,
    pub generator: Box<dyn Generator>,
    pub publisher: Box<dyn CodePublisher>,
    pub store: Box<dyn ArtifactStore>,
}

impl Collaborators {
    /// Production wiring: local directories, `git` and the configured toolchain.
    pub fn from_config(config: &PipelineConfig, cancel: &CancelToken) -> Self {
        Self {
            workspace: Box::new(DirWorkspaceManager::new(&config.workspace_root)),
            acquirer: Box::new(GitSourceAcquirer::new(
                config.timeouts.checkout(),
                config.checkout_depth,
                cancel.clone(),
            )),
            generator: Box::new(ToolchainGenerator::new(
                config.toolchain.command.clone(),
                config.timeouts.generation(),
                config.output_limit_bytes,
                cancel.clone(),
            )),
            publisher: Box::new(GitPublisher::new(config.timeouts.publish(), cancel.clone())),
            store: Box::new(DirArtifactStore::new(&config.archive_root)),
        }
    }
}

/// One execution of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub state: RunState,
    /// Every state entered, starting with `Idle`.
    pub history: Vec<RunState>,
    pub status: Option<RunStatus>,
}

impl Run {
    fn new(id: String) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            state: RunState::Idle,
            history: vec![RunState::Idle],
            status: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(run_id = %self.id, ?state, "run state");
        self.state = state;
        self.history.push(state);
    }
}

/// What a finished run reports.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// One result per planned stage, in plan order.
    pub stages: Vec<StageResult>,
    /// Archived document locations in the artifact store.
    pub documents: Vec<PathBuf>,
    pub publish: Option<PublishResult>,
    /// States the run passed through.
    pub states: Vec<RunState>,
    /// Diagnostic of the failing stage (error text plus tool output).
    pub diagnostic: Option<String>,
}

impl RunOutcome {
    pub fn stage(&self, id: StageId) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == id)
    }
}

/// Pipeline driver. Only one run executes at a time per [`RunGate`] and workspace root.
pub struct Orchestrator {
    config: PipelineConfig,
    collaborators: Collaborators,
    plan: StagePlan,
    gate: RunGate,
    cancel: CancelToken,
}

impl Orchestrator {
    /// Production orchestrator sharing the process-wide run gate.
    pub fn new(config: PipelineConfig, cancel: CancelToken) -> Self {
        let collaborators = Collaborators::from_config(&config, &cancel);
        Self::with_collaborators(config, collaborators, cancel)
    }

    pub fn with_collaborators(
        config: PipelineConfig,
        collaborators: Collaborators,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            collaborators,
            plan: StagePlan::standard(),
            gate: RunGate::process(),
            cancel,
        }
    }

    /// Use a separate in-process gate (isolated orchestrators in tests).
    pub fn with_gate(mut self, gate: RunGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline once.
    ///
    /// Returns `Err` only when the run could not start (busy lock, unusable
    /// workspace). Stage failures are reported through [`RunOutcome::status`].
    #[instrument(skip_all)]
    pub fn trigger(&self) -> Result<RunOutcome, PipelineError> {
        let run_id = generate_run_id();
        let _lock = RunLock::acquire(
            &self.gate,
            &self.config.workspace_root,
            &run_id,
            self.config.busy_wait(),
        )?;

        let mut run = Run::new(run_id);
        info!(run_id = %run.id, "run started");
        let scope = WorkspaceScope::acquire(self.collaborators.workspace.as_ref(), &run.id)?;

        let run_id = run.id.clone();
        let mut ctx = RunContext::new(scope.path(), &self.config.output_root_dir);
        let execution = execute_plan(
            &self.plan,
            || self.cancel.reason(),
            |state| run.enter(state),
            |stage| self.run_stage(stage, &run_id, &mut ctx),
        );

        let mut status = execution.status;
        let diagnostic = execution.failure.as_ref().map(|f| {
            execution
                .results
                .iter()
                .find(|r| r.stage == f.stage)
                .and_then(|r| r.diagnostic.clone())
                .unwrap_or_else(|| f.error.to_string())
        });
        let documents: Vec<PathBuf> = ctx
            .archive
            .as_ref()
            .map(|receipt| receipt.files.iter().map(|f| f.stored_at.clone()).collect())
            .unwrap_or_default();

        if let Err(err) = scope.release() {
            error!(run_id = %run.id, err = %err, "workspace cleanup failed");
            if status.is_success() {
                status = RunStatus::Failed {
                    stage: "cleanup".to_string(),
                    reason: err.to_string(),
                };
                run.enter(RunState::Failed);
            }
        }
        run.status = Some(status.clone());

        let report = RunReport {
            run_id: run.id.clone(),
            started_at: run.started_at,
            ended_at: Utc::now(),
            status: status.clone(),
            stages: execution.results.clone(),
            documents: documents.clone(),
            publish: ctx.publish.clone(),
        };
        let report_path = self
            .collaborators
            .store
            .run_dir(&run.id)
            .join(RUN_REPORT_FILE);
        if let Err(err) = write_run_report(&report_path, &report) {
            warn!(err = %format!("{err:#}"), "failed to write run report");
        }

        info!(run_id = %run.id, status = ?status, "run finished");
        Ok(RunOutcome {
            run_id: run.id,
            status,
            stages: execution.results,
            documents,
            publish: ctx.publish,
            states: run.history,
            diagnostic,
        })
    }

    fn run_stage(
        &self,
        stage: StageId,
        run_id: &str,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, PipelineError> {
        match stage {
            StageId::Acquire => self.acquire(ctx),
            StageId::PrepareToolchain => self.prepare_toolchain(ctx),
            StageId::Assemble => {
                let artifact = assemble(
                    &ctx.source_dir,
                    &self.config.required_files,
                    &self.config.search_subpaths,
                    &ctx.workspace.join(MERGED_ARTIFACT),
                )?;
                ctx.artifact = Some(artifact);
                Ok(StageOutcome::Completed)
            }
            StageId::Generate => self.generate(ctx),
            StageId::Publish => self.publish(ctx),
            StageId::Archive => {
                let receipt = self.collaborators.store.archive(
                    run_id,
                    &ctx.output_root,
                    &self.config.archive_pattern,
                )?;
                ctx.archive = Some(receipt);
                Ok(StageOutcome::Completed)
            }
        }
    }

    /// Fetch both repositories concurrently; the source checkout's error wins.
    fn acquire(&self, ctx: &RunContext) -> Result<StageOutcome, PipelineError> {
        let source = FetchRequest {
            repo_url: self.config.native_repo_url.clone(),
            branch: self.config.native_repo_branch.clone(),
            target_dir: ctx.source_dir.clone(),
        };
        let toolchain = FetchRequest {
            repo_url: self.config.toolchain_repo_url.clone(),
            branch: self.config.toolchain_repo_branch.clone(),
            target_dir: ctx.toolchain_dir.clone(),
        };
        let acquirer = self.collaborators.acquirer.as_ref();
        let (source_result, toolchain_result) = thread::scope(|scope| {
            let toolchain_handle = scope.spawn(|| acquirer.fetch(&toolchain));
            let source_result = acquirer.fetch(&source);
            let toolchain_result = toolchain_handle.join().unwrap_or_else(|_| {
                Err(PipelineError::resource_msg("toolchain checkout thread panicked"))
            });
            (source_result, toolchain_result)
        });
        source_result?;
        toolchain_result?;
        Ok(StageOutcome::Completed)
    }

    fn prepare_toolchain(&self, ctx: &RunContext) -> Result<StageOutcome, PipelineError> {
        let Some((program, args)) = self.config.toolchain.setup_command.split_first() else {
            info!("no toolchain setup command configured");
            return Ok(StageOutcome::NotApplicable);
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&ctx.toolchain_dir);
        let timeout = self.config.timeouts.setup();
        let output = run_command(cmd, timeout, self.config.output_limit_bytes, &self.cancel)
            .map_err(|err| {
                PipelineError::resource_msg(format!("toolchain setup could not run: {err:#}"))
            })?;
        let log = output.render_log(StageId::PrepareToolchain.as_str());
        write_job_log(&ctx.log_path(StageId::PrepareToolchain.as_str()), &log)?;

        if output.cancelled {
            return Err(PipelineError::aborted("toolchain setup cancelled"));
        }
        if output.timed_out {
            return Err(PipelineError::resource_msg(format!(
                "toolchain setup timed out after {timeout:?}"
            )));
        }
        if !output.success() {
            let stderr = output.stderr_lossy();
            return Err(PipelineError::resource_msg(format!(
                "toolchain setup failed (exit {:?}): {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(StageOutcome::Completed)
    }

    fn generate(&self, ctx: &mut RunContext) -> Result<StageOutcome, PipelineError> {
        let artifact = ctx
            .artifact
            .as_ref()
            .map(|a| a.path.clone())
            .ok_or_else(|| PipelineError::resource_msg("merged artifact is missing"))?;
        let requests: Vec<GenerateRequest> = JobKind::ALL
            .iter()
            .map(|&job| GenerateRequest {
                job,
                toolchain_dir: ctx.toolchain_dir.clone(),
                input_artifact: job.needs_input_artifact().then(|| artifact.clone()),
                output_dir: ctx.output_root.join(job.output_subdir()),
                log_path: ctx.log_path(job.as_str()),
            })
            .collect();
        let results = run_jobs(
            self.collaborators.generator.as_ref(),
            &requests,
            self.config.generation_workers,
        );
        ctx.generated = collect_results(results)?;
        Ok(StageOutcome::Completed)
    }

    fn publish(&self, ctx: &mut RunContext) -> Result<StageOutcome, PipelineError> {
        let code_dir = ctx
            .generated
            .iter()
            .find(|g| g.job == JobKind::CodeTranslation)
            .map(|g| g.output_dir.clone())
            .ok_or_else(|| PipelineError::publish("no generated code tree"))?;
        let credential = CredentialRef::parse(&self.config.credential_ref)
            .map_err(|reason| PipelineError::publish(format!("credential_ref: {reason}")))?;
        let request = PublishRequest {
            code_dir,
            repo_url: self.config.publish_repo_url.clone(),
            branch: self.config.publish_branch.clone(),
            commit_message: self.config.publish.commit_message.clone(),
            author: self.config.publish.author(),
            credential,
        };
        ctx.publish = Some(self.collaborators.publisher.publish(&request)?);
        Ok(StageOutcome::Completed)
    }
}

/// Stage-to-stage handoff within one run.
struct RunContext {
    workspace: PathBuf,
    source_dir: PathBuf,
    toolchain_dir: PathBuf,
    output_root: PathBuf,
    artifact: Option<MergedArtifact>,
    generated: Vec<GeneratedOutput>,
    publish: Option<PublishResult>,
    archive: Option<ArchiveReceipt>,
}

impl RunContext {
    fn new(workspace: &Path, output_root_dir: &str) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            source_dir: workspace.join(SOURCE_DIR),
            toolchain_dir: workspace.join(TOOLCHAIN_DIR),
            output_root: workspace.join(output_root_dir),
            artifact: None,
            generated: Vec::new(),
            publish: None,
            archive: None,
        }
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.output_root.join(LOG_DIR).join(format!("{name}.log"))
    }
}
