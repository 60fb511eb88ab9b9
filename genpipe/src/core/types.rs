//! Shared deterministic types for pipeline core logic.
//!
//! These types define stable contracts between the orchestrator, the stage
//! engine and the run report. They carry no I/O and serialize to stable JSON.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named unit of pipeline work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    Acquire,
    PrepareToolchain,
    Assemble,
    Generate,
    Publish,
    Archive,
}

impl StageId {
    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Acquire => "acquire",
            StageId::PrepareToolchain => "prepare-toolchain",
            StageId::Assemble => "assemble",
            StageId::Generate => "generate",
            StageId::Publish => "publish",
            StageId::Archive => "archive",
        }
    }

    /// Run state the orchestrator is in while this stage executes.
    pub fn run_state(self) -> RunState {
        match self {
            StageId::Acquire => RunState::Acquiring,
            StageId::PrepareToolchain => RunState::Preparing,
            StageId::Assemble => RunState::Assembling,
            StageId::Generate => RunState::Generating,
            StageId::Publish => RunState::Publishing,
            StageId::Archive => RunState::Archiving,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the run does when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// First failure ends the run; remaining stages are skipped.
    FailFast,
    /// Record the failure and keep going; dependents of this stage are skipped.
    BestEffort,
}

/// Outcome classification for one stage in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Recorded outcome of one stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageId,
    pub status: StageStatus,
    /// Error text and tool output for failures, skip reason for skips.
    pub diagnostic: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Idle,
    Acquiring,
    Preparing,
    Assembling,
    Generating,
    Publishing,
    Archiving,
    Succeeded,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Aborted
        )
    }
}

/// Externally visible terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed { stage: String, reason: String },
    Aborted { reason: String },
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }

    pub fn terminal_state(&self) -> RunState {
        match self {
            RunStatus::Succeeded => RunState::Succeeded,
            RunStatus::Failed { .. } => RunState::Failed,
            RunStatus::Aborted { .. } => RunState::Aborted,
        }
    }
}

/// External generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    DocumentTdd,
    DocumentFdd,
    CodeTranslation,
}

impl JobKind {
    /// All jobs in reporting order.
    pub const ALL: [JobKind; 3] = [
        JobKind::DocumentTdd,
        JobKind::DocumentFdd,
        JobKind::CodeTranslation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::DocumentTdd => "document-tdd",
            JobKind::DocumentFdd => "document-fdd",
            JobKind::CodeTranslation => "code-translation",
        }
    }

    /// Dedicated output subdirectory relative to the output root.
    pub fn output_subdir(self) -> &'static str {
        match self {
            JobKind::DocumentTdd => "docs/tdd",
            JobKind::DocumentFdd => "docs/fdd",
            JobKind::CodeTranslation => "code",
        }
    }

    /// Stable document file name, `None` for the code tree.
    pub fn document_name(self) -> Option<&'static str> {
        match self {
            JobKind::DocumentTdd => Some("TDD.docx"),
            JobKind::DocumentFdd => Some("FDD.docx"),
            JobKind::CodeTranslation => None,
        }
    }

    pub fn needs_input_artifact(self) -> bool {
        self == JobKind::CodeTranslation
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of publishing the generated code tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum PublishResult {
    /// A new commit was created and force-pushed.
    Pushed { commit: String },
    /// The generated tree matched the remote branch tip; nothing was committed.
    NoChanges { commit: String },
}

impl PublishResult {
    pub fn commit(&self) -> &str {
        match self {
            PublishResult::Pushed { commit } | PublishResult::NoChanges { commit } => commit,
        }
    }
}
