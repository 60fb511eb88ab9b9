//! Error taxonomy for pipeline stages.
//!
//! Every stage action returns [`PipelineError`]. The orchestrator surfaces the
//! first failure verbatim together with the stage that produced it.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::JobKind;

/// Failure raised by a pipeline stage or by the run lifecycle itself.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Workspace provisioning, locking, or cleanup failed.
    #[error("resource error: {context}")]
    Resource {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A repository checkout failed (network, auth, unknown branch, timeout).
    #[error("acquisition of {repo} ({branch}) failed: {reason}")]
    Acquisition {
        repo: String,
        branch: String,
        reason: String,
    },

    /// A required source file was found in none of the search paths.
    #[error("missing expected file: {file} (searched {})", display_paths(.searched))]
    MissingInput { file: String, searched: Vec<PathBuf> },

    /// An external generation job exited nonzero, timed out, or produced nothing.
    #[error("generation job {job} failed (exit {}): {reason}", display_code(.exit_code))]
    Generation {
        job: JobKind,
        exit_code: Option<i32>,
        reason: String,
        output: String,
    },

    /// The archive pattern matched no generated files.
    #[error("archive of '{pattern}' failed: {reason}")]
    Archive { pattern: String, reason: String },

    /// Code publishing failed for a reason other than "nothing to commit".
    #[error("publish failed: {reason}")]
    Publish { reason: String },

    /// The run was cancelled externally.
    #[error("aborted: {reason}")]
    Aborted { reason: String },

    /// Another run holds the pipeline lock.
    #[error("another run is active ({holder})")]
    Busy { holder: String },
}

impl PipelineError {
    pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source: Some(source),
        }
    }

    pub fn resource_msg(context: impl Into<String>) -> Self {
        Self::Resource {
            context: context.into(),
            source: None,
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    pub fn publish(reason: impl Into<String>) -> Self {
        Self::Publish {
            reason: reason.into(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Raw diagnostic output captured from the failing tool, if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Generation { output, .. } if !output.trim().is_empty() => Some(output),
            _ => None,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_names_file_and_search_paths() {
        let err = PipelineError::MissingInput {
            file: "B.h".to_string(),
            searched: vec![PathBuf::from("src/B.h"), PathBuf::from("src/sub/B.h")],
        };
        assert_eq!(
            err.to_string(),
            "missing expected file: B.h (searched src/B.h, src/sub/B.h)"
        );
    }

    #[test]
    fn generation_error_exposes_diagnostic() {
        let err = PipelineError::Generation {
            job: JobKind::CodeTranslation,
            exit_code: Some(2),
            reason: "nonzero exit".to_string(),
            output: "Traceback: boom".to_string(),
        };
        assert!(err.to_string().contains("code-translation"));
        assert!(err.to_string().contains("exit 2"));
        assert_eq!(err.diagnostic(), Some("Traceback: boom"));
    }

    #[test]
    fn timed_out_generation_reports_no_exit_code() {
        let err = PipelineError::Generation {
            job: JobKind::DocumentTdd,
            exit_code: None,
            reason: "timed out".to_string(),
            output: String::new(),
        };
        assert!(err.to_string().contains("exit none"));
        assert_eq!(err.diagnostic(), None);
    }
}
