//! Stage sequencing engine.
//!
//! Walks a validated [`StagePlan`] in order, applying dependency gating,
//! per-stage failure policy, and cancellation. The engine owns no I/O: stage
//! work is supplied by the caller as a callback.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::stages::StagePlan;
use crate::core::types::{FailurePolicy, RunState, RunStatus, StageId, StageResult, StageStatus};
use crate::error::PipelineError;

/// What a stage action reports when it returns without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage did its work.
    Completed,
    /// Nothing to do for this run (e.g. no setup command configured).
    NotApplicable,
}

/// The failure that ended (or, for best-effort stages, marked) a run.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: StageId,
    pub error: PipelineError,
}

/// Result of walking a plan.
#[derive(Debug)]
pub struct PlanExecution {
    pub results: Vec<StageResult>,
    pub status: RunStatus,
    /// First fail-fast failure (or abort), surfaced verbatim to the caller.
    pub failure: Option<StageFailure>,
}

const NOT_APPLICABLE: &str = "not applicable";

/// Execute `plan` stage by stage.
///
/// `cancelled` is polled before each stage and returns the abort reason once a
/// cancellation was requested. `on_state` observes every state transition.
pub fn execute_plan<C, S, F>(
    plan: &StagePlan,
    cancelled: C,
    mut on_state: S,
    mut action: F,
) -> PlanExecution
where
    C: Fn() -> Option<String>,
    S: FnMut(RunState),
    F: FnMut(StageId) -> Result<StageOutcome, PipelineError>,
{
    let mut results = Vec::with_capacity(plan.stages().len());
    let mut satisfied: HashSet<StageId> = HashSet::new();
    let mut failure: Option<StageFailure> = None;
    let mut abort_reason: Option<String> = None;

    for stage in plan.stages() {
        if abort_reason.is_none()
            && failure.is_none()
            && let Some(reason) = cancelled()
        {
            warn!(stage = %stage.id, %reason, "run cancelled before stage");
            abort_reason = Some(reason);
        }

        if let Some(reason) = &abort_reason {
            results.push(skipped(stage.id, format!("aborted: {reason}")));
            continue;
        }
        if let Some(f) = &failure {
            results.push(skipped(stage.id, format!("{} failed", f.stage)));
            continue;
        }
        if let Some(unmet) = stage.predecessors.iter().find(|p| !satisfied.contains(*p)) {
            debug!(stage = %stage.id, unmet = %unmet, "predecessor not satisfied");
            results.push(skipped(stage.id, format!("predecessor {unmet} did not succeed")));
            continue;
        }

        on_state(stage.id.run_state());
        info!(stage = %stage.id, "stage started");
        let started_at = Utc::now();
        let outcome = action(stage.id);
        let ended_at = Utc::now();

        match outcome {
            Ok(StageOutcome::Completed) => {
                info!(stage = %stage.id, "stage succeeded");
                satisfied.insert(stage.id);
                results.push(StageResult {
                    stage: stage.id,
                    status: StageStatus::Succeeded,
                    diagnostic: None,
                    started_at,
                    ended_at,
                });
            }
            Ok(StageOutcome::NotApplicable) => {
                info!(stage = %stage.id, "stage not applicable");
                satisfied.insert(stage.id);
                results.push(StageResult {
                    stage: stage.id,
                    status: StageStatus::Skipped,
                    diagnostic: Some(NOT_APPLICABLE.to_string()),
                    started_at,
                    ended_at,
                });
            }
            Err(error) => {
                warn!(stage = %stage.id, err = %error, "stage failed");
                results.push(StageResult {
                    stage: stage.id,
                    status: StageStatus::Failed,
                    diagnostic: Some(render_diagnostic(&error)),
                    started_at,
                    ended_at,
                });
                if let PipelineError::Aborted { reason } = &error {
                    abort_reason = Some(reason.clone());
                    failure = Some(StageFailure {
                        stage: stage.id,
                        error,
                    });
                } else if stage.policy == FailurePolicy::FailFast {
                    failure = Some(StageFailure {
                        stage: stage.id,
                        error,
                    });
                }
            }
        }
    }

    let status = match (&abort_reason, &failure) {
        (Some(reason), _) => RunStatus::Aborted {
            reason: reason.clone(),
        },
        (None, Some(f)) => RunStatus::Failed {
            stage: f.stage.to_string(),
            reason: f.error.to_string(),
        },
        (None, None) => RunStatus::Succeeded,
    };
    on_state(status.terminal_state());

    PlanExecution {
        results,
        status,
        failure,
    }
}

fn skipped(stage: StageId, reason: String) -> StageResult {
    let now = Utc::now();
    StageResult {
        stage,
        status: StageStatus::Skipped,
        diagnostic: Some(reason),
        started_at: now,
        ended_at: now,
    }
}

fn render_diagnostic(error: &PipelineError) -> String {
    match error.diagnostic() {
        Some(output) => format!("{error}\n{output}"),
        None => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::core::stages::StageDef;

    fn statuses(exec: &PlanExecution) -> Vec<(StageId, StageStatus)> {
        exec.results.iter().map(|r| (r.stage, r.status)).collect()
    }

    fn never_cancelled() -> Option<String> {
        None
    }

    #[test]
    fn runs_every_stage_in_order_on_success() {
        let mut order = Vec::new();
        let mut states = Vec::new();
        let exec = execute_plan(
            &StagePlan::standard(),
            never_cancelled,
            |s| states.push(s),
            |stage| {
                order.push(stage);
                Ok(StageOutcome::Completed)
            },
        );
        assert_eq!(exec.status, RunStatus::Succeeded);
        assert_eq!(
            order,
            vec![
                StageId::Acquire,
                StageId::PrepareToolchain,
                StageId::Assemble,
                StageId::Generate,
                StageId::Publish,
                StageId::Archive,
            ]
        );
        assert_eq!(states.first(), Some(&RunState::Acquiring));
        assert_eq!(states.last(), Some(&RunState::Succeeded));
        assert!(exec.failure.is_none());
    }

    #[test]
    fn fail_fast_skips_remaining_stages() {
        let exec = execute_plan(
            &StagePlan::standard(),
            never_cancelled,
            |_| {},
            |stage| match stage {
                StageId::Generate => Err(PipelineError::Generation {
                    job: crate::core::types::JobKind::DocumentFdd,
                    exit_code: Some(1),
                    reason: "nonzero exit".to_string(),
                    output: "stack trace".to_string(),
                }),
                _ => Ok(StageOutcome::Completed),
            },
        );
        assert_eq!(
            statuses(&exec),
            vec![
                (StageId::Acquire, StageStatus::Succeeded),
                (StageId::PrepareToolchain, StageStatus::Succeeded),
                (StageId::Assemble, StageStatus::Succeeded),
                (StageId::Generate, StageStatus::Failed),
                (StageId::Publish, StageStatus::Skipped),
                (StageId::Archive, StageStatus::Skipped),
            ]
        );
        match &exec.status {
            RunStatus::Failed { stage, reason } => {
                assert_eq!(stage, "generate");
                assert!(reason.contains("document-fdd"));
            }
            other => panic!("unexpected status {other:?}"),
        }
        let generate = &exec.results[3];
        assert!(
            generate
                .diagnostic
                .as_deref()
                .is_some_and(|d| d.contains("stack trace"))
        );
        assert_eq!(exec.failure.map(|f| f.stage), Some(StageId::Generate));
    }

    #[test]
    fn not_applicable_stage_satisfies_dependents() {
        let exec = execute_plan(
            &StagePlan::standard(),
            never_cancelled,
            |_| {},
            |stage| match stage {
                StageId::PrepareToolchain => Ok(StageOutcome::NotApplicable),
                _ => Ok(StageOutcome::Completed),
            },
        );
        assert_eq!(exec.status, RunStatus::Succeeded);
        assert_eq!(exec.results[1].status, StageStatus::Skipped);
        assert_eq!(exec.results[3].status, StageStatus::Succeeded);
    }

    #[test]
    fn best_effort_failure_skips_only_dependents() {
        let plan = StagePlan::new(vec![
            StageDef {
                id: StageId::Acquire,
                predecessors: &[],
                policy: FailurePolicy::BestEffort,
            },
            StageDef {
                id: StageId::Assemble,
                predecessors: &[StageId::Acquire],
                policy: FailurePolicy::FailFast,
            },
            StageDef {
                id: StageId::Archive,
                predecessors: &[],
                policy: FailurePolicy::FailFast,
            },
        ])
        .expect("plan");
        let exec = execute_plan(
            &plan,
            never_cancelled,
            |_| {},
            |stage| match stage {
                StageId::Acquire => Err(PipelineError::Acquisition {
                    repo: "r".to_string(),
                    branch: "b".to_string(),
                    reason: "offline".to_string(),
                }),
                _ => Ok(StageOutcome::Completed),
            },
        );
        assert_eq!(
            statuses(&exec),
            vec![
                (StageId::Acquire, StageStatus::Failed),
                (StageId::Assemble, StageStatus::Skipped),
                (StageId::Archive, StageStatus::Succeeded),
            ]
        );
        assert_eq!(exec.status, RunStatus::Succeeded);
    }

    #[test]
    fn cancellation_before_stage_aborts_run() {
        let calls = Cell::new(0);
        let exec = execute_plan(
            &StagePlan::standard(),
            || (calls.get() >= 2).then(|| "ctrl-c".to_string()),
            |_| {},
            |_| {
                calls.set(calls.get() + 1);
                Ok(StageOutcome::Completed)
            },
        );
        assert_eq!(calls.get(), 2);
        assert_eq!(
            exec.status,
            RunStatus::Aborted {
                reason: "ctrl-c".to_string()
            }
        );
        assert!(
            exec.results[2..]
                .iter()
                .all(|r| r.status == StageStatus::Skipped)
        );
    }

    #[test]
    fn aborted_stage_error_ends_run_as_aborted() {
        let exec = execute_plan(
            &StagePlan::standard(),
            never_cancelled,
            |_| {},
            |stage| match stage {
                StageId::Acquire => Err(PipelineError::aborted("killed checkout")),
                _ => Ok(StageOutcome::Completed),
            },
        );
        assert_eq!(
            exec.status,
            RunStatus::Aborted {
                reason: "killed checkout".to_string()
            }
        );
        assert_eq!(exec.results[0].status, StageStatus::Failed);
        assert!(
            exec.results[1..]
                .iter()
                .all(|r| r.status == StageStatus::Skipped)
        );
    }
}
