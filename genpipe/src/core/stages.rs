//! Immutable stage definitions and plan validation.

use std::collections::HashSet;

use crate::core::types::{FailurePolicy, StageId};

/// Static definition of one stage: position comes from its index in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDef {
    pub id: StageId,
    pub predecessors: &'static [StageId],
    pub policy: FailurePolicy,
}

/// Standard build-and-publish plan.
///
/// Archiving runs last so documents are only retained for runs whose code was
/// published.
pub const STANDARD_PLAN: [StageDef; 6] = [
    StageDef {
        id: StageId::Acquire,
        predecessors: &[],
        policy: FailurePolicy::FailFast,
    },
    StageDef {
        id: StageId::PrepareToolchain,
        predecessors: &[StageId::Acquire],
        policy: FailurePolicy::FailFast,
    },
    StageDef {
        id: StageId::Assemble,
        predecessors: &[StageId::Acquire],
        policy: FailurePolicy::FailFast,
    },
    StageDef {
        id: StageId::Generate,
        predecessors: &[StageId::Assemble, StageId::PrepareToolchain],
        policy: FailurePolicy::FailFast,
    },
    StageDef {
        id: StageId::Publish,
        predecessors: &[StageId::Generate],
        policy: FailurePolicy::FailFast,
    },
    StageDef {
        id: StageId::Archive,
        predecessors: &[StageId::Generate, StageId::Publish],
        policy: FailurePolicy::FailFast,
    },
];

/// Ordered, validated list of stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<StageDef>,
}

impl StagePlan {
    /// Build a plan, rejecting duplicates and predecessors that do not run earlier.
    pub fn new(stages: Vec<StageDef>) -> Result<Self, String> {
        let plan = Self { stages };
        let errors = plan.validate();
        if !errors.is_empty() {
            return Err(errors.join("; "));
        }
        Ok(plan)
    }

    pub fn standard() -> Self {
        Self {
            stages: STANDARD_PLAN.to_vec(),
        }
    }

    pub fn stages(&self) -> &[StageDef] {
        &self.stages
    }

    pub fn get(&self, id: StageId) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Collect every ordering violation in the plan.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let all: HashSet<StageId> = self.stages.iter().map(|s| s.id).collect();
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id) {
                errors.push(format!("duplicate stage {}", stage.id));
                continue;
            }
            for pred in stage.predecessors {
                if *pred == stage.id {
                    errors.push(format!("stage {} depends on itself", stage.id));
                } else if !all.contains(pred) {
                    errors.push(format!(
                        "stage {} depends on unknown stage {pred}",
                        stage.id
                    ));
                } else if !seen.contains(pred) {
                    errors.push(format!(
                        "stage {} depends on {pred}, which runs later",
                        stage.id
                    ));
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_plan_is_valid() {
        assert!(StagePlan::standard().validate().is_empty());
    }

    #[test]
    fn standard_plan_is_fail_fast_everywhere() {
        assert!(
            StagePlan::standard()
                .stages()
                .iter()
                .all(|s| s.policy == FailurePolicy::FailFast)
        );
    }

    #[test]
    fn rejects_predecessor_that_runs_later() {
        let err = StagePlan::new(vec![
            StageDef {
                id: StageId::Generate,
                predecessors: &[StageId::Assemble],
                policy: FailurePolicy::FailFast,
            },
            StageDef {
                id: StageId::Assemble,
                predecessors: &[],
                policy: FailurePolicy::FailFast,
            },
        ])
        .unwrap_err();
        assert!(err.contains("runs later"), "{err}");
    }

    #[test]
    fn rejects_unknown_and_duplicate_stages() {
        let errors = StagePlan {
            stages: vec![
                StageDef {
                    id: StageId::Publish,
                    predecessors: &[StageId::Generate],
                    policy: FailurePolicy::FailFast,
                },
                StageDef {
                    id: StageId::Publish,
                    predecessors: &[],
                    policy: FailurePolicy::FailFast,
                },
            ],
        }
        .validate();
        assert!(errors.iter().any(|e| e.contains("unknown stage generate")));
        assert!(errors.iter().any(|e| e.contains("duplicate stage publish")));
    }
}
