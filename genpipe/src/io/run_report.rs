//! Run report (`run.json`) written next to the archived artifacts of a run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{PublishResult, RunStatus, StageResult};

pub const RUN_REPORT_FILE: &str = "run.json";

/// Everything a finished run reports about itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    /// One entry per planned stage, in plan order.
    pub stages: Vec<StageResult>,
    /// Archived document locations.
    #[serde(default)]
    pub documents: Vec<PathBuf>,
    #[serde(default)]
    pub publish: Option<PublishResult>,
}

pub fn load_run_report(path: &Path) -> Result<RunReport> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run report {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse run report {}", path.display()))
}

/// Atomically write the report (temp file + rename).
pub fn write_run_report(path: &Path, report: &RunReport) -> Result<()> {
    debug!(path = %path.display(), run_id = %report.run_id, "writing run report");
    let mut buf = serde_json::to_string_pretty(report)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("run report path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp run report {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace run report {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{StageId, StageStatus};

    #[test]
    fn failed_run_report_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run-1").join(RUN_REPORT_FILE);
        let now = Utc::now();
        let report = RunReport {
            run_id: "run-1".to_string(),
            started_at: now,
            ended_at: now,
            status: RunStatus::Failed {
                stage: "assemble".to_string(),
                reason: "missing expected file: B.h".to_string(),
            },
            stages: vec![StageResult {
                stage: StageId::Assemble,
                status: StageStatus::Failed,
                diagnostic: Some("missing expected file: B.h".to_string()),
                started_at: now,
                ended_at: now,
            }],
            documents: Vec::new(),
            publish: None,
        };

        write_run_report(&path, &report).expect("write");
        assert_eq!(load_run_report(&path).expect("load"), report);

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"status\": \"failed\""), "{raw}");
        assert!(raw.ends_with('\n'));
    }
}
