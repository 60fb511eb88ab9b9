//! Pipeline configuration stored in `genpipe.toml`.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::credentials::CredentialRef;
use crate::io::git::Author;

pub const DEFAULT_CONFIG_FILE: &str = "genpipe.toml";

/// Pipeline configuration (TOML).
///
/// One validated record carries every external parameter of a run. Missing
/// fields default to the GridCtrl conversion job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub native_repo_url: String,
    pub native_repo_branch: String,
    pub toolchain_repo_url: String,
    pub toolchain_repo_branch: String,

    /// Source files to merge, in the order they appear in the merged artifact.
    pub required_files: Vec<String>,
    /// Subdirectories of the native checkout searched for each required file, in order.
    /// An empty string means the checkout root.
    pub search_subpaths: Vec<String>,

    /// Directory (relative to the run workspace) that receives generated output.
    pub output_root_dir: String,
    pub publish_repo_url: String,
    pub publish_branch: String,
    /// Reference to the publish credential (`env:NAME`, `file:PATH` or `none`).
    pub credential_ref: String,

    /// Parent directory of per-run workspaces; also holds the run lock file.
    pub workspace_root: PathBuf,
    /// Retained artifact store, keyed by run id.
    pub archive_root: PathBuf,
    /// Glob (relative to the output root) selecting documents to archive.
    pub archive_pattern: String,

    /// Shallow clone depth; `None` clones full history.
    pub checkout_depth: Option<u32>,
    /// Worker threads for the generation jobs (1-4).
    pub generation_workers: usize,
    /// Truncate captured tool output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub busy_policy: BusyPolicyKind,
    /// How long a `wait` trigger queues for the lock before giving up.
    pub busy_wait_secs: u64,

    pub timeouts: TimeoutConfig,
    pub toolchain: ToolchainConfig,
    pub publish: PublishConfig,
}

/// What a trigger does when another run holds the lock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicyKind {
    Reject,
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub checkout_secs: u64,
    pub setup_secs: u64,
    pub generation_secs: u64,
    pub publish_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            checkout_secs: 10 * 60,
            setup_secs: 15 * 60,
            generation_secs: 30 * 60,
            publish_secs: 5 * 60,
        }
    }
}

impl TimeoutConfig {
    pub fn checkout(&self) -> Duration {
        Duration::from_secs(self.checkout_secs)
    }

    pub fn setup(&self) -> Duration {
        Duration::from_secs(self.setup_secs)
    }

    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation_secs)
    }

    pub fn publish(&self) -> Duration {
        Duration::from_secs(self.publish_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Program and leading arguments of the generation entry point (e.g. `["python3","run_cbn_workflow.py"]`).
    pub command: Vec<String>,
    /// Dependency installation run once in the toolchain checkout; empty to skip.
    pub setup_command: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "run_cbn_workflow.py".to_string()],
            setup_command: ["python3", "-m", "pip", "install", "requests", "docx", "reportlab"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PublishConfig {
    pub author_name: String,
    pub author_email: String,
    /// Commit message; must keep a CI skip marker so the push does not re-trigger builds.
    pub commit_message: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            author_name: "jenkins-bot".to_string(),
            author_email: "jenkins@ci.local".to_string(),
            commit_message: "Auto-generated React code from CbN workflow [ci skip]".to_string(),
        }
    }
}

impl PublishConfig {
    pub fn author(&self) -> Author {
        Author {
            name: self.author_name.clone(),
            email: self.author_email.clone(),
        }
    }
}

const GRID_CTRL_FILES: [&str; 14] = [
    "GridCtrl.h",
    "GridCtrl.cpp",
    "CellRange.h",
    "GridCell.h",
    "GridCell.cpp",
    "GridCellBase.h",
    "GridCellBase.cpp",
    "GridDropTarget.h",
    "GridDropTarget.cpp",
    "InPlaceEdit.h",
    "InPlaceEdit.cpp",
    "MemDC.h",
    "TitleTip.h",
    "TitleTip.cpp",
];

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            native_repo_url: "https://github.com/ChrisMaunder/MFC-GridCtrl.git".to_string(),
            native_repo_branch: "master".to_string(),
            toolchain_repo_url:
                "https://github.com/CBN-Project-Deployment/CBN_Workflow_document.git".to_string(),
            toolchain_repo_branch: "main".to_string(),
            required_files: GRID_CTRL_FILES.iter().map(|s| s.to_string()).collect(),
            search_subpaths: vec![String::new(), "GridCtrl".to_string()],
            output_root_dir: "generated_output".to_string(),
            publish_repo_url: "git@github.com:Mrityunjai-demo/React-Dep.git".to_string(),
            publish_branch: "main".to_string(),
            credential_ref: "env:CBN_PASSWORD".to_string(),
            workspace_root: PathBuf::from(".genpipe/workspaces"),
            archive_root: PathBuf::from(".genpipe/artifacts"),
            archive_pattern: "docs/**/*.docx".to_string(),
            checkout_depth: Some(1),
            generation_workers: 3,
            output_limit_bytes: 1_000_000,
            busy_policy: BusyPolicyKind::Reject,
            busy_wait_secs: 0,
            timeouts: TimeoutConfig::default(),
            toolchain: ToolchainConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        require_non_empty("native_repo_url", &self.native_repo_url)?;
        require_non_empty("toolchain_repo_url", &self.toolchain_repo_url)?;
        require_non_empty("publish_repo_url", &self.publish_repo_url)?;
        validate_branch("native_repo_branch", &self.native_repo_branch)?;
        validate_branch("toolchain_repo_branch", &self.toolchain_repo_branch)?;
        validate_branch("publish_branch", &self.publish_branch)?;

        if self.required_files.is_empty() {
            return Err(anyhow!("required_files must list at least one file"));
        }
        let mut seen = std::collections::HashSet::new();
        for file in &self.required_files {
            if file.trim().is_empty() {
                return Err(anyhow!("required_files must not contain empty names"));
            }
            validate_relative("required_files", file)?;
            if !seen.insert(file.as_str()) {
                return Err(anyhow!("required_files lists '{file}' twice"));
            }
        }
        if self.search_subpaths.is_empty() {
            return Err(anyhow!(
                "search_subpaths must not be empty (use \"\" for the checkout root)"
            ));
        }
        for sub in &self.search_subpaths {
            validate_relative("search_subpaths", sub)?;
        }

        require_non_empty("output_root_dir", &self.output_root_dir)?;
        validate_relative("output_root_dir", &self.output_root_dir)?;
        require_non_empty("archive_pattern", &self.archive_pattern)?;
        validate_relative("archive_pattern", &self.archive_pattern)?;

        CredentialRef::parse(&self.credential_ref)
            .map_err(|e| anyhow!("credential_ref is invalid: {e}"))?;

        if self.checkout_depth == Some(0) {
            return Err(anyhow!("checkout_depth must be > 0 (omit it for a full clone)"));
        }
        if !(1..=4).contains(&self.generation_workers) {
            return Err(anyhow!(
                "generation_workers must be between 1 and 4 (got {})",
                self.generation_workers
            ));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (key, secs) in [
            ("timeouts.checkout_secs", self.timeouts.checkout_secs),
            ("timeouts.setup_secs", self.timeouts.setup_secs),
            ("timeouts.generation_secs", self.timeouts.generation_secs),
            ("timeouts.publish_secs", self.timeouts.publish_secs),
        ] {
            if secs == 0 {
                return Err(anyhow!("{key} must be > 0"));
            }
        }
        if self.toolchain.command.is_empty() || self.toolchain.command[0].trim().is_empty() {
            return Err(anyhow!("toolchain.command must be a non-empty array"));
        }
        if let Some(program) = self.toolchain.setup_command.first()
            && program.trim().is_empty()
        {
            return Err(anyhow!("toolchain.setup_command must start with a program"));
        }
        require_non_empty("publish.author_name", &self.publish.author_name)?;
        require_non_empty("publish.author_email", &self.publish.author_email)?;
        require_non_empty("publish.commit_message", &self.publish.commit_message)?;
        Ok(())
    }

    /// How long a trigger waits for a busy lock, `None` to reject immediately.
    pub fn busy_wait(&self) -> Option<Duration> {
        match self.busy_policy {
            BusyPolicyKind::Reject => None,
            BusyPolicyKind::Wait => Some(Duration::from_secs(self.busy_wait_secs)),
        }
    }
}

fn require_non_empty(key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{key} must not be empty"));
    }
    Ok(())
}

/// Reject branch names git would refuse or misread as options.
fn validate_branch(key: &str, branch: &str) -> Result<()> {
    require_non_empty(key, branch)?;
    let bad_char = branch
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if bad_char
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("@{")
    {
        return Err(anyhow!("{key} is not a valid branch name: '{branch}'"));
    }
    Ok(())
}

fn validate_relative(key: &str, value: &str) -> Result<()> {
    let path = Path::new(value);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(anyhow!(
            "{key} entries must be relative paths inside the checkout (got '{value}')"
        ));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
