//! Test-only helpers: local git repositories and scripted collaborators.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use crate::core::types::{JobKind, PublishResult};
use crate::error::PipelineError;
use crate::io::acquire::{FetchRequest, SourceAcquirer};
use crate::io::archive::DirArtifactStore;
use crate::io::config::PipelineConfig;
use crate::io::generate::{GenerateRequest, GeneratedOutput, Generator, collect_output};
use crate::io::publish::{CodePublisher, PublishRequest};
use crate::io::workspace::{DirWorkspaceManager, WorkspaceManager};
use crate::pipeline::Collaborators;

pub const NATIVE_URL: &str = "test://native";
pub const TOOLCHAIN_URL: &str = "test://toolchain";

/// Run git in `dir` and panic on failure.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Run git in `dir` and return trimmed stdout.
pub fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create a non-bare repository whose unborn HEAD points at `branch`.
pub fn init_repo(path: &Path, branch: &str) {
    fs::create_dir_all(path).expect("create repo dir");
    git(path, &["init", "--quiet"]);
    git(path, &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")]);
    git(path, &["config", "user.name", "Test Author"]);
    git(path, &["config", "user.email", "test@example.invalid"]);
}

/// Write `name` and commit it on the current branch.
pub fn commit_file(repo: &Path, name: &str, contents: &str) {
    let path = repo.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(&path, contents).expect("write file");
    git(repo, &["add", "--", name]);
    git(repo, &["commit", "--quiet", "-m", &format!("add {name}")]);
}

/// Create an empty bare repository to push to.
pub fn init_bare(path: &Path) {
    fs::create_dir_all(path).expect("create bare dir");
    git(path, &["init", "--quiet", "--bare"]);
}

/// Config rooted in a scratch directory, with no toolchain setup and fake URLs.
pub fn test_config(root: &Path) -> PipelineConfig {
    let mut cfg = PipelineConfig {
        native_repo_url: NATIVE_URL.to_string(),
        toolchain_repo_url: TOOLCHAIN_URL.to_string(),
        publish_repo_url: root.join("publish.git").to_string_lossy().to_string(),
        required_files: vec!["A.h".to_string(), "B.h".to_string()],
        search_subpaths: vec![String::new(), "sub".to_string()],
        credential_ref: "none".to_string(),
        workspace_root: root.join("workspaces"),
        archive_root: root.join("artifacts"),
        ..PipelineConfig::default()
    };
    cfg.toolchain.setup_command = Vec::new();
    cfg
}

/// Acquirer that materializes canned file trees instead of cloning.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAcquirer {
    trees: HashMap<String, Vec<(String, String)>>,
    failing: Vec<String>,
    fetched: Arc<Mutex<Vec<FetchRequest>>>,
}

impl ScriptedAcquirer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files to place when `repo_url` is fetched.
    pub fn with_tree(mut self, repo_url: &str, files: &[(&str, &str)]) -> Self {
        self.trees.insert(
            repo_url.to_string(),
            files
                .iter()
                .map(|(n, c)| (n.to_string(), c.to_string()))
                .collect(),
        );
        self
    }

    /// Fetching `repo_url` fails like an unknown branch would.
    pub fn failing(mut self, repo_url: &str) -> Self {
        self.failing.push(repo_url.to_string());
        self
    }

    pub fn fetched(&self) -> Vec<FetchRequest> {
        self.fetched.lock().expect("fetched lock").clone()
    }
}

impl SourceAcquirer for ScriptedAcquirer {
    fn fetch(&self, request: &FetchRequest) -> Result<(), PipelineError> {
        self.fetched
            .lock()
            .expect("fetched lock")
            .push(request.clone());
        if self.failing.contains(&request.repo_url) {
            return Err(PipelineError::Acquisition {
                repo: request.repo_url.clone(),
                branch: request.branch.clone(),
                reason: "scripted failure".to_string(),
            });
        }
        fs::create_dir_all(&request.target_dir).expect("create target");
        for (name, contents) in self.trees.get(&request.repo_url).into_iter().flatten() {
            let path = request.target_dir.join(name);
            fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
            fs::write(path, contents).expect("write tree file");
        }
        Ok(())
    }
}

/// Rendezvous points for holding the first generation job.
#[derive(Debug, Clone)]
pub struct GeneratorGate {
    /// Passed once the first job is running.
    pub entered: Arc<Barrier>,
    /// The held job continues once this is passed.
    pub release: Arc<Barrier>,
}

/// Generator that writes canned output instead of running the toolchain.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    failing: Vec<JobKind>,
    invocations: Arc<Mutex<Vec<JobKind>>>,
    gate: Option<GeneratorGate>,
    held: Arc<AtomicBool>,
}

impl ScriptedGenerator {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing(jobs: &[JobKind]) -> Self {
        Self {
            failing: jobs.to_vec(),
            ..Self::default()
        }
    }

    /// Succeeding generator whose first job blocks on the returned gate.
    pub fn gated() -> (Self, GeneratorGate) {
        let gate = GeneratorGate {
            entered: Arc::new(Barrier::new(2)),
            release: Arc::new(Barrier::new(2)),
        };
        let generator = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (generator, gate)
    }

    pub fn invocations(&self) -> Vec<JobKind> {
        self.invocations.lock().expect("invocations lock").clone()
    }
}

impl Generator for ScriptedGenerator {
    fn invoke(&self, request: &GenerateRequest) -> Result<GeneratedOutput, PipelineError> {
        self.invocations
            .lock()
            .expect("invocations lock")
            .push(request.job);
        if let Some(gate) = &self.gate
            && !self.held.swap(true, Ordering::SeqCst)
        {
            gate.entered.wait();
            gate.release.wait();
        }
        if self.failing.contains(&request.job) {
            return Err(PipelineError::Generation {
                job: request.job,
                exit_code: Some(1),
                reason: "nonzero exit".to_string(),
                output: format!("{} exploded\n", request.job),
            });
        }
        fs::create_dir_all(&request.output_dir).expect("create output dir");
        match request.job.document_name() {
            Some(name) => fs::write(request.output_dir.join(name), format!("{} body", request.job))
                .expect("write document"),
            None => {
                let input = request.input_artifact.as_ref().expect("input artifact");
                let merged = fs::read_to_string(input).expect("read merged artifact");
                fs::write(request.output_dir.join("App.jsx"), format!("// from\n{merged}"))
                    .expect("write code");
            }
        }
        collect_output(request)
    }
}

/// Publisher that records requests and reports a fixed commit.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    fail: bool,
    requests: Arc<Mutex<Vec<PublishRequest>>>,
}

pub const FAKE_COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<PublishRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl CodePublisher for RecordingPublisher {
    fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PipelineError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if self.fail {
            return Err(PipelineError::publish("push rejected"));
        }
        Ok(PublishResult::Pushed {
            commit: FAKE_COMMIT.to_string(),
        })
    }
}

/// Directory workspace manager that counts acquisitions and releases.
#[derive(Debug, Clone)]
pub struct CountingWorkspaceManager {
    inner: DirWorkspaceManager,
    acquires: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    acquired: Arc<Mutex<Vec<PathBuf>>>,
    fail_release: bool,
}

impl CountingWorkspaceManager {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: DirWorkspaceManager::new(root),
            acquires: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
            acquired: Arc::new(Mutex::new(Vec::new())),
            fail_release: false,
        }
    }

    /// Releases are counted but report an error and leave the directory behind.
    pub fn failing_release(root: &Path) -> Self {
        Self {
            fail_release: true,
            ..Self::new(root)
        }
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> Vec<PathBuf> {
        self.acquired.lock().expect("acquired lock").clone()
    }
}

impl WorkspaceManager for CountingWorkspaceManager {
    fn acquire(&self, run_id: &str) -> Result<PathBuf, PipelineError> {
        let path = self.inner.acquire(run_id)?;
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.acquired
            .lock()
            .expect("acquired lock")
            .push(path.clone());
        Ok(path)
    }

    fn release(&self, path: &Path) -> Result<(), PipelineError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release {
            return Err(PipelineError::resource_msg(format!(
                "scripted release failure for {}",
                path.display()
            )));
        }
        self.inner.release(path)
    }
}

/// Fakes wired into [`Collaborators`], with handles kept for assertions.
#[derive(Debug, Clone)]
pub struct FakeCollaborators {
    pub workspace: CountingWorkspaceManager,
    pub acquirer: ScriptedAcquirer,
    pub generator: ScriptedGenerator,
    pub publisher: RecordingPublisher,
    pub archive_root: PathBuf,
}

impl FakeCollaborators {
    /// Happy-path fakes for `cfg`: the native tree holds `A.h` and `sub/B.h`.
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            workspace: CountingWorkspaceManager::new(&cfg.workspace_root),
            acquirer: ScriptedAcquirer::new()
                .with_tree(NATIVE_URL, &[("A.h", "x"), ("sub/B.h", "y")])
                .with_tree(TOOLCHAIN_URL, &[("run_cbn_workflow.py", "# toolchain\n")]),
            generator: ScriptedGenerator::succeeding(),
            publisher: RecordingPublisher::new(),
            archive_root: cfg.archive_root.clone(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            workspace: Box::new(self.workspace.clone()),
            acquirer: Box::new(self.acquirer.clone()),
            generator: Box::new(self.generator.clone()),
            publisher: Box::new(self.publisher.clone()),
            store: Box::new(DirArtifactStore::new(&self.archive_root)),
        }
    }
}
