//! Generation jobs.
//!
//! The [`Generator`] trait decouples stage orchestration from the external
//! toolchain. [`ToolchainGenerator`] spawns the toolchain entry point with
//! fixed arguments per [`JobKind`]; tests use scripted generators that write
//! predetermined files without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::types::JobKind;
use crate::error::PipelineError;
use crate::io::cancel::CancelToken;
use crate::io::process::{CommandOutput, run_command};

/// Parameters for one generation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub job: JobKind,
    /// Toolchain checkout; the job runs with this as its working directory.
    pub toolchain_dir: PathBuf,
    /// Merged artifact, required by code translation only.
    pub input_artifact: Option<PathBuf>,
    /// Dedicated directory for this job's output.
    pub output_dir: PathBuf,
    /// Where captured stdout/stderr is written.
    pub log_path: PathBuf,
}

/// Files a job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedOutput {
    pub job: JobKind,
    pub output_dir: PathBuf,
    /// Absolute paths, sorted.
    pub files: Vec<PathBuf>,
}

impl GeneratedOutput {
    /// The stable document path for document jobs.
    pub fn document(&self) -> Option<PathBuf> {
        self.job.document_name().map(|name| self.output_dir.join(name))
    }
}

/// Abstraction over generation backends.
pub trait Generator: Send + Sync {
    fn invoke(&self, request: &GenerateRequest) -> Result<GeneratedOutput, PipelineError>;
}

/// Runs the toolchain entry point (e.g. `python3 run_cbn_workflow.py`).
#[derive(Debug, Clone)]
pub struct ToolchainGenerator {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: CancelToken,
}

impl ToolchainGenerator {
    pub fn new(
        command: Vec<String>,
        timeout: Duration,
        output_limit_bytes: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
            cancel,
        }
    }

    fn build_command(&self, request: &GenerateRequest) -> Result<Command, PipelineError> {
        let Some((program, leading)) = self.command.split_first() else {
            return Err(generation_error(request.job, None, "toolchain command is empty", ""));
        };
        let mut cmd = Command::new(program);
        cmd.args(leading).arg(subcommand(request.job));
        match request.job.document_name() {
            Some(name) => {
                cmd.arg("--output").arg(request.output_dir.join(name));
            }
            None => {
                let Some(input) = &request.input_artifact else {
                    return Err(generation_error(request.job, None, "no input artifact", ""));
                };
                cmd.arg("--input")
                    .arg(input)
                    .arg("--output")
                    .arg(&request.output_dir);
            }
        }
        cmd.current_dir(&request.toolchain_dir);
        Ok(cmd)
    }
}

impl Generator for ToolchainGenerator {
    #[instrument(skip_all, fields(job = %request.job, timeout_secs = self.timeout.as_secs()))]
    fn invoke(&self, request: &GenerateRequest) -> Result<GeneratedOutput, PipelineError> {
        fs::create_dir_all(&request.output_dir).map_err(|e| {
            PipelineError::resource(
                format!("create output dir {}", request.output_dir.display()),
                e,
            )
        })?;
        let cmd = self.build_command(request)?;
        info!(toolchain = %request.toolchain_dir.display(), "starting generation job");

        let output = run_command(cmd, self.timeout, self.output_limit_bytes, &self.cancel)
            .map_err(|err| generation_error(request.job, None, format!("{err:#}"), ""))?;
        let log = output.render_log(request.job.as_str());
        write_job_log(&request.log_path, &log)?;

        check_exit(request.job, &output, &log, self.timeout)?;
        let generated = collect_output(request)?;
        info!(files = generated.files.len(), "generation job completed");
        Ok(generated)
    }
}

fn subcommand(job: JobKind) -> &'static str {
    match job {
        JobKind::DocumentTdd => "tdd",
        JobKind::DocumentFdd => "fdd",
        JobKind::CodeTranslation => "cpp_to_react",
    }
}

fn check_exit(
    job: JobKind,
    output: &CommandOutput,
    log: &str,
    timeout: Duration,
) -> Result<(), PipelineError> {
    if output.cancelled {
        return Err(PipelineError::aborted(format!("generation job {job} cancelled")));
    }
    if output.timed_out {
        warn!(timeout_secs = timeout.as_secs(), "generation job timed out");
        return Err(generation_error(
            job,
            None,
            format!("timed out after {timeout:?}"),
            log,
        ));
    }
    if !output.success() {
        warn!(exit_code = ?output.status.code(), "generation job failed");
        return Err(generation_error(
            job,
            output.status.code(),
            "nonzero exit",
            log,
        ));
    }
    Ok(())
}

/// Verify the job left what it promised and list its files.
pub fn collect_output(request: &GenerateRequest) -> Result<GeneratedOutput, PipelineError> {
    let job = request.job;
    if let Some(name) = job.document_name() {
        let doc = request.output_dir.join(name);
        if !doc.is_file() {
            return Err(generation_error(
                job,
                Some(0),
                format!("expected document {} was not produced", doc.display()),
                "",
            ));
        }
    }
    let files = list_files(&request.output_dir)?;
    if files.is_empty() {
        return Err(generation_error(
            job,
            Some(0),
            format!("no files produced in {}", request.output_dir.display()),
            "",
        ));
    }
    Ok(GeneratedOutput {
        job,
        output_dir: request.output_dir.clone(),
        files,
    })
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            PipelineError::resource_msg(format!("walk {}: {e}", dir.display()))
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

pub(crate) fn write_job_log(path: &Path, log: &str) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            PipelineError::resource(format!("create log dir {}", parent.display()), e)
        })?;
    }
    fs::write(path, log)
        .map_err(|e| PipelineError::resource(format!("write job log {}", path.display()), e))?;
    debug!(log = %path.display(), "job log written");
    Ok(())
}

fn generation_error(
    job: JobKind,
    exit_code: Option<i32>,
    reason: impl Into<String>,
    output: &str,
) -> PipelineError {
    PipelineError::Generation {
        job,
        exit_code,
        reason: reason.into(),
        output: output.to_string(),
    }
}

/// Run every request on at most `workers` threads.
///
/// Each job runs to completion regardless of the others. Results come back in
/// request order.
pub fn run_jobs(
    generator: &dyn Generator,
    requests: &[GenerateRequest],
    workers: usize,
) -> Vec<Result<GeneratedOutput, PipelineError>> {
    let workers = workers.clamp(1, requests.len().max(1));
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel();

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            scope.spawn(move || {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(request) = requests.get(index) else {
                        break;
                    };
                    debug!(job = %request.job, "worker picked up job");
                    let result = generator.invoke(request);
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<Result<GeneratedOutput, PipelineError>>> =
        requests.iter().map(|_| None).collect();
    for (index, result) in rx {
        slots[index] = Some(result);
    }
    slots
        .into_iter()
        .zip(requests)
        .map(|(slot, request)| {
            slot.unwrap_or_else(|| {
                Err(generation_error(request.job, None, "job did not report a result", ""))
            })
        })
        .collect()
}

/// Fold job results into the stage result.
///
/// The first failure in job order is reported; when several jobs failed the
/// others are appended to its captured output.
pub fn collect_results(
    results: Vec<Result<GeneratedOutput, PipelineError>>,
) -> Result<Vec<GeneratedOutput>, PipelineError> {
    let mut outputs = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(output) => outputs.push(output),
            Err(err) => failures.push(err),
        }
    }
    if failures.is_empty() {
        return Ok(outputs);
    }
    // Cancellation wins over ordinary failures so the run ends as aborted.
    if let Some(pos) = failures.iter().position(PipelineError::is_aborted) {
        return Err(failures.swap_remove(pos));
    }
    let mut first = failures.remove(0);
    if !failures.is_empty() {
        let others = failures
            .iter()
            .map(|e| format!("also failed: {e}"))
            .collect::<Vec<_>>()
            .join("\n");
        if let PipelineError::Generation { output, .. } = &mut first {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&others);
        }
    }
    Err(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedGenerator;

    fn request(root: &Path, job: JobKind) -> GenerateRequest {
        GenerateRequest {
            job,
            toolchain_dir: root.join("toolchain"),
            input_artifact: job
                .needs_input_artifact()
                .then(|| root.join("merged.cpp")),
            output_dir: root.join("out").join(job.output_subdir()),
            log_path: root.join("out/logs").join(format!("{job}.log")),
        }
    }

    fn all_requests(root: &Path) -> Vec<GenerateRequest> {
        JobKind::ALL.iter().map(|job| request(root, *job)).collect()
    }

    #[test]
    fn results_come_back_in_request_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("merged.cpp"), "int x;\n\n").expect("write");
        let generator = ScriptedGenerator::succeeding();
        let results = run_jobs(&generator, &all_requests(temp.path()), 2);
        let jobs: Vec<JobKind> = results
            .iter()
            .map(|r| r.as_ref().expect("ok").job)
            .collect();
        assert_eq!(jobs, JobKind::ALL.to_vec());
        assert_eq!(generator.invocations().len(), 3);
    }

    /// A failing job does not stop the others.
    #[test]
    fn every_job_runs_when_one_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = ScriptedGenerator::failing(&[JobKind::DocumentTdd, JobKind::CodeTranslation]);
        let results = run_jobs(&generator, &all_requests(temp.path()), 1);
        assert_eq!(generator.invocations().len(), 3);

        let err = collect_results(results).unwrap_err();
        match err {
            PipelineError::Generation { job, output, .. } => {
                assert_eq!(job, JobKind::DocumentTdd);
                assert!(output.contains("code-translation"), "{output}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn collect_output_requires_stable_document_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), JobKind::DocumentFdd);
        fs::create_dir_all(&req.output_dir).expect("mkdir");
        fs::write(req.output_dir.join("other.docx"), "x").expect("write");
        assert!(collect_output(&req).is_err());

        fs::write(req.output_dir.join("FDD.docx"), "x").expect("write");
        let out = collect_output(&req).expect("collect");
        assert_eq!(out.document(), Some(req.output_dir.join("FDD.docx")));
        assert_eq!(out.files.len(), 2);
    }

    #[test]
    fn empty_code_tree_is_generation_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), JobKind::CodeTranslation);
        fs::create_dir_all(&req.output_dir).expect("mkdir");
        let err = collect_output(&req).unwrap_err();
        assert!(matches!(err, PipelineError::Generation { .. }), "{err}");
    }

    #[cfg(unix)]
    mod toolchain {
        use super::*;

        fn generator(script: &str) -> ToolchainGenerator {
            ToolchainGenerator::new(
                vec!["sh".to_string(), "-c".to_string(), script.to_string(), "tool".to_string()],
                Duration::from_secs(30),
                10_000,
                CancelToken::new(),
            )
        }

        /// `sh -c script tool <args>` sees the job arguments as `$1..`.
        #[test]
        fn document_job_gets_fixed_arguments() {
            let temp = tempfile::tempdir().expect("tempdir");
            let req = request(temp.path(), JobKind::DocumentTdd);
            fs::create_dir_all(&req.toolchain_dir).expect("mkdir");
            let generator = generator("echo \"$@\"; printf doc > \"$3\"");

            let out = generator.invoke(&req).expect("invoke");
            assert_eq!(out.files, vec![req.output_dir.join("TDD.docx")]);
            let log = fs::read_to_string(&req.log_path).expect("log");
            assert!(log.contains("tdd --output"), "{log}");
        }

        #[test]
        fn code_job_passes_input_and_output() {
            let temp = tempfile::tempdir().expect("tempdir");
            let req = request(temp.path(), JobKind::CodeTranslation);
            fs::create_dir_all(&req.toolchain_dir).expect("mkdir");
            fs::write(temp.path().join("merged.cpp"), "int x;").expect("write");
            let generator = generator("test \"$1\" = cpp_to_react && cp \"$3\" \"$5/App.jsx\"");

            let out = generator.invoke(&req).expect("invoke");
            assert_eq!(out.files, vec![req.output_dir.join("App.jsx")]);
        }

        #[test]
        fn nonzero_exit_carries_code_and_output() {
            let temp = tempfile::tempdir().expect("tempdir");
            let req = request(temp.path(), JobKind::DocumentFdd);
            fs::create_dir_all(&req.toolchain_dir).expect("mkdir");
            let generator = generator("echo boom >&2; exit 7");

            let err = generator.invoke(&req).unwrap_err();
            match &err {
                PipelineError::Generation {
                    job, exit_code, ..
                } => {
                    assert_eq!(*job, JobKind::DocumentFdd);
                    assert_eq!(*exit_code, Some(7));
                }
                other => panic!("unexpected error {other:?}"),
            }
            assert!(err.diagnostic().expect("diagnostic").contains("boom"));
        }
    }
}
