//! Pipeline-wide run exclusivity.
//!
//! A run holds two locks for its whole lifetime: an in-process gate (so two
//! triggers in one process never overlap) and a lock file under the workspace
//! root (so two processes never share the workspace). A lock file whose
//! recorded pid no longer exists was left by a killed run and is reclaimed.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::PipelineError;

pub const LOCK_FILE_NAME: &str = ".genpipe.lock";
const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// In-process exclusivity flag shared by every orchestrator that clones it.
#[derive(Debug, Clone, Default)]
pub struct RunGate {
    busy: Arc<AtomicBool>,
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The gate shared by the whole process.
    pub fn process() -> Self {
        static GATE: OnceLock<RunGate> = OnceLock::new();
        GATE.get_or_init(RunGate::new).clone()
    }

    fn try_enter(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn leave(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Held for the lifetime of a run; releases both locks on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    gate: RunGate,
}

impl RunLock {
    /// Take the run lock, rejecting at once (`wait = None`) or queueing up to `wait`.
    pub fn acquire(
        gate: &RunGate,
        root: &Path,
        holder: &str,
        wait: Option<Duration>,
    ) -> Result<Self, PipelineError> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            match Self::try_acquire(gate, root, holder)? {
                Ok(lock) => return Ok(lock),
                Err(current) => {
                    let Some(deadline) = deadline else {
                        return Err(PipelineError::Busy { holder: current });
                    };
                    if Instant::now() >= deadline {
                        warn!(holder = %current, "gave up waiting for run lock");
                        return Err(PipelineError::Busy { holder: current });
                    }
                    debug!(holder = %current, "run lock busy, waiting");
                    thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }

    /// One attempt. The inner `Err` names the current holder.
    fn try_acquire(
        gate: &RunGate,
        root: &Path,
        holder: &str,
    ) -> Result<Result<Self, String>, PipelineError> {
        if !gate.try_enter() {
            return Ok(Err("run in this process".to_string()));
        }
        // From here on every early exit must leave the gate again.
        let result = Self::take_lock_file(root, holder);
        match result {
            Ok(Ok(path)) => Ok(Ok(Self {
                path,
                gate: gate.clone(),
            })),
            Ok(Err(current)) => {
                gate.leave();
                Ok(Err(current))
            }
            Err(e) => {
                gate.leave();
                Err(e)
            }
        }
    }

    fn take_lock_file(root: &Path, holder: &str) -> Result<Result<PathBuf, String>, PipelineError> {
        fs::create_dir_all(root).map_err(|e| {
            PipelineError::resource(format!("create workspace root {}", root.display()), e)
        })?;
        let path = root.join(LOCK_FILE_NAME);
        // One retry after reclaiming a stale file; a second loss means a live contender.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let stamp = LockStamp {
                        holder: holder.to_string(),
                        pid: Some(std::process::id()),
                    };
                    if let Err(e) = file.write_all(stamp.render().as_bytes()) {
                        let _ = fs::remove_file(&path);
                        return Err(PipelineError::resource(
                            format!("write lock file {}", path.display()),
                            e,
                        ));
                    }
                    info!(lock = %path.display(), holder, "run lock acquired");
                    return Ok(Ok(path));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let contents = match fs::read_to_string(&path) {
                        Ok(contents) => contents,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(_) => String::new(),
                    };
                    let stamp = LockStamp::parse(&contents);
                    if stamp.is_stale() {
                        warn!(
                            lock = %path.display(),
                            holder = %stamp.holder,
                            pid = ?stamp.pid,
                            "reclaiming lock left by an exited process"
                        );
                        if let Err(e) = fs::remove_file(&path)
                            && e.kind() != ErrorKind::NotFound
                        {
                            return Err(PipelineError::resource(
                                format!("remove stale lock file {}", path.display()),
                                e,
                            ));
                        }
                        continue;
                    }
                    return Ok(Err(format!(
                        "{}; remove {} if no run is active",
                        stamp.holder,
                        path.display()
                    )));
                }
                Err(e) => {
                    return Err(PipelineError::resource(
                        format!("create lock file {}", path.display()),
                        e,
                    ));
                }
            }
        }
        Ok(Err(format!("contended lock {}", path.display())))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Contents of the lock file: holder run id on the first line, then `pid N`.
#[derive(Debug, PartialEq, Eq)]
struct LockStamp {
    holder: String,
    pid: Option<u32>,
}

impl LockStamp {
    fn parse(contents: &str) -> Self {
        let mut lines = contents.lines();
        let holder = lines
            .next()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or("unknown holder")
            .to_string();
        let pid = lines
            .filter_map(|line| line.strip_prefix("pid "))
            .find_map(|pid| pid.trim().parse().ok());
        Self { holder, pid }
    }

    fn render(&self) -> String {
        match self.pid {
            Some(pid) => format!("{}\npid {pid}\n", self.holder),
            None => format!("{}\n", self.holder),
        }
    }

    /// Only a recorded pid that is verifiably gone makes a lock stale.
    fn is_stale(&self) -> bool {
        self.pid.is_some_and(|pid| !process_alive(pid))
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return true;
    };
    // EPERM still means the process exists.
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "run lock released"),
            Err(e) => warn!(lock = %self.path.display(), err = %e, "failed to remove lock file"),
        }
        self.gate.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_holder_lock_rejects_trigger() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stamp = format!("run-other\npid {}\n", std::process::id());
        fs::write(temp.path().join(LOCK_FILE_NAME), stamp).expect("write");

        let err = RunLock::acquire(&RunGate::new(), temp.path(), "run-me", None).unwrap_err();
        match err {
            PipelineError::Busy { holder } => assert!(holder.contains("run-other"), "{holder}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    /// A lock left by a killed run (its pid is gone) does not block the next run.
    #[cfg(unix)]
    #[test]
    fn lock_of_exited_process_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead_pid = child.id();
        child.wait().expect("wait");
        fs::write(
            temp.path().join(LOCK_FILE_NAME),
            format!("run-killed\npid {dead_pid}\n"),
        )
        .expect("write");

        let lock = RunLock::acquire(&RunGate::new(), temp.path(), "run-me", None).expect("reclaim");
        let stamp = LockStamp::parse(&fs::read_to_string(lock.path()).expect("read lock"));
        assert_eq!(
            stamp,
            LockStamp {
                holder: "run-me".to_string(),
                pid: Some(std::process::id()),
            }
        );
    }

    #[test]
    fn stamp_parse_tolerates_missing_pid() {
        assert_eq!(
            LockStamp::parse("run-x\n"),
            LockStamp {
                holder: "run-x".to_string(),
                pid: None,
            }
        );
        assert_eq!(LockStamp::parse("").holder, "unknown holder");
        assert!(!LockStamp::parse("run-x\n").is_stale());
    }

    #[test]
    fn waiting_trigger_gives_up_after_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(LOCK_FILE_NAME), "run-other\n").expect("write");

        let started = Instant::now();
        let err =
            RunLock::acquire(&RunGate::new(), temp.path(), "run-me", Some(Duration::from_millis(600)))
                .unwrap_err();
        assert!(matches!(err, PipelineError::Busy { .. }));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn lock_file_removed_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = {
            let lock = RunLock::acquire(&RunGate::new(), temp.path(), "run-me", None).expect("lock");
            let contents = fs::read_to_string(lock.path()).expect("read lock");
            assert!(contents.starts_with("run-me\n"));
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn gate_rejects_second_holder_until_released() {
        let temp = tempfile::tempdir().expect("tempdir");
        let other_root = tempfile::tempdir().expect("tempdir");
        let gate = RunGate::new();

        let first = RunLock::acquire(&gate, temp.path(), "run-a", None).expect("first");
        let err = RunLock::acquire(&gate, other_root.path(), "run-b", None).unwrap_err();
        assert!(matches!(err, PipelineError::Busy { .. }));

        drop(first);
        RunLock::acquire(&gate, other_root.path(), "run-b", None).expect("after release");
    }
}
