//! Retained build artifacts.
//!
//! Generated documents are copied into a per-run directory of the artifact
//! store together with a manifest of SHA-256 fingerprints.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::error::PipelineError;

pub const MANIFEST_FILE: &str = "manifest.json";

/// One archived file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFile {
    /// Path relative to the output root, `/`-separated.
    pub path: String,
    /// Where the copy lives in the store.
    pub stored_at: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// What an archive call retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReceipt {
    pub run_id: String,
    pub pattern: String,
    pub files: Vec<ArchivedFile>,
}

/// Durable storage for build artifacts, keyed by run id.
pub trait ArtifactStore: Send + Sync {
    /// Retain every file under `output_dir` matching `pattern`.
    fn archive(
        &self,
        run_id: &str,
        output_dir: &Path,
        pattern: &str,
    ) -> Result<ArchiveReceipt, PipelineError>;

    /// Directory holding everything stored for `run_id`.
    fn run_dir(&self, run_id: &str) -> PathBuf;
}

/// Artifact store on the local filesystem: `<root>/<run_id>/<relative path>`.
#[derive(Debug, Clone)]
pub struct DirArtifactStore {
    root: PathBuf,
}

impl DirArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for DirArtifactStore {
    #[instrument(skip_all, fields(run_id, pattern))]
    fn archive(
        &self,
        run_id: &str,
        output_dir: &Path,
        pattern: &str,
    ) -> Result<ArchiveReceipt, PipelineError> {
        let matcher = glob_to_regex(pattern).map_err(|reason| PipelineError::Archive {
            pattern: pattern.to_string(),
            reason,
        })?;
        let matches = matching_files(output_dir, &matcher).map_err(|reason| {
            PipelineError::Archive {
                pattern: pattern.to_string(),
                reason,
            }
        })?;
        if matches.is_empty() {
            return Err(PipelineError::Archive {
                pattern: pattern.to_string(),
                reason: format!("no files matched under {}", output_dir.display()),
            });
        }

        let run_dir = self.run_dir(run_id);
        let mut files = Vec::with_capacity(matches.len());
        for (rel, source) in matches {
            let dest = run_dir.join(&rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::resource(format!("create {}", parent.display()), e)
                })?;
            }
            let bytes = fs::copy(&source, &dest).map_err(|e| {
                PipelineError::resource(
                    format!("copy {} to {}", source.display(), dest.display()),
                    e,
                )
            })?;
            let sha256 = sha256_file(&dest)?;
            debug!(file = %rel, bytes, %sha256, "archived");
            files.push(ArchivedFile {
                path: rel,
                stored_at: dest,
                bytes,
                sha256,
            });
        }

        let receipt = ArchiveReceipt {
            run_id: run_id.to_string(),
            pattern: pattern.to_string(),
            files,
        };
        write_manifest(&run_dir.join(MANIFEST_FILE), &receipt)?;
        info!(files = receipt.files.len(), dir = %run_dir.display(), "artifacts archived");
        Ok(receipt)
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }
}

/// Translate a path glob into an anchored regex.
///
/// `*` and `?` never cross a `/`; `**/` matches zero or more whole segments and
/// a trailing `**` matches anything.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, String> {
    let mut re = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(?:[^/]+/)*");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');
    Regex::new(&re).map_err(|e| format!("invalid pattern: {e}"))
}

/// Files under `root` whose relative path matches, sorted by path.
fn matching_files(root: &Path, matcher: &Regex) -> Result<Vec<(String, PathBuf)>, String> {
    if !root.is_dir() {
        return Err(format!("output directory {} does not exist", root.display()));
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| format!("walk {}: {e}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if matcher.is_match(&rel) {
            found.push((rel, entry.into_path()));
        }
    }
    Ok(found)
}

pub fn sha256_file(path: &Path) -> Result<String, PipelineError> {
    let mut file = fs::File::open(path)
        .map_err(|e| PipelineError::resource(format!("open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| PipelineError::resource(format!("read {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn write_manifest(path: &Path, receipt: &ArchiveReceipt) -> Result<(), PipelineError> {
    let mut buf = serde_json::to_string_pretty(receipt)
        .map_err(|e| PipelineError::resource_msg(format!("serialize manifest: {e}")))?;
    buf.push('\n');
    fs::write(path, buf)
        .map_err(|e| PipelineError::resource(format!("write {}", path.display()), e))
}
