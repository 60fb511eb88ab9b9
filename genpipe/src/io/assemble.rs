//! Merged input artifact for code translation.
//!
//! Required source files are resolved against an ordered list of search paths
//! and concatenated in list order. Nothing is written until every file has
//! been found, so a failed assembly never leaves an artifact behind.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::error::PipelineError;

/// Bytes appended after every segment.
pub const SEGMENT_SEPARATOR: &[u8] = b"\n\n";

/// One required file as it appears in the merged artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Name as listed in the required-file list.
    pub name: String,
    /// Where it was found.
    pub source: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedArtifact {
    pub path: PathBuf,
    /// In required-file order.
    pub segments: Vec<Segment>,
}

impl MergedArtifact {
    /// Size of the artifact including separators.
    pub fn total_bytes(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.bytes + SEGMENT_SEPARATOR.len() as u64)
            .sum()
    }
}

/// Resolve every required file, then write the merged artifact to `output`.
///
/// Fails with [`PipelineError::MissingInput`] naming the first file found in
/// none of `search_paths`. An empty search path means `source_dir` itself.
#[instrument(skip_all, fields(source = %source_dir.display(), files = required_files.len()))]
pub fn assemble(
    source_dir: &Path,
    required_files: &[String],
    search_paths: &[String],
    output: &Path,
) -> Result<MergedArtifact, PipelineError> {
    let mut segments = Vec::with_capacity(required_files.len());
    for name in required_files {
        let (source, bytes) = resolve(source_dir, name, search_paths)?;
        if bytes == 0 {
            warn!(file = %name, source = %source.display(), "required file is empty");
        }
        debug!(file = %name, source = %source.display(), bytes, "resolved");
        segments.push(Segment {
            name: name.clone(),
            source,
            bytes,
        });
    }

    let partial = partial_path(output);
    if let Err(err) = write_segments(&partial, &segments) {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }
    fs::rename(&partial, output).map_err(|e| {
        let _ = fs::remove_file(&partial);
        PipelineError::resource(format!("move merged artifact to {}", output.display()), e)
    })?;

    let artifact = MergedArtifact {
        path: output.to_path_buf(),
        segments,
    };
    info!(
        output = %output.display(),
        segments = artifact.segments.len(),
        bytes = artifact.total_bytes(),
        "merged artifact written"
    );
    Ok(artifact)
}

fn resolve(
    source_dir: &Path,
    name: &str,
    search_paths: &[String],
) -> Result<(PathBuf, u64), PipelineError> {
    let mut searched = Vec::with_capacity(search_paths.len());
    for sub in search_paths {
        let candidate = if sub.is_empty() {
            source_dir.join(name)
        } else {
            source_dir.join(sub).join(name)
        };
        if let Ok(meta) = fs::metadata(&candidate)
            && meta.is_file()
        {
            return Ok((candidate, meta.len()));
        }
        searched.push(candidate);
    }
    Err(PipelineError::MissingInput {
        file: name.to_string(),
        searched,
    })
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn write_segments(path: &Path, segments: &[Segment]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| {
            PipelineError::resource(format!("create directory {}", parent.display()), e)
        })?;
    }
    let file = File::create(path)
        .map_err(|e| PipelineError::resource(format!("create {}", path.display()), e))?;
    let mut out = BufWriter::new(file);
    for segment in segments {
        let mut input = File::open(&segment.source).map_err(|e| {
            PipelineError::resource(format!("open {}", segment.source.display()), e)
        })?;
        std::io::copy(&mut input, &mut out).map_err(|e| {
            PipelineError::resource(format!("copy {}", segment.source.display()), e)
        })?;
        out.write_all(SEGMENT_SEPARATOR)
            .map_err(|e| PipelineError::resource(format!("write {}", path.display()), e))?;
    }
    out.flush()
        .map_err(|e| PipelineError::resource(format!("flush {}", path.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn concatenates_in_list_order_with_separator() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("sub")).expect("mkdir");
        fs::write(src.join("A.h"), "x").expect("write");
        fs::write(src.join("sub/B.h"), "y").expect("write");
        let out = temp.path().join("merged.cpp");

        let artifact = assemble(
            &src,
            &names(&["B.h", "A.h"]),
            &names(&["", "sub"]),
            &out,
        )
        .expect("assemble");

        assert_eq!(fs::read(&out).expect("read"), b"y\n\nx\n\n");
        assert_eq!(artifact.segments[0].source, src.join("sub/B.h"));
        assert_eq!(artifact.total_bytes(), 6);
    }

    /// The checkout root wins over later search paths.
    #[test]
    fn earlier_search_path_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path();
        fs::create_dir_all(src.join("sub")).expect("mkdir");
        fs::write(src.join("A.h"), "root").expect("write");
        fs::write(src.join("sub/A.h"), "nested").expect("write");
        let out = src.join("merged.cpp");

        assemble(src, &names(&["A.h"]), &names(&["", "sub"]), &out).expect("assemble");
        assert_eq!(fs::read(&out).expect("read"), b"root\n\n");
    }

    #[test]
    fn trailing_slash_search_path_resolves_nested_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path();
        fs::create_dir_all(src.join("sub")).expect("mkdir");
        fs::write(src.join("A.h"), "x").expect("write");
        fs::write(src.join("sub/B.h"), "y").expect("write");
        let out = src.join("merged.cpp");

        let artifact = assemble(src, &names(&["A.h", "B.h"]), &names(&["", "sub/"]), &out)
            .expect("assemble");

        assert_eq!(fs::read(&out).expect("read"), b"x\n\ny\n\n");
        assert!(artifact.segments[1].source.ends_with("sub/B.h"));
    }

    #[test]
    fn missing_file_fails_without_writing_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("A.h"), "x").expect("write");
        let out = temp.path().join("merged.cpp");

        let err = assemble(
            &src,
            &names(&["A.h", "B.h", "C.h"]),
            &names(&["", "sub"]),
            &out,
        )
        .unwrap_err();
        match err {
            PipelineError::MissingInput { file, searched } => {
                assert_eq!(file, "B.h");
                assert_eq!(searched, vec![src.join("B.h"), src.join("sub/B.h")]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!out.exists());
        assert!(!partial_path(&out).exists());
    }

    #[test]
    fn empty_file_contributes_only_separator() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path();
        fs::write(src.join("Empty.h"), "").expect("write");
        fs::write(src.join("A.h"), "a").expect("write");
        let out = src.join("merged.cpp");

        let artifact =
            assemble(src, &names(&["Empty.h", "A.h"]), &names(&[""]), &out).expect("assemble");
        assert_eq!(fs::read(&out).expect("read"), b"\n\na\n\n");
        assert_eq!(artifact.segments[0].bytes, 0);
    }

    /// A directory with the required name is not a match.
    #[test]
    fn directories_are_not_matches() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path();
        fs::create_dir_all(src.join("A.h")).expect("mkdir");
        let err = assemble(src, &names(&["A.h"]), &names(&[""]), &src.join("m.cpp")).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput { .. }));
    }
}
