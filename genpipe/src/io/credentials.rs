//! Publish credential indirection.
//!
//! Configuration only ever holds a [`CredentialRef`]. The secret itself is
//! resolved at the point of use and wrapped in [`Secret`], whose `Debug`
//! output is redacted.

use std::fmt;
use std::fs;
use std::path::PathBuf;

/// Where the publish credential lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRef {
    /// Read from an environment variable.
    Env(String),
    /// Read from a file (first line, trailing whitespace trimmed).
    File(PathBuf),
    /// Authentication is configured outside the pipeline (e.g. ssh agent).
    None,
}

impl CredentialRef {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "none" {
            return Ok(Self::None);
        }
        match raw.split_once(':') {
            Some(("env", name)) if is_env_name(name) => Ok(Self::Env(name.to_string())),
            Some(("env", name)) => Err(format!("'{name}' is not a valid environment variable name")),
            Some(("file", path)) if !path.trim().is_empty() => {
                Ok(Self::File(PathBuf::from(path.trim())))
            }
            Some(("file", _)) => Err("file: reference needs a path".to_string()),
            _ => Err(format!(
                "expected env:NAME, file:PATH or none (got '{raw}')"
            )),
        }
    }

    /// Resolve the reference. `Ok(None)` means no credential is injected.
    pub fn resolve(&self) -> Result<Option<Secret>, String> {
        match self {
            Self::None => Ok(None),
            Self::Env(name) => match std::env::var(name) {
                Ok(value) if !value.is_empty() => Ok(Some(Secret(value))),
                Ok(_) => Err(format!("credential variable {name} is empty")),
                Err(_) => Err(format!("credential variable {name} is not set")),
            },
            Self::File(path) => {
                let contents = fs::read_to_string(path).map_err(|e| {
                    format!("read credential file {}: {e}", path.display())
                })?;
                let value = contents.lines().next().unwrap_or("").trim_end().to_string();
                if value.is_empty() {
                    return Err(format!("credential file {} is empty", path.display()));
                }
                Ok(Some(Secret(value)))
            }
        }
    }
}

fn is_env_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolved credential value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_forms() {
        assert_eq!(
            CredentialRef::parse("env:CBN_PASSWORD"),
            Ok(CredentialRef::Env("CBN_PASSWORD".to_string()))
        );
        assert_eq!(
            CredentialRef::parse("file:/run/secrets/token"),
            Ok(CredentialRef::File(PathBuf::from("/run/secrets/token")))
        );
        assert_eq!(CredentialRef::parse("none"), Ok(CredentialRef::None));
        assert_eq!(CredentialRef::parse(""), Ok(CredentialRef::None));
    }

    #[test]
    fn rejects_unknown_schemes_and_bad_names() {
        assert!(CredentialRef::parse("vault:x").is_err());
        assert!(CredentialRef::parse("env:1BAD").is_err());
        assert!(CredentialRef::parse("env:HAS-DASH").is_err());
        assert!(CredentialRef::parse("file:").is_err());
    }

    #[test]
    fn resolves_file_reference_and_redacts_debug() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("token");
        fs::write(&path, "s3cr3t\n").expect("write");

        let secret = CredentialRef::File(path)
            .resolve()
            .expect("resolve")
            .expect("secret");
        assert_eq!(secret.expose(), "s3cr3t");
        let debug = format!("{secret:?}");
        assert!(!debug.contains("s3cr3t"));
    }

    #[test]
    fn missing_env_reference_is_an_error() {
        let err = CredentialRef::Env("GENPIPE_TEST_SURELY_UNSET_VAR".to_string())
            .resolve()
            .unwrap_err();
        assert!(err.contains("not set"));
    }
}
