//! Loading and provisioning of effect secrets.
//!
//! The agent keeps a single JSON secrets file; a derivation asks for entries
//! out of it through its `secretsMap`. Provisioning resolves that request,
//! enforces each secret's access condition, and writes the allowed subset
//! into the sandbox-visible `secrets.json` — with every condition stripped.
//!
//! Secret material is wrapped in [`Sensitive`] from the moment it is parsed
//! and leaves this module only through the file write.

mod provision;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hercules_effects_core::{Secret, Sensitive};

pub use provision::provision_secrets;

/// File name of the provisioned secrets inside the sandbox secrets
/// directory.
pub const SECRETS_FILE_NAME: &str = "secrets.json";

/// Upper bound on the secrets file size, checked before reading.
const MAX_SECRETS_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Load the agent's secrets file.
///
/// `None` means no secrets file is configured, which is not an error: the
/// result is an empty (wrapped) map. The file is read eagerly, once per
/// effect run.
///
/// # Errors
///
/// Returns [`SecretError::Unreadable`] when the configured file cannot be
/// read and [`SecretError::Unparseable`] when it exists but is malformed.
pub fn load_secrets_file(
    path: Option<&Path>,
) -> Result<Sensitive<BTreeMap<String, Secret>>, SecretError> {
    let Some(path) = path else {
        return Ok(Sensitive::new(BTreeMap::new()));
    };

    let size = std::fs::metadata(path)
        .map_err(|source| SecretError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    if size > MAX_SECRETS_FILE_SIZE {
        return Err(SecretError::TooLarge {
            path: path.to_path_buf(),
            size,
        });
    }

    let raw = std::fs::read(path).map_err(|source| SecretError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = serde_json::from_slice(&raw).map_err(|source| SecretError::Unparseable {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(Sensitive::new(parsed))
}

/// Secret loading and provisioning failures.
///
/// Variants name the *destination* of a request, never secret contents.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The configured secrets file could not be read.
    #[error("secrets file {path:?} is not readable")]
    Unreadable {
        /// Configured secrets file path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The secrets file exists but is not valid JSON of the expected shape.
    #[error("secrets file {path:?} is malformed")]
    Unparseable {
        /// Configured secrets file path.
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The secrets file exceeds the size bound.
    #[error("secrets file {path:?} is implausibly large ({size} bytes)")]
    TooLarge {
        /// Configured secrets file path.
        path: PathBuf,
        /// Observed size.
        size: u64,
    },

    /// The requested secret does not exist or its condition denied access.
    #[error("access to secret {name:?} was denied")]
    AccessDenied {
        /// Destination name from the derivation's `secretsMap`.
        name: String,
    },

    /// Strict mode requires a condition and the secret has none.
    #[error("secret {name:?} has no access condition; it can only be used with --friendly runs")]
    ConditionMissing {
        /// Destination name from the derivation's `secretsMap`.
        name: String,
    },

    /// The provisioned file could not be written.
    #[error("failed to write provisioned secrets to {path:?}")]
    WriteFailed {
        /// Destination path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_no_path_yields_empty_map() {
        let secrets = load_secrets_file(None).unwrap();
        assert!(secrets.expose().is_empty());
    }

    #[test]
    fn test_load_parses_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"deploy":{{"data":{{"k":"v"}},"condition":{{"IsBranch":"main"}}}}}}"#
        )
        .unwrap();

        let secrets = load_secrets_file(Some(file.path())).unwrap();
        let deploy = secrets.expose().get("deploy").unwrap();
        assert_eq!(deploy.data.get("k").unwrap(), "v");
        assert!(deploy.condition.is_some());
    }

    #[test]
    fn test_malformed_file_is_unparseable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = load_secrets_file(Some(file.path())).unwrap_err();
        assert!(matches!(err, SecretError::Unparseable { .. }));
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_secrets_file(Some(&tmp.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, SecretError::Unreadable { .. }));
    }
}
