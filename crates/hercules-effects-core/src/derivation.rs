//! Realized derivations as they enter the effect runner.
//!
//! A [`Derivation`] is the already-evaluated build recipe handed over by the
//! evaluation walker: an executable, its arguments, an environment, and a
//! nominal output name. The runner never evaluates expressions; this record
//! is its whole view of the package layer.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved environment entry naming the secrets a derivation requests.
///
/// The value is a JSON object mapping destination names (keys in the
/// provisioned `secrets.json`) to source secret names (keys in the agent's
/// secrets file).
pub const SECRETS_MAP_ENV: &str = "secretsMap";

/// Mapping destination-name → source-secret-name, as declared by a
/// derivation through [`SECRETS_MAP_ENV`].
pub type SecretsMap = BTreeMap<String, String>;

/// A store path identifying a derivation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DrvPath(String);

impl DrvPath {
    /// Wrap a store path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the `path!output` form used by the store build hook into the
    /// derivation path and the requested output name.
    ///
    /// Returns `None` when no `!` separator is present.
    #[must_use]
    pub fn parse_with_output(raw: &str) -> Option<(Self, String)> {
        let (path, output) = raw.split_once('!')?;
        if path.is_empty() || output.is_empty() {
            return None;
        }
        Some((Self::new(path), output.to_string()))
    }
}

impl fmt::Display for DrvPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DrvPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A fully-resolved build recipe. Immutable across a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
    /// Store path of the derivation itself.
    pub path: DrvPath,

    /// Path of the builder executable.
    pub builder: String,

    /// Builder arguments, in order.
    pub args: Vec<String>,

    /// Builder environment.
    pub env: BTreeMap<String, String>,

    /// Nominal output identifier (conventionally `out`).
    pub output_name: String,
}

impl Derivation {
    /// Extract the secrets the derivation requests via the reserved
    /// [`SECRETS_MAP_ENV`] environment entry.
    ///
    /// An absent entry means the derivation requests no secrets and yields
    /// an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsMapError`] when the entry is present but is not a
    /// JSON object of strings.
    pub fn secrets_map(&self) -> Result<SecretsMap, SecretsMapError> {
        match self.env.get(SECRETS_MAP_ENV) {
            None => Ok(SecretsMap::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|source| SecretsMapError {
                drv_path: self.path.clone(),
                source,
            }),
        }
    }
}

/// The `secretsMap` entry of a derivation could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("derivation {drv_path} carries a malformed secretsMap")]
pub struct SecretsMapError {
    /// The derivation whose entry was rejected.
    pub drv_path: DrvPath,
    #[source]
    source: serde_json::Error,
}
