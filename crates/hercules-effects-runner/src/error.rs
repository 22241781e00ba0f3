//! The top-level error type of an effect run.
//!
//! Each subsystem defines its own error enum next to its code; this module
//! aggregates them so callers can match on the kind without string
//! inspection. Errors within a single effect run are fatal to that run —
//! the runner performs no retries at its outer boundary.

use hercules_effects_core::derivation::SecretsMapError;
use hercules_effects_core::ProtocolError;

use crate::container::ContainerError;
use crate::logs::LogShipError;
use crate::proxy::ProxyError;
use crate::rundir::RunDirError;
use crate::secrets::SecretError;
use crate::shortcut::BuildCallbackError;
use crate::worker::WorkerError;

/// Anything that can end an effect run early.
#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    /// Run-directory setup failed.
    #[error(transparent)]
    RunDir(#[from] RunDirError),

    /// The derivation's `secretsMap` entry was malformed.
    #[error(transparent)]
    SecretsMap(#[from] SecretsMapError),

    /// Secret loading or provisioning failed.
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// Container spec construction or runtime invocation failed.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// The daemon proxy failed to come up or misbehaved.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// A protocol stream broke.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The shortcut build callback gave up.
    #[error(transparent)]
    BuildCallback(#[from] BuildCallbackError),

    /// The log pipeline failed to drain.
    #[error(transparent)]
    LogShip(#[from] LogShipError),

    /// A worker-side task failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// An infrastructure invariant was violated.
    #[error("fatal: {0}")]
    Fatal(String),
}
