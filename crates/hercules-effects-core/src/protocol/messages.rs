//! Typed command and event variants carried by the worker protocol.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::derivation::DrvPath;

/// Identifier of one remote build attempt.
///
/// A retried build gets a fresh attempt id, which is how the shortcut
/// callback distinguishes a stale completion record from the retry it is
/// actually waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(Uuid);

impl AttemptId {
    /// Mint a fresh attempt id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a remote build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    /// The outputs were produced and should be substitutable.
    Success,
    /// The build itself failed.
    Failure,
    /// A dependency of the build failed.
    DependencyFailure,
}

impl BuildStatus {
    /// Whether this status rules out a usable output.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failure | Self::DependencyFailure)
    }
}

/// Parameters of an evaluation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalParams {
    /// Path of the expression tree to walk.
    pub expr_path: String,

    /// Store settings applied for the duration of the walk.
    pub options: Vec<(String, String)>,
}

/// Parameters of a build task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParams {
    /// Derivations to realise.
    pub drv_paths: Vec<DrvPath>,
}

/// Commands flowing controller → worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Start an evaluation walk. Starting command for the `eval` verb.
    Eval(EvalParams),

    /// Realise derivations. Starting command for the `build` verb.
    Build(BuildParams),

    /// Report a remote build completion back to an evaluating worker.
    BuildResult {
        /// Derivation the attempt was for.
        path: DrvPath,
        /// Attempt being reported.
        attempt: AttemptId,
        /// Outcome of the attempt.
        status: BuildStatus,
    },

    /// Bring up the store-daemon proxy socket. Starting command for the
    /// `nix-daemon` verb.
    StartDaemon {
        /// Where the worker must create the listening socket.
        socket_path: PathBuf,
    },

    /// Distinguished command-stream terminator.
    End,
}

impl Command {
    /// The variant tag, for diagnostics.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Eval(_) => "Eval",
            Self::Build(_) => "Build",
            Self::BuildResult { .. } => "BuildResult",
            Self::StartDaemon { .. } => "StartDaemon",
            Self::End => "End",
        }
    }
}

/// Events flowing worker → controller, in producer order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// An attribute of the walked tree evaluated to a derivation.
    Attribute {
        /// Attribute path within the tree.
        path: Vec<String>,
        /// The derivation it produced.
        drv: DrvPath,
    },

    /// An attribute failed to evaluate.
    AttributeError {
        /// Attribute path within the tree.
        path: Vec<String>,
        /// Rendered error message.
        message: String,
        /// Derivation the error pertains to, when known.
        error_derivation: Option<String>,
        /// Error type name, when the runtime exposes one.
        error_type: Option<String>,
    },

    /// The worker needs `drv_path`'s output built remotely.
    Build {
        /// Derivation to build.
        drv_path: DrvPath,
        /// Output the evaluation is blocked on.
        output_name: String,
        /// Previous attempt, when this is a retry request.
        previous_attempt: Option<AttemptId>,
    },

    /// A build task finished realising one derivation.
    BuildResult {
        /// Derivation that was realised.
        path: DrvPath,
        /// Attempt this result belongs to.
        attempt: AttemptId,
        /// Outcome.
        status: BuildStatus,
    },

    /// The daemon proxy socket exists and accepts connections.
    DaemonStarted,

    /// A recoverable error, reported without ending the stream.
    Error(String),

    /// A fatal worker error; the worker exits with failure after sending
    /// this.
    Exception(String),

    /// The evaluation walk completed.
    EvaluationDone,
}

/// The verb a worker subprocess was launched with.
///
/// The verb fixes the only acceptable starting command; anything else is a
/// fatal protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartingVerb {
    /// Walk an expression tree, emitting attributes and build requests.
    Eval,
    /// Realise derivations.
    Build,
    /// Serve a store-daemon proxy socket.
    NixDaemon,
}

impl StartingVerb {
    /// Whether `command` may start a stream for this verb.
    #[must_use]
    pub fn accepts(self, command: &Command) -> bool {
        matches!(
            (self, command),
            (Self::Eval, Command::Eval(_))
                | (Self::Build, Command::Build(_))
                | (Self::NixDaemon, Command::StartDaemon { .. })
        )
    }
}

impl fmt::Display for StartingVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eval => f.write_str("eval"),
            Self::Build => f.write_str("build"),
            Self::NixDaemon => f.write_str("nix-daemon"),
        }
    }
}

impl std::str::FromStr for StartingVerb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eval" => Ok(Self::Eval),
            "build" => Ok(Self::Build),
            "nix-daemon" => Ok(Self::NixDaemon),
            other => Err(format!("unknown worker verb: {other}")),
        }
    }
}
