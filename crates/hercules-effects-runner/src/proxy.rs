//! Supervision of the store-daemon proxy subprocess.
//!
//! When an effect needs store access, the runner brings up a worker
//! subprocess in its `nix-daemon` verb. The worker creates a Unix socket
//! that is then bind-mounted into the container as the daemon socket; the
//! worker proxies every connection to the host daemon.
//!
//! Lifecycle: `Spawning → Ready → Running → Draining → Stopped`, where a
//! worker death before readiness is the failure absorbing state. Shutdown
//! is bounded: after the command-stream terminator is sent, the child gets
//! 60 seconds to exit before it is abandoned with a warning — never an
//! error, because by then the effect's outcome is already decided.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hercules_effects_core::{Command, Event, MessageCodec, ProtocolError, StartingVerb};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::error::EffectError;
use crate::worker::WorkerOptions;

/// How long an exiting proxy child is waited for before being abandoned.
pub const DAEMON_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// How a worker subprocess is launched.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Path of the `hercules-effects-worker` binary.
    pub program: PathBuf,

    /// Store options forwarded to the worker (serialized as its single
    /// positional argument).
    pub options: WorkerOptions,
}

impl WorkerSpec {
    /// A spec with no extra options.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            options: WorkerOptions::default(),
        }
    }
}

/// Daemon proxy supervision failures.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The worker could not be spawned.
    #[error("failed to spawn worker {program:?}")]
    Spawn {
        /// Worker binary.
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The worker exited before emitting `DaemonStarted`.
    #[error("nix-daemon worker exited before readiness (exit code {code})")]
    ExitedBeforeReady {
        /// The worker's exit code.
        code: i32,
    },

    /// The worker reported a fatal error before readiness.
    #[error("nix-daemon worker failed: {message}")]
    Worker {
        /// Rendered exception text from the worker.
        message: String,
    },

    /// The protocol stream to the worker broke.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Run `inner` with a store-daemon proxy socket available at
/// `socket_path`.
///
/// The socket exists before `inner` starts: the worker binds it before
/// emitting `DaemonStarted`, and this function does not return from its
/// readiness wait until that event arrives. `inner`'s result is returned
/// unchanged; proxy shutdown problems after `inner` completes are logged,
/// not propagated.
///
/// # Errors
///
/// Returns [`ProxyError`] (wrapped in [`EffectError`]) when the worker
/// cannot be spawned or dies before readiness, and `inner`'s own error
/// otherwise.
pub async fn with_nix_daemon_proxy<T, F, Fut>(
    spec: &WorkerSpec,
    socket_path: &Path,
    inner: F,
) -> Result<T, EffectError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, EffectError>>,
{
    let mut child = tokio::process::Command::new(&spec.program)
        .arg(StartingVerb::NixDaemon.to_string())
        .arg(spec.options.to_json_arg())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(false)
        .spawn()
        .map_err(|source| ProxyError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    let stdin = child.stdin.take().expect("stdin was requested piped");
    let stdout = child.stdout.take().expect("stdout was requested piped");
    let mut commands = FramedWrite::new(stdin, MessageCodec::<Command>::new());
    let mut events = FramedRead::new(stdout, MessageCodec::<Event>::new());

    commands
        .send(Command::StartDaemon {
            socket_path: socket_path.to_path_buf(),
        })
        .await
        .map_err(ProxyError::from)?;

    // Readiness: the socket is guaranteed to exist once DaemonStarted is
    // observed.
    loop {
        match events.next().await {
            Some(Ok(Event::DaemonStarted)) => break,
            Some(Ok(Event::Exception(message))) => {
                return Err(ProxyError::Worker { message }.into());
            },
            Some(Ok(other)) => {
                debug!(event = ?other, "ignoring event before daemon readiness");
            },
            Some(Err(e)) => return Err(ProxyError::from(e).into()),
            None => {
                let status = child.wait().await.map_err(ProtocolError::Io).map_err(ProxyError::from)?;
                return Err(ProxyError::ExitedBeforeReady {
                    code: status.code().unwrap_or(-1),
                }
                .into());
            },
        }
    }

    let result = inner().await;

    // Drain remaining events in the background so the child never blocks
    // on a full stdout pipe while shutting down.
    let drain = tokio::spawn(async move { while events.next().await.is_some() {} });

    if let Err(e) = commands.send(Command::End).await {
        debug!(error = %e, "worker command stream already closed");
    }
    drop(commands);

    match tokio::time::timeout(DAEMON_SHUTDOWN_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) if status.success() => {
            debug!("nix-daemon worker exited cleanly");
        },
        Ok(Ok(status)) => {
            warn!(?status, "nix-daemon worker exited with failure");
        },
        Ok(Err(e)) => {
            warn!(error = %e, "failed waiting for nix-daemon worker");
        },
        Err(_) => {
            warn!(
                timeout_secs = DAEMON_SHUTDOWN_TIMEOUT.as_secs(),
                "nix-daemon worker did not exit in time; abandoning it"
            );
        },
    }
    drain.abort();

    result
}
