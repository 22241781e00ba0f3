//! The worker side of the protocol.
//!
//! A worker subprocess owns exactly one protocol stream: framed commands
//! arrive on stdin, framed events leave on stdout, and stderr stays
//! free-form for diagnostics. The verb the worker was launched with fixes
//! the only acceptable starting command; anything else is a fatal protocol
//! violation, reported as an `Exception` event before the process exits
//! with failure.

mod build;
mod daemon;
pub mod eval;

use futures::{SinkExt, StreamExt};
use hercules_effects_core::{Command, Event, MessageCodec, ProtocolError, StartingVerb};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::error;

pub use daemon::HOST_DAEMON_SOCKET;
pub use eval::{serve_eval, EvalContext, Evaluator};

use crate::shortcut::{BuildCallbackError, NixCliStore, StoreError};

/// Options handed to a worker as its single positional JSON argument.
///
/// An ordered list of `(key, value)` pairs; the worker honors the keys it
/// understands (`daemon-socket`, `nix-store`) and logs the rest.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct WorkerOptions(Vec<(String, String)>);

impl WorkerOptions {
    /// Build from `(key, value)` pairs.
    #[must_use]
    pub fn new(options: Vec<(String, String)>) -> Self {
        Self(options)
    }

    /// Parse the positional argument form.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error when the argument is not a JSON
    /// list of string pairs.
    pub fn from_json_arg(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serialize into the positional argument form.
    #[must_use]
    pub fn to_json_arg(&self) -> String {
        serde_json::to_string(&self.0).expect("string pairs always serialize")
    }

    /// Last value set for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The pairs, in order.
    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Worker task failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Protocol framing or discipline violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The shortcut machinery failed.
    #[error(transparent)]
    Callback(#[from] BuildCallbackError),

    /// The daemon proxy socket could not be created.
    #[error("failed to bind proxy socket at {path:?}")]
    SocketBind {
        /// Requested socket path.
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The evaluation walker reported an error.
    #[error("evaluation failed: {message}")]
    Eval {
        /// Rendered walker error.
        message: String,
    },

    /// This worker build carries no evaluation walker.
    #[error("this worker has no evaluation walker linked; use the embedding agent for eval runs")]
    EvaluatorNotLinked,
}

/// Render an error with its source chain for an `Exception` event.
fn render_exception(error: &WorkerError) -> String {
    let mut rendered = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Serve one protocol stream for `verb`.
///
/// Generic over the transport so tests can drive it over in-memory
/// duplexes; production hands it the process stdio.
///
/// Any task failure is serialized as an `Exception` event before the error
/// is returned, after which the caller exits with failure status.
///
/// # Errors
///
/// Returns [`WorkerError`] on protocol violations and task failures.
pub async fn serve<R, W>(
    verb: StartingVerb,
    options: &WorkerOptions,
    input: R,
    output: W,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut commands = FramedRead::new(input, MessageCodec::<Command>::new());
    let mut events = FramedWrite::new(output, MessageCodec::<Event>::new());

    let result = dispatch(verb, options, &mut commands, &mut events).await;

    if let Err(e) = &result {
        error!(error = %e, "worker task failed");
        let _ = events.send(Event::Exception(render_exception(e))).await;
    }
    result
}

async fn dispatch<R, W>(
    verb: StartingVerb,
    options: &WorkerOptions,
    commands: &mut FramedRead<R, MessageCodec<Command>>,
    events: &mut FramedWrite<W, MessageCodec<Event>>,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let first = match commands.next().await {
        Some(Ok(command)) => command,
        Some(Err(e)) => return Err(e.into()),
        None => return Err(ProtocolError::UnexpectedEof.into()),
    };

    if !verb.accepts(&first) {
        return Err(ProtocolError::UnexpectedStartingCommand {
            verb: verb.to_string(),
            got: first.tag().to_string(),
        }
        .into());
    }

    match first {
        Command::StartDaemon { socket_path } => {
            daemon::run_daemon(socket_path, options, commands, events).await
        },
        Command::Build(params) => {
            let store = options
                .get("nix-store")
                .map_or_else(NixCliStore::default, NixCliStore::new);
            build::run_build(&params, &store, events).await
        },
        // The walker is linked by the embedding agent; see `serve_eval`.
        Command::Eval(_) => Err(WorkerError::EvaluatorNotLinked),
        Command::BuildResult { .. } | Command::End => {
            unreachable!("verbs only accept starting commands")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hercules_effects_core::BuildParams;

    /// Drive `serve` over an in-memory transport and return the events it
    /// emitted.
    async fn run_worker(verb: StartingVerb, commands: Vec<Command>) -> Vec<Event> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, client_write) = tokio::io::split(client_io);

        let server = tokio::spawn(async move {
            let _ = serve(verb, &WorkerOptions::default(), server_read, server_write).await;
        });

        let mut sink = FramedWrite::new(client_write, MessageCodec::<Command>::new());
        for command in commands {
            sink.send(command).await.unwrap();
        }
        drop(sink);

        let mut events = Vec::new();
        let mut stream = FramedRead::new(client_read, MessageCodec::<Event>::new());
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        server.await.unwrap();
        events
    }

    #[tokio::test]
    async fn test_non_starting_command_is_fatal() {
        let events = run_worker(StartingVerb::NixDaemon, vec![Command::End]).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Exception(message) => {
                assert!(message.contains("unexpected starting command"));
                assert!(message.contains("End"));
            },
            other => panic!("expected Exception, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eval_without_walker_is_exception() {
        let events = run_worker(
            StartingVerb::Eval,
            vec![Command::Eval(hercules_effects_core::EvalParams {
                expr_path: "ci.nix".to_string(),
                options: vec![],
            })],
        )
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Exception(m) if m.contains("walker")));
    }

    #[tokio::test]
    async fn test_build_verb_reports_results() {
        // A store binary that always succeeds: `true` ignores arguments.
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, client_write) = tokio::io::split(client_io);

        let options = WorkerOptions::new(vec![("nix-store".to_string(), "true".to_string())]);
        let server = tokio::spawn(async move {
            serve(StartingVerb::Build, &options, server_read, server_write).await
        });

        let mut sink = FramedWrite::new(client_write, MessageCodec::<Command>::new());
        sink.send(Command::Build(BuildParams {
            drv_paths: vec!["/nix/store/x-a.drv".into(), "/nix/store/x-b.drv".into()],
        }))
        .await
        .unwrap();
        drop(sink);

        let mut stream = FramedRead::new(client_read, MessageCodec::<Event>::new());
        let mut results = Vec::new();
        while let Some(event) = stream.next().await {
            results.push(event.unwrap());
        }
        server.await.unwrap().unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|event| matches!(
            event,
            Event::BuildResult {
                status: hercules_effects_core::BuildStatus::Success,
                ..
            }
        )));
    }

    #[test]
    fn test_options_round_trip_and_lookup() {
        let options = WorkerOptions::new(vec![
            ("daemon-socket".to_string(), "/tmp/a".to_string()),
            ("daemon-socket".to_string(), "/tmp/b".to_string()),
        ]);
        let parsed = WorkerOptions::from_json_arg(&options.to_json_arg()).unwrap();
        // Later pairs win.
        assert_eq!(parsed.get("daemon-socket"), Some("/tmp/b"));
        assert_eq!(parsed.get("missing"), None);
    }
}
