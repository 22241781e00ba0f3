//! The evaluation harness.
//!
//! The attribute walker itself lives in the embedding agent; this module
//! supplies everything around it: the shared [`BuildState`], the command
//! reader that records remote build completions, and the
//! sentinel-terminated event channel with its single writer. A walker only
//! sees [`EvalContext`].

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hercules_effects_core::{Command, DrvPath, EvalParams, Event, MessageCodec};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::warn;

use super::{render_exception, WorkerError};
use crate::shortcut::{shortcut_build, BuildCallbackError, BuildState, NixStore};

/// Depth of the event queue between producers and the protocol writer.
const EVENT_QUEUE_DEPTH: usize = 64;

/// An attribute walker provided by the embedding agent.
pub trait Evaluator<S: NixStore>: Send {
    /// Walk the tree described by `params`, reporting through `ctx`.
    fn walk(
        &mut self,
        params: &EvalParams,
        ctx: &EvalContext<S>,
    ) -> impl std::future::Future<Output = Result<(), WorkerError>> + Send;
}

/// The walker's view of the evaluation run.
pub struct EvalContext<S> {
    state: Arc<BuildState>,
    store: Arc<S>,
}

impl<S: NixStore> EvalContext<S> {
    /// Report an attribute that evaluated to a derivation.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the event channel is closed.
    pub async fn emit_attribute(
        &self,
        path: Vec<String>,
        drv: DrvPath,
    ) -> Result<(), WorkerError> {
        Ok(self.state.emit(Event::Attribute { path, drv }).await?)
    }

    /// Report an attribute that failed to evaluate.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the event channel is closed.
    pub async fn emit_attribute_error(
        &self,
        path: Vec<String>,
        message: impl Into<String>,
        error_derivation: Option<String>,
        error_type: Option<String>,
    ) -> Result<(), WorkerError> {
        Ok(self
            .state
            .emit(Event::AttributeError {
                path,
                message: message.into(),
                error_derivation,
                error_type,
            })
            .await?)
    }

    /// Make an output available, requesting a remote build if substitution
    /// cannot provide it.
    ///
    /// This is the store build hook surface; walkers call it when forcing
    /// a derivation output that is missing locally.
    ///
    /// # Errors
    ///
    /// Returns [`BuildCallbackError`] per the shortcut retry policy.
    pub async fn ensure_output(
        &self,
        drv: &DrvPath,
        output: &str,
    ) -> Result<(), BuildCallbackError> {
        shortcut_build(&self.state, self.store.as_ref(), &format!("{drv}!{output}")).await
    }
}

/// Run one evaluation stream: start the command reader and event writer,
/// run the walker, then drain.
///
/// The embedding agent installs the process-wide store build hook (see
/// [`crate::shortcut::install_build_hook`]) around this call when its
/// store layer needs the callback; the harness itself only requires the
/// [`EvalContext`] surface.
///
/// # Errors
///
/// Returns [`WorkerError`] on walker failure or a broken event stream.
/// Walker failures are reported to the controller as an `Exception` event
/// before this returns.
pub async fn serve_eval<R, W, S, E>(
    params: EvalParams,
    mut walker: E,
    store: Arc<S>,
    commands: FramedRead<R, MessageCodec<Command>>,
    events: FramedWrite<W, MessageCodec<Event>>,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: NixStore + Send + Sync + 'static,
    E: Evaluator<S>,
{
    let (shortcut_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let state = Arc::new(BuildState::new(shortcut_tx));

    let writer = spawn_event_writer(event_rx, events);
    let reader = spawn_command_reader(commands, Arc::clone(&state));

    let ctx = EvalContext {
        state: Arc::clone(&state),
        store,
    };
    let walk_result = walker.walk(&params, &ctx).await;

    match &walk_result {
        Ok(()) => {
            let _ = state.emit(Event::EvaluationDone).await;
        },
        Err(e) => {
            let _ = state.emit(Event::Exception(render_exception(e))).await;
        },
    }
    state.finish().await;

    // The writer drains everything queued before the sentinel.
    match writer.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => {
            walk_result?;
            return Err(e.into());
        },
        Err(e) => {
            walk_result?;
            return Err(WorkerError::Eval {
                message: format!("event writer panicked: {e}"),
            });
        },
    }
    reader.abort();

    walk_result
}

/// Single owner of the outbound event stream.
fn spawn_event_writer<W>(
    mut event_rx: mpsc::Receiver<Option<Event>>,
    mut events: FramedWrite<W, MessageCodec<Event>>,
) -> tokio::task::JoinHandle<Result<(), hercules_effects_core::ProtocolError>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(Some(event)) = event_rx.recv().await {
            events.send(event).await?;
        }
        Ok(())
    })
}

/// Single writer of `BuildState::completed`.
fn spawn_command_reader<R>(
    mut commands: FramedRead<R, MessageCodec<Command>>,
    state: Arc<BuildState>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(next) = commands.next().await {
            match next {
                Ok(Command::BuildResult {
                    path,
                    attempt,
                    status,
                }) => {
                    state.record_completed(path, attempt, status);
                },
                Ok(Command::End) => break,
                Ok(other) => {
                    warn!(command = other.tag(), "ignoring command during evaluation");
                },
                Err(e) => {
                    warn!(error = %e, "command stream failed during evaluation");
                    break;
                },
            }
        }
    })
}
