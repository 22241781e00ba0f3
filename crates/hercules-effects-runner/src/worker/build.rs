//! The `build` worker task.

use futures::SinkExt;
use hercules_effects_core::{AttemptId, BuildParams, BuildStatus, Event, MessageCodec};
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;
use tracing::{info, warn};

use super::WorkerError;
use crate::shortcut::NixStore;

/// Realise each requested derivation and report one `BuildResult` per
/// path, in request order.
///
/// A failed realisation is an outcome, not a task error: the status in the
/// event carries it and the worker exits cleanly.
pub(super) async fn run_build<W, S>(
    params: &BuildParams,
    store: &S,
    events: &mut FramedWrite<W, MessageCodec<Event>>,
) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin + Send + 'static,
    S: NixStore,
{
    for drv_path in &params.drv_paths {
        let attempt = AttemptId::new();
        let status = match store.realise(drv_path).await {
            Ok(()) => {
                info!(drv = %drv_path, %attempt, "derivation realised");
                BuildStatus::Success
            },
            Err(e) => {
                warn!(drv = %drv_path, %attempt, error = %e, "derivation failed");
                BuildStatus::Failure
            },
        };

        events
            .send(Event::BuildResult {
                path: drv_path.clone(),
                attempt,
                status,
            })
            .await
            .map_err(WorkerError::from)?;
    }

    Ok(())
}
