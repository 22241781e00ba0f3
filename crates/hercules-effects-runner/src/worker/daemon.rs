//! The `nix-daemon` worker task.
//!
//! Creates the proxy socket the container will see as its store daemon and
//! forwards every client connection to the host daemon. The socket is
//! bound *before* `DaemonStarted` is emitted, so once the controller has
//! observed readiness it may bind-mount the path without racing.

use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use hercules_effects_core::{Command, Event, MessageCodec};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::{WorkerError, WorkerOptions};

/// Default host daemon socket proxied to.
pub const HOST_DAEMON_SOCKET: &str = "/nix/var/nix/daemon-socket/socket";

/// Serve the proxy socket until the command stream terminates.
pub(super) async fn run_daemon<R, W>(
    socket_path: PathBuf,
    options: &WorkerOptions,
    commands: &mut FramedRead<R, MessageCodec<Command>>,
    events: &mut FramedWrite<W, MessageCodec<Event>>,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let host_socket = options
        .get("daemon-socket")
        .map_or_else(|| PathBuf::from(HOST_DAEMON_SOCKET), PathBuf::from);
    for (key, value) in options.iter() {
        if key != "daemon-socket" {
            debug!(key, value, "ignoring unrecognized worker option");
        }
    }

    let bind_err = |source| WorkerError::SocketBind {
        path: socket_path.clone(),
        source,
    };
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(bind_err)?;
    }
    // A stale socket from an abandoned run would make the bind fail.
    match std::fs::remove_file(&socket_path) {
        Ok(()) => warn!(path = %socket_path.display(), "removed stale proxy socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(bind_err(e)),
    }
    let listener = UnixListener::bind(&socket_path).map_err(bind_err)?;

    // Readiness only after the socket exists.
    events.send(Event::DaemonStarted).await.map_err(WorkerError::from)?;
    info!(
        socket = %socket_path.display(),
        upstream = %host_socket.display(),
        "daemon proxy ready"
    );

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            command = commands.next() => match command {
                Some(Ok(Command::End)) | None => break,
                Some(Ok(other)) => {
                    warn!(command = other.tag(), "ignoring command while proxying");
                },
                Some(Err(e)) => return Err(e.into()),
            },
            accepted = listener.accept() => match accepted {
                Ok((client, _addr)) => {
                    let upstream = host_socket.clone();
                    connections.spawn(proxy_connection(client, upstream));
                },
                Err(e) => {
                    warn!(error = %e, "failed to accept proxy connection");
                },
            },
        }
    }

    // Clients are gone once the container has exited; let in-flight
    // connections run down to their EOFs.
    drop(listener);
    while connections.join_next().await.is_some() {}
    if let Err(e) = std::fs::remove_file(&socket_path) {
        debug!(error = %e, "proxy socket already gone");
    }
    info!("daemon proxy stopped");

    Ok(())
}

/// Shuttle bytes between one client and the host daemon.
async fn proxy_connection(mut client: UnixStream, upstream_path: PathBuf) {
    let mut upstream = match UnixStream::connect(&upstream_path).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                upstream = %upstream_path.display(),
                error = %e,
                "failed to reach host daemon"
            );
            return;
        },
    };

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(to_upstream, to_client, "proxy connection finished");
        },
        Err(e) => {
            debug!(error = %e, "proxy connection aborted");
        },
    }
}
