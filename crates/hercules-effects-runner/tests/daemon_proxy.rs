//! Daemon-proxy lifecycle against the real worker binary.
//!
//! What is tested end-to-end:
//!
//! (a) the worker binds its proxy socket before `DaemonStarted`, so the
//!     socket exists by the time the inner action runs;
//! (b) bytes written to the proxy socket reach the (fake) host daemon and
//!     come back;
//! (c) after the inner action, the worker shuts down well inside the
//!     60-second bound and removes its socket;
//! (d) a worker that dies before readiness surfaces as
//!     `ExitedBeforeReady` with its exit code, and the inner action never
//!     runs;
//! (e) a non-starting first command makes the worker emit `Exception` and
//!     exit with failure status.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use hercules_effects_core::{Command, Event, MessageCodec};
use hercules_effects_runner::{
    with_nix_daemon_proxy, EffectError, ProxyError, WorkerOptions, WorkerSpec,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hercules-effects-worker"))
}

/// A stand-in host daemon that echoes whatever it receives.
fn spawn_fake_daemon(socket_path: &Path) -> tokio::task::JoinHandle<()> {
    let listener = UnixListener::bind(socket_path).unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _addr)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        },
                    }
                }
            });
        }
    })
}

#[tokio::test]
#[cfg_attr(miri, ignore)] // Spawns processes.
async fn proxy_lifecycle_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let host_socket = tmp.path().join("host-daemon.sock");
    let proxy_socket = tmp.path().join("nix-daemon-socket");
    let _daemon = spawn_fake_daemon(&host_socket);

    let worker = WorkerSpec {
        program: worker_binary(),
        options: WorkerOptions::new(vec![(
            "daemon-socket".to_string(),
            host_socket.to_string_lossy().into_owned(),
        )]),
    };

    let started = Instant::now();
    let result = tokio::time::timeout(
        TEST_TIMEOUT,
        with_nix_daemon_proxy(&worker, &proxy_socket, || async {
            // Readiness implies the socket already exists.
            assert!(proxy_socket.exists());

            let mut conn = UnixStream::connect(&proxy_socket).await.unwrap();
            conn.write_all(b"ping").await.unwrap();
            let mut reply = [0u8; 4];
            conn.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"ping");
            drop(conn);

            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, EffectError>(42)
        }),
    )
    .await
    .expect("proxy run timed out")
    .unwrap();

    assert_eq!(result, 42);
    // Orderly shutdown, nowhere near the 60 s abandon bound.
    assert!(started.elapsed() < TEST_TIMEOUT);
    assert!(!proxy_socket.exists());
}

#[tokio::test]
#[cfg_attr(miri, ignore)] // Spawns processes.
async fn worker_death_before_readiness() {
    let tmp = tempfile::tempdir().unwrap();
    let proxy_socket = tmp.path().join("nix-daemon-socket");

    // A worker that consumes the first frame header and dies.
    let script = tmp.path().join("dying-worker.sh");
    std::fs::write(&script, "#!/bin/sh\nhead -c 4 >/dev/null\nexit 7\n").unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();

    let worker = WorkerSpec::new(&script);
    let ran = AtomicBool::new(false);

    let err = tokio::time::timeout(
        TEST_TIMEOUT,
        with_nix_daemon_proxy(&worker, &proxy_socket, || async {
            ran.store(true, Ordering::SeqCst);
            Ok::<_, EffectError>(())
        }),
    )
    .await
    .expect("proxy run timed out")
    .unwrap_err();

    assert!(!ran.load(Ordering::SeqCst));
    match err {
        EffectError::Proxy(ProxyError::ExitedBeforeReady { code }) => assert_eq!(code, 7),
        other => panic!("expected ExitedBeforeReady, got {other:?}"),
    }
}

#[tokio::test]
#[cfg_attr(miri, ignore)] // Spawns processes.
async fn non_starting_command_is_exception_and_failure_exit() {
    let mut child = tokio::process::Command::new(worker_binary())
        .arg("nix-daemon")
        .arg("[]")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let mut commands = FramedWrite::new(
        child.stdin.take().unwrap(),
        MessageCodec::<Command>::new(),
    );
    let mut events = FramedRead::new(
        child.stdout.take().unwrap(),
        MessageCodec::<Event>::new(),
    );

    commands.send(Command::End).await.unwrap();

    let event = tokio::time::timeout(TEST_TIMEOUT, events.next())
        .await
        .expect("no event before timeout")
        .unwrap()
        .unwrap();
    match event {
        Event::Exception(message) => {
            assert!(message.contains("unexpected starting command"));
        },
        other => panic!("expected Exception, got {other:?}"),
    }

    let status = tokio::time::timeout(TEST_TIMEOUT, child.wait())
        .await
        .expect("worker did not exit")
        .unwrap();
    assert!(!status.success());
}
