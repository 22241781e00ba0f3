//! Sandboxed execution of effect derivations.
//!
//! An *effect* is a derivation whose purpose is to cause side effects —
//! deploys, notifications — and which therefore runs with network access,
//! provisioned secrets, and a gateway to the store daemon. This crate owns
//! the whole lifecycle of one such run:
//!
//! - [`rundir`]: the per-run directory layout bind-mounted into the sandbox.
//! - [`secrets`]: the secrets-file reader and the condition-checked
//!   provisioner that materializes `secrets.json`.
//! - [`container`]: runtime-spec construction and the `runc` invocation.
//! - [`proxy`]: supervision of the `nix-daemon` worker subprocess whose
//!   socket is bind-mounted into the container.
//! - [`worker`]: the worker side of the protocol — the daemon-socket task,
//!   the build task, and the evaluation harness.
//! - [`shortcut`]: the store build hook that turns a missing output during
//!   evaluation into a remote build request with bounded substitution
//!   retries.
//! - [`logs`]: the staged pipeline shipping build logs to the agent socket.
//! - [`run`]: the orchestration tying the above together.

pub mod container;
pub mod error;
pub mod logs;
pub mod proxy;
pub mod run;
pub mod rundir;
pub mod secrets;
pub mod shortcut;
pub mod worker;

pub use container::{BindMount, ContainerConfig, ContainerError, ContainerRuntime};
pub use error::EffectError;
pub use logs::{LogFrame, LogKind, LogMessage, LogShipError, LogShipper, LOG_DRAIN_TIMEOUT};
pub use proxy::{with_nix_daemon_proxy, ProxyError, WorkerSpec, DAEMON_SHUTDOWN_TIMEOUT};
pub use run::{EffectRunner, RunEffectParams};
pub use rundir::{EffectPaths, RunDirError};
pub use secrets::{load_secrets_file, provision_secrets, SecretError, SECRETS_FILE_NAME};
pub use shortcut::{
    install_build_hook, installed_build_hook, shortcut_build, BuildCallbackError, BuildHook,
    BuildHookGuard, BuildState, NixCliStore, NixStore, StoreError,
};
pub use worker::{serve, WorkerError, WorkerOptions, HOST_DAEMON_SOCKET};
