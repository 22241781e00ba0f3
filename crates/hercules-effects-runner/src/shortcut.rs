//! The store build hook that turns a missing output during evaluation into
//! a remote build.
//!
//! When the evaluation walker forces a derivation whose output is not in
//! the local store, the store layer calls the installed hook with
//! `drvPath!outputName`. The hook asks the controller (via a `Build`
//! event) to build the derivation remotely, then tries to substitute the
//! output, with one controller-side retry before giving up.
//!
//! State is shared between the hook (called from the evaluation task) and
//! the protocol reader that records completed builds, as a record of
//! independently synchronized fields rather than one shared aggregate.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use hercules_effects_core::{AttemptId, BuildStatus, DrvPath, Event};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

/// Abstract store operations the shortcut hook depends on.
///
/// The production implementation drives the store through the CLI; tests
/// use scripted fakes.
pub trait NixStore: Send + Sync {
    /// Make `output` of `drv` available locally, substituting if possible.
    fn ensure_output(
        &self,
        drv: &DrvPath,
        output: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Realise a derivation, building it if necessary.
    fn realise(&self, drv: &DrvPath)
        -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Forget negative substituter lookups so a fresh `ensure_output` can
    /// see newly pushed outputs.
    fn clear_substituter_caches(&self);

    /// Forget cached path-info entries.
    fn clear_path_info_cache(&self);
}

/// Store operation failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store command exited with failure.
    #[error("store command exited with {code}")]
    CommandFailed {
        /// Exit code of the store command.
        code: i32,
    },

    /// The store command could not be run.
    #[error("failed to run store command")]
    Io(#[from] std::io::Error),
}

/// CLI-backed store implementation.
///
/// Every invocation is a fresh process, so the cache-clearing operations
/// are inherently satisfied and reduce to debug logging.
#[derive(Debug, Clone)]
pub struct NixCliStore {
    program: PathBuf,
}

impl Default for NixCliStore {
    fn default() -> Self {
        Self {
            program: PathBuf::from("nix-store"),
        }
    }
}

impl NixCliStore {
    /// Use a specific `nix-store` binary.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run_realise(&self, target: &str) -> Result<(), StoreError> {
        let status = tokio::process::Command::new(&self.program)
            .arg("--realise")
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(StoreError::CommandFailed {
                code: status.code().unwrap_or(-1),
            })
        }
    }
}

impl NixStore for NixCliStore {
    async fn ensure_output(&self, drv: &DrvPath, output: &str) -> Result<(), StoreError> {
        self.run_realise(&format!("{drv}!{output}")).await
    }

    async fn realise(&self, drv: &DrvPath) -> Result<(), StoreError> {
        self.run_realise(drv.as_str()).await
    }

    fn clear_substituter_caches(&self) {
        debug!("substituter caches are per-invocation for the CLI store");
    }

    fn clear_path_info_cache(&self) {
        debug!("path-info cache is per-invocation for the CLI store");
    }
}

/// Shared state between the evaluation task and the protocol reader.
pub struct BuildState {
    /// Completed remote builds, written only by the protocol reader.
    completed: Mutex<HashMap<DrvPath, (AttemptId, BuildStatus)>>,

    /// Wakes hook calls waiting on `completed`.
    completed_changed: Notify,

    /// Derivations with a shortcut request in flight.
    in_progress: Mutex<HashSet<DrvPath>>,

    /// Events bound for the controller; `None` is the end-of-stream
    /// sentinel enqueued by [`BuildState::finish`].
    shortcut_tx: mpsc::Sender<Option<Event>>,
}

impl BuildState {
    /// Create state whose emitted events flow into `shortcut_tx`.
    #[must_use]
    pub fn new(shortcut_tx: mpsc::Sender<Option<Event>>) -> Self {
        Self {
            completed: Mutex::new(HashMap::new()),
            completed_changed: Notify::new(),
            in_progress: Mutex::new(HashSet::new()),
            shortcut_tx,
        }
    }

    /// Atomically mark `drv` as having a shortcut request in flight.
    ///
    /// Exactly one of any number of concurrent callers acquires the
    /// marker; the rest fail with [`BuildCallbackError::ConcurrentBuild`],
    /// which signals that substitution should have succeeded and did not.
    pub fn begin(self: &Arc<Self>, drv: &DrvPath) -> Result<InProgressMarker, BuildCallbackError> {
        let mut in_progress = self.in_progress.lock().expect("in_progress lock poisoned");
        if !in_progress.insert(drv.clone()) {
            return Err(BuildCallbackError::ConcurrentBuild {
                drv_path: drv.clone(),
            });
        }
        Ok(InProgressMarker {
            state: Arc::clone(self),
            drv: drv.clone(),
        })
    }

    /// Record a completed remote build and wake waiters.
    ///
    /// Single-writer: only the protocol reader calls this.
    pub fn record_completed(&self, drv: DrvPath, attempt: AttemptId, status: BuildStatus) {
        self.completed
            .lock()
            .expect("completed lock poisoned")
            .insert(drv, (attempt, status));
        self.completed_changed.notify_waiters();
    }

    /// Wait until `completed` holds an attempt for `drv` other than
    /// `exclude`.
    pub async fn await_completed(
        &self,
        drv: &DrvPath,
        exclude: Option<AttemptId>,
    ) -> (AttemptId, BuildStatus) {
        loop {
            // Register interest before checking, so a record landing
            // between the check and the await still wakes us.
            let notified = self.completed_changed.notified();
            if let Some(&(attempt, status)) = self
                .completed
                .lock()
                .expect("completed lock poisoned")
                .get(drv)
            {
                if Some(attempt) != exclude {
                    return (attempt, status);
                }
            }
            notified.await;
        }
    }

    /// Queue an event for the controller.
    pub async fn emit(&self, event: Event) -> Result<(), BuildCallbackError> {
        self.shortcut_tx
            .send(Some(event))
            .await
            .map_err(|_| BuildCallbackError::ChannelClosed)
    }

    /// Enqueue the end-of-stream sentinel.
    pub async fn finish(&self) {
        let _ = self.shortcut_tx.send(None).await;
    }
}

/// RAII marker for a shortcut request in flight.
///
/// Dropping releases the marker on every exit path of the hook.
pub struct InProgressMarker {
    state: Arc<BuildState>,
    drv: DrvPath,
}

impl Drop for InProgressMarker {
    fn drop(&mut self) {
        self.state
            .in_progress
            .lock()
            .expect("in_progress lock poisoned")
            .remove(&self.drv);
    }
}

/// Shortcut hook failures.
#[derive(Debug, thiserror::Error)]
pub enum BuildCallbackError {
    /// A shortcut request for this derivation is already in flight.
    #[error("refusing concurrent build request for {drv_path}; its output should have been substitutable")]
    ConcurrentBuild {
        /// The contested derivation.
        drv_path: DrvPath,
    },

    /// The remote build failed, or its output stayed unavailable.
    #[error("build of {drv_path} failed: {detail}")]
    Build {
        /// The derivation that could not be provided.
        drv_path: DrvPath,
        /// What went wrong.
        detail: String,
    },

    /// The store layer passed a request that is not `path!output`.
    #[error("malformed build request {raw:?}")]
    MalformedRequest {
        /// The raw request string.
        raw: String,
    },

    /// The controller side of the shortcut channel is gone.
    #[error("shortcut event channel closed")]
    ChannelClosed,

    /// A build hook is already installed in this process.
    #[error("a store build hook is already installed")]
    AlreadyInstalled,
}

/// Handle a missing output reported by the store layer as
/// `drvPath!outputName`.
///
/// Emits `Build` events for the controller and retries substitution with
/// cleared caches after each reported completion; at most two remote
/// attempts are consumed before giving up.
///
/// # Errors
///
/// Returns [`BuildCallbackError`] on concurrent requests, failed builds,
/// and outputs that stay unavailable after a reported successful rebuild.
pub async fn shortcut_build<S: NixStore>(
    state: &Arc<BuildState>,
    store: &S,
    raw_request: &str,
) -> Result<(), BuildCallbackError> {
    let Some((drv_path, output_name)) = DrvPath::parse_with_output(raw_request) else {
        return Err(BuildCallbackError::MalformedRequest {
            raw: raw_request.to_string(),
        });
    };

    let _marker = state.begin(&drv_path)?;

    state
        .emit(Event::Build {
            drv_path: drv_path.clone(),
            output_name: output_name.clone(),
            previous_attempt: None,
        })
        .await?;

    // Naive substitution; the controller may still be building.
    if store.ensure_output(&drv_path, &output_name).await.is_ok() {
        return Ok(());
    }

    let (attempt0, status0) = state.await_completed(&drv_path, None).await;
    check_status(&drv_path, attempt0, status0)?;

    store.clear_substituter_caches();
    store.clear_path_info_cache();
    if store.ensure_output(&drv_path, &output_name).await.is_ok() {
        return Ok(());
    }

    info!(drv = %drv_path, "output still unavailable after reported build; requesting a retry");
    state
        .emit(Event::Build {
            drv_path: drv_path.clone(),
            output_name: output_name.clone(),
            previous_attempt: Some(attempt0),
        })
        .await?;

    let (attempt1, status1) = state.await_completed(&drv_path, Some(attempt0)).await;
    check_status(&drv_path, attempt1, status1)?;

    store.clear_substituter_caches();
    store.clear_path_info_cache();
    if store.ensure_output(&drv_path, &output_name).await.is_ok() {
        return Ok(());
    }

    Err(BuildCallbackError::Build {
        drv_path,
        detail: format!(
            "substitution failed even though attempt {attempt1} reported a successful rebuild"
        ),
    })
}

fn check_status(
    drv_path: &DrvPath,
    attempt: AttemptId,
    status: BuildStatus,
) -> Result<(), BuildCallbackError> {
    if status.is_failure() {
        return Err(BuildCallbackError::Build {
            drv_path: drv_path.clone(),
            detail: format!("attempt {attempt} reported {status:?}"),
        });
    }
    Ok(())
}

/// The process-wide build hook installed into the store layer before
/// evaluation begins.
pub struct BuildHook {
    /// Shared evaluation state.
    pub state: Arc<BuildState>,
}

static INSTALLED_HOOK: Mutex<Option<Arc<BuildHook>>> = Mutex::new(None);

/// Install `hook` as the process-wide store build hook.
///
/// Initialization-once: a second install fails until the returned guard is
/// dropped. Concurrent evaluation runs in one process are not supported.
///
/// # Errors
///
/// Returns [`BuildCallbackError::AlreadyInstalled`] when a hook is
/// present.
pub fn install_build_hook(hook: Arc<BuildHook>) -> Result<BuildHookGuard, BuildCallbackError> {
    let mut installed = INSTALLED_HOOK.lock().expect("hook lock poisoned");
    if installed.is_some() {
        return Err(BuildCallbackError::AlreadyInstalled);
    }
    *installed = Some(hook);
    Ok(BuildHookGuard { _private: () })
}

/// The currently installed hook, if any.
#[must_use]
pub fn installed_build_hook() -> Option<Arc<BuildHook>> {
    INSTALLED_HOOK.lock().expect("hook lock poisoned").clone()
}

/// Teardown handle for the installed hook.
pub struct BuildHookGuard {
    _private: (),
}

impl Drop for BuildHookGuard {
    fn drop(&mut self) {
        INSTALLED_HOOK
            .lock()
            .expect("hook lock poisoned")
            .take();
    }
}
