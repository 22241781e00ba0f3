//! Per-run directory layout.
//!
//! Every effect invocation gets a fresh run directory:
//!
//! ```text
//! <dir>/
//!   build/             # bind-mounted as /build
//!   etc/               # bind-mounted as /etc
//!   secrets/           # bind-mounted as /secrets, read-only
//!   runc-state/        # runtime working area, opaque to callers
//!   nix-daemon-socket  # only when the daemon proxy is in use
//! ```
//!
//! The subdirectories are created before container launch and persist until
//! the caller tears the run directory down.

use std::fs;
use std::path::{Path, PathBuf};

/// Locations inside one run directory.
#[derive(Debug, Clone)]
pub struct EffectPaths {
    root: PathBuf,
}

impl EffectPaths {
    /// Create the run-directory layout under `root`.
    ///
    /// Creation is idempotent; existing subdirectories are reused.
    ///
    /// # Errors
    ///
    /// Returns [`RunDirError`] when a directory cannot be created.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, RunDirError> {
        let paths = Self { root: root.into() };
        for dir in [
            paths.build_dir(),
            paths.etc_dir(),
            paths.secrets_dir(),
            paths.runc_state_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|source| RunDirError::Create { path: dir, source })?;
        }
        Ok(paths)
    }

    /// The run directory itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host side of the container's `/build`.
    #[must_use]
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    /// Host side of the container's `/etc`.
    #[must_use]
    pub fn etc_dir(&self) -> PathBuf {
        self.root.join("etc")
    }

    /// Host side of the container's read-only `/secrets`.
    #[must_use]
    pub fn secrets_dir(&self) -> PathBuf {
        self.root.join("secrets")
    }

    /// Working area handed to the container runtime.
    #[must_use]
    pub fn runc_state_dir(&self) -> PathBuf {
        self.root.join("runc-state")
    }

    /// Where the daemon proxy creates its socket.
    #[must_use]
    pub fn daemon_socket(&self) -> PathBuf {
        self.root.join("nix-daemon-socket")
    }
}

/// Run-directory setup failure.
#[derive(Debug, thiserror::Error)]
pub enum RunDirError {
    /// A layout directory could not be created.
    #[error("failed to create run directory entry {path:?}")]
    Create {
        /// The directory that could not be created.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
