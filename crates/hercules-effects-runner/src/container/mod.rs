//! Container configuration and the runtime invocation.
//!
//! The runner does not implement isolation itself; it assembles an OCI
//! runtime spec and delegates to a low-level runtime binary (`runc` by
//! default). The host root filesystem is shared into the container, with
//! the per-run directories bind-mounted over it.

mod runner;
mod spec;

use std::collections::BTreeMap;
use std::path::PathBuf;

pub use runner::ContainerRuntime;
pub use spec::RuntimeSpec;

/// A host path exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Mount point inside the container.
    pub path_in_container: PathBuf,

    /// Source path on the host.
    pub path_in_host: PathBuf,

    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl BindMount {
    /// A read-write bind mount.
    #[must_use]
    pub fn read_write(container: impl Into<PathBuf>, host: impl Into<PathBuf>) -> Self {
        Self {
            path_in_container: container.into(),
            path_in_host: host.into(),
            read_only: false,
        }
    }

    /// A read-only bind mount.
    #[must_use]
    pub fn read_only(container: impl Into<PathBuf>, host: impl Into<PathBuf>) -> Self {
        Self {
            path_in_container: container.into(),
            path_in_host: host.into(),
            read_only: true,
        }
    }
}

/// Everything needed to launch one container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Bind mounts on top of the base runtime set.
    pub extra_bind_mounts: Vec<BindMount>,

    /// Executable to run inside the container.
    pub executable: String,

    /// Arguments to the executable.
    pub arguments: Vec<String>,

    /// Full environment of the process; nothing is inherited.
    pub environment: BTreeMap<String, String>,

    /// Working directory inside the container.
    pub working_directory: String,

    /// Hostname visible inside the container.
    pub hostname: String,

    /// Whether the root filesystem is mounted read-only.
    pub root_read_only: bool,
}

impl ContainerConfig {
    /// Start building a config for `executable`.
    #[must_use]
    pub fn builder(executable: impl Into<String>) -> ContainerConfigBuilder {
        ContainerConfigBuilder {
            config: Self {
                extra_bind_mounts: Vec::new(),
                executable: executable.into(),
                arguments: Vec::new(),
                environment: BTreeMap::new(),
                working_directory: "/".to_string(),
                hostname: "localhost".to_string(),
                root_read_only: false,
            },
        }
    }
}

/// Builder for [`ContainerConfig`].
#[derive(Debug)]
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    /// Add a bind mount.
    #[must_use]
    pub fn bind_mount(mut self, mount: BindMount) -> Self {
        self.config.extra_bind_mounts.push(mount);
        self
    }

    /// Set the argument vector.
    #[must_use]
    pub fn arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    /// Set the process environment.
    #[must_use]
    pub fn environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.config.environment = environment;
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.config.working_directory = dir.into();
        self
    }

    /// Set the hostname.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    /// Mount the root filesystem read-only.
    #[must_use]
    pub fn root_read_only(mut self, read_only: bool) -> Self {
        self.config.root_read_only = read_only;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> ContainerConfig {
        self.config
    }
}

/// Container spec or runtime failures.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// A bind-mount source does not exist on the host.
    ///
    /// Checked before the runtime is launched so the failure names the
    /// missing path instead of surfacing as an opaque runtime error.
    #[error("bind mount source {path:?} does not exist on the host")]
    MissingBindSource {
        /// The missing host path.
        path: PathBuf,
    },

    /// The runtime spec could not be materialized under the state
    /// directory.
    #[error("failed to write runtime spec to {path:?}")]
    SpecWrite {
        /// Bundle path the spec was written towards.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The runtime binary could not be spawned.
    #[error("failed to spawn container runtime {program:?}")]
    RuntimeSpawn {
        /// Runtime binary.
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the runtime failed.
    #[error("failed waiting for the container runtime")]
    RuntimeWait(#[source] std::io::Error),
}
