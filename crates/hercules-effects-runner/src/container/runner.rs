//! Invocation of the low-level container runtime.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ContainerConfig, ContainerError, RuntimeSpec};

/// Handle on the runtime binary used to launch containers.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    program: PathBuf,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new("runc")
    }
}

impl ContainerRuntime {
    /// Use a specific runtime binary.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launch the configured container and wait for it to exit.
    ///
    /// The runtime's stdout and stderr are forwarded to this process's
    /// stderr unchanged; stdout stays clean for callers that use it as a
    /// protocol channel. The container's exit code is returned verbatim —
    /// a non-zero code is the effect's outcome, not a runner error.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError`] when a bind source is missing, the spec
    /// cannot be written, or the runtime cannot be spawned or awaited.
    pub async fn run(
        &self,
        state_dir: &Path,
        config: &ContainerConfig,
    ) -> Result<i32, ContainerError> {
        for mount in &config.extra_bind_mounts {
            if !mount.path_in_host.exists() {
                return Err(ContainerError::MissingBindSource {
                    path: mount.path_in_host.clone(),
                });
            }
        }

        let container_id = format!("effect-{}", Uuid::new_v4());
        let bundle_dir = state_dir.join(&container_id);
        let spec_path = bundle_dir.join("config.json");

        let spec = RuntimeSpec::from_config(config);
        let spec_write = |source| ContainerError::SpecWrite {
            path: spec_path.clone(),
            source,
        };
        std::fs::create_dir_all(&bundle_dir).map_err(spec_write)?;
        let payload = serde_json::to_vec_pretty(&spec).map_err(|e| spec_write(e.into()))?;
        std::fs::write(&spec_path, payload).map_err(spec_write)?;

        debug!(bundle = %bundle_dir.display(), "runtime spec materialized");

        let mut child = tokio::process::Command::new(&self.program)
            .arg("--root")
            .arg(state_dir)
            .arg("run")
            .arg("--bundle")
            .arg(&bundle_dir)
            .arg(&container_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ContainerError::RuntimeSpawn {
                program: self.program.clone(),
                source,
            })?;

        let forward_out = forward_to_stderr(child.stdout.take());
        let forward_err = forward_to_stderr(child.stderr.take());

        let status = child.wait().await.map_err(ContainerError::RuntimeWait)?;
        let _ = tokio::join!(forward_out, forward_err);

        let code = exit_code(status);
        info!(container = %container_id, code, "container exited");
        Ok(code)
    }
}

/// Copy a child output stream to our stderr, unchanged.
fn forward_to_stderr<R>(stream: Option<R>) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else { return };
        let mut stderr = tokio::io::stderr();
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    use tokio::io::AsyncWriteExt;
                    if stderr.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                },
            }
        }
    })
}

/// Translate an exit status into the code reported to the caller.
///
/// Signal deaths map to the conventional `128 + signal`.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}
