//! Orchestration of one effect run.
//!
//! Ties the pieces together: run-directory creation, secret provisioning,
//! environment composition, mount assembly, the optional daemon proxy, and
//! the container itself. The effect's exit code is the run's result —
//! non-zero is the effect's business, not a runner failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hercules_effects_core::{Condition, Derivation, Secret, SecretContext, Sensitive};
use tracing::info;

use crate::container::{BindMount, ContainerConfig, ContainerRuntime};
use crate::error::EffectError;
use crate::proxy::{with_nix_daemon_proxy, WorkerSpec};
use crate::rundir::EffectPaths;
use crate::secrets::provision_secrets;
use crate::worker::{WorkerOptions, HOST_DAEMON_SOCKET};

/// Hostname visible inside effect containers.
const EFFECT_HOSTNAME: &str = "hercules-ci";

/// Conventional name under which the API token is provided.
const TOKEN_SECRET_NAME: &str = "hercules-ci";

/// Daemon socket path inside the container.
const CONTAINER_DAEMON_SOCKET: &str = "/nix/var/nix/daemon-socket/socket";

/// Inputs to one effect run.
#[derive(Debug)]
pub struct RunEffectParams {
    /// The effect derivation to execute.
    pub derivation: Derivation,

    /// API token exposed to the effect as the `hercules-ci` secret.
    pub token: Option<Sensitive<String>>,

    /// Path of the agent's secrets file.
    pub secrets_config_path: Option<PathBuf>,

    /// Access context for secret conditions.
    pub secret_context: Option<SecretContext>,

    /// Base URL the effect should use for API calls.
    pub api_base_url: String,

    /// The run directory; created if missing, torn down by the caller.
    pub dir: PathBuf,

    /// Project identifier, when known.
    pub project_id: Option<String>,

    /// Project path (owner/site/repo), when known.
    pub project_path: Option<String>,

    /// Whether to proxy store access through a worker subprocess instead
    /// of exposing the host daemon socket directly.
    pub use_nix_daemon_proxy: bool,

    /// Store options forwarded to the proxy worker.
    pub extra_nix_options: Vec<(String, String)>,

    /// Relaxed secret access for local development runs.
    pub friendly: bool,
}

/// Executes effect derivations.
pub struct EffectRunner {
    runtime: ContainerRuntime,
    worker_program: PathBuf,
}

impl EffectRunner {
    /// A runner that launches `worker_program` for daemon proxying and
    /// uses the default container runtime.
    #[must_use]
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        Self {
            runtime: ContainerRuntime::default(),
            worker_program: worker_program.into(),
        }
    }

    /// Use a specific container runtime.
    #[must_use]
    pub fn with_runtime(mut self, runtime: ContainerRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Run one effect and return its exit code.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError`] on setup failures — secrets, directories,
    /// proxy, container launch. The container's own non-zero exit is a
    /// result, not an error.
    pub async fn run_effect(&self, params: &RunEffectParams) -> Result<i32, EffectError> {
        let paths = EffectPaths::create(&params.dir)?;

        let secrets_map = params.derivation.secrets_map()?;
        provision_secrets(
            params.friendly,
            params.secret_context.as_ref(),
            params.secrets_config_path.as_deref(),
            &secrets_map,
            token_secret(params.token.clone()),
            &paths.secrets_dir(),
        )?;

        let environment = compose_environment(params);
        info!(
            drv = %params.derivation.path,
            proxy = params.use_nix_daemon_proxy,
            "starting effect"
        );

        let exit_code = if params.use_nix_daemon_proxy {
            let socket_path = paths.daemon_socket();
            let worker = WorkerSpec {
                program: self.worker_program.clone(),
                options: WorkerOptions::new(params.extra_nix_options.clone()),
            };
            with_nix_daemon_proxy(&worker, &socket_path, || async {
                // Assembled only now: the proxy socket exists once the
                // worker has reported readiness.
                let config = container_config(params, &paths, &socket_path, environment.clone());
                Ok(self
                    .runtime
                    .run(&paths.runc_state_dir(), &config)
                    .await?)
            })
            .await?
        } else {
            let config = container_config(
                params,
                &paths,
                Path::new(HOST_DAEMON_SOCKET),
                environment,
            );
            self.runtime.run(&paths.runc_state_dir(), &config).await?
        };

        info!(code = exit_code, "effect finished");
        Ok(exit_code)
    }
}

/// The extra secrets injected on top of the secrets file.
fn token_secret(token: Option<Sensitive<String>>) -> Sensitive<BTreeMap<String, Secret>> {
    match token {
        None => Sensitive::new(BTreeMap::new()),
        Some(token) => token.map(|token| {
            BTreeMap::from([(
                TOKEN_SECRET_NAME.to_string(),
                Secret {
                    data: BTreeMap::from([(
                        "token".to_string(),
                        serde_json::Value::String(token),
                    )]),
                    // Injected per run, so access needs no further gating.
                    condition: Some(Condition::True),
                },
            )])
        }),
    }
}

/// Compose the in-container environment.
///
/// Three layers, rightmost wins: an overridable base, the derivation's own
/// environment, the impure-overridable tail. A fixed tail always wins.
/// Host passthrough of impure variables is intentionally empty.
fn compose_environment(params: &RunEffectParams) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for (key, value) in [
        ("PATH", "/path-not-set"),
        ("HOME", "/homeless-shelter"),
        ("NIX_STORE", "/nix/store"),
        ("NIX_BUILD_CORES", "1"),
        ("NIX_REMOTE", "daemon"),
        ("IN_HERCULES_CI_EFFECT", "true"),
        ("HERCULES_CI_SECRETS_JSON", "/secrets/secrets.json"),
    ] {
        env.insert(key.to_string(), value.to_string());
    }
    env.insert(
        "HERCULES_CI_API_BASE_URL".to_string(),
        params.api_base_url.clone(),
    );
    if let Some(project_id) = &params.project_id {
        env.insert("HERCULES_CI_PROJECT_ID".to_string(), project_id.clone());
    }
    if let Some(project_path) = &params.project_path {
        env.insert("HERCULES_CI_PROJECT_PATH".to_string(), project_path.clone());
    }

    env.extend(
        params
            .derivation
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    for key in ["NIX_BUILD_TOP", "TMPDIR", "TEMPDIR", "TMP", "TEMP"] {
        env.insert(key.to_string(), "/build".to_string());
    }

    env.insert("NIX_LOG_FD".to_string(), "2".to_string());
    env.insert("TERM".to_string(), "xterm-256color".to_string());

    env
}

/// Assemble the container configuration for one run.
fn container_config(
    params: &RunEffectParams,
    paths: &EffectPaths,
    daemon_socket_source: &Path,
    environment: BTreeMap<String, String>,
) -> ContainerConfig {
    ContainerConfig::builder(&params.derivation.builder)
        .arguments(params.derivation.args.clone())
        .environment(environment)
        .working_directory("/build")
        .hostname(EFFECT_HOSTNAME)
        .root_read_only(false)
        .bind_mount(BindMount::read_write("/build", paths.build_dir()))
        .bind_mount(BindMount::read_write("/etc", paths.etc_dir()))
        .bind_mount(BindMount::read_only("/secrets", paths.secrets_dir()))
        // Read-only is not supported by the runtime for this path.
        .bind_mount(BindMount::read_write("/etc/resolv.conf", "/etc/resolv.conf"))
        .bind_mount(BindMount::read_only(
            CONTAINER_DAEMON_SOCKET,
            daemon_socket_source,
        ))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hercules_effects_core::DrvPath;

    fn params_with_env(env: &[(&str, &str)]) -> RunEffectParams {
        RunEffectParams {
            derivation: Derivation {
                path: DrvPath::new("/nix/store/ffffffffffffffffffffffffffffffff-effect.drv"),
                builder: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "true".to_string()],
                env: env
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                output_name: "out".to_string(),
            },
            token: None,
            secrets_config_path: None,
            secret_context: None,
            api_base_url: "https://hercules-ci.com".to_string(),
            dir: PathBuf::from("/tmp/effect-run"),
            project_id: Some("prj_1".to_string()),
            project_path: Some("github/acme/infra".to_string()),
            use_nix_daemon_proxy: false,
            extra_nix_options: vec![],
            friendly: false,
        }
    }

    #[test]
    fn test_environment_base_values() {
        let env = compose_environment(&params_with_env(&[]));

        assert_eq!(env["PATH"], "/path-not-set");
        assert_eq!(env["HOME"], "/homeless-shelter");
        assert_eq!(env["NIX_REMOTE"], "daemon");
        assert_eq!(env["IN_HERCULES_CI_EFFECT"], "true");
        assert_eq!(env["HERCULES_CI_API_BASE_URL"], "https://hercules-ci.com");
        assert_eq!(env["HERCULES_CI_SECRETS_JSON"], "/secrets/secrets.json");
        assert_eq!(env["HERCULES_CI_PROJECT_ID"], "prj_1");
        assert_eq!(env["HERCULES_CI_PROJECT_PATH"], "github/acme/infra");
    }

    #[test]
    fn test_derivation_overrides_base_but_not_tails() {
        let env = compose_environment(&params_with_env(&[
            ("HOME", "/root"),
            ("TMPDIR", "/elsewhere"),
            ("TERM", "dumb"),
        ]));

        // Base entries yield to the derivation.
        assert_eq!(env["HOME"], "/root");
        // The impure tail and the fixed tail win over the derivation.
        assert_eq!(env["TMPDIR"], "/build");
        assert_eq!(env["TERM"], "xterm-256color");
        assert_eq!(env["NIX_LOG_FD"], "2");
    }

    #[test]
    fn test_project_fields_absent_when_unknown() {
        let mut params = params_with_env(&[]);
        params.project_id = None;
        params.project_path = None;
        let env = compose_environment(&params);

        assert!(!env.contains_key("HERCULES_CI_PROJECT_ID"));
        assert!(!env.contains_key("HERCULES_CI_PROJECT_PATH"));
    }

    #[test]
    fn test_mount_set_and_container_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = EffectPaths::create(tmp.path()).unwrap();
        let params = params_with_env(&[]);
        let config = container_config(
            &params,
            &paths,
            Path::new("/run/proxy-socket"),
            compose_environment(&params),
        );

        assert_eq!(config.hostname, "hercules-ci");
        assert_eq!(config.working_directory, "/build");
        assert!(!config.root_read_only);

        let by_dest: BTreeMap<_, _> = config
            .extra_bind_mounts
            .iter()
            .map(|m| (m.path_in_container.to_string_lossy().into_owned(), m))
            .collect();
        assert!(!by_dest["/build"].read_only);
        assert!(!by_dest["/etc"].read_only);
        assert!(by_dest["/secrets"].read_only);
        assert!(!by_dest["/etc/resolv.conf"].read_only);
        let socket = &by_dest["/nix/var/nix/daemon-socket/socket"];
        assert!(socket.read_only);
        assert_eq!(socket.path_in_host, Path::new("/run/proxy-socket"));
    }

    #[test]
    fn test_token_becomes_conventional_secret() {
        let extras = token_secret(Some(Sensitive::new("tok_123".to_string())));
        let secret = extras.expose().get(TOKEN_SECRET_NAME).unwrap();
        assert_eq!(secret.data["token"], "tok_123");
        assert_eq!(secret.condition, Some(Condition::True));

        assert!(token_secret(None).expose().is_empty());
    }
}
