//! Effect-run orchestration scenarios.
//!
//! The full container path needs `runc` and a reachable store daemon
//! socket, which CI runners do not generally have; the complete happy path
//! is therefore `#[ignore]`d and run on hosts that provide both. The
//! setup-failure paths run everywhere.

use std::collections::BTreeMap;
use std::path::PathBuf;

use hercules_effects_core::{Derivation, DrvPath, SECRETS_MAP_ENV};
use hercules_effects_runner::{EffectError, EffectRunner, RunEffectParams, SECRETS_FILE_NAME};

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hercules-effects-worker"))
}

fn trivial_params(dir: PathBuf, env: BTreeMap<String, String>) -> RunEffectParams {
    RunEffectParams {
        derivation: Derivation {
            path: DrvPath::new("/nix/store/22222222222222222222222222222222-effect.drv"),
            builder: "/bin/true".to_string(),
            args: vec![],
            env,
            output_name: "out".to_string(),
        },
        token: None,
        secrets_config_path: None,
        secret_context: None,
        api_base_url: "https://hercules-ci.com".to_string(),
        dir,
        project_id: None,
        project_path: None,
        use_nix_daemon_proxy: false,
        extra_nix_options: vec![],
        friendly: false,
    }
}

#[tokio::test]
async fn malformed_secrets_map_fails_before_any_launch() {
    let tmp = tempfile::tempdir().unwrap();
    let params = trivial_params(
        tmp.path().join("run"),
        BTreeMap::from([(SECRETS_MAP_ENV.to_string(), "[not-an-object".to_string())]),
    );

    let runner = EffectRunner::new(worker_binary());
    let err = runner.run_effect(&params).await.unwrap_err();
    assert!(matches!(err, EffectError::SecretsMap(_)));

    // Setup stopped before provisioning.
    assert!(!tmp
        .path()
        .join("run")
        .join("secrets")
        .join(SECRETS_FILE_NAME)
        .exists());
}

#[tokio::test]
#[ignore = "requires runc and a host store daemon socket"]
async fn happy_path_returns_container_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    let params = trivial_params(tmp.path().join("run"), BTreeMap::new());

    let runner = EffectRunner::new(worker_binary());
    let code = runner.run_effect(&params).await.unwrap();

    assert_eq!(code, 0);
    assert!(!tmp
        .path()
        .join("run")
        .join("secrets")
        .join(SECRETS_FILE_NAME)
        .exists());
}
