//! Resolution of a derivation's `secretsMap` into an on-disk
//! `secrets.json`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use hercules_effects_core::{Secret, SecretContext, SecretsMap, Sensitive};
use tracing::warn;

use super::{load_secrets_file, SecretError, SECRETS_FILE_NAME};

/// Resolve `secrets_map` against the secrets file and write the allowed
/// subset into `dest_dir/secrets.json`.
///
/// `extra_secrets` are caller-supplied entries (conventionally the API token
/// under the name `hercules-ci`) that shadow same-named file entries.
///
/// Access is decided per destination:
///
/// - strict mode (`friendly == false`) requires a condition on every secret
///   and a satisfied evaluation under `ctx`;
/// - friendly mode allows condition-free secrets with a deprecation warning,
///   allows unverifiable ones (no context) with a warning, and logs the
///   evaluator trace before denying a failed condition.
///
/// The `condition` field is stripped from every provisioned secret. The
/// write is atomic (temp file + rename), so a failure leaves no partial
/// output. An empty `secrets_map` writes nothing and never touches the
/// source file.
///
/// # Errors
///
/// Returns [`SecretError`] on load failures, denied or unverifiable access,
/// and write failures. Errors name destinations, never secret contents.
pub fn provision_secrets(
    friendly: bool,
    ctx: Option<&SecretContext>,
    source_path: Option<&Path>,
    secrets_map: &SecretsMap,
    extra_secrets: Sensitive<BTreeMap<String, Secret>>,
    dest_dir: &Path,
) -> Result<(), SecretError> {
    if secrets_map.is_empty() {
        return Ok(());
    }

    let merged = load_secrets_file(source_path)?.map(|mut secrets| {
        secrets.extend(extra_secrets.reveal());
        secrets
    });

    let mut provisioned: BTreeMap<&str, Secret> = BTreeMap::new();
    for (dest_name, source_name) in secrets_map {
        let secret = merged
            .expose()
            .get(source_name)
            .ok_or_else(|| SecretError::AccessDenied {
                name: dest_name.clone(),
            })?;

        check_access(friendly, ctx, dest_name, secret.condition.as_ref())?;

        provisioned.insert(
            dest_name,
            Secret {
                data: secret.data.clone(),
                condition: None,
            },
        );
    }

    write_secrets_file(dest_dir, &Sensitive::new(provisioned))
}

/// Apply the access decision table for one destination.
fn check_access(
    friendly: bool,
    ctx: Option<&SecretContext>,
    dest_name: &str,
    condition: Option<&hercules_effects_core::Condition>,
) -> Result<(), SecretError> {
    match (friendly, condition, ctx) {
        (false, None, _) => Err(SecretError::ConditionMissing {
            name: dest_name.to_string(),
        }),
        (false, Some(condition), Some(ctx)) => {
            if condition.evaluate(ctx) {
                Ok(())
            } else {
                Err(SecretError::AccessDenied {
                    name: dest_name.to_string(),
                })
            }
        },
        // Strict mode cannot verify anything without a context.
        (false, Some(_), None) => Err(SecretError::AccessDenied {
            name: dest_name.to_string(),
        }),
        (true, None, _) => {
            warn!(
                secret = dest_name,
                "secret has no condition field; this is deprecated and will be rejected \
                 in non-friendly runs"
            );
            Ok(())
        },
        (true, Some(condition), Some(ctx)) => {
            let (trace, allowed) = condition.evaluate_trace(ctx);
            if allowed {
                Ok(())
            } else {
                for line in &trace {
                    warn!(secret = dest_name, "condition: {line}");
                }
                Err(SecretError::AccessDenied {
                    name: dest_name.to_string(),
                })
            }
        },
        (true, Some(_), None) => {
            warn!(
                secret = dest_name,
                "no secret context is available; access control skipped"
            );
            Ok(())
        },
    }
}

/// Atomically write the provisioned mapping as `secrets.json`.
///
/// This is the only place revealed secret material leaves the process.
fn write_secrets_file(
    dest_dir: &Path,
    provisioned: &Sensitive<BTreeMap<&str, Secret>>,
) -> Result<(), SecretError> {
    let dest = dest_dir.join(SECRETS_FILE_NAME);
    let io_err = |source| SecretError::WriteFailed {
        path: dest.clone(),
        source,
    };

    std::fs::create_dir_all(dest_dir).map_err(io_err)?;

    let payload = serde_json::to_vec_pretty(provisioned.expose())
        .map_err(|source| io_err(source.into()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dest_dir).map_err(io_err)?;
    tmp.write_all(&payload).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.persist(&dest).map_err(|e| io_err(e.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hercules_effects_core::Condition;

    fn source_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn branch_ctx(branch: &str) -> SecretContext {
        SecretContext {
            branch: Some(branch.to_string()),
            ..SecretContext::default()
        }
    }

    fn single_map() -> SecretsMap {
        SecretsMap::from([("aws".to_string(), "deploy".to_string())])
    }

    const DEPLOY_MAIN: &str =
        r#"{"deploy":{"data":{"k":"v"},"condition":{"IsBranch":"main"}}}"#;

    #[test]
    fn test_empty_map_writes_nothing() {
        let dest = tempfile::tempdir().unwrap();
        // A broken source path must not matter when nothing is requested.
        provision_secrets(
            false,
            None,
            Some(Path::new("/nonexistent/secrets.json")),
            &SecretsMap::new(),
            Sensitive::new(BTreeMap::new()),
            dest.path(),
        )
        .unwrap();
        assert!(!dest.path().join(SECRETS_FILE_NAME).exists());
    }

    #[test]
    fn test_grant_strips_condition() {
        let source = source_file(DEPLOY_MAIN);
        let dest = tempfile::tempdir().unwrap();

        provision_secrets(
            false,
            Some(&branch_ctx("main")),
            Some(source.path()),
            &single_map(),
            Sensitive::new(BTreeMap::new()),
            dest.path(),
        )
        .unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dest.path().join(SECRETS_FILE_NAME)).unwrap())
                .unwrap();
        assert_eq!(written["aws"]["data"]["k"], "v");
        assert_eq!(written["aws"]["condition"], serde_json::Value::Null);
    }

    #[test]
    fn test_strict_deny_writes_no_file() {
        let source = source_file(DEPLOY_MAIN);
        let dest = tempfile::tempdir().unwrap();

        let err = provision_secrets(
            false,
            Some(&branch_ctx("feature")),
            Some(source.path()),
            &single_map(),
            Sensitive::new(BTreeMap::new()),
            dest.path(),
        )
        .unwrap_err();

        assert!(matches!(err, SecretError::AccessDenied { name } if name == "aws"));
        assert!(!dest.path().join(SECRETS_FILE_NAME).exists());
    }

    #[test]
    fn test_strict_requires_condition() {
        let source = source_file(r#"{"deploy":{"data":{"k":"v"}}}"#);
        let dest = tempfile::tempdir().unwrap();

        let err = provision_secrets(
            false,
            Some(&branch_ctx("main")),
            Some(source.path()),
            &single_map(),
            Sensitive::new(BTreeMap::new()),
            dest.path(),
        )
        .unwrap_err();

        assert!(matches!(err, SecretError::ConditionMissing { name } if name == "aws"));
    }

    #[test]
    fn test_friendly_allows_missing_condition() {
        let source = source_file(r#"{"deploy":{"data":{"k":"v"}}}"#);
        let dest = tempfile::tempdir().unwrap();

        provision_secrets(
            true,
            Some(&branch_ctx("main")),
            Some(source.path()),
            &single_map(),
            Sensitive::new(BTreeMap::new()),
            dest.path(),
        )
        .unwrap();
        assert!(dest.path().join(SECRETS_FILE_NAME).exists());
    }

    #[test]
    fn test_friendly_allows_missing_context() {
        let source = source_file(DEPLOY_MAIN);
        let dest = tempfile::tempdir().unwrap();

        provision_secrets(
            true,
            None,
            Some(source.path()),
            &single_map(),
            Sensitive::new(BTreeMap::new()),
            dest.path(),
        )
        .unwrap();
        assert!(dest.path().join(SECRETS_FILE_NAME).exists());
    }

    #[test]
    fn test_friendly_denies_failed_condition() {
        let source = source_file(DEPLOY_MAIN);
        let dest = tempfile::tempdir().unwrap();

        let err = provision_secrets(
            true,
            Some(&branch_ctx("feature")),
            Some(source.path()),
            &single_map(),
            Sensitive::new(BTreeMap::new()),
            dest.path(),
        )
        .unwrap_err();
        assert!(matches!(err, SecretError::AccessDenied { name } if name == "aws"));
        assert!(!dest.path().join(SECRETS_FILE_NAME).exists());
    }

    #[test]
    fn test_missing_source_secret_names_destination() {
        let source = source_file(r"{}");
        let dest = tempfile::tempdir().unwrap();

        let err = provision_secrets(
            false,
            Some(&branch_ctx("main")),
            Some(source.path()),
            &single_map(),
            Sensitive::new(BTreeMap::new()),
            dest.path(),
        )
        .unwrap_err();
        assert!(matches!(err, SecretError::AccessDenied { name } if name == "aws"));
    }

    #[test]
    fn test_extra_secrets_shadow_file_entries() {
        let source = source_file(DEPLOY_MAIN);
        let dest = tempfile::tempdir().unwrap();

        let extras = BTreeMap::from([(
            "deploy".to_string(),
            Secret {
                data: BTreeMap::from([(
                    "k".to_string(),
                    serde_json::Value::String("shadowed".to_string()),
                )]),
                condition: Some(Condition::True),
            },
        )]);

        provision_secrets(
            false,
            Some(&branch_ctx("anything")),
            Some(source.path()),
            &single_map(),
            Sensitive::new(extras),
            dest.path(),
        )
        .unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dest.path().join(SECRETS_FILE_NAME)).unwrap())
                .unwrap();
        assert_eq!(written["aws"]["data"]["k"], "shadowed");
    }

    #[test]
    fn test_provisioning_is_idempotent() {
        let source = source_file(DEPLOY_MAIN);
        let dest = tempfile::tempdir().unwrap();
        let run = || {
            provision_secrets(
                false,
                Some(&branch_ctx("main")),
                Some(source.path()),
                &single_map(),
                Sensitive::new(BTreeMap::new()),
                dest.path(),
            )
            .unwrap();
            std::fs::read(dest.path().join(SECRETS_FILE_NAME)).unwrap()
        };

        let first = run();
        let second = run();
        assert_eq!(first, second);
    }
}
