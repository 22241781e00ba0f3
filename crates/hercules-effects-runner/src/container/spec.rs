//! Typed model of the OCI runtime spec the runner hands to `runc`.
//!
//! Only the fields this runner sets are modeled. The host root is shared as
//! the container root filesystem; isolation comes from the mount, pid, ipc,
//! uts and user namespaces — the network namespace is deliberately omitted
//! so effects keep host network access.

use serde::Serialize;

use super::{BindMount, ContainerConfig};

/// Spec version written into `config.json`.
const OCI_VERSION: &str = "1.0.2";

/// Capabilities granted to the effect process.
///
/// The minimal set `runc` grants unprivileged containers by default.
const BASE_CAPABILITIES: [&str; 3] = ["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"];

/// Top-level runtime spec.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    oci_version: String,
    process: Process,
    root: Root,
    hostname: String,
    mounts: Vec<Mount>,
    linux: Linux,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Process {
    terminal: bool,
    user: User,
    args: Vec<String>,
    env: Vec<String>,
    cwd: String,
    capabilities: Capabilities,
    no_new_privileges: bool,
}

#[derive(Debug, Serialize)]
struct User {
    uid: u32,
    gid: u32,
}

#[derive(Debug, Serialize)]
struct Capabilities {
    bounding: Vec<String>,
    effective: Vec<String>,
    inheritable: Vec<String>,
    permitted: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Root {
    path: String,
    readonly: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Mount {
    destination: String,
    #[serde(rename = "type")]
    kind: String,
    source: String,
    options: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Linux {
    uid_mappings: Vec<IdMapping>,
    gid_mappings: Vec<IdMapping>,
    namespaces: Vec<Namespace>,
}

#[derive(Debug, Serialize)]
struct IdMapping {
    #[serde(rename = "containerID")]
    container_id: u32,
    #[serde(rename = "hostID")]
    host_id: u32,
    size: u32,
}

#[derive(Debug, Serialize)]
struct Namespace {
    #[serde(rename = "type")]
    kind: String,
}

impl RuntimeSpec {
    /// Build the spec for one container launch.
    ///
    /// Root inside the container maps to the invoking user, so the effect
    /// sees uid 0 without the runner needing real privileges.
    #[must_use]
    pub fn from_config(config: &ContainerConfig) -> Self {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let mut args = vec![config.executable.clone()];
        args.extend(config.arguments.iter().cloned());

        let env = config
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut mounts = base_mounts();
        mounts.extend(config.extra_bind_mounts.iter().map(bind_mount));

        Self {
            oci_version: OCI_VERSION.to_string(),
            process: Process {
                terminal: false,
                user: User { uid: 0, gid: 0 },
                args,
                env,
                cwd: config.working_directory.clone(),
                capabilities: Capabilities {
                    bounding: caps(),
                    effective: caps(),
                    inheritable: caps(),
                    permitted: caps(),
                },
                no_new_privileges: true,
            },
            root: Root {
                path: "/".to_string(),
                readonly: config.root_read_only,
            },
            hostname: config.hostname.clone(),
            mounts,
            linux: Linux {
                uid_mappings: vec![IdMapping {
                    container_id: 0,
                    host_id: uid,
                    size: 1,
                }],
                gid_mappings: vec![IdMapping {
                    container_id: 0,
                    host_id: gid,
                    size: 1,
                }],
                namespaces: ["mount", "pid", "ipc", "uts", "user"]
                    .into_iter()
                    .map(|kind| Namespace {
                        kind: kind.to_string(),
                    })
                    .collect(),
            },
        }
    }
}

fn caps() -> Vec<String> {
    BASE_CAPABILITIES.iter().map(ToString::to_string).collect()
}

fn bind_mount(mount: &BindMount) -> Mount {
    let mut options = vec!["bind".to_string()];
    if mount.read_only {
        options.push("ro".to_string());
    }
    Mount {
        destination: mount.path_in_container.to_string_lossy().into_owned(),
        kind: "none".to_string(),
        source: mount.path_in_host.to_string_lossy().into_owned(),
        options,
    }
}

/// Mounts every container gets regardless of configuration.
fn base_mounts() -> Vec<Mount> {
    vec![
        Mount {
            destination: "/proc".to_string(),
            kind: "proc".to_string(),
            source: "proc".to_string(),
            options: vec![],
        },
        Mount {
            destination: "/dev".to_string(),
            kind: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "strictatime".to_string(),
                "mode=755".to_string(),
                "size=65536k".to_string(),
            ],
        },
        Mount {
            destination: "/dev/pts".to_string(),
            kind: "devpts".to_string(),
            source: "devpts".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "newinstance".to_string(),
                "ptmxmode=0666".to_string(),
                "mode=0620".to_string(),
            ],
        },
        Mount {
            destination: "/dev/shm".to_string(),
            kind: "tmpfs".to_string(),
            source: "shm".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
                "mode=1777".to_string(),
                "size=65536k".to_string(),
            ],
        },
        Mount {
            destination: "/dev/mqueue".to_string(),
            kind: "mqueue".to_string(),
            source: "mqueue".to_string(),
            options: vec!["nosuid".to_string(), "noexec".to_string(), "nodev".to_string()],
        },
        Mount {
            destination: "/sys".to_string(),
            kind: "none".to_string(),
            source: "/sys".to_string(),
            options: vec![
                "rbind".to_string(),
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
                "ro".to_string(),
            ],
        },
    ]
}
