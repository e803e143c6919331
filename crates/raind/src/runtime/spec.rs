//! Runtime spec synthesis.
//!
//! Builds the `config.json` handed to the runtime and seeds the files the
//! container sees under `/etc`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use raind_common::fs::{atomic_write, write_json_atomic};
use raind_common::{RaindPaths, RaindResult};
use raind_network::Assignment;
use raind_oci::runtime::{
    Hooks, ImageLayout, Linux, Mount, Namespace, NamespaceType, NetworkAttachment, Process, Root,
};
use raind_oci::{OCI_VERSION, RuntimeSpec};

use super::config::RuntimeConfig;

/// Namespaces a pod member joins instead of creating.
pub const SHARED_NAMESPACES: [NamespaceType; 4] = [
    NamespaceType::Network,
    NamespaceType::Ipc,
    NamespaceType::Uts,
    NamespaceType::User,
];

/// Namespaces of another process to join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedNamespaces {
    /// Process whose namespaces are joined.
    pub pid: u32,
    /// Address reachable in the joined network namespace.
    pub address: Option<Ipv4Addr>,
}

impl SharedNamespaces {
    /// `/proc/<pid>/ns/<name>` for `ns_type`.
    #[must_use]
    pub fn path(&self, ns_type: NamespaceType) -> PathBuf {
        PathBuf::from(format!("/proc/{}/ns/{}", self.pid, ns_type.proc_name()))
    }
}

/// How the container gets its network.
#[derive(Debug, Clone)]
pub enum NetworkPlan {
    /// Own namespace with an address on a bridge.
    Attached(Assignment),
    /// Joins another container's namespaces.
    Shared(SharedNamespaces),
}

impl NetworkPlan {
    /// The address other processes reach the container at.
    #[must_use]
    pub fn address(&self) -> Option<Ipv4Addr> {
        match self {
            Self::Attached(assignment) => Some(assignment.address),
            Self::Shared(shared) => shared.address,
        }
    }
}

/// Everything needed to render one runtime spec.
#[derive(Debug, Clone)]
pub struct SpecInputs<'a> {
    /// Container id.
    pub id: &'a str,
    /// Container name.
    pub name: &'a str,
    /// Read-only image root filesystem.
    pub rootfs: &'a Path,
    /// Effective command line.
    pub command: Vec<String>,
    /// Effective environment.
    pub env: Vec<String>,
    /// Working directory.
    pub cwd: String,
    /// Image user.
    pub user: String,
    /// Allocate a terminal.
    pub tty: bool,
    /// User mounts.
    pub mounts: Vec<Mount>,
    /// Network plan.
    pub network: &'a NetworkPlan,
    /// Owning pod.
    pub pod_id: Option<&'a str>,
}

/// Render the runtime spec.
#[must_use]
pub fn build(config: &RuntimeConfig, inputs: &SpecInputs<'_>) -> RuntimeSpec {
    let paths = &config.paths;
    let id = inputs.id;

    let namespaces = NamespaceType::DEFAULT_SET
        .into_iter()
        .map(|ns_type| match inputs.network {
            NetworkPlan::Shared(shared) if SHARED_NAMESPACES.contains(&ns_type) => {
                Namespace::join(ns_type, shared.path(ns_type))
            }
            _ => Namespace::new(ns_type),
        })
        .collect();

    let network = match inputs.network {
        NetworkPlan::Attached(assignment) => Some(NetworkAttachment {
            interface: assignment.veth_name.clone(),
            bridge: assignment.bridge.clone(),
            address: assignment.address_cidr(),
            gateway: assignment.gateway.to_string(),
            dns: config.dns.clone(),
        }),
        NetworkPlan::Shared(_) => None,
    };

    let mut mounts = etc_mounts(paths, id);
    mounts.extend(inputs.mounts.iter().cloned());

    let mut annotations = HashMap::from([
        ("raind.container.id".to_string(), id.to_string()),
        ("raind.container.name".to_string(), inputs.name.to_string()),
    ]);
    if let Some(pod_id) = inputs.pod_id {
        annotations.insert("raind.pod.id".to_string(), pod_id.to_string());
    }

    RuntimeSpec {
        oci_version: OCI_VERSION.to_string(),
        root: Root {
            path: paths.container_subdir(id, "merged"),
            readonly: false,
        },
        process: Process {
            terminal: inputs.tty,
            user: inputs.user.clone(),
            args: inputs.command.clone(),
            env: inputs.env.clone(),
            cwd: PathBuf::from(&inputs.cwd),
        },
        hostname: id.to_string(),
        mounts,
        image: ImageLayout {
            image_layers: vec![inputs.rootfs.to_path_buf()],
            upper_dir: paths.container_subdir(id, "diff"),
            work_dir: paths.container_subdir(id, "work"),
        },
        hooks: Hooks::for_helper(&config.hook_helper, &config.hook_env()),
        linux: Linux {
            namespaces,
            cgroups_path: Some(paths.container_cgroup(id)),
            apparmor_profile: config.apparmor_profile.clone(),
        },
        network,
        annotations,
    }
}

fn etc_mounts(paths: &RaindPaths, id: &str) -> Vec<Mount> {
    let etc = paths.container_subdir(id, "etc");
    let mut mounts: Vec<Mount> = ["hosts", "hostname", "resolv.conf"]
        .into_iter()
        .map(|file| Mount {
            destination: Path::new("/etc").join(file),
            source: etc.join(file),
            mount_type: "bind".to_string(),
            options: vec!["rbind".to_string(), "ro".to_string()],
        })
        .collect();
    mounts.push(Mount {
        destination: PathBuf::from("/run/raind/cert"),
        source: paths.container_subdir(id, "cert"),
        mount_type: "bind".to_string(),
        options: vec!["rbind".to_string(), "ro".to_string()],
    });
    mounts
}

/// Write the runtime spec as `config.json` in the container directory.
///
/// # Errors
///
/// Returns I/O errors.
pub fn write(paths: &RaindPaths, id: &str, spec: &RuntimeSpec) -> RaindResult<()> {
    let path = paths.container_config(id);
    write_json_atomic(&path, spec)?;
    tracing::debug!(container_id = %id, path = %path.display(), "Runtime spec written");
    Ok(())
}

/// Point the joined namespaces of a written runtime spec at `shared`.
/// Returns whether `config.json` changed.
///
/// # Errors
///
/// Returns I/O errors or a malformed `config.json`.
pub fn rejoin(paths: &RaindPaths, id: &str, shared: &SharedNamespaces) -> RaindResult<bool> {
    let path = paths.container_config(id);
    let mut spec: RuntimeSpec = serde_json::from_slice(&std::fs::read(&path)?)?;
    let mut changed = false;
    for namespace in &mut spec.linux.namespaces {
        if namespace.path.is_none() || !SHARED_NAMESPACES.contains(&namespace.ns_type) {
            continue;
        }
        let target = shared.path(namespace.ns_type);
        if namespace.path.as_ref() != Some(&target) {
            namespace.path = Some(target);
            changed = true;
        }
    }
    if changed {
        write(paths, id, &spec)?;
    }
    Ok(changed)
}

/// Seed `etc/{hosts,hostname,resolv.conf}`. `resolv.conf` points at the
/// gateway when the container has one, else at the configured servers.
///
/// # Errors
///
/// Returns I/O errors.
pub fn seed_etc(
    etc: &Path,
    id: &str,
    address: Option<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
    dns: &[String],
) -> RaindResult<()> {
    let mut hosts = String::from("127.0.0.1\tlocalhost\n");
    if let Some(address) = address {
        hosts.push_str(&format!("{address}\t{id}\n"));
    }
    atomic_write(&etc.join("hosts"), hosts.as_bytes())?;
    atomic_write(&etc.join("hostname"), format!("{id}\n").as_bytes())?;

    let resolv: String = match gateway {
        Some(gateway) => format!("nameserver {gateway}\n"),
        None => dns.iter().map(|server| format!("nameserver {server}\n")).collect(),
    };
    atomic_write(&etc.join("resolv.conf"), resolv.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use raind_oci::HookEvent;
    use tempfile::TempDir;

    use super::*;

    fn assignment() -> Assignment {
        Assignment {
            bridge: "raind0".to_string(),
            address: Ipv4Addr::new(10, 166, 0, 1),
            prefix: 24,
            gateway: Ipv4Addr::new(10, 166, 0, 254),
            veth_name: "rd_abc".to_string(),
        }
    }

    fn inputs<'a>(network: &'a NetworkPlan, rootfs: &'a Path) -> SpecInputs<'a> {
        SpecInputs {
            id: "abc",
            name: "web",
            rootfs,
            command: vec!["nginx".to_string()],
            env: vec!["PATH=/bin".to_string()],
            cwd: "/".to_string(),
            user: String::new(),
            tty: false,
            mounts: vec!["/data:/data:ro".parse().unwrap()],
            network,
            pod_id: None,
        }
    }

    #[test]
    fn attached_container_spec() {
        let config = RuntimeConfig::default().with_root("/r");
        let network = NetworkPlan::Attached(assignment());
        let rootfs = PathBuf::from("/r/image/layers/alpine/latest/rootfs");
        let spec = build(&config, &inputs(&network, &rootfs));

        assert_eq!(spec.root.path, PathBuf::from("/r/container/abc/merged"));
        assert_eq!(spec.image.upper_dir, PathBuf::from("/r/container/abc/diff"));
        assert_eq!(spec.image.image_layers, vec![rootfs]);
        assert_eq!(spec.linux.namespaces.len(), 7);
        assert!(spec.linux.namespaces.iter().all(|ns| ns.path.is_none()));
        assert_eq!(spec.linux.cgroups_path, Some(PathBuf::from("/r/cgroup/abc")));

        let network = spec.network.unwrap();
        assert_eq!(network.interface, "rd_abc");
        assert_eq!(network.address, "10.166.0.1/24");
        assert_eq!(network.gateway, "10.166.0.254");
        assert_eq!(network.dns, vec!["8.8.8.8".to_string()]);

        for event in HookEvent::ALL {
            assert_eq!(spec.hooks.for_event(event).len(), 1);
        }
        assert_eq!(spec.mounts.last().unwrap().destination, PathBuf::from("/data"));
    }

    #[test]
    fn pod_member_joins_namespaces() {
        let config = RuntimeConfig::default().with_root("/r");
        let network = NetworkPlan::Shared(SharedNamespaces {
            pid: 4242,
            address: None,
        });
        let rootfs = PathBuf::from("/rootfs");
        let spec = build(&config, &inputs(&network, &rootfs));

        assert!(spec.network.is_none());
        let net = spec
            .linux
            .namespaces
            .iter()
            .find(|ns| ns.ns_type == NamespaceType::Network)
            .unwrap();
        assert_eq!(net.path, Some(PathBuf::from("/proc/4242/ns/net")));
        let pid = spec
            .linux
            .namespaces
            .iter()
            .find(|ns| ns.ns_type == NamespaceType::Pid)
            .unwrap();
        assert!(pid.path.is_none());
    }

    #[test]
    fn rejoin_rewrites_joined_namespaces_only() {
        let dir = TempDir::new().unwrap();
        let config = RuntimeConfig::default().with_root(dir.path());
        let network = NetworkPlan::Shared(SharedNamespaces {
            pid: 1000,
            address: None,
        });
        let rootfs = PathBuf::from("/rootfs");
        std::fs::create_dir_all(config.paths.container("abc")).unwrap();
        write(&config.paths, "abc", &build(&config, &inputs(&network, &rootfs))).unwrap();

        let moved = SharedNamespaces {
            pid: 1002,
            address: None,
        };
        assert!(rejoin(&config.paths, "abc", &moved).unwrap());
        assert!(!rejoin(&config.paths, "abc", &moved).unwrap());

        let text = std::fs::read_to_string(config.paths.container_config("abc")).unwrap();
        let spec: RuntimeSpec = serde_json::from_str(&text).unwrap();
        let joined: Vec<_> = spec.linux.namespaces.iter().filter_map(|ns| ns.path.clone()).collect();
        assert_eq!(joined.len(), 4);
        assert!(joined.iter().all(|p| p.starts_with("/proc/1002/ns")));
        assert!(!text.contains("/proc/1000/"));
    }

    #[test]
    fn etc_files() {
        let dir = TempDir::new().unwrap();
        seed_etc(
            dir.path(),
            "abc",
            Some(Ipv4Addr::new(10, 166, 0, 1)),
            Some(Ipv4Addr::new(10, 166, 0, 254)),
            &[],
        )
        .unwrap();

        let hosts = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert!(hosts.contains("127.0.0.1\tlocalhost"));
        assert!(hosts.contains("10.166.0.1\tabc"));
        let resolv = std::fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert_eq!(resolv, "nameserver 10.166.0.254\n");
    }
}
