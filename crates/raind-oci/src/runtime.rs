//! Runtime spec handed to the droplet OCI runtime.
//!
//! The document is written as `config.json` in the container directory before
//! `droplet create` runs. It follows the shape of the OCI runtime
//! configuration, with raind extensions for the overlay image layers and the
//! container network interface.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use raind_common::RaindError;
use serde::{Deserialize, Serialize};

/// Runtime spec (`config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    /// OCI version.
    pub oci_version: String,
    /// Root filesystem.
    pub root: Root,
    /// Container process.
    pub process: Process,
    /// Hostname inside the UTS namespace.
    pub hostname: String,
    /// Additional mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    /// Overlay layout of the root filesystem.
    pub image: ImageLayout,
    /// Lifecycle hooks.
    pub hooks: Hooks,
    /// Linux-specific configuration.
    pub linux: Linux,
    /// Container network attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkAttachment>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// Root filesystem configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// Path to the root filesystem (the overlay `merged` directory).
    pub path: PathBuf,
    /// Mount root as read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Allocate a terminal.
    #[serde(default)]
    pub terminal: bool,
    /// User specification from the image (`uid[:gid]` or a name).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Command line.
    pub args: Vec<String>,
    /// Environment variables (`KEY=VALUE`).
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
}

/// Mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount destination inside the container.
    pub destination: PathBuf,
    /// Mount source on the host.
    pub source: PathBuf,
    /// Mount type.
    #[serde(rename = "type", default = "default_mount_type")]
    pub mount_type: String,
    /// Mount options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

fn default_mount_type() -> String {
    "bind".to_string()
}

impl FromStr for Mount {
    type Err = RaindError;

    /// Parse `source:destination[:ro]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (source, destination, readonly) = match parts.as_slice() {
            [source, destination] => (*source, *destination, false),
            [source, destination, "ro"] => (*source, *destination, true),
            [source, destination, "rw"] => (*source, *destination, false),
            _ => return Err(RaindError::validation("mount", s.to_string())),
        };
        if source.is_empty() || !destination.starts_with('/') {
            return Err(RaindError::validation("mount", s.to_string()));
        }
        let mut options = vec!["rbind".to_string()];
        options.push(if readonly { "ro" } else { "rw" }.to_string());
        Ok(Self {
            destination: PathBuf::from(destination),
            source: PathBuf::from(source),
            mount_type: default_mount_type(),
            options,
        })
    }
}

/// Overlay layout: read-only image layers plus the writable upper and work
/// directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageLayout {
    /// Read-only lower layers, topmost first.
    pub image_layers: Vec<PathBuf>,
    /// Writable upper directory (`diff`).
    pub upper_dir: PathBuf,
    /// Overlay work directory.
    pub work_dir: PathBuf,
}

/// Network attachment of the container interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Host-side veth name (`rd_<id>`, at most 15 characters).
    pub interface: String,
    /// Bridge the veth is enslaved to.
    pub bridge: String,
    /// Container address in CIDR form.
    pub address: String,
    /// Default gateway.
    pub gateway: String,
    /// DNS servers written into the runtime configuration.
    #[serde(default)]
    pub dns: Vec<String>,
}

/// Lifecycle hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    /// Run in the runtime namespace after the environment is created.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create_runtime: Vec<Hook>,
    /// Run in the container namespace before pivot_root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create_container: Vec<Hook>,
    /// Run after the user process starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststart: Vec<Hook>,
    /// Run when the container is asked to stop.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_container: Vec<Hook>,
    /// Run after the container is deleted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststop: Vec<Hook>,
}

impl Hooks {
    /// One hook per [`HookEvent`], each invoking `helper <event>` with `env`.
    #[must_use]
    pub fn for_helper(helper: &Path, env: &[String]) -> Self {
        let hook = |event: HookEvent| {
            vec![Hook {
                path: helper.to_path_buf(),
                args: vec![
                    helper
                        .file_name()
                        .map_or_else(|| "raind-hook".to_string(), |n| n.to_string_lossy().into_owned()),
                    event.to_string(),
                ],
                env: env.to_vec(),
                timeout: Some(HOOK_TIMEOUT_SECS),
            }]
        };
        Self {
            create_runtime: hook(HookEvent::CreateRuntime),
            create_container: hook(HookEvent::CreateContainer),
            poststart: hook(HookEvent::Poststart),
            stop_container: hook(HookEvent::StopContainer),
            poststop: hook(HookEvent::Poststop),
        }
    }

    /// Hooks registered for `event`.
    #[must_use]
    pub fn for_event(&self, event: HookEvent) -> &[Hook] {
        match event {
            HookEvent::CreateRuntime => &self.create_runtime,
            HookEvent::CreateContainer => &self.create_container,
            HookEvent::Poststart => &self.poststart,
            HookEvent::StopContainer => &self.stop_container,
            HookEvent::Poststop => &self.poststop,
        }
    }
}

/// Timeout applied to every raind hook, in seconds.
pub const HOOK_TIMEOUT_SECS: u32 = 5;

/// Hook configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    /// Path to the hook executable.
    pub path: PathBuf,
    /// Arguments, including argv\[0\].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

/// OCI lifecycle events raind installs hooks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookEvent {
    /// Environment created, user process not yet started.
    CreateRuntime,
    /// Inside the container before pivot_root.
    CreateContainer,
    /// User process started.
    Poststart,
    /// Container asked to stop.
    StopContainer,
    /// Container deleted.
    Poststop,
}

impl HookEvent {
    /// All events in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::CreateRuntime,
        Self::CreateContainer,
        Self::Poststart,
        Self::StopContainer,
        Self::Poststop,
    ];

    /// Wire name of the event (`X-Hook-Event` header value).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateRuntime => "createRuntime",
            Self::CreateContainer => "createContainer",
            Self::Poststart => "poststart",
            Self::StopContainer => "stopContainer",
            Self::Poststop => "poststop",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = RaindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| RaindError::validation("hook event", s.to_string()))
    }
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    /// Namespaces to create or join.
    pub namespaces: Vec<Namespace>,
    /// Cgroup path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<PathBuf>,
    /// AppArmor profile applied to the process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apparmor_profile: Option<String>,
}

/// Namespace configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace type.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Path to existing namespace (to join instead of create).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Namespace {
    /// A fresh namespace of the given type.
    #[must_use]
    pub const fn new(ns_type: NamespaceType) -> Self {
        Self { ns_type, path: None }
    }

    /// Join the namespace at `path`.
    #[must_use]
    pub fn join(ns_type: NamespaceType, path: impl Into<PathBuf>) -> Self {
        Self {
            ns_type,
            path: Some(path.into()),
        }
    }
}

/// Namespace types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// Mount namespace.
    Mount,
    /// Network namespace.
    Network,
    /// UTS namespace.
    Uts,
    /// PID namespace.
    Pid,
    /// IPC namespace.
    Ipc,
    /// User namespace.
    User,
    /// Cgroup namespace.
    Cgroup,
}

impl NamespaceType {
    /// The namespaces every raind container gets.
    pub const DEFAULT_SET: [Self; 7] = [
        Self::Mount,
        Self::Network,
        Self::Uts,
        Self::Pid,
        Self::Ipc,
        Self::User,
        Self::Cgroup,
    ];

    /// Entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(&self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Network => "net",
            Self::Uts => "uts",
            Self::Pid => "pid",
            Self::Ipc => "ipc",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_parsing() {
        let mount: Mount = "/data:/var/lib/data:ro".parse().unwrap();
        assert_eq!(mount.source, PathBuf::from("/data"));
        assert_eq!(mount.destination, PathBuf::from("/var/lib/data"));
        assert!(mount.options.contains(&"ro".to_string()));

        assert!("/data".parse::<Mount>().is_err());
        assert!("/data:relative".parse::<Mount>().is_err());
        assert!("/a:/b:xx".parse::<Mount>().is_err());
    }

    #[test]
    fn hook_events_round_trip_through_header_names() {
        for event in HookEvent::ALL {
            assert_eq!(event.as_str().parse::<HookEvent>().unwrap(), event);
        }
        assert!("prestart".parse::<HookEvent>().is_err());
    }

    #[test]
    fn helper_hooks_cover_every_event() {
        let hooks = Hooks::for_helper(Path::new("/usr/bin/raind-hook"), &["A=B".to_string()]);
        for event in HookEvent::ALL {
            let installed = hooks.for_event(event);
            assert_eq!(installed.len(), 1);
            assert_eq!(installed[0].args, vec!["raind-hook".to_string(), event.to_string()]);
            assert_eq!(installed[0].env, vec!["A=B".to_string()]);
        }
    }

    #[test]
    fn spec_serialization_uses_camel_case() {
        let spec = RuntimeSpec {
            oci_version: crate::OCI_VERSION.to_string(),
            root: Root {
                path: "/c/merged".into(),
                readonly: false,
            },
            process: Process {
                terminal: true,
                user: String::new(),
                args: vec!["/bin/sh".into()],
                env: vec!["PATH=/bin".into()],
                cwd: "/".into(),
            },
            hostname: "abc".into(),
            mounts: Vec::new(),
            image: ImageLayout {
                image_layers: vec!["/l/rootfs".into()],
                upper_dir: "/c/diff".into(),
                work_dir: "/c/work".into(),
            },
            hooks: Hooks::default(),
            linux: Linux {
                namespaces: NamespaceType::DEFAULT_SET.map(Namespace::new).to_vec(),
                cgroups_path: None,
                apparmor_profile: None,
            },
            network: None,
            annotations: HashMap::new(),
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"ociVersion\""));
        assert!(json.contains("\"imageLayers\""));
        assert!(json.contains("\"upperDir\""));
        assert!(json.contains("\"type\":\"network\""));

        let back: RuntimeSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
