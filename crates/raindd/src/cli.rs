//! Command-line arguments and their mapping onto [`RuntimeConfig`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use raind::runtime::RuntimeConfig;
use raind_common::RaindPaths;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// raindd - single-node container platform daemon.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Management API listen address
    #[arg(long, env = "RAIND_LISTEN", default_value = "127.0.0.1:7755")]
    pub listen: SocketAddr,

    /// Hook listener address
    #[arg(long, env = "RAIND_HOOK_LISTEN", default_value = "127.0.0.1:7756")]
    pub hook_listen: SocketAddr,

    /// Base URL the hook helper reports to (defaults to the hook listener)
    #[arg(long, env = "RAIND_HOOK_ENDPOINT")]
    pub hook_endpoint: Option<String>,

    /// Hook helper installed into runtime specs
    #[arg(long, env = "RAIND_HOOK_HELPER", default_value = "/usr/local/bin/raind-hook")]
    pub hook_helper: PathBuf,

    /// State root
    #[arg(long, env = "RAIND_ROOT", default_value = "/etc/raind")]
    pub root: PathBuf,

    /// Cgroup subtree
    #[arg(long, env = "RAIND_CGROUP_ROOT", default_value = "/sys/fs/cgroup/raind")]
    pub cgroup_root: PathBuf,

    /// OCI runtime binary
    #[arg(long, env = "RAIND_RUNTIME", default_value = "droplet")]
    pub runtime: PathBuf,

    /// Bridge used when a container names none
    #[arg(long, env = "RAIND_BRIDGE", default_value = "raind0")]
    pub bridge: String,

    /// SPIFFE trust domain
    #[arg(long, env = "RAIND_TRUST_DOMAIN", default_value = "raind.local")]
    pub trust_domain: String,

    /// Name prefix of pod infra containers
    #[arg(long, env = "RAIND_INFRA_PREFIX", default_value = "infra")]
    pub infra_prefix: String,

    /// Image of pod infra containers
    #[arg(long, env = "RAIND_INFRA_IMAGE", default_value = "busybox")]
    pub infra_image: String,

    /// Host outbound interface
    #[arg(long, env = "RAIND_HOST_INTERFACE", default_value = "eth0")]
    pub host_interface: String,

    /// DNS servers for containers
    #[arg(long, env = "RAIND_DNS", value_delimiter = ',', default_value = "8.8.8.8")]
    pub dns: Vec<String>,

    /// NFLOG group for policy logging
    #[arg(long, env = "RAIND_NFLOG_GROUP", default_value_t = 100)]
    pub nflog_group: u16,

    /// AppArmor profile for container processes
    #[arg(long, env = "RAIND_APPARMOR_PROFILE", default_value = "raind-default")]
    pub apparmor_profile: String,

    /// Run containers without an AppArmor profile
    #[arg(long)]
    pub no_apparmor: bool,

    /// Process monitor interval in milliseconds
    #[arg(long, env = "RAIND_MONITOR_INTERVAL_MS", default_value_t = 100)]
    pub monitor_interval_ms: u64,

    /// Pod reconciler interval in seconds
    #[arg(long, env = "RAIND_POD_INTERVAL", default_value_t = 5)]
    pub pod_interval: u64,

    /// Service controller interval in seconds
    #[arg(long, env = "RAIND_SERVICE_INTERVAL", default_value_t = 5)]
    pub service_interval: u64,

    /// Seconds to wait for hook-driven state changes
    #[arg(long, env = "RAIND_STATE_TIMEOUT", default_value_t = 10)]
    pub state_timeout: u64,

    /// Log format
    #[arg(long, env = "RAIND_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    /// Runtime configuration described by the arguments.
    #[must_use]
    pub fn runtime_config(&self) -> RuntimeConfig {
        let endpoint = self
            .hook_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}", self.hook_listen));
        let mut config = RuntimeConfig::default()
            .with_runtime_binary(self.runtime.clone())
            .with_hook(self.hook_helper.clone(), endpoint)
            .with_trust_domain(self.trust_domain.clone())
            .with_host_interface(self.host_interface.clone())
            .with_intervals(
                Duration::from_millis(self.monitor_interval_ms),
                Duration::from_secs(self.pod_interval),
                Duration::from_secs(self.service_interval),
            )
            .with_state_timeout(Duration::from_secs(self.state_timeout));
        config.paths = RaindPaths {
            root: self.root.clone(),
            cgroup_root: self.cgroup_root.clone(),
        };
        config.hook_listen = self.hook_listen;
        config.default_bridge.clone_from(&self.bridge);
        config.infra_prefix.clone_from(&self.infra_prefix);
        config.infra_image.clone_from(&self.infra_image);
        config.dns.clone_from(&self.dns);
        config.nflog_group = self.nflog_group;
        config.apparmor_profile = (!self.no_apparmor).then(|| self.apparmor_profile.clone());
        config
    }
}
