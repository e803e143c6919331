//! Runtime configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use raind_common::RaindPaths;
use raind_network::ipam::DEFAULT_BRIDGE;

/// Environment handed to every hook invocation so the helper accepts it.
pub const HOOK_SETTER_ENV: &str = "RAIND-HOOK-SETTER=CONDENSER";

/// Runtime configuration options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Paths for runtime data.
    pub paths: RaindPaths,
    /// OCI runtime binary.
    pub runtime_binary: PathBuf,
    /// Hook helper installed into every runtime spec.
    pub hook_helper: PathBuf,
    /// Base URL the hook helper posts to.
    pub hook_endpoint: String,
    /// Listen address of the hook listener.
    pub hook_listen: SocketAddr,
    /// Bridge used when a create request names none.
    pub default_bridge: String,
    /// SPIFFE trust domain of issued certificates.
    pub trust_domain: String,
    /// Name prefix identifying a pod's infra container.
    pub infra_prefix: String,
    /// Image the infra container runs.
    pub infra_image: String,
    /// Command of the infra container.
    pub infra_command: Vec<String>,
    /// Host outbound interface used by north-south rules.
    pub host_interface: String,
    /// DNS servers written into runtime specs and `resolv.conf`.
    pub dns: Vec<String>,
    /// NFLOG group for default-verdict logging.
    pub nflog_group: u16,
    /// AppArmor profile applied to container processes.
    pub apparmor_profile: Option<String>,
    /// Interval of the process monitor.
    pub monitor_interval: Duration,
    /// Interval of the pod reconciler.
    pub pod_interval: Duration,
    /// Interval of the service controller.
    pub service_interval: Duration,
    /// How long lifecycle operations wait for hook-driven state changes.
    pub state_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: RaindPaths::new(),
            runtime_binary: PathBuf::from("droplet"),
            hook_helper: PathBuf::from("/usr/local/bin/raind-hook"),
            hook_endpoint: "https://127.0.0.1:7756".to_string(),
            hook_listen: SocketAddr::from(([127, 0, 0, 1], 7756)),
            default_bridge: DEFAULT_BRIDGE.to_string(),
            trust_domain: "raind.local".to_string(),
            infra_prefix: "infra".to_string(),
            infra_image: "busybox".to_string(),
            infra_command: vec!["sleep".to_string(), "infinity".to_string()],
            host_interface: "eth0".to_string(),
            dns: vec!["8.8.8.8".to_string()],
            nflog_group: 100,
            apparmor_profile: Some("raind-default".to_string()),
            monitor_interval: Duration::from_millis(100),
            pod_interval: Duration::from_secs(5),
            service_interval: Duration::from_secs(5),
            state_timeout: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = RaindPaths::with_root(root);
        self
    }

    /// Set the OCI runtime binary.
    #[must_use]
    pub fn with_runtime_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.runtime_binary = binary.into();
        self
    }

    /// Set the hook helper and the endpoint it reports to.
    #[must_use]
    pub fn with_hook(mut self, helper: impl Into<PathBuf>, endpoint: impl Into<String>) -> Self {
        self.hook_helper = helper.into();
        self.hook_endpoint = endpoint.into();
        self
    }

    /// Set the SPIFFE trust domain.
    #[must_use]
    pub fn with_trust_domain(mut self, domain: impl Into<String>) -> Self {
        self.trust_domain = domain.into();
        self
    }

    /// Set the host outbound interface.
    #[must_use]
    pub fn with_host_interface(mut self, interface: impl Into<String>) -> Self {
        self.host_interface = interface.into();
        self
    }

    /// Set the reconcile intervals.
    #[must_use]
    pub const fn with_intervals(mut self, monitor: Duration, pods: Duration, services: Duration) -> Self {
        self.monitor_interval = monitor;
        self.pod_interval = pods;
        self.service_interval = services;
        self
    }

    /// Set the state wait timeout.
    #[must_use]
    pub const fn with_state_timeout(mut self, timeout: Duration) -> Self {
        self.state_timeout = timeout;
        self
    }

    /// Environment entries passed to the hook helper.
    #[must_use]
    pub fn hook_env(&self) -> Vec<String> {
        vec![
            HOOK_SETTER_ENV.to_string(),
            format!("RAIND_HOOK_ENDPOINT={}", self.hook_endpoint),
            format!("RAIND_TRUST_DOMAIN={}", self.trust_domain),
            format!("RAIND_ROOT={}", self.paths.root.display()),
        ]
    }
}
