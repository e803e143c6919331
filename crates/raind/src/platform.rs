//! Wiring of stores, engines and reconcilers into one platform.

use std::sync::Arc;

use raind_common::paths::stores;
use raind_common::{CommandRunner, HostCommandRunner, RaindResult};
use raind_image::{ImageManager, ImagePuller, RegistryPuller};
use raind_network::bridge::BridgeManager;
use raind_network::policy::CompilerSettings;
use raind_network::{
    IpamStore, IptablesBackend, Netfilter, NetworkService, PolicyCompiler, PolicyStore,
    PortForwarder,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::apparmor;
use crate::pki::PkiIssuer;
use crate::pod::{PodService, PodStore, Reconciler};
use crate::runtime::{
    ContainerEngine, ContainerStore, DropletRuntime, EventBus, HookReceiver, Monitor, OciRuntime,
    ProcessProbe, RuntimeConfig, SignalProbe,
};
use crate::service::{ServiceController, ServiceStore};

/// Everything that touches the host.
#[derive(Clone)]
pub struct HostSeams {
    /// Runs `ip` and friends.
    pub runner: Arc<dyn CommandRunner>,
    /// Packet filter.
    pub netfilter: Arc<dyn Netfilter>,
    /// OCI runtime.
    pub runtime: Arc<dyn OciRuntime>,
    /// Image source.
    pub puller: Arc<dyn ImagePuller>,
    /// Liveness of container processes.
    pub probe: Arc<dyn ProcessProbe>,
}

impl HostSeams {
    /// The real host: `iptables`, the droplet binary, registries, signals.
    #[must_use]
    pub fn host(config: &RuntimeConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(HostCommandRunner);
        Self {
            netfilter: Arc::new(IptablesBackend::new(runner.clone())),
            runtime: Arc::new(DropletRuntime::new(
                config.runtime_binary.clone(),
                runner.clone(),
            )),
            puller: Arc::new(RegistryPuller),
            probe: Arc::new(SignalProbe),
            runner,
        }
    }
}

/// The assembled control plane.
pub struct Platform {
    /// Configuration.
    pub config: RuntimeConfig,
    /// Container lifecycle events.
    pub events: EventBus,
    /// CSM.
    pub containers: Arc<ContainerStore>,
    /// Container lifecycle.
    pub engine: Arc<ContainerEngine>,
    /// Hook ingestion.
    pub hooks: Arc<HookReceiver>,
    /// Images.
    pub images: Arc<ImageManager>,
    /// Addresses.
    pub ipam: Arc<IpamStore>,
    /// Bridges.
    pub networks: NetworkService,
    /// Network policies.
    pub policies: Arc<PolicyCompiler>,
    /// Pods.
    pub pods: Arc<PodService>,
    /// L4 services.
    pub services: Arc<ServiceController>,
    /// Client certificate issuer.
    pub pki: Arc<PkiIssuer>,
    /// Packet filter shared by every component.
    pub netfilter: Arc<dyn Netfilter>,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn ProcessProbe>,
}

impl Platform {
    /// Open every store under the configured root and wire the components.
    ///
    /// # Errors
    ///
    /// Returns I/O errors creating the directory layout and PKI errors
    /// loading the client CA.
    pub fn new(config: RuntimeConfig, seams: HostSeams) -> RaindResult<Self> {
        let paths = &config.paths;
        paths.create_dirs()?;

        let events = EventBus::new();
        let containers = Arc::new(ContainerStore::new(paths.store(stores::CONTAINERS)));
        let ipam = Arc::new(IpamStore::new(paths.store(stores::IPAM)));
        let images = Arc::new(ImageManager::new(paths.clone(), seams.puller.clone()));
        let engine = Arc::new(ContainerEngine::new(
            config.clone(),
            containers.clone(),
            images.clone(),
            ipam.clone(),
            PortForwarder::new(seams.netfilter.clone()),
            seams.runtime.clone(),
            events.clone(),
        ));
        let hooks = Arc::new(HookReceiver::new(containers.clone(), events.clone()));

        let policies = Arc::new(PolicyCompiler::new(
            Arc::new(PolicyStore::new(paths.store(stores::POLICIES))),
            ipam.clone(),
            seams.netfilter.clone(),
            containers.clone(),
            CompilerSettings {
                host_interface: config.host_interface.clone(),
                nflog_group: config.nflog_group,
            },
        ));

        let pod_store = Arc::new(PodStore::new(paths.store(stores::PODS)));
        let pods = Arc::new(PodService::new(engine.clone(), pod_store.clone()));
        let services = Arc::new(ServiceController::new(
            Arc::new(ServiceStore::new(paths.store(stores::SERVICES))),
            pod_store,
            containers.clone(),
            ipam.clone(),
            seams.netfilter.clone(),
            config.infra_prefix.clone(),
            config.service_interval,
        ));
        let pki = Arc::new(PkiIssuer::load_or_generate(
            &paths.pki(),
            config.trust_domain.clone(),
            containers.clone(),
        )?);
        let networks = NetworkService::new(ipam.clone(), BridgeManager::new(seams.runner.clone()));

        Ok(Self {
            config,
            events,
            containers,
            engine,
            hooks,
            images,
            ipam,
            networks,
            policies,
            pods,
            services,
            pki,
            netfilter: seams.netfilter,
            runner: seams.runner,
            probe: seams.probe,
        })
    }

    /// Bring up bridges, load the AppArmor profile and reinstall committed
    /// policies.
    ///
    /// # Errors
    ///
    /// Returns bridge or packet-filter errors.
    pub async fn bootstrap(&self) -> RaindResult<()> {
        self.networks.bootstrap().await?;
        if let Some(profile) = &self.config.apparmor_profile {
            apparmor::install(
                self.runner.as_ref(),
                &self.config.paths.apparmor_profile(),
                profile,
            )
            .await?;
        }
        self.policies.restore().await?;
        tracing::info!(root = %self.config.paths.root.display(), "Platform ready");
        Ok(())
    }

    /// The process monitor.
    #[must_use]
    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.containers.clone(),
            self.probe.clone(),
            self.events.clone(),
            self.config.monitor_interval,
        )
    }

    /// The pod reconciler.
    #[must_use]
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.pods.clone(), self.config.pod_interval)
    }

    /// Spawn the monitor, the pod reconciler and the service controller;
    /// each stops when `cancel` fires.
    #[must_use]
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.monitor().run(cancel.clone())),
            tokio::spawn(self.reconciler().run(cancel.clone())),
            tokio::spawn(self.services.clone().run(cancel.clone())),
        ]
    }
}
