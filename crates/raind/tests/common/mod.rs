//! Shared setup: a platform over a temporary root with every host seam faked.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use raind::platform::{HostSeams, Platform};
use raind::runtime::ProcessProbe;
use raind::runtime::RuntimeConfig;
use raind::runtime::lifecycle::fake::SimulatedRuntime;
use raind_common::RecordingRunner;
use raind_image::manager::fake::StaticPuller;
use raind_network::MemoryNetfilter;
use raind_oci::image::ExecutionConfig;
use tempfile::TempDir;

/// Every process is alive.
pub struct Alive;

impl ProcessProbe for Alive {
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub platform: Platform,
    pub runtime: Arc<SimulatedRuntime>,
    pub netfilter: Arc<MemoryNetfilter>,
    pub runner: Arc<RecordingRunner>,
}

pub async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = RuntimeConfig::default()
        .with_root(dir.path().join("raind"))
        .with_state_timeout(Duration::from_secs(1));

    let runtime = Arc::new(SimulatedRuntime::new());
    let netfilter = Arc::new(MemoryNetfilter::new());
    let runner = Arc::new(RecordingRunner::new());
    let puller = Arc::new(StaticPuller::new(ExecutionConfig {
        cmd: Some(vec!["/bin/sh".to_string()]),
        env: Some(vec!["PATH=/usr/bin:/bin".to_string()]),
        ..ExecutionConfig::default()
    }));
    let seams = HostSeams {
        runner: runner.clone(),
        netfilter: netfilter.clone(),
        runtime: runtime.clone(),
        puller,
        probe: Arc::new(Alive),
    };

    let platform = Platform::new(config, seams).unwrap();
    runtime.attach(platform.hooks.clone());
    platform.bootstrap().await.unwrap();

    Harness {
        dir,
        platform,
        runtime,
        netfilter,
        runner,
    }
}
