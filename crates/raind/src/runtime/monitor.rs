//! Process monitor.
//!
//! Containers in `created` or `running` have an init process. When it is gone
//! without a stop hook (crash, OOM kill, host reboot), the record is moved to
//! `stopped`.

use std::sync::Arc;
use std::time::Duration;

use raind_common::RaindResult;
use raind_oci::ContainerStatus;
use tokio_util::sync::CancellationToken;

use super::events::{ContainerEvent, EventBus, now};
use super::state::ContainerStore;

/// Checks whether a process exists.
pub trait ProcessProbe: Send + Sync {
    /// Whether `pid` is alive.
    fn is_alive(&self, pid: u32) -> bool;
}

/// [`ProcessProbe`] sending signal 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    #[allow(unsafe_code)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: kill with signal 0 performs permission and existence checks only.
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
}

/// Moves containers whose init process vanished to `stopped`.
pub struct Monitor {
    store: Arc<ContainerStore>,
    probe: Arc<dyn ProcessProbe>,
    events: EventBus,
    interval: Duration,
}

impl Monitor {
    /// Create a monitor.
    pub fn new(
        store: Arc<ContainerStore>,
        probe: Arc<dyn ProcessProbe>,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            probe,
            events,
            interval,
        }
    }

    /// Probe every container once; returns the ids moved to `stopped`.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn tick(&self) -> RaindResult<Vec<String>> {
        let mut stopped = Vec::new();
        for record in self.store.list()? {
            // pid 0 means no hook has reported a process yet
            if !record.state.has_process() || record.pid == 0 {
                continue;
            }
            if self.probe.is_alive(record.pid) {
                continue;
            }
            let id = record.container_id;
            let result = self.store.update(&id, |current| {
                // skip if a hook moved it meanwhile
                if current.pid != record.pid || !current.state.has_process() {
                    return Ok(false);
                }
                current.transition(ContainerStatus::Stopped, Some(0))?;
                current.reason = Some("process exited".to_string());
                Ok(true)
            });
            match result {
                Ok(true) => {
                    tracing::info!(container_id = %id, pid = record.pid, "Container process gone, marked stopped");
                    self.events.publish(ContainerEvent::Stopped {
                        id: id.clone(),
                        reason: "process exited".to_string(),
                        timestamp: now(),
                    });
                    stopped.push(id);
                }
                Ok(false) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(stopped)
    }

    /// Probe at the configured interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(interval = ?self.interval, "Process monitor started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick() {
                        tracing::warn!(error = %err, "Process monitor tick failed");
                    }
                }
            }
        }
        tracing::debug!("Process monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;

    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;
    use crate::runtime::state::ContainerRecord;

    #[derive(Default)]
    struct FakeProbe {
        alive: Mutex<HashSet<u32>>,
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().contains(&pid)
        }
    }

    fn running(store: &ContainerStore, id: &str, pid: u32) {
        store
            .insert(ContainerRecord::creating(
                id,
                id,
                "library/alpine",
                "latest",
                vec![],
                PathBuf::new(),
            ))
            .unwrap();
        store
            .transition(id, ContainerStatus::Created, Some(pid))
            .unwrap();
        store.transition(id, ContainerStatus::Running, None).unwrap();
    }

    #[test]
    fn vanished_process_is_stopped() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ContainerStore::new(dir.path().join("csm.json")));
        running(&store, "alive", 10);
        running(&store, "gone", 11);

        let probe = Arc::new(FakeProbe::default());
        probe.alive.lock().insert(10);
        let monitor = Monitor::new(store.clone(), probe, EventBus::new(), Duration::from_millis(100));

        assert_eq!(monitor.tick().unwrap(), vec!["gone".to_string()]);
        let gone = store.get("gone").unwrap();
        assert_eq!(gone.state, ContainerStatus::Stopped);
        assert_eq!(gone.pid, 0);
        assert_eq!(store.get("alive").unwrap().state, ContainerStatus::Running);

        assert!(monitor.tick().unwrap().is_empty());
    }

    #[test]
    fn own_process_is_alive() {
        assert!(SignalProbe.is_alive(std::process::id()));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ContainerStore::new(dir.path().join("csm.json")));
        let monitor = Monitor::new(
            store,
            Arc::new(FakeProbe::default()),
            EventBus::new(),
            Duration::from_millis(100),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
