//! OCI runtime driver.
//!
//! The daemon never manipulates namespaces itself; every lifecycle step is an
//! invocation of the external runtime binary, which reads the `config.json`
//! written into the container directory.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use raind_common::{CommandRunner, RaindResult};

/// Lifecycle operations of the OCI runtime.
#[async_trait]
pub trait OciRuntime: Send + Sync {
    /// Create the container environment; fires the `createRuntime` hook.
    async fn create(&self, id: &str, tty: bool) -> RaindResult<()>;

    /// Start the user process; fires `poststart`.
    async fn start(&self, id: &str) -> RaindResult<()>;

    /// Stop the container; fires `stopContainer`.
    async fn kill(&self, id: &str) -> RaindResult<()>;

    /// Delete the container; fires `poststop`.
    async fn delete(&self, id: &str) -> RaindResult<()>;

    /// Run `entrypoint` inside the container and return its output.
    async fn exec(&self, id: &str, tty: bool, entrypoint: &[String]) -> RaindResult<String>;
}

/// [`OciRuntime`] backed by the `droplet` binary.
#[derive(Clone)]
pub struct DropletRuntime {
    binary: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl DropletRuntime {
    /// Create a driver invoking `binary` through `runner`.
    pub fn new(binary: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    fn program(&self) -> String {
        self.binary.display().to_string()
    }

    async fn invoke(&self, args: Vec<String>) -> RaindResult<String> {
        tracing::debug!(runtime = %self.binary.display(), args = ?args, "Invoking runtime");
        self.runner.run(&self.program(), &args).await
    }
}

fn with_tty(verb: &str, tty: bool, id: &str) -> Vec<String> {
    let mut args = vec![verb.to_string()];
    if tty {
        args.push("-t".to_string());
    }
    args.push(id.to_string());
    args
}

#[async_trait]
impl OciRuntime for DropletRuntime {
    async fn create(&self, id: &str, tty: bool) -> RaindResult<()> {
        self.invoke(with_tty("create", tty, id)).await.map(drop)
    }

    async fn start(&self, id: &str) -> RaindResult<()> {
        self.invoke(vec!["start".to_string(), id.to_string()])
            .await
            .map(drop)
    }

    async fn kill(&self, id: &str) -> RaindResult<()> {
        self.invoke(vec!["kill".to_string(), id.to_string()])
            .await
            .map(drop)
    }

    async fn delete(&self, id: &str) -> RaindResult<()> {
        self.invoke(vec!["delete".to_string(), id.to_string()])
            .await
            .map(drop)
    }

    async fn exec(&self, id: &str, tty: bool, entrypoint: &[String]) -> RaindResult<String> {
        let mut args = with_tty("exec", tty, id);
        args.push("--entrypoint".to_string());
        args.extend_from_slice(entrypoint);
        self.invoke(args).await
    }
}

/// An in-process runtime that delivers hooks the way droplet does.
pub mod fake {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, OnceLock};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use raind_common::{RaindError, RaindResult};
    use raind_oci::{ContainerState, ContainerStatus, HookEvent};

    use super::OciRuntime;
    use crate::runtime::hooks::HookReceiver;

    /// Simulated runtime. Every call is recorded; hooks are handed straight to
    /// the attached receiver.
    #[derive(Default)]
    pub struct SimulatedRuntime {
        receiver: OnceLock<Arc<HookReceiver>>,
        next_pid: AtomicU32,
        calls: Mutex<Vec<String>>,
        failing: Mutex<HashSet<String>>,
        quiet: Mutex<HashSet<HookEvent>>,
    }

    impl SimulatedRuntime {
        /// A runtime with no receiver attached yet.
        #[must_use]
        pub fn new() -> Self {
            Self {
                next_pid: AtomicU32::new(1000),
                ..Self::default()
            }
        }

        /// Deliver hooks to `receiver`.
        pub fn attach(&self, receiver: Arc<HookReceiver>) {
            let _ = self.receiver.set(receiver);
        }

        /// Make `verb` (`create`, `start`, ...) fail.
        pub fn fail_on(&self, verb: &str) {
            self.failing.lock().insert(verb.to_string());
        }

        /// Let `verb` succeed again.
        pub fn heal(&self, verb: &str) {
            self.failing.lock().remove(verb);
        }

        /// Suppress delivery of `event`.
        pub fn suppress(&self, event: HookEvent) {
            self.quiet.lock().insert(event);
        }

        /// Recorded calls as `verb id`.
        #[must_use]
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, verb: &str, id: &str) -> RaindResult<()> {
            self.calls.lock().push(format!("{verb} {id}"));
            if self.failing.lock().contains(verb) {
                return Err(RaindError::Command {
                    program: "droplet".to_string(),
                    args: format!("{verb} {id}"),
                    output: "simulated failure".to_string(),
                });
            }
            Ok(())
        }

        fn deliver(&self, event: HookEvent, id: &str, status: ContainerStatus, pid: Option<u32>) -> RaindResult<()> {
            if self.quiet.lock().contains(&event) {
                return Ok(());
            }
            let Some(receiver) = self.receiver.get() else {
                return Ok(());
            };
            let mut state = ContainerState::new(id, "");
            state.status = status;
            state.pid = pid;
            receiver.handle(event, &state)
        }
    }

    #[async_trait]
    impl OciRuntime for SimulatedRuntime {
        async fn create(&self, id: &str, _tty: bool) -> RaindResult<()> {
            self.record("create", id)?;
            let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
            self.deliver(HookEvent::CreateRuntime, id, ContainerStatus::Created, Some(pid))?;
            self.deliver(HookEvent::CreateContainer, id, ContainerStatus::Created, Some(pid))
        }

        async fn start(&self, id: &str) -> RaindResult<()> {
            self.record("start", id)?;
            self.deliver(HookEvent::Poststart, id, ContainerStatus::Running, None)
        }

        async fn kill(&self, id: &str) -> RaindResult<()> {
            self.record("kill", id)?;
            self.deliver(HookEvent::StopContainer, id, ContainerStatus::Stopped, None)
        }

        async fn delete(&self, id: &str) -> RaindResult<()> {
            self.record("delete", id)?;
            self.deliver(HookEvent::Poststop, id, ContainerStatus::Stopped, None)
        }

        async fn exec(&self, id: &str, _tty: bool, entrypoint: &[String]) -> RaindResult<String> {
            self.record("exec", id)?;
            Ok(entrypoint.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use raind_common::RecordingRunner;

    use super::*;

    #[tokio::test]
    async fn droplet_argv() {
        let runner = Arc::new(RecordingRunner::new());
        let runtime = DropletRuntime::new("droplet", runner.clone());

        runtime.create("abc", true).await.unwrap();
        runtime.create("abc", false).await.unwrap();
        runtime.start("abc").await.unwrap();
        runtime.kill("abc").await.unwrap();
        runtime.delete("abc").await.unwrap();
        runtime
            .exec("abc", false, &["ls".to_string(), "-l".to_string()])
            .await
            .unwrap();

        assert_eq!(
            runner.command_lines(),
            vec![
                "droplet create -t abc",
                "droplet create abc",
                "droplet start abc",
                "droplet kill abc",
                "droplet delete abc",
                "droplet exec abc --entrypoint ls -l",
            ]
        );
    }

    #[tokio::test]
    async fn failure_carries_output() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("start abc");
        let runtime = DropletRuntime::new("droplet", runner);

        let err = runtime.start("abc").await.unwrap_err();
        assert!(matches!(err, raind_common::RaindError::Command { .. }));
    }
}
