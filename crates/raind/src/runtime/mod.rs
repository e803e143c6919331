//! Container runtime core.
//!
//! The container store, the lifecycle engine and the pieces that feed it:
//! the OCI runtime driver, hook ingestion and the process monitor.

mod config;
mod container;
pub mod events;
pub mod hooks;
pub mod lifecycle;
pub mod monitor;
pub mod spec;
mod state;

pub use config::{HOOK_SETTER_ENV, RuntimeConfig};
pub use container::{ContainerEngine, CreateRequest};
pub use events::{ContainerEvent, EventBus};
pub use hooks::HookReceiver;
pub use lifecycle::{DropletRuntime, OciRuntime};
pub use monitor::{Monitor, ProcessProbe, SignalProbe};
pub use spec::SharedNamespaces;
pub use state::{ContainerDocument, ContainerRecord, ContainerStore};
