//! # raind
//!
//! The core of the raind control plane.
//!
//! - [`runtime`]: the container store (CSM), the lifecycle engine driving the
//!   droplet OCI runtime, hook ingestion and the process monitor
//! - [`pod`]: pods, templates, replica sets and their reconciler
//! - [`service`]: L4 services load-balanced onto pod infra containers
//! - [`pki`]: SPIFFE client certificates for containers
//! - [`apparmor`]: the default confinement profile
//! - [`platform`]: everything wired together over one root directory
//!
//! ## Usage
//!
//! ```no_run
//! use raind::platform::{HostSeams, Platform};
//! use raind::runtime::{CreateRequest, RuntimeConfig};
//!
//! # async fn example() -> raind_common::RaindResult<()> {
//! let config = RuntimeConfig::default();
//! let platform = Platform::new(config.clone(), HostSeams::host(&config))?;
//! platform.bootstrap().await?;
//!
//! let record = platform.engine.create(CreateRequest::new("alpine")).await?;
//! platform.engine.start(&record.container_id).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod apparmor;
pub mod cgroup;
pub mod pki;
pub mod platform;
pub mod pod;
pub mod runtime;
pub mod service;

pub use platform::{HostSeams, Platform};
