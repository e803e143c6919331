//! # raind-oci
//!
//! Types exchanged with the droplet OCI runtime.
//!
//! This crate provides:
//! - The runtime spec written as `config.json` for each container
//! - Image manifest and configuration types read during pulls
//! - The OCI state payload delivered to hooks and the container status machine

#![warn(missing_docs)]

pub mod image;
pub mod runtime;
pub mod state;

pub use runtime::{HookEvent, RuntimeSpec};
pub use state::{ContainerState, ContainerStatus};

/// OCI runtime spec version written by raind.
pub const OCI_VERSION: &str = "1.2.0";
