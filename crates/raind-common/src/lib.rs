//! # raind-common
//!
//! Shared utilities and types for the raind container platform.
//!
//! This crate provides functionality used across all raind crates:
//! - Container IDs, entity IDs and name generation
//! - Standard filesystem paths
//! - Atomic file replacement and advisory locking
//! - The lock-protected JSON document store
//! - The host command execution seam
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod exec;
pub mod fs;
pub mod id;
pub mod paths;
pub mod store;

pub use error::{ErrorKind, RaindError, RaindResult};
pub use exec::{CommandOutput, CommandRunner, HostCommandRunner, RecordingRunner};
pub use id::ContainerId;
pub use paths::RaindPaths;
pub use store::{Document, JsonStore};
