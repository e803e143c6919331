//! # raind-bottle
//!
//! Bottles: YAML-declared groups of services with dependencies and network
//! policies, run as ordinary raind containers.
//!
//! - Services start in dependency order and stop in reverse
//! - Environment values naming a dependency resolve to its address
//! - Declared policies go through the policy compiler

#![warn(missing_docs)]

pub mod env;
pub mod order;
mod service;
pub mod spec;
mod store;

pub use order::start_order;
pub use service::BottleService;
pub use spec::{BottleSpec, PolicySpec, ServiceSpec};
pub use store::{Bottle, BottleDocument, BottlePolicy, BottleStore};
