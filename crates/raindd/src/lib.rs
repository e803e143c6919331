//! raindd - the raind daemon.
//!
//! Serves the management API and the hook listener over one [`raind::Platform`]
//! and runs its background loops until SIGINT or SIGTERM.

#![warn(missing_docs)]

pub mod api;
pub mod cli;
pub mod logging;
