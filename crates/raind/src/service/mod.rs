//! L4 services: selector-based load balancing onto pod infra addresses.

mod controller;
mod model;
mod store;

pub use controller::{Endpoint, ServiceController, chain_name, probabilities};
pub use model::{L4Service, ServicePort, ServiceSpec};
pub use store::{ServiceDocument, ServiceStore};
