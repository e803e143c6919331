//! Pods, pod templates and replica sets.

pub mod model;
mod reconciler;
mod service;
mod store;

pub use model::{
    ContainerTemplate, DEFAULT_NAMESPACE, Manifest, Pod, PodSpec, PodState, PodTemplate,
    ReplicaSet, ReplicaSetSpec,
};
pub use reconciler::{ReconcileReport, Reconciler};
pub use service::{Applied, InfraState, PodService};
pub use store::{PodDocument, PodStore};
