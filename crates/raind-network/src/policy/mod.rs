//! Network policies.
//!
//! Policies are edited in the store and take effect on commit. A commit
//! rebuilds the chains from scratch; revert returns to the document of the
//! previous commit.

pub mod compiler;
pub mod model;
pub mod store;

pub use compiler::{CommitReport, CompilerSettings, ContainerResolver, PolicyCompiler};
pub use model::{
    Endpoint, NorthSouthMode, Policy, PolicyDocument, PolicyKind, PolicyRequest, PolicyStatus,
};
pub use store::PolicyStore;
