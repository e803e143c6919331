//! Cgroup v2 subtrees.
//!
//! Every container gets `<cgroup root>/<id>`; the runtime moves the init
//! process into it and applies limits.

mod manager;

pub use manager::CgroupManager;
