//! Shared-subtree propagation.
//!
//! - [`graph`]: an explicit model of the kernel mount tree
//! - [`policy`]: how volume mounts and their appearances are wired together

pub mod graph;
pub mod policy;

pub use graph::PropagationGraph;
pub use policy::{ReadOnly, apply_flags, attach_appearance, discard_staged, publish, publish_bind};
