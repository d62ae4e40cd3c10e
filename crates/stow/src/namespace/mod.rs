//! Container mount namespaces.
//!
//! A container's namespace starts as a slave copy of the host tree. The
//! [`NamespaceBuilder`] lays the container root, system filesystems, bind
//! specs and volume links over it, and tears it down again on stop.

mod builder;

pub use builder::{LinkPlacement, LinkRequest, NamespaceBuilder, NamespaceContext, NamespaceMounts};
