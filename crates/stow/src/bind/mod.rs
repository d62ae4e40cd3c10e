//! Container bind mounts: typed specifications and target resolution.

pub mod resolver;
pub mod spec;

pub use resolver::{BindResolver, MAX_SYMLINKS};
pub use spec::{BindFlags, BindSpec, format_binds, parse_binds};
