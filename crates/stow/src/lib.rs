//! # stow
//!
//! Volumes and container mount namespaces.
//!
//! - **Volumes**: plain, overlay, bind and rbind volumes, each published as
//!   the root of its own peer group
//! - **Binds**: typed bind specs resolved inside the container root
//! - **Namespaces**: per-container mount trees with system filesystems,
//!   binds and volume links
//! - **Propagation**: shared/slave rules, either on the kernel or on an
//!   in-memory model of the mount tree
//!
//! ## Usage
//!
//! ```no_run
//! use stow::runtime::{Runtime, RuntimeConfig};
//! use stow::volume::{VolumeBackend, VolumeSpec};
//!
//! # fn example() -> stow_common::StowResult<()> {
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//!
//! let data = runtime.create_volume(VolumeSpec::new(VolumeBackend::Plain))?;
//! let id = runtime.run("web", None, Vec::new())?;
//! runtime.link(&data.id, &id, "/data", false)?;
//!
//! runtime.destroy(&id)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bind;
pub mod cli;
pub mod mount;
pub mod namespace;
pub mod propagation;
pub mod runtime;
pub mod volume;

pub use runtime::Runtime;
