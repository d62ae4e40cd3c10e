//! # stow-common
//!
//! Shared types for the stow volume and mount-namespace subsystem:
//! - Container and volume identifiers
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{StowError, StowResult};
pub use id::{ContainerId, VolumeId};
pub use paths::StowPaths;
