//! Runtime core.
//!
//! [`Runtime`] ties volumes, container namespaces and links together and
//! drives the container lifecycle.

mod config;
mod container;
mod engine;
pub mod events;
mod lifecycle;
pub mod link;
mod state;

pub use config::{MountBackend, RuntimeConfig};
pub use container::Container;
pub use engine::Runtime;
pub use events::{EventBus, RuntimeEvent};
pub use lifecycle::{ContainerStatus, LifecycleEvent};
pub use link::{LinkRegistry, LinkState, VolumeLink};
pub use state::StateManager;
