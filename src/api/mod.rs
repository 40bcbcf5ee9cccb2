//! High-level API for relaymesh
//!
//! [`Node`] is the façade a transport adapter talks to. [`MeshConfig`] holds
//! its tunables and [`Event`]s report what happened.

pub mod config;
pub mod events;
pub mod node;

pub use config::{MeshConfig, NetworkProfile};
pub use events::{Event, EventCallback, EventHandlers, SubscriptionHandle};
pub use node::{Node, NodeBuilder, NodeState};
