//! # relaymesh
//!
//! Store-and-forward routing for ad-hoc peer-to-peer meshes where every device
//! holds only a handful of radio links. Messages hop across devices that are
//! directly connected, using on-demand route discovery, a gossiped topology
//! table and flooding as a last resort.
//!
//! ## Quick Start
//!
//! ```no_run
//! use relaymesh::network::MemoryNetwork;
//! use relaymesh::{Event, NodeBuilder, PeerId, SendOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let (transport, inbox) = network.register("alice");
//!
//!     let node = NodeBuilder::new("alice").with_transport(transport).build()?;
//!     node.subscribe(|event| {
//!         if let Event::MessageDelivered { message } = event {
//!             println!("{} says {:?}", message.origin_id, message.payload);
//!         }
//!     });
//!     node.spawn_link_pump(inbox);
//!     node.start().await?;
//!
//!     node.send_message(&PeerId::from("bob"), b"hello".to_vec(), SendOptions::reliable())
//!         .await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod network;
pub mod protocol;
pub mod routing;

// Re-export main types
pub use api::{Event, MeshConfig, NetworkProfile, Node, NodeBuilder, NodeState, SubscriptionHandle};
pub use error::{ConfigError, MeshError, NetworkError, ProtocolError, Result, RoutingError};
pub use identity::{MessageId, PeerId};
pub use protocol::{Message, SendOptions};
pub use routing::{DeliveryPath, DiscoveryOutcome, SendReport};
