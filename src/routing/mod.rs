//! Routing subsystem
//!
//! Moves messages across the mesh and keeps the state that makes that cheap:
//!
//! - **Router**: per-message policy (direct, cached route, discovery,
//!   topology, flood) and inbound handling
//! - **RoutingTable**: adjacency graph built from neighbor announcements,
//!   queried by breadth-first search
//! - **RouteCache** / **RouteDiscovery**: on-demand routes learned with
//!   request/reply floods and invalidated on link loss
//! - **MessageCache**: duplicate suppression
//! - **AckManager**: retransmission of acknowledged sends
//! - **TopologyGossip**: when to announce the local neighbor set
//!
//! # Hop accounting
//!
//! The origin sends with `hop_count = 0` and a route path holding only itself.
//! Every receiver increments the hop count and appends itself before deciding
//! anything, and relays only while `hop_count < ttl`. A frame with `ttl = k`
//! therefore never reaches anyone with a hop count above `k`.
//!
//! # Example
//!
//! ```no_run
//! use relaymesh::network::MemoryNetwork;
//! use relaymesh::routing::{Router, RouterConfig};
//! use relaymesh::api::EventHandlers;
//! use relaymesh::{PeerId, SendOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> relaymesh::Result<()> {
//! let network = MemoryNetwork::new();
//! let (transport, _inbox) = network.register("alice");
//! let router = Router::new(
//!     PeerId::from("alice"),
//!     Arc::new(transport),
//!     RouterConfig::default(),
//!     EventHandlers::new(),
//! );
//!
//! router.peer_connected(&PeerId::from("bob"));
//! router
//!     .send_message(&PeerId::from("bob"), b"hi".to_vec(), SendOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod ack;
mod discovery;
mod forwarding;
mod gossip;
mod message_cache;
mod route_cache;
mod router;
mod routing_table;

pub use ack::{AckManager, AckPoll, FailedDelivery, PendingAck};
pub use discovery::{
    DiscoveryCallback, DiscoveryOutcome, DiscoveryStart, RelayRecord, RouteDiscovery,
};
pub use forwarding::{
    has_hop_budget, has_loop, path_contains, prepare_relay, record_hop, relay_targets,
    validate_routing_info,
};
pub use gossip::TopologyGossip;
pub use message_cache::MessageCache;
pub use route_cache::{RouteCache, RouteInfo};
pub use router::{DeliveryPath, Router, RouterConfig, SendReport};
pub use routing_table::{Adjacency, RoutingTable};
