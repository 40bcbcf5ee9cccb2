//! Network module
//!
//! Connection admission and the seam to the physical transport. The transport
//! itself (radio discovery, byte delivery) is external; this module decides which
//! peers get one of the scarce connection slots and how connection races between
//! two peers are settled.

pub mod memory;
mod orchestrator;
mod pool;
mod priority;
mod session;
mod transport;

pub use memory::{LinkEvent, MemoryNetwork, MemoryTransport, SentFrame};
pub use orchestrator::{AdmissionDecision, DisconnectDecision, Orchestrator, RebalanceOutcome};
pub use pool::{ConnectionPool, ConnectionSlot, LinkIntent, SlotDecision, SlotOccupant};
pub use priority::{
    ConnectionClass, PeerProfile, PoolContext, PriorityPolicy, PriorityWeights,
    WeightedPriorityPolicy,
};
pub use session::{should_initiate, SessionAction, SessionConfig, SessionManager, SessionPhase};
pub use transport::{ConnectionState, SendMode, Transport};
