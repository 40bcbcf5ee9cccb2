//! Node implementation - the main entry point for relaymesh
//!
//! A [`Node`] ties the routing core to a transport adapter. The adapter feeds it
//! discovery, connection and data events through the `on_*` methods; the node
//! decides admission, resolves connection races, routes frames and runs
//! periodic maintenance once started.

use crate::api::config::{MeshConfig, NetworkProfile};
use crate::api::events::{Event, EventHandlers, SubscriptionHandle};
use crate::error::{ConfigError, MeshError};
use crate::identity::PeerId;
use crate::network::{
    AdmissionDecision, ConnectionState, DisconnectDecision, LinkEvent, Orchestrator, PeerProfile,
    PriorityPolicy, SessionAction, SessionManager, Transport, WeightedPriorityPolicy,
};
use crate::protocol::SendOptions;
use crate::routing::{DiscoveryOutcome, Router, SendReport};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Current operational state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Node has been created but not started
    Created,
    /// Maintenance is running and messages may be sent
    Running,
    /// Node is shutting down
    Stopping,
    /// Node has stopped
    Stopped,
}

/// Builder for creating Node instances with progressive configuration
///
/// # Examples
///
/// ```no_run
/// use relaymesh::api::{NetworkProfile, NodeBuilder};
/// use relaymesh::network::MemoryNetwork;
///
/// # async fn example() -> relaymesh::Result<()> {
/// let network = MemoryNetwork::new();
/// let (transport, inbox) = network.register("alice");
///
/// let node = NodeBuilder::new("alice")
///     .with_network_profile(NetworkProfile::Minimal)
///     .with_transport(transport)
///     .build()?;
/// node.spawn_link_pump(inbox);
/// node.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct NodeBuilder {
    local: PeerId,
    config: MeshConfig,
    transport: Option<Arc<dyn Transport>>,
    policy: Option<Arc<dyn PriorityPolicy>>,
}

impl NodeBuilder {
    /// Start building a node with the given identity
    pub fn new(local: impl Into<PeerId>) -> Self {
        Self {
            local: local.into(),
            config: MeshConfig::default(),
            transport: None,
            policy: None,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the network profile preset
    ///
    /// Resets the connection slot count to the profile's default.
    pub fn with_network_profile(mut self, profile: NetworkProfile) -> Self {
        self.config = self.config.with_profile(profile);
        self
    }

    /// Set the number of connection slots
    pub fn with_max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the hop budget of locally originated messages
    pub fn with_default_ttl(mut self, ttl: u32) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    /// Use a transport adapter
    pub fn with_transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use a transport adapter shared with other components
    pub fn with_shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the admission scoring policy
    ///
    /// Defaults to [`WeightedPriorityPolicy`] with the configured weights.
    pub fn with_priority_policy(mut self, policy: Arc<dyn PriorityPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Build the node
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the identity is empty
    /// or the broadcast sentinel, or no transport was given.
    pub fn build(self) -> crate::Result<Node> {
        self.config.validate()?;

        if self.local.as_str().is_empty() || self.local.is_broadcast() {
            return Err(ConfigError::invalid("local_id", "must name a single peer").into());
        }

        let transport = self
            .transport
            .ok_or_else(|| ConfigError::invalid("transport", "a transport adapter is required"))?;

        let policy: Arc<dyn PriorityPolicy> = match self.policy {
            Some(policy) => policy,
            None => Arc::new(WeightedPriorityPolicy::new(self.config.priority.clone())),
        };

        let events = EventHandlers::new();
        let router = Router::new(
            self.local.clone(),
            Arc::clone(&transport),
            self.config.router_config(),
            events.clone(),
        );
        let orchestrator =
            Orchestrator::new(self.config.max_connections, policy, self.config.candidate_ttl());
        let sessions = SessionManager::new(self.local.clone(), self.config.session_config());

        Ok(Node {
            inner: Arc::new(NodeInner {
                local: self.local,
                config: self.config,
                transport,
                orchestrator,
                sessions,
                router,
                events,
                state: RwLock::new(NodeState::Created),
                maintenance: Mutex::new(None),
            }),
        })
    }
}

struct NodeInner {
    local: PeerId,
    config: MeshConfig,
    transport: Arc<dyn Transport>,
    orchestrator: Orchestrator,
    sessions: SessionManager,
    router: Router,
    events: EventHandlers,
    state: RwLock<NodeState>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// A relaymesh node
///
/// Cloning is cheap and every clone drives the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    // ========================================================================
    // Lifecycle Methods
    // ========================================================================

    /// Start the node
    ///
    /// Spawns the maintenance loop (ack retries, discovery expiry, cache sweeps,
    /// topology announcements, session timers, pool rebalancing).
    ///
    /// # Errors
    ///
    /// Returns an error unless the node is `Created` or `Stopped`.
    pub async fn start(&self) -> crate::Result<()> {
        {
            let mut state = self.inner.state.write();
            if *state != NodeState::Created && *state != NodeState::Stopped {
                return Err(MeshError::InvalidState(format!(
                    "cannot start a node in state {:?}",
                    *state
                )));
            }
            *state = NodeState::Running;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.maintenance_interval();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Node { inner }.maintain(Instant::now()).await;
            }
        });
        *self.inner.maintenance.lock() = Some(handle);

        info!(peer = %self.inner.local, "Node started");
        self.inner.events.dispatch(Event::NodeStarted);
        Ok(())
    }

    /// Stop the node
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not running.
    pub async fn stop(&self) -> crate::Result<()> {
        {
            let mut state = self.inner.state.write();
            if *state != NodeState::Running {
                return Err(MeshError::InvalidState(format!(
                    "cannot stop a node in state {:?}",
                    *state
                )));
            }
            *state = NodeState::Stopping;
        }

        let handle = self.inner.maintenance.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            // Cancellation is the expected outcome
            let _ = handle.await;
        }

        *self.inner.state.write() = NodeState::Stopped;
        info!(peer = %self.inner.local, "Node stopped");
        self.inner.events.dispatch(Event::NodeStopped);
        Ok(())
    }

    /// Get the current operational state
    pub fn state(&self) -> NodeState {
        *self.inner.state.read()
    }

    /// Local peer identity
    pub fn local_id(&self) -> &PeerId {
        &self.inner.local
    }

    /// Active configuration
    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    // ========================================================================
    // Event Methods
    // ========================================================================

    /// Register an event handler
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(handler)
    }

    /// Remove an event handler
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.inner.events.unsubscribe(handle);
    }

    // ========================================================================
    // Messaging Methods
    // ========================================================================

    /// Send an application message to `recipient`
    ///
    /// Use [`PeerId::broadcast`] as recipient to flood the whole mesh.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not running, the message is addressed to
    /// this node, or an unacknowledged send found no way out.
    pub async fn send_message(
        &self,
        recipient: &PeerId,
        payload: impl Into<Vec<u8>>,
        options: SendOptions,
    ) -> crate::Result<SendReport> {
        self.ensure_running()?;
        self.inner
            .router
            .send_message(recipient, payload.into(), options)
            .await
    }

    /// Flood a message to every reachable peer
    pub async fn broadcast(
        &self,
        payload: impl Into<Vec<u8>>,
        options: SendOptions,
    ) -> crate::Result<SendReport> {
        self.send_message(&PeerId::broadcast(), payload, options)
            .await
    }

    /// Find a route to `destination`, waiting at most the configured discovery timeout
    pub async fn discover_route(&self, destination: &PeerId) -> crate::Result<DiscoveryOutcome> {
        self.inner
            .router
            .discover_route(destination, self.inner.config.discovery_timeout())
            .await
    }

    // ========================================================================
    // Admission Methods
    // ========================================================================

    /// Ask the orchestrator for a slot for `peer`
    ///
    /// Returns whether the peer holds a slot afterwards. A displaced occupant is
    /// disconnected.
    pub async fn admit_peer(&self, peer: &PeerId) -> bool {
        if peer == &self.inner.local || peer.is_broadcast() {
            return false;
        }

        match self.inner.orchestrator.admit(peer, Instant::now()) {
            AdmissionDecision::AlreadyAdmitted { .. } => true,
            AdmissionDecision::Admitted { .. } => {
                self.inner
                    .events
                    .dispatch(Event::PeerAdmitted { peer: peer.clone() });
                true
            },
            AdmissionDecision::Replaced { evicted, .. } => {
                self.inner
                    .events
                    .dispatch(Event::PeerAdmitted { peer: peer.clone() });
                self.evict(&evicted).await;
                true
            },
            AdmissionDecision::Rejected { .. } => {
                self.inner
                    .events
                    .dispatch(Event::PeerRejected { peer: peer.clone() });
                false
            },
        }
    }

    /// Ask to drop `peer` in favour of someone else
    ///
    /// With a waiting candidate the peer is disconnected right away and the
    /// candidate dialed. Otherwise the disconnect is deferred until a newcomer
    /// needs the slot.
    pub async fn request_disconnect(&self, peer: &PeerId) -> DisconnectDecision {
        let now = Instant::now();
        let decision = self.inner.orchestrator.request_disconnect(peer, now);

        if let DisconnectDecision::Disconnect { replacement } = &decision {
            self.evict(peer).await;
            if let Some(replacement) = replacement {
                self.inner.events.dispatch(Event::PeerAdmitted {
                    peer: replacement.clone(),
                });
                self.connect_admitted(replacement, now).await;
            }
        }
        decision
    }

    /// Replace what is known about a peer (class, battery, signal)
    pub fn update_peer_profile(&self, peer: &PeerId, profile: PeerProfile) {
        self.inner.orchestrator.update_profile(peer, profile);
    }

    // ========================================================================
    // Transport Events
    // ========================================================================

    /// The transport found `peer` in range
    ///
    /// Admits the peer and, if this side wins the connection race, dials it.
    /// Returns whether the peer was admitted.
    pub async fn on_peer_discovered(&self, peer: &PeerId) -> bool {
        if !self.admit_peer(peer).await {
            return false;
        }
        self.connect_admitted(peer, Instant::now()).await;
        true
    }

    /// The transport lost sight of `peer` altogether
    pub async fn on_peer_lost(&self, peer: &PeerId) {
        let was_linked = self.inner.router.is_neighbor(peer);
        self.inner.router.peer_lost(peer);
        self.inner.sessions.forget(peer);
        self.inner.orchestrator.forget(peer);
        debug!(peer = %peer, "Peer lost");

        if was_linked {
            self.inner
                .events
                .dispatch(Event::PeerDisconnected { peer: peer.clone() });
        }
        self.rebalance(Instant::now()).await;
    }

    /// The link to `peer` changed state
    pub async fn on_connection_state_changed(&self, peer: &PeerId, state: ConnectionState) {
        let now = Instant::now();
        match state {
            ConnectionState::Connecting => self.inner.sessions.on_inbound(peer, now),
            ConnectionState::Connected => self.link_up(peer, now).await,
            ConnectionState::Disconnected => self.link_down(peer, now).await,
        }
    }

    /// A frame arrived from neighbor `from`
    ///
    /// # Errors
    ///
    /// Returns the decode or validation error of a malformed frame, which has
    /// been dropped.
    pub async fn on_data_received(&self, from: &PeerId, frame: &[u8]) -> crate::Result<()> {
        self.inner.orchestrator.touch(from, Instant::now());
        let result = self.inner.router.handle_incoming(from, frame).await;
        if let Err(e) = &result {
            warn!(peer = %from, error = %e, "Dropped inbound frame");
        }
        result
    }

    /// Dispatch one event of an in-process transport
    pub async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Data { from, frame } => {
                // Already logged; a bad frame never stops the pump
                let _ = self.on_data_received(&from, &frame).await;
            },
            LinkEvent::State { peer, state } => {
                self.on_connection_state_changed(&peer, state).await
            },
        }
    }

    /// Feed an inbox of link events into this node until it closes
    pub fn spawn_link_pump(&self, mut inbox: mpsc::UnboundedReceiver<LinkEvent>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                node.handle_link_event(event).await;
            }
        })
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Run one maintenance pass as of `now`
    ///
    /// Called by the loop spawned in [`Node::start`]; exposed so simulations can
    /// drive time explicitly.
    #[doc(hidden)]
    pub async fn maintain(&self, now: Instant) {
        self.inner.router.tick(now).await;

        for action in self.inner.sessions.poll(now) {
            self.perform(action).await;
        }

        self.rebalance(now).await;
    }

    /// Routing core
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Admission control
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    /// Connection attempt state
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    fn ensure_running(&self) -> crate::Result<()> {
        let state = self.state();
        if state != NodeState::Running {
            return Err(MeshError::InvalidState(format!(
                "node must be running to send messages (state {:?})",
                state
            )));
        }
        Ok(())
    }

    async fn link_up(&self, peer: &PeerId, now: Instant) {
        if !self.inner.orchestrator.is_admitted(peer) && !self.admit_peer(peer).await {
            info!(peer = %peer, "Refusing link from peer without a slot");
            self.inner.sessions.forget(peer);
            if let Err(e) = self.inner.transport.disconnect(peer).await {
                warn!(peer = %peer, error = %e, "Failed to drop refused link");
            }
            return;
        }

        self.inner.orchestrator.mark_connected(peer, now);
        self.inner.sessions.on_connected(peer);

        if !self.inner.router.is_neighbor(peer) {
            self.inner.router.peer_connected(peer);
            info!(peer = %peer, "Peer connected");
            self.inner
                .events
                .dispatch(Event::PeerConnected { peer: peer.clone() });
        }
    }

    async fn link_down(&self, peer: &PeerId, now: Instant) {
        let was_linked = self.inner.router.is_neighbor(peer);
        let action = self.inner.sessions.on_disconnected(peer, now);
        self.inner.router.peer_disconnected(peer);

        match action {
            SessionAction::GiveUp(peer) => self.give_up(&peer),
            // A failed attempt in backoff keeps its slot for the retry
            _ if self.inner.sessions.phase(peer).is_some() => {},
            _ => {
                self.inner.orchestrator.release(peer);
            },
        }

        if was_linked {
            info!(peer = %peer, "Peer disconnected");
            self.inner
                .events
                .dispatch(Event::PeerDisconnected { peer: peer.clone() });
        }

        self.rebalance(now).await;
    }

    async fn rebalance(&self, now: Instant) {
        let outcome = self.inner.orchestrator.rebalance(now);

        for peer in &outcome.evicted {
            self.evict(peer).await;
        }
        for peer in &outcome.admitted {
            self.inner
                .events
                .dispatch(Event::PeerAdmitted { peer: peer.clone() });
            self.connect_admitted(peer, now).await;
        }
    }

    async fn connect_admitted(&self, peer: &PeerId, now: Instant) {
        if self.inner.router.is_neighbor(peer) {
            return;
        }
        let action = self.inner.sessions.begin(peer, now);
        self.perform(action).await;
    }

    async fn evict(&self, peer: &PeerId) {
        let was_linked = self.inner.router.is_neighbor(peer);
        self.inner.sessions.forget(peer);
        self.inner.router.peer_disconnected(peer);

        info!(peer = %peer, "Peer evicted");
        self.inner
            .events
            .dispatch(Event::PeerEvicted { peer: peer.clone() });
        if was_linked {
            self.inner
                .events
                .dispatch(Event::PeerDisconnected { peer: peer.clone() });
        }

        if let Err(e) = self.inner.transport.disconnect(peer).await {
            warn!(peer = %peer, error = %e, "Failed to disconnect evicted peer");
        }
    }

    async fn perform(&self, action: SessionAction) {
        match action {
            SessionAction::Connect(peer) => self.dial(&peer, false).await,
            SessionAction::ResetAndConnect(peer) => self.dial(&peer, true).await,
            SessionAction::Reset(peer) => {
                if let Err(e) = self.inner.transport.reset_session(&peer).await {
                    debug!(peer = %peer, error = %e, "Session reset failed");
                }
            },
            SessionAction::GiveUp(peer) => self.give_up(&peer),
            SessionAction::Wait => {},
        }
    }

    async fn dial(&self, peer: &PeerId, reset: bool) {
        if reset {
            if let Err(e) = self.inner.transport.reset_session(peer).await {
                debug!(peer = %peer, error = %e, "Session reset failed");
            }
        }

        debug!(peer = %peer, reset, "Dialing peer");
        if let Err(e) = self.inner.transport.connect(peer).await {
            warn!(peer = %peer, error = %e, "Connection attempt failed");
            if let SessionAction::GiveUp(peer) =
                self.inner.sessions.on_connect_failed(peer, Instant::now())
            {
                self.give_up(&peer);
            }
        }
    }

    fn give_up(&self, peer: &PeerId) {
        self.inner.sessions.forget(peer);
        if self.inner.orchestrator.release(peer) {
            info!(peer = %peer, "Released slot of unreachable peer");
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local", &self.inner.local)
            .field("state", &self.state())
            .field("router", &self.inner.router)
            .field("orchestrator", &self.inner.orchestrator)
            .finish()
    }
}
