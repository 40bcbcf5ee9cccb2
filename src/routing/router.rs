//! Message dispatcher
//!
//! [`Router`] is the routing core of a node. An outbound unicast message tries,
//! in order: a live direct link, a cached route, on-demand route discovery, the
//! topology table and finally a flood to every neighbor. Inbound frames are
//! deduplicated, accounted for with [`record_hop`], and then delivered, answered
//! or relayed according to their payload kind.
//!
//! The router never holds a lock across a transport call. Relays and ack
//! retransmissions never wait for discovery, so an inbound pump can never block
//! on a reply that only the same pump could deliver.

use crate::api::events::{Event, EventHandlers};
use crate::crypto::{delivery_fingerprint, frame_fingerprint};
use crate::error::{NetworkError, Result, RoutingError};
use crate::identity::{MessageId, PeerId};
use crate::network::{SendMode, Transport};
use crate::protocol::messages::{originate, unix_millis};
use crate::protocol::{
    decode_frame, encode_frame, Ack, ChatPayload, Envelope, Message, PayloadKind, RouteError,
    RouteReply, RouteRequest, SendOptions, TopologyBroadcast, WirePayload, MAX_TTL,
};
use crate::routing::ack::AckManager;
use crate::routing::discovery::{
    DiscoveryCallback, DiscoveryOutcome, DiscoveryStart, RelayRecord, RouteDiscovery,
};
use crate::routing::forwarding::{
    has_hop_budget, has_loop, path_contains, prepare_relay, record_hop, relay_targets,
    validate_routing_info,
};
use crate::routing::gossip::TopologyGossip;
use crate::routing::message_cache::MessageCache;
use crate::routing::route_cache::{RouteCache, RouteInfo};
use crate::routing::routing_table::RoutingTable;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Tunables of the routing core
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    /// Hop budget for locally originated frames
    pub default_ttl: u32,
    /// Lifetime of a cached route
    pub route_ttl: Duration,
    /// How long a route discovery may wait for a reply
    pub discovery_timeout: Duration,
    /// Dedup window
    pub message_cache_ttl: Duration,
    /// Maximum remembered fingerprints
    pub message_cache_capacity: usize,
    /// Delay before the first retransmission of an unacknowledged send
    pub ack_timeout: Duration,
    /// Retransmissions before a send is reported failed
    pub max_retries: u32,
    /// Period of unconditional topology announcements
    pub topology_interval: Duration,
    /// Minimum spacing of announcements triggered by neighbor changes
    pub topology_min_interval: Duration,
    /// Age after which a peer's announcement is dropped
    pub topology_liveness: Duration,
    /// Maximum neighbors a relayed announcement goes to (0 = all)
    pub topology_fanout: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_ttl: 8,
            route_ttl: Duration::from_secs(300),
            discovery_timeout: Duration::from_secs(5),
            message_cache_ttl: Duration::from_secs(300),
            message_cache_capacity: 10_000,
            ack_timeout: Duration::from_secs(2),
            max_retries: 3,
            topology_interval: Duration::from_secs(30),
            topology_min_interval: Duration::from_secs(2),
            topology_liveness: Duration::from_secs(90),
            topology_fanout: 0,
        }
    }
}

/// How an outbound message left this peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryPath {
    /// Sent over a live link to the recipient
    Direct,
    /// Sent to the next hop of a cached route
    CachedRoute,
    /// Sent to the next hop of a freshly discovered route
    Discovered,
    /// Sent to the shortest-path next hops of the topology table
    Topology,
    /// Flooded to every neighbor
    Broadcast,
    /// Nothing could be sent yet; acknowledged sends retry later
    Queued,
}

/// Outcome of [`Router::send_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// Identifier of the sent message
    pub message_id: MessageId,
    /// How it left this peer
    pub path: DeliveryPath,
}

/// Whether a dispatch may use route discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscoveryMode {
    /// Wait for the discovery to finish (locally originated sends)
    Await,
    /// Start a discovery for later sends but do not wait (acks, retries)
    Background,
    /// Never discover (relays)
    Never,
}

/// Routing core of one peer
pub struct Router {
    local: PeerId,
    config: RouterConfig,
    transport: Arc<dyn Transport>,
    neighbors: RwLock<BTreeSet<PeerId>>,
    routing_table: RoutingTable,
    route_cache: RouteCache,
    discovery: Arc<RouteDiscovery>,
    /// Frames already processed, keyed per transmission attempt
    seen: MessageCache,
    /// Application messages already handed to the user
    delivered: MessageCache,
    acks: AckManager,
    gossip: TopologyGossip,
    events: EventHandlers,
}

impl Router {
    /// Create a router for `local` sending through `transport`
    pub fn new(
        local: PeerId,
        transport: Arc<dyn Transport>,
        config: RouterConfig,
        events: EventHandlers,
    ) -> Self {
        let gossip = TopologyGossip::new(
            local.clone(),
            config.topology_interval,
            config.topology_min_interval,
        )
        .with_fanout(config.topology_fanout);

        Self {
            routing_table: RoutingTable::new(local.clone(), config.topology_liveness),
            route_cache: RouteCache::new(config.route_ttl),
            discovery: Arc::new(RouteDiscovery::new(config.discovery_timeout * 2)),
            seen: MessageCache::new(config.message_cache_ttl, config.message_cache_capacity),
            delivered: MessageCache::new(config.message_cache_ttl, config.message_cache_capacity),
            acks: AckManager::new(config.ack_timeout, config.max_retries),
            neighbors: RwLock::new(BTreeSet::new()),
            local,
            config,
            transport,
            gossip,
            events,
        }
    }

    /// Local peer identity
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Active configuration
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Directly connected peers, sorted
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.neighbors.read().iter().cloned().collect()
    }

    /// Whether `peer` has a live link to us
    pub fn is_neighbor(&self, peer: &PeerId) -> bool {
        self.neighbors.read().contains(peer)
    }

    /// Topology table
    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Route cache
    pub fn route_cache(&self) -> &RouteCache {
        &self.route_cache
    }

    /// Discovery state
    pub fn discovery(&self) -> &RouteDiscovery {
        &self.discovery
    }

    /// Acknowledgment tracker
    pub fn acks(&self) -> &AckManager {
        &self.acks
    }

    /// Seen-frame cache
    pub fn message_cache(&self) -> &MessageCache {
        &self.seen
    }

    /// Send an application message
    ///
    /// Fails only for a self-addressed send, an unusable hop budget, or an
    /// unacknowledged send that could not leave this peer at all. An
    /// acknowledged send that could not leave yet is reported as
    /// [`DeliveryPath::Queued`] and retried by [`Router::tick`].
    pub async fn send_message(
        &self,
        recipient: &PeerId,
        payload: Vec<u8>,
        options: SendOptions,
    ) -> Result<SendReport> {
        if recipient == &self.local {
            return Err(RoutingError::SelfAddressed.into());
        }

        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        if ttl == 0 || ttl > MAX_TTL {
            return Err(RoutingError::InvalidRoutingInfo {
                reason: format!("ttl {} outside 1..={}", ttl, MAX_TTL),
            }
            .into());
        }

        let message_id = MessageId::generate();
        let mut envelope = originate(
            &self.local,
            recipient,
            message_id,
            ttl,
            &WirePayload::Chat(ChatPayload { content: payload }),
        )?;
        envelope.requires_ack = options.requires_ack && !recipient.is_broadcast();
        envelope.priority = options.priority;
        self.seen
            .observe(frame_fingerprint(&self.local, &message_id, PayloadKind::Chat, 0));

        if recipient.is_broadcast() {
            let sent = self.flood(&envelope, &self.neighbors()).await;
            if sent == 0 {
                return Err(NetworkError::NoPeersAvailable.into());
            }
            debug!(message_id = %message_id, targets = sent, "Broadcast sent");
            return Ok(SendReport {
                message_id,
                path: DeliveryPath::Broadcast,
            });
        }

        let path = self.dispatch(&envelope, None, DiscoveryMode::Await).await;

        if envelope.requires_ack {
            self.acks
                .register(message_id, recipient.clone(), envelope, Instant::now());
        }

        match path {
            Some(path) => {
                debug!(message_id = %message_id, recipient = %recipient, path = ?path, "Message sent");
                Ok(SendReport { message_id, path })
            },
            None if options.requires_ack => {
                debug!(message_id = %message_id, recipient = %recipient, "No route yet, send queued for retry");
                Ok(SendReport {
                    message_id,
                    path: DeliveryPath::Queued,
                })
            },
            None => Err(NetworkError::NoPeersAvailable.into()),
        }
    }

    /// Start discovering a route to `destination`
    ///
    /// The callback fires exactly once: immediately if the destination is a
    /// neighbor or a valid route is cached, otherwise when a reply arrives or
    /// `timeout` passes. Concurrent discoveries for one destination share a
    /// single request flood.
    pub async fn initiate_route_discovery(
        &self,
        destination: &PeerId,
        timeout: Duration,
        callback: DiscoveryCallback,
    ) -> Result<()> {
        if destination == &self.local {
            return Err(RoutingError::SelfAddressed.into());
        }
        if destination.is_broadcast() {
            return Err(RoutingError::RouteNotFound {
                destination: destination.clone(),
            }
            .into());
        }

        if self.is_neighbor(destination) {
            callback(DiscoveryOutcome::Found(self.direct_route(destination)));
            return Ok(());
        }

        if let Some(route) = self.route_cache.lookup(destination) {
            if self.is_neighbor(&route.next_hop) {
                callback(DiscoveryOutcome::Found(route));
                return Ok(());
            }
        }

        let request_id = match self
            .discovery
            .begin(destination, timeout, callback, Instant::now())
        {
            DiscoveryStart::Joined(id) => {
                debug!(destination = %destination, request_id = %id, "Joined running route discovery");
                return Ok(());
            },
            DiscoveryStart::New(id) => id,
        };

        let request = RouteRequest {
            request_id: request_id.as_bytes().to_vec(),
            origin: self.local.to_string(),
            destination: destination.to_string(),
            hop_count: 0,
            path: vec![self.local.to_string()],
            timestamp_ms: unix_millis(),
        };
        let envelope = match originate(
            &self.local,
            &PeerId::broadcast(),
            request_id,
            self.config.default_ttl,
            &WirePayload::RouteRequest(request),
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.discovery.time_out(&request_id);
                return Err(e.into());
            },
        };
        self.seen.observe(frame_fingerprint(
            &self.local,
            &request_id,
            PayloadKind::RouteRequest,
            0,
        ));

        let sent = self.flood(&envelope, &self.neighbors()).await;
        if sent == 0 {
            debug!(destination = %destination, "No neighbors to ask for a route");
            self.discovery.time_out(&request_id);
            return Ok(());
        }

        debug!(destination = %destination, request_id = %request_id, targets = sent, "Route request flooded");

        let discovery = Arc::clone(&self.discovery);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            discovery.time_out(&request_id);
        });
        Ok(())
    }

    /// Discover a route and wait for the outcome
    pub async fn discover_route(
        &self,
        destination: &PeerId,
        timeout: Duration,
    ) -> Result<DiscoveryOutcome> {
        let (tx, rx) = oneshot::channel();
        self.initiate_route_discovery(
            destination,
            timeout,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )
        .await?;

        Ok(rx.await.unwrap_or(DiscoveryOutcome::NoRoute))
    }

    /// Process one frame received from neighbor `from`
    ///
    /// Malformed frames are returned as errors; duplicates and frames this peer
    /// originated are dropped silently.
    pub async fn handle_incoming(&self, from: &PeerId, frame: &[u8]) -> Result<()> {
        let mut envelope = decode_frame(frame)?;
        validate_routing_info(&envelope)?;

        if envelope.sender_id != from.as_str() {
            return Err(RoutingError::InvalidRoutingInfo {
                reason: format!(
                    "frame received from {} names sender {}",
                    from, envelope.sender_id
                ),
            }
            .into());
        }

        let origin = envelope.origin();
        let kind = envelope.kind()?;
        let message_id = envelope.id()?;

        if origin == self.local || path_contains(&envelope, &self.local) {
            trace!(message_id = %message_id, kind = %kind, "Dropping frame that already passed here");
            return Ok(());
        }

        if !self.seen.observe(frame_fingerprint(
            &origin,
            &message_id,
            kind,
            envelope.attempt,
        )) {
            trace!(origin = %origin, message_id = %message_id, kind = %kind, "Dropping duplicate frame");
            return Ok(());
        }

        record_hop(&mut envelope, &self.local);

        match envelope.body()? {
            WirePayload::Chat(chat) => self.on_chat(envelope, chat, from).await,
            WirePayload::Ack(ack) => self.on_ack(envelope, ack, from).await,
            WirePayload::TopologyBroadcast(announcement) => {
                self.on_topology(envelope, announcement, from).await
            },
            WirePayload::RouteRequest(request) => {
                self.on_route_request(envelope, request, from).await
            },
            WirePayload::RouteReply(reply) => self.apply_reply(envelope, &reply).await,
            WirePayload::RouteError(notice) => self.on_route_error(envelope, notice, from).await,
        }
    }

    /// A link to `peer` came up
    pub fn peer_connected(&self, peer: &PeerId) {
        if peer == &self.local || peer.is_broadcast() {
            return;
        }

        let added = self.neighbors.write().insert(peer.clone());
        self.routing_table.add_local_neighbor(peer);
        if added {
            self.gossip.mark_dirty();
            // A discovery waiting for this peer is answered by the link itself
            if self.discovery.resolve(&self.direct_route(peer)) {
                self.events.dispatch(Event::RouteDiscovered {
                    destination: peer.clone(),
                    next_hop: peer.clone(),
                    hop_count: 1,
                });
            }
            debug!(peer = %peer, "Neighbor added");
        }
    }

    /// The link to `peer` went down
    ///
    /// Routes through the peer are purged, relay state naming it is dropped and
    /// acknowledged sends addressed to it fail immediately.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        let removed = self.neighbors.write().remove(peer);
        self.routing_table.remove_local_neighbor(peer);
        let invalidated = self.route_cache.invalidate_next_hop(peer);
        let relays = self.discovery.forget_peer(peer);

        for failure in self.acks.fail_peer(peer) {
            warn!(message_id = %failure.message_id, peer = %peer, "Recipient disconnected before acknowledging");
            self.events.dispatch(Event::DeliveryFailed {
                message_id: failure.message_id,
                peer: failure.target,
                attempts: failure.attempts,
            });
        }

        if removed {
            self.gossip.mark_dirty();
        }

        debug!(
            peer = %peer,
            routes = invalidated.len(),
            relays,
            "Neighbor removed"
        );
    }

    /// `peer` left radio range entirely; forget everything it announced
    pub fn peer_lost(&self, peer: &PeerId) {
        self.peer_disconnected(peer);
        self.routing_table.remove_peer(peer);
    }

    /// Run periodic work due at `now`
    ///
    /// Retransmits unacknowledged sends, reports exhausted ones, expires
    /// discoveries, sweeps caches and announces the neighbor set when due.
    pub async fn tick(&self, now: Instant) {
        let poll = self.acks.poll_due(now);

        for failure in poll.failures {
            self.events.dispatch(Event::DeliveryFailed {
                message_id: failure.message_id,
                peer: failure.target,
                attempts: failure.attempts,
            });
        }

        for retry in poll.retries {
            if let Ok(id) = retry.id() {
                self.seen.observe(frame_fingerprint(
                    &self.local,
                    &id,
                    PayloadKind::Chat,
                    retry.attempt,
                ));
            }
            if self
                .dispatch(&retry, None, DiscoveryMode::Background)
                .await
                .is_none()
            {
                debug!(recipient = %retry.recipient_id, attempt = retry.attempt, "Retransmission found no neighbor");
            }
        }

        self.discovery.expire(now);
        self.seen.evict_expired_at(now);
        self.delivered.evict_expired_at(now);
        self.route_cache.sweep(now);
        self.routing_table.prune_stale(now);
        self.announce_topology(now).await;
    }

    /// Send `envelope` along the first policy step that works
    ///
    /// Returns `None` when nothing was transmitted.
    async fn dispatch(
        &self,
        envelope: &Envelope,
        from: Option<&PeerId>,
        mode: DiscoveryMode,
    ) -> Option<DeliveryPath> {
        let destination = envelope.recipient();

        if self.is_neighbor(&destination) {
            match self
                .transmit(&destination, envelope, SendMode::Reliable)
                .await
            {
                Ok(()) => return Some(DeliveryPath::Direct),
                Err(e) => warn!(peer = %destination, error = %e, "Direct send failed"),
            }
        }

        if let Some(route) = self.usable_route(&destination, envelope, from) {
            match self
                .transmit(&route.next_hop, envelope, SendMode::Reliable)
                .await
            {
                Ok(()) => return Some(DeliveryPath::CachedRoute),
                Err(e) => {
                    warn!(next_hop = %route.next_hop, destination = %destination, error = %e, "Send to next hop failed");
                    self.handle_link_failure(&route.next_hop, &destination)
                        .await;
                },
            }
        }

        match mode {
            DiscoveryMode::Await => {
                match self
                    .discover_route(&destination, self.config.discovery_timeout)
                    .await
                {
                    Ok(DiscoveryOutcome::Found(route))
                        if self.is_neighbor(&route.next_hop)
                            && !path_contains(envelope, &route.next_hop) =>
                    {
                        match self
                            .transmit(&route.next_hop, envelope, SendMode::Reliable)
                            .await
                        {
                            Ok(()) => return Some(DeliveryPath::Discovered),
                            Err(e) => {
                                warn!(next_hop = %route.next_hop, error = %e, "Send along discovered route failed")
                            },
                        }
                    },
                    Ok(_) => debug!(destination = %destination, "Discovery found no route"),
                    Err(e) => debug!(destination = %destination, error = %e, "Discovery not possible"),
                }
            },
            DiscoveryMode::Background => {
                let timeout = self.config.discovery_timeout;
                if let Err(e) = self
                    .initiate_route_discovery(&destination, timeout, Box::new(|_| {}))
                    .await
                {
                    debug!(destination = %destination, error = %e, "Background discovery not started");
                }
            },
            DiscoveryMode::Never => {},
        }

        let hops: Vec<PeerId> = self
            .routing_table
            .next_hops_to(&destination)
            .into_iter()
            .filter(|hop| {
                self.is_neighbor(hop) && Some(hop) != from && !path_contains(envelope, hop)
            })
            .collect();
        if !hops.is_empty() {
            let mut sent = 0;
            for hop in &hops {
                match self.transmit(hop, envelope, SendMode::Reliable).await {
                    Ok(()) => sent += 1,
                    Err(e) => debug!(next_hop = %hop, error = %e, "Send to topology next hop failed"),
                }
            }
            if sent > 0 {
                return Some(DeliveryPath::Topology);
            }
        }

        let targets = relay_targets(&self.neighbors(), envelope, from);
        if self.flood(envelope, &targets).await > 0 {
            return Some(DeliveryPath::Broadcast);
        }

        None
    }

    fn usable_route(
        &self,
        destination: &PeerId,
        envelope: &Envelope,
        from: Option<&PeerId>,
    ) -> Option<RouteInfo> {
        let route = self.route_cache.lookup(destination)?;
        let usable = self.is_neighbor(&route.next_hop)
            && Some(&route.next_hop) != from
            && !path_contains(envelope, &route.next_hop);
        usable.then_some(route)
    }

    fn direct_route(&self, peer: &PeerId) -> RouteInfo {
        RouteInfo::new(peer.clone(), peer.clone(), 1)
            .with_path(vec![self.local.clone(), peer.clone()])
    }

    /// Forget routes through a next hop that failed and tell the neighbors
    async fn handle_link_failure(&self, broken: &PeerId, destination: &PeerId) {
        let invalidated = self.route_cache.invalidate_next_hop(broken);
        debug!(next_hop = %broken, routes = invalidated.len(), "Routes through failed next hop invalidated");

        let notice = RouteError {
            destination: destination.to_string(),
            broken_next_hop: broken.to_string(),
            reporter: self.local.to_string(),
        };
        let notice_id = MessageId::generate();
        let envelope = match originate(
            &self.local,
            &PeerId::broadcast(),
            notice_id,
            self.config.default_ttl,
            &WirePayload::RouteError(notice),
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Failed to build route error");
                return;
            },
        };
        self.seen.observe(frame_fingerprint(
            &self.local,
            &notice_id,
            PayloadKind::RouteError,
            0,
        ));

        let targets: Vec<PeerId> = self
            .neighbors()
            .into_iter()
            .filter(|n| n != broken)
            .collect();
        self.flood(&envelope, &targets).await;
    }

    async fn on_chat(&self, envelope: Envelope, chat: ChatPayload, from: &PeerId) -> Result<()> {
        if envelope.is_broadcast() {
            self.deliver(&envelope, chat)?;
            if has_hop_budget(&envelope) {
                let relay = prepare_relay(&envelope, &self.local);
                let targets = relay_targets(&self.neighbors(), &relay, Some(from));
                self.flood(&relay, &targets).await;
            }
            return Ok(());
        }

        self.learn_reverse_routes(&envelope, from);

        if envelope.recipient() == self.local {
            self.deliver(&envelope, chat)?;
            if envelope.requires_ack {
                // Duplicates are re-acked: the earlier ack may have been lost
                self.send_ack(&envelope).await?;
            }
            return Ok(());
        }

        self.relay_unicast(&envelope, from).await;
        Ok(())
    }

    async fn on_ack(&self, envelope: Envelope, ack: Ack, from: &PeerId) -> Result<()> {
        self.learn_reverse_routes(&envelope, from);

        if envelope.recipient() != self.local {
            self.relay_unicast(&envelope, from).await;
            return Ok(());
        }

        let acked = MessageId::from_slice(&ack.message_id)?;
        let peer = envelope.origin();
        if let Some(pending) = self.acks.acknowledge(&acked, &peer) {
            info!(
                message_id = %acked,
                peer = %peer,
                attempt = ack.attempt,
                retries = pending.attempts_made,
                "Delivery confirmed"
            );
            self.events.dispatch(Event::DeliveryConfirmed {
                message_id: acked,
                peer,
            });
        }
        Ok(())
    }

    async fn on_topology(
        &self,
        envelope: Envelope,
        announcement: TopologyBroadcast,
        from: &PeerId,
    ) -> Result<()> {
        let announcer = PeerId::from(announcement.announcer.as_str());
        if announcer != envelope.origin() {
            return Err(RoutingError::InvalidRoutingInfo {
                reason: format!(
                    "announcement for {} originated by {}",
                    announcer, envelope.origin_id
                ),
            }
            .into());
        }

        let changed = self.routing_table.merge_announcement(
            &announcer,
            announcement
                .neighbors
                .iter()
                .map(|n| PeerId::from(n.as_str())),
            announcement.sequence,
            Instant::now(),
        );

        if changed && has_hop_budget(&envelope) {
            let relay = prepare_relay(&envelope, &self.local);
            let targets = self
                .gossip
                .select_targets(relay_targets(&self.neighbors(), &relay, Some(from)));
            self.flood(&relay, &targets).await;
        }
        Ok(())
    }

    async fn on_route_request(
        &self,
        envelope: Envelope,
        request: RouteRequest,
        from: &PeerId,
    ) -> Result<()> {
        let request_id = MessageId::from_slice(&request.request_id)?;
        let destination = PeerId::from(request.destination.as_str());
        let origin = envelope.origin();

        self.learn_reverse_routes(&envelope, from);

        let traversed: Vec<PeerId> = envelope
            .route_path
            .iter()
            .map(|p| PeerId::from(p.as_str()))
            .collect();

        if let Some(path) = self.resolve_request(&destination, &traversed) {
            debug!(
                origin = %origin,
                destination = %destination,
                hop_count = path.len().saturating_sub(1),
                "Answering route request"
            );
            return self
                .answer_request(request_id, &origin, &destination, path, envelope.ttl)
                .await;
        }

        if !has_hop_budget(&envelope) {
            debug!(origin = %origin, destination = %destination, "Route request out of hops");
            return Ok(());
        }

        let mut relay = prepare_relay(&envelope, &self.local);
        relay.payload = WirePayload::RouteRequest(RouteRequest {
            hop_count: relay.hop_count,
            path: relay.route_path.clone(),
            ..request
        })
        .encode()?;

        let targets = relay_targets(&self.neighbors(), &relay, Some(from));
        if targets.is_empty() {
            return Ok(());
        }

        self.discovery.record_relay(
            request_id,
            RelayRecord {
                upstream: from.clone(),
                origin,
                destination,
                relayed_at: Instant::now(),
            },
        );
        self.flood(&relay, &targets).await;
        Ok(())
    }

    /// Full path for answering a request that traversed `traversed`, if this
    /// peer can answer
    fn resolve_request(&self, destination: &PeerId, traversed: &[PeerId]) -> Option<Vec<PeerId>> {
        let mut path = traversed.to_vec();

        if destination == &self.local {
            // Path already ends here
        } else if self.is_neighbor(destination) {
            path.push(destination.clone());
        } else {
            let route = self.route_cache.lookup(destination)?;
            let cached = route.path.as_ref()?;
            if cached.first() != Some(&self.local) || !self.is_neighbor(&route.next_hop) {
                return None;
            }
            path.extend(cached.iter().skip(1).cloned());
        }

        (!has_loop(&path)).then_some(path)
    }

    async fn answer_request(
        &self,
        request_id: MessageId,
        requester: &PeerId,
        destination: &PeerId,
        path: Vec<PeerId>,
        request_ttl: u32,
    ) -> Result<()> {
        let reply = RouteReply {
            request_id: request_id.as_bytes().to_vec(),
            destination: destination.to_string(),
            hop_count: path.len().saturating_sub(1) as u32,
            path: path.iter().map(|p| p.to_string()).collect(),
            timestamp_ms: unix_millis(),
        };

        let ttl = (path.len() as u32).max(request_ttl).min(MAX_TTL);
        let reply_id = MessageId::generate();
        let envelope = originate(
            &self.local,
            requester,
            reply_id,
            ttl,
            &WirePayload::RouteReply(reply.clone()),
        )?;
        self.seen.observe(frame_fingerprint(
            &self.local,
            &reply_id,
            PayloadKind::RouteReply,
            0,
        ));

        self.apply_reply(envelope, &reply).await
    }

    /// Install the route a reply carries and pass it one step toward the requester
    async fn apply_reply(&self, envelope: Envelope, reply: &RouteReply) -> Result<()> {
        let request_id = MessageId::from_slice(&reply.request_id)?;
        let destination = PeerId::from(reply.destination.as_str());
        let path: Vec<PeerId> = reply.path.iter().map(|p| PeerId::from(p.as_str())).collect();

        if path.last() != Some(&destination) || has_loop(&path) {
            return Err(RoutingError::InvalidRoutingInfo {
                reason: "route reply path is inconsistent".to_string(),
            }
            .into());
        }

        let Some(index) = path.iter().position(|p| p == &self.local) else {
            debug!(request_id = %request_id, "Route reply does not pass through this peer");
            return Ok(());
        };

        if index + 1 < path.len() {
            let route = RouteInfo::new(
                destination.clone(),
                path[index + 1].clone(),
                (path.len() - 1 - index) as u32,
            )
            .with_path(path[index..].to_vec());
            self.route_cache.insert(route.clone());

            if self.discovery.complete(&request_id, route.clone()) || self.discovery.resolve(&route)
            {
                info!(
                    destination = %destination,
                    next_hop = %route.next_hop,
                    hop_count = route.hop_count,
                    "Route discovered"
                );
                self.events.dispatch(Event::RouteDiscovered {
                    destination: destination.clone(),
                    next_hop: route.next_hop.clone(),
                    hop_count: route.hop_count,
                });
            }
        }

        if index == 0 {
            return Ok(());
        }

        let upstream = &path[index - 1];
        let target = if self.is_neighbor(upstream) {
            Some(upstream.clone())
        } else {
            self.discovery
                .upstream_of(&request_id)
                .filter(|p| self.is_neighbor(p))
        };
        let Some(target) = target else {
            debug!(request_id = %request_id, upstream = %upstream, "Upstream of route reply is gone");
            return Ok(());
        };

        if !has_hop_budget(&envelope) {
            debug!(request_id = %request_id, "Route reply out of hops");
            return Ok(());
        }

        let relay = prepare_relay(&envelope, &self.local);
        self.transmit(&target, &relay, SendMode::Reliable).await
    }

    async fn on_route_error(
        &self,
        envelope: Envelope,
        notice: RouteError,
        from: &PeerId,
    ) -> Result<()> {
        let reporter = PeerId::from(notice.reporter.as_str());
        if reporter != envelope.origin() {
            return Err(RoutingError::InvalidRoutingInfo {
                reason: format!(
                    "route error from {} originated by {}",
                    reporter, envelope.origin_id
                ),
            }
            .into());
        }

        let broken = PeerId::from(notice.broken_next_hop.as_str());
        let destination = PeerId::from(notice.destination.as_str());
        let removed = self
            .route_cache
            .invalidate_broken_link(&reporter, &broken, &destination);
        if removed.is_empty() {
            return Ok(());
        }

        debug!(
            reporter = %reporter,
            broken = %broken,
            routes = removed.len(),
            "Routes invalidated by route error"
        );

        if has_hop_budget(&envelope) {
            let relay = prepare_relay(&envelope, &self.local);
            let targets = relay_targets(&self.neighbors(), &relay, Some(from));
            self.flood(&relay, &targets).await;
        }
        Ok(())
    }

    /// Hand a chat message to the application unless it was delivered before
    fn deliver(&self, envelope: &Envelope, chat: ChatPayload) -> Result<bool> {
        let message = Message::from_envelope(envelope, chat)?;
        if !self
            .delivered
            .observe(delivery_fingerprint(&message.origin_id, &message.id))
        {
            debug!(origin = %message.origin_id, message_id = %message.id, "Message already delivered");
            return Ok(false);
        }

        debug!(
            origin = %message.origin_id,
            message_id = %message.id,
            hop_count = message.hop_count,
            "Message delivered"
        );
        self.events.dispatch(Event::MessageDelivered { message });
        Ok(true)
    }

    async fn send_ack(&self, envelope: &Envelope) -> Result<()> {
        let origin = envelope.origin();
        let ack = Ack {
            message_id: envelope.message_id.clone(),
            attempt: envelope.attempt,
        };
        let ack_id = MessageId::generate();
        let reply = originate(
            &self.local,
            &origin,
            ack_id,
            envelope.ttl,
            &WirePayload::Ack(ack),
        )?;
        self.seen
            .observe(frame_fingerprint(&self.local, &ack_id, PayloadKind::Ack, 0));

        if self
            .dispatch(&reply, None, DiscoveryMode::Background)
            .await
            .is_none()
        {
            debug!(peer = %origin, "Ack could not be sent");
        }
        Ok(())
    }

    async fn relay_unicast(&self, envelope: &Envelope, from: &PeerId) {
        if !has_hop_budget(envelope) {
            debug!(
                origin = %envelope.origin_id,
                recipient = %envelope.recipient_id,
                hop_count = envelope.hop_count,
                "Hop budget exhausted, not relaying"
            );
            return;
        }

        let relay = prepare_relay(envelope, &self.local);
        match self.dispatch(&relay, Some(from), DiscoveryMode::Never).await {
            Some(path) => trace!(recipient = %relay.recipient_id, path = ?path, "Relayed"),
            None => debug!(recipient = %relay.recipient_id, "No neighbor to relay to"),
        }
    }

    /// Learn routes back to every earlier peer on the frame's path
    ///
    /// Called after [`record_hop`], so the path ends with the local peer and
    /// its second to last entry is `from`.
    fn learn_reverse_routes(&self, envelope: &Envelope, from: &PeerId) {
        let path: Vec<PeerId> = envelope
            .route_path
            .iter()
            .map(|p| PeerId::from(p.as_str()))
            .collect();
        if path.len() < 2 || has_loop(&path) {
            return;
        }

        let now = Instant::now();
        let last = path.len() - 1;
        for j in 0..last {
            let reverse: Vec<PeerId> = path[j..].iter().rev().cloned().collect();
            let route = RouteInfo::new(path[j].clone(), from.clone(), (last - j) as u32)
                .with_path(reverse)
                .installed(now);
            self.route_cache.learn(route, now);
        }
    }

    async fn announce_topology(&self, now: Instant) {
        let neighbors = self.neighbors();
        let Some(announcement) = self.gossip.next_announcement(&neighbors, now) else {
            return;
        };
        if neighbors.is_empty() {
            return;
        }

        let id = MessageId::generate();
        let sequence = announcement.sequence;
        let envelope = match originate(
            &self.local,
            &PeerId::broadcast(),
            id,
            self.config.default_ttl,
            &WirePayload::TopologyBroadcast(announcement),
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Failed to build topology announcement");
                return;
            },
        };
        self.seen.observe(frame_fingerprint(
            &self.local,
            &id,
            PayloadKind::TopologyBroadcast,
            0,
        ));

        let sent = self.flood(&envelope, &neighbors).await;
        trace!(sequence, neighbors = neighbors.len(), sent, "Topology announced");
    }

    async fn transmit(&self, peer: &PeerId, envelope: &Envelope, mode: SendMode) -> Result<()> {
        let frame = encode_frame(envelope)?;
        self.transport.send(peer, frame, mode).await
    }

    /// Send best effort to every target; returns how many sends succeeded
    async fn flood(&self, envelope: &Envelope, targets: &[PeerId]) -> usize {
        if targets.is_empty() {
            return 0;
        }

        let frame = match encode_frame(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                return 0;
            },
        };

        let mut sent = 0;
        for peer in targets {
            match self
                .transport
                .send(peer, frame.clone(), SendMode::BestEffort)
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %peer, error = %e, "Flood send failed"),
            }
        }
        sent
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.local)
            .field("neighbors", &self.neighbors.read().len())
            .field("routes", &self.route_cache.len())
            .field("pending_acks", &self.acks.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use crate::network::{LinkEvent, MemoryNetwork};
    use parking_lot::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    type EventLog = Arc<Mutex<Vec<Event>>>;

    fn config() -> RouterConfig {
        RouterConfig {
            discovery_timeout: Duration::from_millis(50),
            ..RouterConfig::default()
        }
    }

    fn router(
        network: &MemoryNetwork,
        id: &str,
    ) -> (Router, UnboundedReceiver<LinkEvent>, EventLog) {
        let (transport, rx) = network.register(id);
        let events = EventHandlers::new();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        events.subscribe(move |event| sink.lock().push(event));

        let router = Router::new(PeerId::from(id), Arc::new(transport), config(), events);
        (router, rx, log)
    }

    fn connect(network: &MemoryNetwork, a: &Router, b: &str) {
        network.link(a.local_id(), &PeerId::from(b)).unwrap();
        a.peer_connected(&PeerId::from(b));
    }

    fn chat(origin: &str, recipient: &str, ttl: u32) -> Envelope {
        originate(
            &PeerId::from(origin),
            &PeerId::from(recipient),
            MessageId::generate(),
            ttl,
            &WirePayload::Chat(ChatPayload {
                content: b"hi".to_vec(),
            }),
        )
        .unwrap()
    }

    /// Walk a frame through relays as if each had received and forwarded it
    fn via(mut envelope: Envelope, relays: &[&str]) -> Envelope {
        for relay in relays {
            let peer = PeerId::from(*relay);
            record_hop(&mut envelope, &peer);
            envelope = prepare_relay(&envelope, &peer);
        }
        envelope
    }

    fn deliveries(log: &EventLog) -> usize {
        log.lock()
            .iter()
            .filter(|e| matches!(e, Event::MessageDelivered { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_send_to_self_is_rejected() {
        let network = MemoryNetwork::new();
        let (a, _rx, _) = router(&network, "a");

        let result = a
            .send_message(&PeerId::from("a"), b"hi".to_vec(), SendOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(MeshError::Routing(RoutingError::SelfAddressed))
        ));
    }

    #[tokio::test]
    async fn test_send_rejects_unusable_ttl() {
        let network = MemoryNetwork::new();
        let (a, _rx, _) = router(&network, "a");

        let result = a
            .send_message(
                &PeerId::from("b"),
                b"hi".to_vec(),
                SendOptions::default().with_ttl(MAX_TTL + 1),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_send_without_neighbors() {
        let network = MemoryNetwork::new();
        let (a, _rx, _) = router(&network, "a");

        let result = a
            .send_message(&PeerId::from("b"), b"hi".to_vec(), SendOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(MeshError::Network(NetworkError::NoPeersAvailable))
        ));

        let report = a
            .send_message(&PeerId::from("b"), b"hi".to_vec(), SendOptions::reliable())
            .await
            .unwrap();
        assert_eq!(report.path, DeliveryPath::Queued);
        assert!(a.acks().is_pending(&report.message_id));
    }

    #[tokio::test]
    async fn test_direct_send_uses_link() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");

        let report = a
            .send_message(&PeerId::from("b"), b"hi".to_vec(), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(report.path, DeliveryPath::Direct);

        let frames = network.frames_of_kind(PayloadKind::Chat);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to, PeerId::from("b"));
        assert_eq!(frames[0].mode, SendMode::Reliable);
    }

    #[tokio::test]
    async fn test_cached_route_preferred_over_discovery() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");
        a.route_cache()
            .insert(RouteInfo::new(PeerId::from("d"), PeerId::from("b"), 3));

        let report = a
            .send_message(&PeerId::from("d"), b"hi".to_vec(), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(report.path, DeliveryPath::CachedRoute);
        assert!(network.frames_of_kind(PayloadKind::RouteRequest).is_empty());
    }

    #[tokio::test]
    async fn test_discovery_precedes_topology() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");
        a.routing_table().merge_announcement(
            &PeerId::from("b"),
            vec![PeerId::from("a"), PeerId::from("c")],
            1,
            Instant::now(),
        );

        // Nobody answers the request, so the send falls back to the table
        let report = a
            .send_message(&PeerId::from("c"), b"hi".to_vec(), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(report.path, DeliveryPath::Topology);
        assert_eq!(network.frames_of_kind(PayloadKind::RouteRequest).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivered_once_and_reacked() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, log) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");

        let mut envelope = chat("b", "a", 8);
        envelope.requires_ack = true;
        let frame = encode_frame(&envelope).unwrap();

        for _ in 0..3 {
            a.handle_incoming(&PeerId::from("b"), &frame).await.unwrap();
        }
        assert_eq!(deliveries(&log), 1);
        assert_eq!(network.frames_of_kind(PayloadKind::Ack).len(), 1);

        // A retransmission is a new frame but not a new message
        envelope.attempt = 1;
        let retry = encode_frame(&envelope).unwrap();
        a.handle_incoming(&PeerId::from("b"), &retry).await.unwrap();
        assert_eq!(deliveries(&log), 1);
        assert_eq!(network.frames_of_kind(PayloadKind::Ack).len(), 2);
    }

    #[tokio::test]
    async fn test_sender_must_match_link() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");

        let frame = encode_frame(&chat("b", "a", 8)).unwrap();
        let result = a.handle_incoming(&PeerId::from("c"), &frame).await;
        assert!(matches!(
            result,
            Err(MeshError::Routing(RoutingError::InvalidRoutingInfo { .. }))
        ));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_an_error() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");

        let result = a
            .handle_incoming(&PeerId::from("b"), &[0xff, 0xff, 0xff])
            .await;
        assert!(matches!(result, Err(MeshError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_relay_respects_hop_budget() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        let (_c, _c_rx, _) = router(&network, "c");
        connect(&network, &a, "b");
        connect(&network, &a, "c");

        // ttl 1: arrives here with hop_count 1 and goes no further
        let exhausted = encode_frame(&chat("b", "z", 1)).unwrap();
        a.handle_incoming(&PeerId::from("b"), &exhausted).await.unwrap();
        assert!(network.frames_of_kind(PayloadKind::Chat).is_empty());

        let fresh = encode_frame(&chat("b", "z", 2)).unwrap();
        a.handle_incoming(&PeerId::from("b"), &fresh).await.unwrap();

        let relayed = network.frames_of_kind(PayloadKind::Chat);
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].to, PeerId::from("c"));
        let envelope = relayed[0].envelope.as_ref().unwrap();
        assert_eq!(envelope.hop_count, 1);
        assert_eq!(envelope.route_path, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_reverse_routes_learned_from_traffic() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");

        let envelope = via(chat("x", "a", 8), &["b"]);
        a.handle_incoming(&PeerId::from("b"), &encode_frame(&envelope).unwrap())
            .await
            .unwrap();

        let route = a.route_cache().lookup(&PeerId::from("x")).unwrap();
        assert_eq!(route.next_hop, PeerId::from("b"));
        assert_eq!(route.hop_count, 2);
        assert_eq!(
            route.path,
            Some(vec![PeerId::from("a"), PeerId::from("b"), PeerId::from("x")])
        );
    }

    #[tokio::test]
    async fn test_destination_answers_route_request() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");

        let request_id = MessageId::generate();
        let request = RouteRequest {
            request_id: request_id.as_bytes().to_vec(),
            origin: "x".to_string(),
            destination: "a".to_string(),
            hop_count: 0,
            path: vec!["x".to_string()],
            timestamp_ms: unix_millis(),
        };
        let envelope = originate(
            &PeerId::from("x"),
            &PeerId::broadcast(),
            request_id,
            8,
            &WirePayload::RouteRequest(request),
        )
        .unwrap();
        let envelope = via(envelope, &["b"]);
        a.handle_incoming(&PeerId::from("b"), &encode_frame(&envelope).unwrap())
            .await
            .unwrap();

        let replies = network.frames_of_kind(PayloadKind::RouteReply);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].to, PeerId::from("b"));
        match replies[0].envelope.as_ref().unwrap().body().unwrap() {
            WirePayload::RouteReply(reply) => {
                assert_eq!(reply.path, vec!["x", "b", "a"]);
                assert_eq!(reply.hop_count, 2);
            },
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_reply_completes_discovery() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, log) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");

        let outcome: Arc<Mutex<Option<DiscoveryOutcome>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&outcome);
        a.initiate_route_discovery(
            &PeerId::from("d"),
            Duration::from_secs(5),
            Box::new(move |o| *sink.lock() = Some(o)),
        )
        .await
        .unwrap();

        let rreq = network.frames_of_kind(PayloadKind::RouteRequest);
        assert_eq!(rreq.len(), 1);
        let request_id = rreq[0].envelope.as_ref().unwrap().id().unwrap();

        // c answers, b relays the reply to us
        let reply = RouteReply {
            request_id: request_id.as_bytes().to_vec(),
            destination: "d".to_string(),
            path: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            hop_count: 3,
            timestamp_ms: unix_millis(),
        };
        let envelope = originate(
            &PeerId::from("c"),
            &PeerId::from("a"),
            MessageId::generate(),
            8,
            &WirePayload::RouteReply(reply),
        )
        .unwrap();
        let envelope = via(envelope, &["b"]);
        a.handle_incoming(&PeerId::from("b"), &encode_frame(&envelope).unwrap())
            .await
            .unwrap();

        let route = outcome.lock().clone().and_then(|o| o.route().cloned()).unwrap();
        assert_eq!(route.next_hop, PeerId::from("b"));
        assert_eq!(route.hop_count, 3);
        assert_eq!(a.route_cache().lookup(&PeerId::from("d")), Some(route));
        assert!(log
            .lock()
            .iter()
            .any(|e| matches!(e, Event::RouteDiscovered { hop_count: 3, .. })));
    }

    #[tokio::test]
    async fn test_discovery_resolves_immediately_for_neighbor() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");

        let outcome = a
            .discover_route(&PeerId::from("b"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.route().unwrap().next_hop, PeerId::from("b"));
        assert!(network.frames_of_kind(PayloadKind::RouteRequest).is_empty());
    }

    #[tokio::test]
    async fn test_discovery_without_neighbors_fails_fast() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");

        let outcome = a
            .discover_route(&PeerId::from("d"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, DiscoveryOutcome::NoRoute);
        assert_eq!(a.discovery().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_purges_routes_and_fails_acks() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, log) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");
        a.route_cache()
            .insert(RouteInfo::new(PeerId::from("x"), PeerId::from("b"), 2));

        let report = a
            .send_message(&PeerId::from("b"), b"hi".to_vec(), SendOptions::reliable())
            .await
            .unwrap();

        a.peer_disconnected(&PeerId::from("b"));

        assert!(a.route_cache().lookup(&PeerId::from("x")).is_none());
        assert!(!a.acks().is_pending(&report.message_id));
        assert!(a.neighbors().is_empty());
        let failures: Vec<_> = log
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::DeliveryFailed { .. }))
            .cloned()
            .collect();
        assert_eq!(
            failures,
            vec![Event::DeliveryFailed {
                message_id: report.message_id,
                peer: PeerId::from("b"),
                attempts: 0,
            }]
        );
    }

    #[tokio::test]
    async fn test_tick_retransmits_unacknowledged_send() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");

        a.send_message(&PeerId::from("b"), b"hi".to_vec(), SendOptions::reliable())
            .await
            .unwrap();
        a.tick(Instant::now() + Duration::from_secs(3)).await;

        let chats = network.frames_of_kind(PayloadKind::Chat);
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[1].envelope.as_ref().unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_tick_announces_topology_once() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        connect(&network, &a, "b");

        let now = Instant::now();
        a.tick(now).await;
        a.tick(now).await;

        let announcements = network.frames_of_kind(PayloadKind::TopologyBroadcast);
        assert_eq!(announcements.len(), 1);
        match announcements[0].envelope.as_ref().unwrap().body().unwrap() {
            WirePayload::TopologyBroadcast(t) => assert_eq!(t.neighbors, vec!["b"]),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_error_invalidates_and_propagates() {
        let network = MemoryNetwork::new();
        let (a, _a_rx, _) = router(&network, "a");
        let (_b, _b_rx, _) = router(&network, "b");
        let (_c, _c_rx, _) = router(&network, "c");
        connect(&network, &a, "b");
        connect(&network, &a, "c");
        a.route_cache()
            .insert(RouteInfo::new(PeerId::from("x"), PeerId::from("b"), 3));

        let notice = RouteError {
            destination: "x".to_string(),
            broken_next_hop: "y".to_string(),
            reporter: "b".to_string(),
        };
        let envelope = originate(
            &PeerId::from("b"),
            &PeerId::broadcast(),
            MessageId::generate(),
            8,
            &WirePayload::RouteError(notice),
        )
        .unwrap();
        a.handle_incoming(&PeerId::from("b"), &encode_frame(&envelope).unwrap())
            .await
            .unwrap();

        assert!(a.route_cache().lookup(&PeerId::from("x")).is_none());
        let relayed = network.frames_of_kind(PayloadKind::RouteError);
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].to, PeerId::from("c"));
    }
}
