//! Event system for asynchronous notifications
//!
//! Applications learn about delivered messages, acknowledgment outcomes, route
//! discoveries and slot changes through [`Event`]s dispatched to subscribed
//! callbacks.

use crate::identity::{MessageId, PeerId};
use crate::protocol::Message;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Events delivered to application handlers
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A message addressed to this peer (or broadcast) arrived
    MessageDelivered {
        /// The delivered message
        message: Message,
    },

    /// The recipient acknowledged an acknowledged send
    DeliveryConfirmed {
        /// Acknowledged message
        message_id: MessageId,
        /// Recipient that acknowledged
        peer: PeerId,
    },

    /// An acknowledged send will not be retried again
    DeliveryFailed {
        /// Message that was never acknowledged
        message_id: MessageId,
        /// Intended recipient
        peer: PeerId,
        /// Retransmissions made
        attempts: u32,
    },

    /// Route discovery installed a route
    RouteDiscovered {
        /// Destination
        destination: PeerId,
        /// Direct neighbor to send through
        next_hop: PeerId,
        /// Links to the destination
        hop_count: u32,
    },

    /// A peer received a connection slot
    PeerAdmitted {
        /// Admitted peer
        peer: PeerId,
    },

    /// A peer was refused a slot and kept as a candidate
    PeerRejected {
        /// Rejected peer
        peer: PeerId,
    },

    /// A peer lost its slot to a higher-priority peer or a disconnect request
    PeerEvicted {
        /// Evicted peer
        peer: PeerId,
    },

    /// A link came up
    PeerConnected {
        /// Remote peer
        peer: PeerId,
    },

    /// A link went down
    PeerDisconnected {
        /// Remote peer
        peer: PeerId,
    },

    /// Node has started successfully
    NodeStarted,

    /// Node has stopped
    NodeStopped,
}

/// Handle for unsubscribing from events
///
/// Dropping the handle does not unsubscribe; call `Node::unsubscribe()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Numeric id of this handle
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Type alias for event handler callbacks
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Registered event handlers
///
/// Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: Arc<RwLock<Vec<(SubscriptionHandle, EventCallback)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventHandlers {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for all future events
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((handle, Arc::new(callback)));
        handle
    }

    /// Remove a handler; unknown handles are ignored
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.handlers.write().retain(|(h, _)| *h != handle);
    }

    /// Deliver an event to every handler, in registration order
    ///
    /// A panicking handler is logged and does not prevent the others from running.
    pub fn dispatch(&self, event: Event) {
        // Snapshot so handlers may subscribe or unsubscribe re-entrantly
        let handlers: Vec<_> = self.handlers.read().clone();

        for (handle, callback) in handlers {
            let event_clone = event.clone();
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event_clone);
            })) {
                tracing::error!(
                    handle = handle.id(),
                    panic = e
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| e.downcast_ref::<String>().map(|s| s.as_str()))
                        .unwrap_or("unknown panic"),
                    "Event handler panicked"
                );
            }
        }
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[test]
    fn test_event_handlers_subscribe() {
        let handlers = EventHandlers::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let _handle = handlers.subscribe(move |_event| {
            called_clone.store(true, Ordering::SeqCst);
        });

        handlers.dispatch(Event::NodeStarted);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_event_handlers_multiple_subscribers() {
        let handlers = EventHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = Arc::clone(&count);
            handlers.subscribe(move |_event| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        handlers.dispatch(Event::PeerConnected {
            peer: PeerId::from("bob"),
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_handlers_unsubscribe() {
        let handlers = EventHandlers::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let handle = handlers.subscribe(move |_event| {
            called_clone.store(true, Ordering::SeqCst);
        });

        handlers.unsubscribe(handle);
        handlers.dispatch(Event::NodeStarted);

        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(handlers.handler_count(), 0);
    }

    #[test]
    fn test_handles_are_unique() {
        let handlers = EventHandlers::new();
        let h1 = handlers.subscribe(|_| {});
        let h2 = handlers.subscribe(|_| {});
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_clones_share_registry() {
        let handlers = EventHandlers::new();
        let clone = handlers.clone();
        clone.subscribe(|_| {});
        assert_eq!(handlers.handler_count(), 1);
    }

    #[test]
    fn test_event_handlers_panic_isolation() {
        let handlers = EventHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));

        handlers.subscribe(|_event| {
            panic!("Handler panic");
        });

        let count_clone = Arc::clone(&count);
        handlers.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        handlers.dispatch(Event::NodeStopped);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
