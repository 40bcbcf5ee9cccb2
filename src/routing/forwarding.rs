//! Hop accounting and relay selection
//!
//! The origin transmits with `hop_count = 0` and a route path holding only
//! itself. Every receiver calls [`record_hop`] before looking at the frame, so
//! `hop_count` always equals the number of links the copy in hand has crossed and
//! the path ends with the local peer.

use crate::error::RoutingError;
use crate::identity::PeerId;
use crate::protocol::{Envelope, MAX_TTL};

/// Check the routing fields of a frame as received
///
/// A well-formed frame has a hop budget in `1..=MAX_TTL`, has not crossed more
/// links than its budget, and carries a route path that starts at the origin,
/// ends at the transmitter and holds exactly `hop_count + 1` entries.
pub fn validate_routing_info(envelope: &Envelope) -> Result<(), RoutingError> {
    if envelope.ttl == 0 || envelope.ttl > MAX_TTL {
        return Err(RoutingError::InvalidRoutingInfo {
            reason: format!("ttl {} outside 1..={}", envelope.ttl, MAX_TTL),
        });
    }

    if envelope.hop_count > envelope.ttl {
        return Err(RoutingError::HopLimitExceeded {
            hop_count: envelope.hop_count,
            ttl: envelope.ttl,
        });
    }

    let path = &envelope.route_path;
    if path.len() != envelope.hop_count as usize + 1 {
        return Err(RoutingError::InvalidRoutingInfo {
            reason: format!(
                "route path has {} entries for hop count {}",
                path.len(),
                envelope.hop_count
            ),
        });
    }

    if path.first() != Some(&envelope.origin_id) {
        return Err(RoutingError::InvalidRoutingInfo {
            reason: "route path does not start at the origin".to_string(),
        });
    }

    if path.last() != Some(&envelope.sender_id) {
        return Err(RoutingError::InvalidRoutingInfo {
            reason: "route path does not end at the sender".to_string(),
        });
    }

    Ok(())
}

/// Account for the link the frame just crossed
pub fn record_hop(envelope: &mut Envelope, local: &PeerId) {
    envelope.hop_count += 1;
    envelope.route_path.push(local.to_string());
}

/// Whether the frame may cross one more link
///
/// Checked after [`record_hop`]: a frame whose hop count reached its budget is
/// delivered if addressed here but never relayed.
pub fn has_hop_budget(envelope: &Envelope) -> bool {
    envelope.hop_count < envelope.ttl
}

/// Copy of a received frame ready to be transmitted by `local`
pub fn prepare_relay(envelope: &Envelope, local: &PeerId) -> Envelope {
    let mut relay = envelope.clone();
    relay.sender_id = local.to_string();
    relay
}

/// Whether `peer` already appears in the frame's route path
pub fn path_contains(envelope: &Envelope, peer: &PeerId) -> bool {
    envelope.route_path.iter().any(|p| p == peer.as_str())
}

/// Neighbors a flooded frame should go to
///
/// Excludes the neighbor it came from and every peer already on its path.
pub fn relay_targets(
    neighbors: &[PeerId],
    envelope: &Envelope,
    from: Option<&PeerId>,
) -> Vec<PeerId> {
    neighbors
        .iter()
        .filter(|n| Some(*n) != from && !path_contains(envelope, n))
        .cloned()
        .collect()
}

/// Whether a path visits any peer twice
pub fn has_loop<T: PartialEq>(path: &[T]) -> bool {
    path.iter()
        .enumerate()
        .any(|(i, p)| path[i + 1..].contains(p))
}
