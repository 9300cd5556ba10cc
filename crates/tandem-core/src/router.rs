//! Event router.
//!
//! Relays messages and typing indicators from a paired connection to its
//! partner. Routing never changes pairing state.

use crate::engine::PairingEngine;
use crate::event::RelayEvent;
use crate::registry::ConnectionId;
use std::sync::Arc;
use tandem_protocol::ServerFrame;
use tracing::trace;

/// What happened to a routed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Pushed to the partner's outbox.
    Delivered { partner: ConnectionId },
    /// The sender has no partner; the event was dropped.
    NotPaired,
    /// The partner could not be reached; the event was dropped.
    PartnerUnreachable { partner: ConnectionId },
}

impl RouteOutcome {
    /// Short name, for logging and metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteOutcome::Delivered { .. } => "delivered",
            RouteOutcome::NotPaired => "not_paired",
            RouteOutcome::PartnerUnreachable { .. } => "partner_unreachable",
        }
    }
}

/// Forwards relay events to the sender's current partner.
#[derive(Clone)]
pub struct EventRouter {
    engine: Arc<PairingEngine>,
}

impl EventRouter {
    /// Create a router over an engine.
    #[must_use]
    pub fn new(engine: Arc<PairingEngine>) -> Self {
        Self { engine }
    }

    /// The engine this router reads pairs from.
    #[must_use]
    pub fn engine(&self) -> &Arc<PairingEngine> {
        &self.engine
    }

    /// Forward `event` from `sender` to its partner, best-effort.
    ///
    /// The pair lookup and the push happen under the engine lock, so an
    /// event is never delivered after the pair it was sent in is gone.
    pub fn route(&self, sender: &ConnectionId, event: RelayEvent) -> RouteOutcome {
        let state = self.engine.lock();

        let Some(partner) = state.partner_of(sender) else {
            trace!(connection = %sender, kind = event.kind(), "Dropping event from unpaired connection");
            return RouteOutcome::NotPaired;
        };

        let sender_name = state.name_of(sender).cloned().unwrap_or_default();
        let kind = event.kind();
        let frame: ServerFrame = event.into_partner_event(&sender_name).into();

        if self.engine.registry().deliver(&partner, frame) {
            trace!(connection = %sender, partner = %partner, kind, "Event routed");
            RouteOutcome::Delivered { partner }
        } else {
            trace!(connection = %sender, partner = %partner, kind, "Partner unreachable");
            RouteOutcome::PartnerUnreachable { partner }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{connect, drain};
    use crate::registry::ChannelRegistry;
    use tandem_protocol::LeaveReason;

    fn setup() -> (Arc<ChannelRegistry>, EventRouter) {
        let registry = Arc::new(ChannelRegistry::new());
        let engine = Arc::new(PairingEngine::new(registry.clone()));
        (registry, EventRouter::new(engine))
    }

    fn message(text: &str) -> RelayEvent {
        RelayEvent::Message {
            text: text.to_string(),
            reply_to: None,
        }
    }

    #[test]
    fn test_route_to_partner() {
        let (registry, router) = setup();
        let (a, mut rx_a) = connect(&registry, 1);
        let (b, mut rx_b) = connect(&registry, 2);
        router.engine().request_pairing(a, Some("Ana")).unwrap();
        router.engine().request_pairing(b, Some("Ben")).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert_eq!(
            router.route(&a, message("hello")),
            RouteOutcome::Delivered { partner: b }
        );
        assert_eq!(
            router.route(&b, RelayEvent::TypingStart),
            RouteOutcome::Delivered { partner: a }
        );
        router.route(&b, RelayEvent::TypingStop);

        assert_eq!(
            drain(&mut rx_b),
            vec![ServerFrame::Message {
                text: "hello".to_string(),
                sender_name: "Ana".to_string(),
                reply_to: None,
            }]
        );
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerFrame::PartnerTyping, ServerFrame::PartnerStopTyping]
        );
    }

    #[test]
    fn test_routing_isolation() {
        let (registry, router) = setup();
        let (a, mut rx_a) = connect(&registry, 1);
        let (b, mut rx_b) = connect(&registry, 2);
        let (c, mut rx_c) = connect(&registry, 3);
        let (d, mut rx_d) = connect(&registry, 4);
        for id in [a, b, c, d] {
            router.engine().request_pairing(id, None).unwrap();
        }
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c, &mut rx_d] {
            drain(rx);
        }

        router.route(&a, message("for b"));
        router.route(&c, message("for d"));

        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(drain(&mut rx_d).len(), 1);
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn test_unpaired_sender_dropped() {
        let (registry, router) = setup();
        let (a, mut rx_a) = connect(&registry, 1);
        let (b, mut rx_b) = connect(&registry, 2);

        // Idle
        assert_eq!(router.route(&a, message("anyone?")), RouteOutcome::NotPaired);

        // Waiting
        router.engine().request_pairing(a, None).unwrap();
        assert_eq!(router.route(&a, RelayEvent::TypingStart), RouteOutcome::NotPaired);

        // After the pair ends
        router.engine().request_pairing(b, None).unwrap();
        router.engine().teardown(&b, LeaveReason::Ended);
        drain(&mut rx_a);
        drain(&mut rx_b);
        assert_eq!(router.route(&a, message("still there?")), RouteOutcome::NotPaired);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_unreachable_partner_leaves_state_unchanged() {
        let (registry, router) = setup();
        let (a, _rx_a) = connect(&registry, 1);
        let (b, rx_b) = connect(&registry, 2);
        router.engine().request_pairing(a, None).unwrap();
        router.engine().request_pairing(b, None).unwrap();
        drop(rx_b);

        let before = router.engine().stats();
        assert_eq!(
            router.route(&a, message("hello?")),
            RouteOutcome::PartnerUnreachable { partner: b }
        );
        assert_eq!(router.engine().stats(), before);
        router.engine().verify().unwrap();
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(RouteOutcome::NotPaired.as_str(), "not_paired");
        assert_eq!(
            RouteOutcome::Delivered {
                partner: ConnectionId::from_u128(1)
            }
            .as_str(),
            "delivered"
        );
    }
}
