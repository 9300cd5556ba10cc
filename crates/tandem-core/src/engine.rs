//! The pairing engine.
//!
//! Owns the waiting queue and the active pair table. Every operation takes
//! the single state lock for its whole duration, so join, leave and
//! disconnect events racing for the same connection are applied one at a
//! time. Frames are pushed to the registry while the lock is held; pushes
//! never block.

use crate::event::ChatEvent;
use crate::name::{DisplayName, DEFAULT_MAX_NAME_CHARS};
use crate::registry::{ConnectionId, ConnectionRegistry};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tandem_protocol::LeaveReason;
use thiserror::Error;
use tracing::{debug, info};

/// Rejected pairing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PairingError {
    /// The connection is already in the waiting queue.
    #[error("Connection {0} is already waiting for a partner")]
    AlreadyWaiting(ConnectionId),

    /// The connection is already in a chat.
    #[error("Connection {0} is already paired")]
    AlreadyPaired(ConnectionId),
}

/// A broken engine invariant, reported by [`PairingEngine::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("Connection {0} is queued more than once")]
    DuplicateInQueue(ConnectionId),

    #[error("Connection {0} is paired with itself")]
    SelfPaired(ConnectionId),

    #[error("Pair entry for {0} has no matching reverse entry")]
    AsymmetricPair(ConnectionId),

    #[error("Connection {0} is both waiting and paired")]
    WaitingAndPaired(ConnectionId),

    #[error("Connection {0} is tracked without a participant record")]
    MissingRecord(ConnectionId),

    #[error("Participant record for {0} is neither waiting nor paired")]
    OrphanRecord(ConnectionId),
}

/// Result of a successful [`PairingEngine::request_pairing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Matched with the longest-waiting reachable connection.
    Paired { partner: ConnectionId, purged: usize },
    /// Queued.
    Waiting { purged: usize },
}

impl JoinOutcome {
    /// Unreachable queue entries discarded while matching.
    #[must_use]
    pub fn purged(&self) -> usize {
        match self {
            JoinOutcome::Paired { purged, .. } | JoinOutcome::Waiting { purged } => *purged,
        }
    }
}

/// Result of [`PairingEngine::teardown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// A pair was dissolved. `notified` is false if the partner was unreachable.
    Unpaired { partner: ConnectionId, notified: bool },
    /// The connection was removed from the waiting queue.
    Dequeued,
    /// The connection was not tracked; nothing happened.
    Untracked,
}

/// Where a connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    /// Not waiting and not paired.
    Idle,
    /// In the waiting queue.
    Waiting,
    /// In a chat with `partner`.
    Paired { partner: ConnectionId },
}

/// Engine statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Connections in the waiting queue.
    pub waiting: usize,
    /// Connections currently in a chat.
    pub paired: usize,
    /// Number of active chats.
    pub active_pairs: usize,
    /// Unreachable queue entries discarded since start.
    pub lost_matches: u64,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum display name length, in characters.
    pub max_name_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_name_chars: DEFAULT_MAX_NAME_CHARS,
        }
    }
}

#[derive(Debug)]
struct Participant {
    name: DisplayName,
}

/// State guarded by the engine lock.
#[derive(Debug, Default)]
pub(crate) struct PairingState {
    /// One record per waiting or paired connection.
    participants: HashMap<ConnectionId, Participant>,
    waiting: VecDeque<ConnectionId>,
    pairs: HashMap<ConnectionId, ConnectionId>,
    lost_matches: u64,
}

impl PairingState {
    pub(crate) fn partner_of(&self, id: &ConnectionId) -> Option<ConnectionId> {
        self.pairs.get(id).copied()
    }

    pub(crate) fn name_of(&self, id: &ConnectionId) -> Option<&DisplayName> {
        self.participants.get(id).map(|p| &p.name)
    }

    fn status(&self, id: &ConnectionId) -> ParticipantStatus {
        match self.pairs.get(id) {
            Some(partner) => ParticipantStatus::Paired { partner: *partner },
            None if self.participants.contains_key(id) => ParticipantStatus::Waiting,
            None => ParticipantStatus::Idle,
        }
    }

    fn verify(&self) -> Result<(), InvariantViolation> {
        let mut queued = HashSet::with_capacity(self.waiting.len());
        for id in &self.waiting {
            if !queued.insert(*id) {
                return Err(InvariantViolation::DuplicateInQueue(*id));
            }
            if self.pairs.contains_key(id) {
                return Err(InvariantViolation::WaitingAndPaired(*id));
            }
            if !self.participants.contains_key(id) {
                return Err(InvariantViolation::MissingRecord(*id));
            }
        }

        for (id, partner) in &self.pairs {
            if id == partner {
                return Err(InvariantViolation::SelfPaired(*id));
            }
            if self.pairs.get(partner) != Some(id) {
                return Err(InvariantViolation::AsymmetricPair(*id));
            }
            if !self.participants.contains_key(id) {
                return Err(InvariantViolation::MissingRecord(*id));
            }
        }

        for id in self.participants.keys() {
            if !queued.contains(id) && !self.pairs.contains_key(id) {
                return Err(InvariantViolation::OrphanRecord(*id));
            }
        }

        Ok(())
    }
}

/// Matches waiting strangers into pairs and tears pairs down.
pub struct PairingEngine {
    state: Mutex<PairingState>,
    registry: Arc<dyn ConnectionRegistry>,
    config: EngineConfig,
}

impl PairingEngine {
    /// Create an engine with default configuration.
    #[must_use]
    pub fn new(registry: Arc<dyn ConnectionRegistry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    /// Create an engine with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<dyn ConnectionRegistry>, config: EngineConfig) -> Self {
        info!("Creating pairing engine with config: {:?}", config);
        Self {
            state: Mutex::new(PairingState::default()),
            registry,
            config,
        }
    }

    /// Acquire the state lock.
    ///
    /// No code path panics while holding the lock, so a poisoned lock still
    /// guards consistent state.
    pub(crate) fn lock(&self) -> MutexGuard<'_, PairingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn registry(&self) -> &dyn ConnectionRegistry {
        self.registry.as_ref()
    }

    fn emit(&self, id: &ConnectionId, event: ChatEvent) -> bool {
        self.registry.deliver(id, event.into())
    }

    /// Pair `id` with the longest-waiting reachable connection, or queue it.
    ///
    /// Unreachable entries at the head of the queue are discarded along the
    /// way. Emits `paired` to both sides, or `waiting` to the requester.
    ///
    /// # Errors
    ///
    /// Returns an error, without changing any state or emitting anything, if
    /// `id` is already waiting or already paired.
    pub fn request_pairing(
        &self,
        id: ConnectionId,
        name: Option<&str>,
    ) -> Result<JoinOutcome, PairingError> {
        let mut state = self.lock();

        match state.status(&id) {
            ParticipantStatus::Paired { .. } => return Err(PairingError::AlreadyPaired(id)),
            ParticipantStatus::Waiting => return Err(PairingError::AlreadyWaiting(id)),
            ParticipantStatus::Idle => {}
        }

        let name = DisplayName::with_limit(name, self.config.max_name_chars);
        let mut purged = 0;

        while let Some(candidate) = state.waiting.pop_front() {
            if !self.registry.is_reachable(&candidate) {
                state.participants.remove(&candidate);
                state.lost_matches += 1;
                purged += 1;
                debug!(connection = %id, stale = %candidate, "Discarded unreachable queue entry");
                continue;
            }

            let partner_name = state
                .participants
                .get(&candidate)
                .map(|p| p.name.clone())
                .unwrap_or_default();

            state.pairs.insert(id, candidate);
            state.pairs.insert(candidate, id);
            state.participants.insert(id, Participant { name: name.clone() });

            self.emit(
                &id,
                ChatEvent::Paired {
                    your_name: name.clone(),
                    partner_name: partner_name.clone(),
                },
            );
            self.emit(
                &candidate,
                ChatEvent::Paired {
                    your_name: partner_name,
                    partner_name: name,
                },
            );

            debug!(connection = %id, partner = %candidate, purged, "Paired");
            return Ok(JoinOutcome::Paired {
                partner: candidate,
                purged,
            });
        }

        state.waiting.push_back(id);
        state.participants.insert(id, Participant { name });
        self.emit(&id, ChatEvent::Waiting);

        debug!(connection = %id, purged, "Waiting for a partner");
        Ok(JoinOutcome::Waiting { purged })
    }

    /// Remove `id` from the queue or dissolve its pair.
    ///
    /// The partner of a dissolved pair receives `partner_left` with `reason`
    /// if it is reachable; both sides' state is cleared either way. Calling
    /// this for an untracked connection does nothing.
    pub fn teardown(&self, id: &ConnectionId, reason: LeaveReason) -> TeardownOutcome {
        let mut state = self.lock();

        if let Some(partner) = state.pairs.remove(id) {
            state.pairs.remove(&partner);
            state.participants.remove(id);
            state.participants.remove(&partner);

            let notified = self.emit(&partner, ChatEvent::PartnerLeft { reason });
            debug!(connection = %id, partner = %partner, %reason, notified, "Pair dissolved");
            return TeardownOutcome::Unpaired { partner, notified };
        }

        if state.participants.remove(id).is_some() {
            state.waiting.retain(|queued| queued != id);
            debug!(connection = %id, %reason, "Left the waiting queue");
            return TeardownOutcome::Dequeued;
        }

        TeardownOutcome::Untracked
    }

    /// Where `id` currently stands.
    #[must_use]
    pub fn status(&self, id: &ConnectionId) -> ParticipantStatus {
        self.lock().status(id)
    }

    /// Get engine statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let state = self.lock();
        EngineStats {
            waiting: state.waiting.len(),
            paired: state.pairs.len(),
            active_pairs: state.pairs.len() / 2,
            lost_matches: state.lost_matches,
        }
    }

    /// Check every structural invariant of the queue and pair table.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        self.lock().verify()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::{ChannelRegistry, Inbox};
    use tandem_protocol::ServerFrame;

    pub(crate) fn setup() -> (Arc<ChannelRegistry>, PairingEngine) {
        let registry = Arc::new(ChannelRegistry::new());
        let engine = PairingEngine::new(registry.clone());
        (registry, engine)
    }

    pub(crate) fn connect(registry: &ChannelRegistry, n: u128) -> (ConnectionId, Inbox) {
        let id = ConnectionId::from_u128(n);
        let rx = registry.register(id);
        (id, rx)
    }

    pub(crate) fn drain(rx: &mut Inbox) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_first_joiner_waits() {
        let (registry, engine) = setup();
        let (a, mut rx_a) = connect(&registry, 1);

        let outcome = engine.request_pairing(a, Some("Ana")).unwrap();

        assert_eq!(outcome, JoinOutcome::Waiting { purged: 0 });
        assert_eq!(engine.status(&a), ParticipantStatus::Waiting);
        assert_eq!(drain(&mut rx_a), vec![ServerFrame::Waiting]);
        engine.verify().unwrap();
    }

    #[test]
    fn test_fifo_pairing() {
        let (registry, engine) = setup();
        let (a, mut rx_a) = connect(&registry, 1);
        let (b, mut rx_b) = connect(&registry, 2);
        let (c, mut rx_c) = connect(&registry, 3);

        engine.request_pairing(a, Some("Ana")).unwrap();
        let outcome = engine.request_pairing(b, None).unwrap();
        engine.request_pairing(c, Some("Cy")).unwrap();

        assert_eq!(outcome, JoinOutcome::Paired { partner: a, purged: 0 });
        assert_eq!(engine.status(&a), ParticipantStatus::Paired { partner: b });
        assert_eq!(engine.status(&b), ParticipantStatus::Paired { partner: a });
        assert_eq!(engine.status(&c), ParticipantStatus::Waiting);

        assert_eq!(
            drain(&mut rx_a),
            vec![
                ServerFrame::Waiting,
                ServerFrame::Paired {
                    your_name: "Ana".to_string(),
                    partner_name: "Stranger".to_string(),
                },
            ]
        );
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerFrame::Paired {
                your_name: "Stranger".to_string(),
                partner_name: "Ana".to_string(),
            }]
        );
        assert_eq!(drain(&mut rx_c), vec![ServerFrame::Waiting]);

        let stats = engine.stats();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.paired, 2);
        assert_eq!(stats.active_pairs, 1);
        engine.verify().unwrap();
    }

    #[test]
    fn test_lost_match_requeues_requester() {
        let (registry, engine) = setup();
        let (a, _rx_a) = connect(&registry, 1);
        let (b, mut rx_b) = connect(&registry, 2);

        engine.request_pairing(a, None).unwrap();
        // a vanishes without a teardown
        registry.unregister(&a);

        let outcome = engine.request_pairing(b, None).unwrap();

        assert_eq!(outcome, JoinOutcome::Waiting { purged: 1 });
        assert_eq!(engine.status(&a), ParticipantStatus::Idle);
        assert_eq!(engine.status(&b), ParticipantStatus::Waiting);
        assert_eq!(drain(&mut rx_b), vec![ServerFrame::Waiting]);
        assert_eq!(engine.stats().lost_matches, 1);
        engine.verify().unwrap();

        // The next valid requester is matched with b
        let (c, _rx_c) = connect(&registry, 3);
        assert_eq!(
            engine.request_pairing(c, None).unwrap(),
            JoinOutcome::Paired {
                partner: b,
                purged: 0
            }
        );
        engine.verify().unwrap();
    }

    #[test]
    fn test_closed_inbox_counts_as_vanished() {
        let (registry, engine) = setup();
        let (a, rx_a) = connect(&registry, 1);
        let (b, _rx_b) = connect(&registry, 2);

        engine.request_pairing(a, None).unwrap();
        drop(rx_a);

        assert_eq!(
            engine.request_pairing(b, None).unwrap(),
            JoinOutcome::Waiting { purged: 1 }
        );
        engine.verify().unwrap();
    }

    #[test]
    fn test_symmetric_teardown() {
        let (registry, engine) = setup();
        let (a, mut rx_a) = connect(&registry, 1);
        let (b, mut rx_b) = connect(&registry, 2);
        engine.request_pairing(a, None).unwrap();
        engine.request_pairing(b, None).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let outcome = engine.teardown(&a, LeaveReason::Ended);

        assert_eq!(
            outcome,
            TeardownOutcome::Unpaired {
                partner: b,
                notified: true
            }
        );
        assert_eq!(engine.status(&a), ParticipantStatus::Idle);
        assert_eq!(engine.status(&b), ParticipantStatus::Idle);
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerFrame::PartnerLeft {
                reason: LeaveReason::Ended
            }]
        );
        assert!(drain(&mut rx_a).is_empty());

        // Second teardown is a no-op
        assert_eq!(
            engine.teardown(&a, LeaveReason::Disconnected),
            TeardownOutcome::Untracked
        );
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(engine.stats(), EngineStats::default());
        engine.verify().unwrap();
    }

    #[test]
    fn test_teardown_clears_state_when_partner_unreachable() {
        let (registry, engine) = setup();
        let (a, _rx_a) = connect(&registry, 1);
        let (b, _rx_b) = connect(&registry, 2);
        engine.request_pairing(a, None).unwrap();
        engine.request_pairing(b, None).unwrap();
        registry.unregister(&b);

        let outcome = engine.teardown(&a, LeaveReason::Disconnected);

        assert_eq!(
            outcome,
            TeardownOutcome::Unpaired {
                partner: b,
                notified: false
            }
        );
        assert_eq!(engine.status(&b), ParticipantStatus::Idle);
        assert_eq!(engine.teardown(&b, LeaveReason::Disconnected), TeardownOutcome::Untracked);
        engine.verify().unwrap();
    }

    #[test]
    fn test_teardown_waiting_connection() {
        let (registry, engine) = setup();
        let (a, mut rx_a) = connect(&registry, 1);
        engine.request_pairing(a, None).unwrap();
        drain(&mut rx_a);

        assert_eq!(engine.teardown(&a, LeaveReason::Ended), TeardownOutcome::Dequeued);
        assert_eq!(engine.stats().waiting, 0);
        assert!(drain(&mut rx_a).is_empty());

        // A later joiner does not get matched with the cancelled one
        let (b, _rx_b) = connect(&registry, 2);
        assert_eq!(
            engine.request_pairing(b, None).unwrap(),
            JoinOutcome::Waiting { purged: 0 }
        );
        engine.verify().unwrap();
    }

    #[test]
    fn test_teardown_untracked_is_noop() {
        let (registry, engine) = setup();
        let (a, mut rx_a) = connect(&registry, 1);

        assert_eq!(engine.teardown(&a, LeaveReason::Ended), TeardownOutcome::Untracked);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(engine.stats(), EngineStats::default());
    }

    #[test]
    fn test_duplicate_join_rejected() {
        let (registry, engine) = setup();
        let (a, mut rx_a) = connect(&registry, 1);
        let (b, mut rx_b) = connect(&registry, 2);

        engine.request_pairing(a, None).unwrap();
        drain(&mut rx_a);
        assert_eq!(
            engine.request_pairing(a, None),
            Err(PairingError::AlreadyWaiting(a))
        );
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(engine.stats().waiting, 1);

        engine.request_pairing(b, None).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);
        assert_eq!(
            engine.request_pairing(b, Some("again")),
            Err(PairingError::AlreadyPaired(b))
        );
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(engine.status(&b), ParticipantStatus::Paired { partner: a });
        engine.verify().unwrap();
    }

    #[test]
    fn test_survivor_can_join_again() {
        let (registry, engine) = setup();
        let (a, _rx_a) = connect(&registry, 1);
        let (b, _rx_b) = connect(&registry, 2);
        let (c, _rx_c) = connect(&registry, 3);
        engine.request_pairing(a, None).unwrap();
        engine.request_pairing(b, None).unwrap();
        engine.teardown(&a, LeaveReason::Ended);

        engine.request_pairing(b, None).unwrap();
        assert_eq!(
            engine.request_pairing(c, None).unwrap(),
            JoinOutcome::Paired {
                partner: b,
                purged: 0
            }
        );
        engine.verify().unwrap();
    }

    #[test]
    fn test_name_limit_from_config() {
        let registry = Arc::new(ChannelRegistry::new());
        let engine = PairingEngine::with_config(
            registry.clone(),
            EngineConfig { max_name_chars: 3 },
        );
        let (a, _rx_a) = connect(&registry, 1);
        let (b, mut rx_b) = connect(&registry, 2);
        engine.request_pairing(a, Some("Anastasia")).unwrap();
        engine.request_pairing(b, None).unwrap();

        assert_eq!(
            drain(&mut rx_b),
            vec![ServerFrame::Paired {
                your_name: "Stranger".to_string(),
                partner_name: "Ana".to_string(),
            }]
        );
    }

    #[test]
    fn test_concurrent_lifecycles_preserve_invariants() {
        let (registry, engine) = setup();

        std::thread::scope(|scope| {
            for worker in 0..8u128 {
                let registry = &registry;
                let engine = &engine;
                scope.spawn(move || {
                    for round in 0..50u128 {
                        let (id, rx) = connect(registry, worker * 1_000 + round);
                        let _ = engine.request_pairing(id, None);
                        if round % 3 == 0 {
                            // Explicit leave racing with the disconnect below
                            engine.teardown(&id, LeaveReason::Ended);
                        }
                        engine.teardown(&id, LeaveReason::Disconnected);
                        registry.unregister(&id);
                        drop(rx);
                    }
                });
            }
        });

        engine.verify().unwrap();
        let stats = engine.stats();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.paired, 0);
    }
}

#[cfg(test)]
mod proptests {
    use super::tests::{connect, setup};
    use super::*;
    use crate::registry::Inbox;
    use proptest::prelude::*;

    const POOL: u128 = 6;

    #[derive(Debug, Clone)]
    enum Op {
        Join(u128),
        Leave(u128),
        Disconnect(u128),
        Vanish(u128),
        Reconnect(u128),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..POOL).prop_map(Op::Join),
            2 => (0..POOL).prop_map(Op::Leave),
            2 => (0..POOL).prop_map(Op::Disconnect),
            1 => (0..POOL).prop_map(Op::Vanish),
            1 => (0..POOL).prop_map(Op::Reconnect),
        ]
    }

    proptest! {
        #[test]
        fn test_invariants_hold_under_any_sequence(ops in prop::collection::vec(op(), 1..200)) {
            let (registry, engine) = setup();
            let mut inboxes: HashMap<u128, Inbox> = (0..POOL)
                .map(|n| (n, connect(&registry, n).1))
                .collect();
            let mut purged_total = 0u64;

            for op in ops {
                match op {
                    Op::Join(n) => {
                        let id = ConnectionId::from_u128(n);
                        let before = engine.status(&id);
                        let result = engine.request_pairing(id, None);
                        if let Ok(outcome) = &result {
                            purged_total += outcome.purged() as u64;
                        }
                        match before {
                            ParticipantStatus::Idle => prop_assert!(result.is_ok()),
                            ParticipantStatus::Waiting => {
                                prop_assert_eq!(result, Err(PairingError::AlreadyWaiting(id)));
                            }
                            ParticipantStatus::Paired { .. } => {
                                prop_assert_eq!(result, Err(PairingError::AlreadyPaired(id)));
                            }
                        }
                    }
                    Op::Leave(n) => {
                        engine.teardown(&ConnectionId::from_u128(n), LeaveReason::Ended);
                    }
                    Op::Disconnect(n) => {
                        let id = ConnectionId::from_u128(n);
                        engine.teardown(&id, LeaveReason::Disconnected);
                        registry.unregister(&id);
                        inboxes.remove(&n);
                    }
                    Op::Vanish(n) => {
                        registry.unregister(&ConnectionId::from_u128(n));
                        inboxes.remove(&n);
                    }
                    Op::Reconnect(n) => {
                        let id = ConnectionId::from_u128(n);
                        // A fresh session starts clean
                        engine.teardown(&id, LeaveReason::Disconnected);
                        inboxes.insert(n, connect(&registry, n).1);
                    }
                }

                prop_assert_eq!(engine.verify(), Ok(()));

                let stats = engine.stats();
                prop_assert_eq!(stats.paired, stats.active_pairs * 2);
                prop_assert_eq!(stats.lost_matches, purged_total);
                prop_assert!(stats.waiting + stats.paired <= POOL as usize);
            }
        }
    }
}
