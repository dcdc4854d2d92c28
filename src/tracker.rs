//! # Packet Expectation Tracker
//!
//! Compares what a relay was supposed to forward with what its neighbors
//! actually heard it transmit.
//!
//! The routing layer raises an *expectation* whenever it hands a packet to
//! a node that is not the packet's destination. Overheard transmissions are
//! recorded as *detections*. Once an expectation is older than the
//! round-trip timeout it is reconciled: a matching detection counts as
//! forwarded, no detection counts as not forwarded. Each expectation is
//! reconciled exactly once, and detections that nobody expected are simply
//! aged out (forwarding more than required is not penalized).

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::registry::TargetNodeRegistry;
use crate::{NodeId, PacketId, SimTime};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Expectation {
    packet_id: PacketId,
    ttl: u8,
    raised_at: SimTime,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Detection {
    ttl: u8,
    seen_at: SimTime,
}

/// Per-node reconciliation result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub node: NodeId,
    pub forwarded: u32,
    pub not_forwarded: u32,

    /// Expectations dropped because the node is no longer tracked.
    pub discarded: u32,

    /// Forwarded flag per reconciled expectation, in the order raised.
    pub outcomes: Vec<bool>,
}

impl ReconcileOutcome {
    fn empty(node: NodeId) -> Self {
        Self {
            node,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.discarded == 0
    }
}

/// Expected-versus-observed bookkeeping for every relay.
#[derive(Debug, Clone)]
pub struct PacketExpectationTracker {
    /// Pending expectations per node, oldest first.
    expected: BTreeMap<NodeId, VecDeque<Expectation>>,

    /// Overheard transmissions per node.
    detected: HashMap<NodeId, HashMap<PacketId, Detection>>,

    /// Recently reconciled (node, packet) pairs and when they were settled.
    reconciled: HashMap<(NodeId, PacketId), SimTime>,

    window_secs: f64,
    retention_secs: f64,
}

impl PacketExpectationTracker {
    /// `window_secs` is the round-trip timeout; `retention_secs` bounds how
    /// long a reconciled id is remembered.
    pub fn new(window_secs: f64, retention_secs: f64) -> Self {
        Self {
            expected: BTreeMap::new(),
            detected: HashMap::new(),
            reconciled: HashMap::new(),
            window_secs,
            retention_secs: retention_secs.max(window_secs),
        }
    }

    /// Register that `node` is obliged to forward `packet_id`.
    ///
    /// Returns false if the obligation was coalesced with a pending one or
    /// the pair was already reconciled.
    pub fn on_routing_obligation(
        &mut self,
        node: NodeId,
        packet_id: PacketId,
        ttl: u8,
        now: SimTime,
    ) -> bool {
        if self.reconciled.contains_key(&(node, packet_id)) {
            return false;
        }
        let queue = self.expected.entry(node).or_default();
        if queue.iter().any(|e| e.packet_id == packet_id) {
            return false;
        }
        queue.push_back(Expectation {
            packet_id,
            ttl,
            raised_at: now,
        });
        true
    }

    /// Record that `node` was heard transmitting `packet_id`.
    pub fn on_observed(&mut self, node: NodeId, packet_id: PacketId, ttl: u8, now: SimTime) {
        self.detected
            .entry(node)
            .or_default()
            .insert(packet_id, Detection { ttl, seen_at: now });
    }

    /// Reconcile every expectation of `node` older than the window.
    ///
    /// Forward-table counters in the registry are bumped in the same pass.
    pub fn reconcile(
        &mut self,
        node: NodeId,
        now: SimTime,
        registry: &mut TargetNodeRegistry,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::empty(node);
        let cutoff = now - self.window_secs;

        let Some(queue) = self.expected.get_mut(&node) else {
            return outcome;
        };
        let mut detections = self.detected.get_mut(&node);

        while let Some(front) = queue.front() {
            if front.raised_at > cutoff {
                break;
            }
            let expectation = *front;
            queue.pop_front();

            let matched = detections
                .as_deref_mut()
                .and_then(|d| d.remove(&expectation.packet_id))
                .is_some();
            self.reconciled.insert((node, expectation.packet_id), now);

            match registry.get_mut(node) {
                Some(tracked) => {
                    tracked.forward.record(matched);
                    if matched {
                        outcome.forwarded += 1;
                    } else {
                        outcome.not_forwarded += 1;
                    }
                    outcome.outcomes.push(matched);
                }
                None => outcome.discarded += 1,
            }
        }

        if queue.is_empty() {
            self.expected.remove(&node);
        }

        if outcome.not_forwarded > 0 {
            log::debug!(
                "[TRACKER] Node {} forwarded {} / missed {} expected packets",
                node,
                outcome.forwarded,
                outcome.not_forwarded,
            );
        }
        outcome
    }

    /// Reconcile all nodes with pending expectations, in node-id order,
    /// then prune aged bookkeeping.
    pub fn reconcile_all(
        &mut self,
        now: SimTime,
        registry: &mut TargetNodeRegistry,
    ) -> Vec<ReconcileOutcome> {
        let nodes: Vec<NodeId> = self.expected.keys().copied().collect();
        let outcomes = nodes
            .into_iter()
            .map(|node| self.reconcile(node, now, registry))
            .filter(|o| !o.is_empty())
            .collect();
        self.prune(now);
        outcomes
    }

    /// Drop unmatched detections older than the window and reconciled ids
    /// older than the retention horizon.
    pub fn prune(&mut self, now: SimTime) {
        let detection_cutoff = now - self.window_secs;
        // A detection may still match a pending expectation raised before it.
        let oldest_pending: HashMap<NodeId, SimTime> = self
            .expected
            .iter()
            .filter_map(|(node, queue)| queue.front().map(|e| (*node, e.raised_at)))
            .collect();

        self.detected.retain(|node, packets| {
            let keep_from = oldest_pending
                .get(node)
                .map_or(detection_cutoff, |t| t.min(detection_cutoff));
            packets.retain(|_, d| d.seen_at >= keep_from);
            !packets.is_empty()
        });

        let retention_cutoff = now - self.retention_secs;
        self.reconciled.retain(|_, settled| *settled >= retention_cutoff);
    }

    /// Pending expectations for `node`.
    pub fn pending(&self, node: NodeId) -> usize {
        self.expected.get(&node).map_or(0, |q| q.len())
    }

    pub fn total_pending(&self) -> usize {
        self.expected.values().map(|q| q.len()).sum()
    }

    /// TTL recorded with the most recent detection of `packet_id` at `node`.
    pub fn detected_ttl(&self, node: NodeId, packet_id: PacketId) -> Option<u8> {
        self.detected.get(&node)?.get(&packet_id).map(|d| d.ttl)
    }

    /// TTL carried by a pending expectation.
    pub fn expected_ttl(&self, node: NodeId, packet_id: PacketId) -> Option<u8> {
        self.expected
            .get(&node)?
            .iter()
            .find(|e| e.packet_id == packet_id)
            .map(|e| e.ttl)
    }

    /// Forget everything about a node that was excluded or left.
    pub fn forget(&mut self, node: NodeId) {
        self.expected.remove(&node);
        self.detected.remove(&node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn setup() -> (PacketExpectationTracker, TargetNodeRegistry) {
        let mut registry = TargetNodeRegistry::new(0.3);
        registry.track(1, 1.0);
        (PacketExpectationTracker::new(2.0, 10.0), registry)
    }

    #[test]
    fn test_matched_and_unmatched_expectations() {
        let (mut tracker, mut registry) = setup();
        tracker.on_routing_obligation(1, 10, 64, 0.0);
        tracker.on_routing_obligation(1, 11, 64, 0.0);
        tracker.on_observed(1, 10, 63, 0.1);

        let outcome = tracker.reconcile(1, 3.0, &mut registry);
        assert_eq!(outcome.forwarded, 1);
        assert_eq!(outcome.not_forwarded, 1);
        assert_eq!(outcome.outcomes, vec![true, false]);

        let forward = registry.get(1).unwrap().forward;
        assert_eq!(forward.forward_count, 1);
        assert_eq!(forward.no_forward_count, 1);
    }

    #[test]
    fn test_young_expectations_wait_for_the_window() {
        let (mut tracker, mut registry) = setup();
        tracker.on_routing_obligation(1, 10, 64, 2.5);
        let outcome = tracker.reconcile(1, 3.0, &mut registry);
        assert!(outcome.is_empty());
        assert_eq!(tracker.pending(1), 1);
        assert_eq!(tracker.expected_ttl(1, 10), Some(64));
    }

    #[test]
    fn test_reconciling_twice_does_not_double_count() {
        let (mut tracker, mut registry) = setup();
        tracker.on_routing_obligation(1, 10, 64, 0.0);
        tracker.reconcile(1, 3.0, &mut registry);

        // Same id raised again and the pass repeated.
        assert!(!tracker.on_routing_obligation(1, 10, 64, 3.0));
        let second = tracker.reconcile(1, 6.0, &mut registry);
        assert!(second.is_empty());
        assert_eq!(registry.get(1).unwrap().forward.total(), 1);
    }

    #[test]
    fn test_duplicate_pending_obligation_is_coalesced() {
        let (mut tracker, _) = setup();
        assert!(tracker.on_routing_obligation(1, 10, 64, 0.0));
        assert!(!tracker.on_routing_obligation(1, 10, 63, 0.5));
        assert_eq!(tracker.pending(1), 1);
    }

    #[test]
    fn test_untracked_node_expectations_are_discarded() {
        let (mut tracker, mut registry) = setup();
        tracker.on_routing_obligation(1, 10, 64, 0.0);
        registry.exclude(1);
        let outcome = tracker.reconcile(1, 3.0, &mut registry);
        assert_eq!(outcome.discarded, 1);
        assert_eq!(tracker.total_pending(), 0);
    }

    #[test]
    fn test_unexpected_detections_age_out() {
        let (mut tracker, mut registry) = setup();
        tracker.on_observed(1, 77, 60, 0.0);
        assert_eq!(tracker.detected_ttl(1, 77), Some(60));
        tracker.reconcile_all(5.0, &mut registry);
        assert_eq!(tracker.detected_ttl(1, 77), None);
    }

    #[test]
    fn test_reconciled_ids_expire_after_retention() {
        let (mut tracker, mut registry) = setup();
        tracker.on_routing_obligation(1, 10, 64, 0.0);
        tracker.reconcile_all(3.0, &mut registry);
        assert!(!tracker.on_routing_obligation(1, 10, 64, 5.0));
        tracker.prune(20.0);
        assert!(tracker.on_routing_obligation(1, 10, 64, 20.0));
    }

    proptest! {
        /// Counters never decrease and always equal reconciled expectations.
        #[test]
        fn counters_are_monotonic(events in proptest::collection::vec((0u16..32, any::<bool>()), 1..150)) {
            let (mut tracker, mut registry) = setup();
            let mut last = registry.get(1).unwrap().forward;
            let mut reconciled = 0u32;
            for (step, (id, forwarded)) in events.into_iter().enumerate() {
                let now = step as f64 * 0.5;
                tracker.on_routing_obligation(1, id, 64, now);
                if forwarded {
                    tracker.on_observed(1, id, 63, now);
                }
                for outcome in tracker.reconcile_all(now, &mut registry) {
                    reconciled += outcome.outcomes.len() as u32;
                }
                let current = registry.get(1).unwrap().forward;
                prop_assert!(current.forward_count >= last.forward_count);
                prop_assert!(current.no_forward_count >= last.no_forward_count);
                prop_assert_eq!(current.total(), reconciled);
                last = current;
            }
        }
    }
}
