//! # Target Node Registry
//!
//! The catalog of nodes currently under trust tracking. Each tracked node
//! owns its forwarding counters, its (alpha, beta) evidence pair and one
//! subjective-logic mass entry per recommender that has observed it. Other
//! components only borrow these records for the duration of a pass.
//!
//! A node enters the registry the first time it shows up as a routing
//! neighbor and leaves it when it is excluded or drops out of the topology.
//! Exclusion is permanent for the run: an excluded node is never re-tracked.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::trust::mass::{MassTableEntry, TrustValueEntry};
use crate::NodeId;

/// Per-node forwarding counters. Both only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTableEntry {
    pub forward_count: u32,
    pub no_forward_count: u32,
}

impl ForwardTableEntry {
    pub fn record(&mut self, forwarded: bool) {
        if forwarded {
            self.forward_count += 1;
        } else {
            self.no_forward_count += 1;
        }
    }

    /// Expectations reconciled so far.
    pub fn total(&self) -> u32 {
        self.forward_count + self.no_forward_count
    }
}

/// Everything the registry knows about one tracked node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedNode {
    pub id: NodeId,

    /// Exponentially smoothed link quality in [0, 1].
    pub connection_strength: f64,

    /// Previous minus current connection strength. Positive means the link
    /// is weakening.
    pub d_connection_strength: f64,

    pub forward: ForwardTableEntry,
    pub trust: TrustValueEntry,

    /// Mass entries keyed by recommender.
    pub masses: BTreeMap<NodeId, MassTableEntry>,
}

impl TrackedNode {
    fn new(id: NodeId, connection_strength: f64) -> Self {
        Self {
            id,
            connection_strength: connection_strength.clamp(0.0, 1.0),
            d_connection_strength: 0.0,
            forward: ForwardTableEntry::default(),
            trust: TrustValueEntry::new(id),
            masses: BTreeMap::new(),
        }
    }
}

/// Registry of tracked nodes.
#[derive(Debug, Clone)]
pub struct TargetNodeRegistry {
    nodes: BTreeMap<NodeId, TrackedNode>,

    /// Nodes withdrawn from routing. Never shrinks within a run.
    excluded: BTreeSet<NodeId>,

    /// Nodes without a routing engine; they stay out of trust accounting.
    unaccounted: BTreeSet<NodeId>,

    /// EMA weight of a fresh connection-strength sample.
    smoothing: f64,
}

impl TargetNodeRegistry {
    pub fn new(smoothing: f64) -> Self {
        Self {
            nodes: BTreeMap::new(),
            excluded: BTreeSet::new(),
            unaccounted: BTreeSet::new(),
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
        }
    }

    /// Start tracking a node that appeared as a routing neighbor.
    ///
    /// Returns true if a new entry was created. Excluded and unaccounted
    /// nodes are refused.
    pub fn track(&mut self, id: NodeId, connection_strength: f64) -> bool {
        if self.excluded.contains(&id) || self.unaccounted.contains(&id) {
            return false;
        }
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, TrackedNode::new(id, connection_strength));
        log::debug!("[REGISTRY] Tracking node {}", id);
        true
    }

    /// Fold a new link-quality sample into the node's connection strength.
    ///
    /// Tracks the node first if needed. Returns the smoothed value, or None
    /// if the node may not be tracked.
    pub fn observe_link(&mut self, id: NodeId, sample: f64) -> Option<f64> {
        let sample = sample.clamp(0.0, 1.0);
        if self.track(id, sample) {
            return Some(sample);
        }
        let alpha = self.smoothing;
        let node = self.nodes.get_mut(&id)?;
        let previous = node.connection_strength;
        let current = alpha * sample + (1.0 - alpha) * previous;
        node.connection_strength = current;
        node.d_connection_strength = previous - current;
        Some(current)
    }

    /// Withdraw a node for the rest of the run.
    ///
    /// Returns true only the first time; re-excluding is a no-op.
    pub fn exclude(&mut self, id: NodeId) -> bool {
        if !self.excluded.insert(id) {
            return false;
        }
        self.nodes.remove(&id);
        for node in self.nodes.values_mut() {
            node.masses.remove(&id);
        }
        true
    }

    /// Forget a node that left the topology. It may be tracked again later.
    pub fn remove(&mut self, id: NodeId) -> Option<TrackedNode> {
        let removed = self.nodes.remove(&id);
        if removed.is_some() {
            for node in self.nodes.values_mut() {
                node.masses.remove(&id);
            }
        }
        removed
    }

    /// Keep a node out of trust accounting because it has no routing engine.
    pub fn mark_unaccounted(&mut self, id: NodeId) -> bool {
        self.nodes.remove(&id);
        self.unaccounted.insert(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&TrackedNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut TrackedNode> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn is_excluded(&self, id: NodeId) -> bool {
        self.excluded.contains(&id)
    }

    pub fn is_unaccounted(&self, id: NodeId) -> bool {
        self.unaccounted.contains(&id)
    }

    /// Tracked node ids in ascending order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TrackedNode> {
        self.nodes.values()
    }

    pub fn excluded(&self) -> &BTreeSet<NodeId> {
        &self.excluded
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_creates_entry_once() {
        let mut registry = TargetNodeRegistry::new(0.5);
        assert!(registry.track(4, 0.8));
        assert!(!registry.track(4, 0.1));
        assert_eq!(registry.get(4).unwrap().connection_strength, 0.8);
    }

    #[test]
    fn test_connection_strength_smoothing_and_trend() {
        let mut registry = TargetNodeRegistry::new(0.5);
        registry.observe_link(1, 1.0);
        let smoothed = registry.observe_link(1, 0.0).unwrap();
        assert!((smoothed - 0.5).abs() < 1e-12);

        let node = registry.get(1).unwrap();
        assert!((node.d_connection_strength - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_exclude_is_idempotent_and_permanent() {
        let mut registry = TargetNodeRegistry::new(0.3);
        registry.track(2, 0.5);
        assert!(registry.exclude(2));
        assert!(!registry.exclude(2));
        assert!(!registry.contains(2));
        assert!(!registry.track(2, 0.5));
        assert!(registry.observe_link(2, 0.9).is_none());
    }

    #[test]
    fn test_removed_node_can_return() {
        let mut registry = TargetNodeRegistry::new(0.3);
        registry.track(5, 0.5);
        assert!(registry.remove(5).is_some());
        assert!(registry.track(5, 0.2));
    }

    #[test]
    fn test_unaccounted_node_is_refused() {
        let mut registry = TargetNodeRegistry::new(0.3);
        registry.track(6, 0.5);
        assert!(registry.mark_unaccounted(6));
        assert!(!registry.contains(6));
        assert!(!registry.track(6, 0.5));
    }

    #[test]
    fn test_forward_table_totals() {
        let mut entry = ForwardTableEntry::default();
        entry.record(true);
        entry.record(false);
        entry.record(false);
        assert_eq!(entry.forward_count, 1);
        assert_eq!(entry.no_forward_count, 2);
        assert_eq!(entry.total(), 3);
    }
}
