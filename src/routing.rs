//! # Routing Fabric
//!
//! Which protocol variant each node runs, and which nodes have been
//! withdrawn from routing.
//!
//! A node runs either the base on-demand protocol or the attack-augmented
//! variant that consults the `AttackStrategyEngine` on every data packet.
//! A node that came up without any routing engine has no slot at all.
//!
//! Exclusion is one-way and idempotent. Excluded nodes drop whatever they
//! are handed and are no longer offered as relays.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::attack::{AttackStrategyEngine, DroppedStats};
use crate::{ForwardDecision, MeshConfig, NodeId, Packet, SimTime};

/// Protocol variant installed on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingSlot {
    Base,
    AttackAugmented,
}

/// When a node was withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExclusionRecord {
    pub node: NodeId,
    pub at: SimTime,
}

/// Comparable view of the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricSnapshot {
    pub slots: BTreeMap<NodeId, RoutingSlot>,
    pub excluded: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingFabric {
    slots: BTreeMap<NodeId, RoutingSlot>,
    excluded: BTreeSet<NodeId>,
    history: Vec<ExclusionRecord>,
}

impl RoutingFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install slots for a configured topology: attackers get the augmented
    /// variant, `unrouted_nodes` get nothing, everyone else the base one.
    pub fn from_config(config: &MeshConfig) -> Self {
        let attackers: BTreeSet<NodeId> = config.attack.attackers.iter().copied().collect();
        let unrouted: BTreeSet<NodeId> = config.general.unrouted_nodes.iter().copied().collect();

        let mut fabric = Self::new();
        for node in 0..config.simulation.n_nodes {
            if unrouted.contains(&node) {
                continue;
            }
            let slot = if attackers.contains(&node) {
                RoutingSlot::AttackAugmented
            } else {
                RoutingSlot::Base
            };
            fabric.install(node, slot);
        }
        fabric
    }

    /// Install (or replace) the protocol on a node. Returns the previous slot.
    pub fn install(&mut self, node: NodeId, slot: RoutingSlot) -> Option<RoutingSlot> {
        self.slots.insert(node, slot)
    }

    pub fn slot(&self, node: NodeId) -> Option<RoutingSlot> {
        self.slots.get(&node).copied()
    }

    /// Withdraw `node` from routing. Returns true only the first time.
    pub fn exclude_node(&mut self, node: NodeId, now: SimTime) -> bool {
        if !self.excluded.insert(node) {
            log::debug!("[ROUTING] Node {} already excluded, skipping", node);
            return false;
        }
        self.history.push(ExclusionRecord { node, at: now });
        log::info!("[ROUTING] Node {} withdrawn from routing at t={:.1}s", node, now);
        true
    }

    pub fn is_excluded(&self, node: NodeId) -> bool {
        self.excluded.contains(&node)
    }

    /// Node has a routing engine and has not been withdrawn.
    pub fn can_relay(&self, node: NodeId) -> bool {
        self.slots.contains_key(&node) && !self.excluded.contains(&node)
    }

    /// Per-hop forwarding decision for `holding_node`.
    ///
    /// None means the node has no routing engine installed.
    pub fn dispatch<R: Rng>(
        &self,
        packet: &Packet,
        holding_node: NodeId,
        now: SimTime,
        native: ForwardDecision,
        attack: &mut AttackStrategyEngine<R>,
        dropped: &mut DroppedStats,
    ) -> Option<ForwardDecision> {
        let slot = self.slot(holding_node)?;
        if self.is_excluded(holding_node) {
            return Some(ForwardDecision::Drop);
        }
        let decision = match slot {
            RoutingSlot::Base => native,
            RoutingSlot::AttackAugmented => {
                if native.is_forward() {
                    attack.decide(packet, holding_node, now, dropped)
                } else {
                    native
                }
            }
        };
        Some(decision)
    }

    pub fn excluded(&self) -> &BTreeSet<NodeId> {
        &self.excluded
    }

    pub fn history(&self) -> &[ExclusionRecord] {
        &self.history
    }

    pub fn snapshot(&self) -> FabricSnapshot {
        FabricSnapshot {
            slots: self.slots.clone(),
            excluded: self.excluded.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::AttackStrategy;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn attack_engine() -> AttackStrategyEngine<StdRng> {
        AttackStrategyEngine::with_rng(
            AttackStrategy::PacketDropPerc { p: 1.0 },
            [2].into_iter().collect(),
            StdRng::seed_from_u64(0),
        )
    }

    #[test]
    fn test_from_config_assigns_slots() {
        let mut config = MeshConfig::default();
        config.attack.attackers = vec![3];
        config.general.unrouted_nodes = vec![4];
        let fabric = RoutingFabric::from_config(&config);
        assert_eq!(fabric.slot(0), Some(RoutingSlot::Base));
        assert_eq!(fabric.slot(3), Some(RoutingSlot::AttackAugmented));
        assert_eq!(fabric.slot(4), None);
        assert!(!fabric.can_relay(4));
    }

    #[test]
    fn test_exclude_twice_equals_once() {
        let mut fabric = RoutingFabric::new();
        fabric.install(1, RoutingSlot::Base);
        assert!(fabric.exclude_node(1, 5.0));
        let once = fabric.snapshot();
        assert!(!fabric.exclude_node(1, 6.0));
        assert_eq!(fabric.snapshot(), once);
        assert_eq!(fabric.history().len(), 1);
    }

    #[test]
    fn test_dispatch_by_slot() {
        let mut fabric = RoutingFabric::new();
        fabric.install(1, RoutingSlot::Base);
        fabric.install(2, RoutingSlot::AttackAugmented);
        let mut attack = attack_engine();
        let mut dropped = DroppedStats::new();
        let packet = Packet::new(1, 64, 0, 9, 800);
        let fwd = ForwardDecision::Forward;

        assert_eq!(
            fabric.dispatch(&packet, 1, 0.0, fwd, &mut attack, &mut dropped),
            Some(ForwardDecision::Forward)
        );
        assert_eq!(
            fabric.dispatch(&packet, 2, 0.0, fwd, &mut attack, &mut dropped),
            Some(ForwardDecision::Drop)
        );
        assert_eq!(fabric.dispatch(&packet, 3, 0.0, fwd, &mut attack, &mut dropped), None);

        fabric.exclude_node(1, 1.0);
        assert_eq!(
            fabric.dispatch(&packet, 1, 1.0, fwd, &mut attack, &mut dropped),
            Some(ForwardDecision::Drop)
        );
        assert_eq!(dropped.attack_drops(), 1);
    }
}
