//! # Attack Strategy Engine
//!
//! The adversarial half of the crate. A node running the attack-augmented
//! protocol consults this engine for every data packet it is asked to
//! relay and either forwards it or silently discards it.
//!
//! Strategies range from a plain black hole (`PacketDropPerc` with p = 1)
//! to selective grey holes that only hit one flow, a set of neighbours, a
//! time window or packets matching a field predicate. Nodes that are not
//! flagged as attackers always forward.
//!
//! Every drop is counted in `DroppedStats`. Those counters are for
//! reporting only; the trust pipeline never reads them.

pub mod strategy;

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{AttackConfig, ForwardDecision, MeshResult, NodeId, Packet, SimTime};
pub use strategy::{AttackStrategy, PacketSelector, TimeWindow};

/// Why a packet was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropCause {
    Attack,
    Congestion,
}

/// Per-node drop counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DroppedStats {
    drop_count: BTreeMap<NodeId, u32>,
    attack_drops: u64,
    congestion_drops: u64,
}

impl DroppedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, node: NodeId, cause: DropCause) {
        *self.drop_count.entry(node).or_insert(0) += 1;
        match cause {
            DropCause::Attack => self.attack_drops += 1,
            DropCause::Congestion => self.congestion_drops += 1,
        }
    }

    pub fn drop_count(&self, node: NodeId) -> u32 {
        self.drop_count.get(&node).copied().unwrap_or(0)
    }

    pub fn attack_drops(&self) -> u64 {
        self.attack_drops
    }

    pub fn congestion_drops(&self) -> u64 {
        self.congestion_drops
    }

    pub fn total(&self) -> u64 {
        self.attack_drops + self.congestion_drops
    }

    pub fn per_node(&self) -> &BTreeMap<NodeId, u32> {
        &self.drop_count
    }
}

/// Drop/forward policy for attack-augmented nodes.
pub struct AttackStrategyEngine<R = StdRng> {
    strategy: AttackStrategy,
    attackers: BTreeSet<NodeId>,
    rng: R,
}

impl AttackStrategyEngine<StdRng> {
    /// Build the engine from configuration with a seeded random source.
    pub fn from_config(config: &AttackConfig) -> MeshResult<Self> {
        let strategy = AttackStrategy::from_config(config)?;
        let attackers = config.attackers.iter().copied().collect();
        Ok(Self::with_rng(
            strategy,
            attackers,
            StdRng::seed_from_u64(config.seed),
        ))
    }
}

impl<R: Rng> AttackStrategyEngine<R> {
    pub fn with_rng(strategy: AttackStrategy, attackers: BTreeSet<NodeId>, rng: R) -> Self {
        Self {
            strategy,
            attackers,
            rng,
        }
    }

    /// Decide what `holding_node` does with `packet`.
    ///
    /// Drops are recorded in `dropped` against the holding node.
    pub fn decide(
        &mut self,
        packet: &Packet,
        holding_node: NodeId,
        now: SimTime,
        dropped: &mut DroppedStats,
    ) -> ForwardDecision {
        if !self.is_attacker(holding_node) {
            return ForwardDecision::Forward;
        }

        let drop = match &self.strategy {
            AttackStrategy::PacketDropPerc { p } => {
                // gen_bool panics outside [0, 1]; p was validated at setup.
                *p > 0.0 && self.rng.gen_bool(p.clamp(0.0, 1.0))
            }
            other => other.targets(packet, now),
        };

        if drop {
            dropped.record(holding_node, DropCause::Attack);
            log::debug!(
                "[ATTACK] Node {} dropped packet {} ({} -> {}) under {:?}",
                holding_node,
                packet.id,
                packet.source,
                packet.destination,
                self.strategy.kind(),
            );
            ForwardDecision::Drop
        } else {
            ForwardDecision::Forward
        }
    }

    pub fn is_attacker(&self, node: NodeId) -> bool {
        self.attackers.contains(&node)
    }

    pub fn attackers(&self) -> &BTreeSet<NodeId> {
        &self.attackers
    }

    pub fn strategy(&self) -> &AttackStrategy {
        &self.strategy
    }
}
