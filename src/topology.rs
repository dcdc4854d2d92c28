//! Collaborator interfaces the core consumes from the host simulator:
//! a topology query and a clock.
//!
//! `StaticTopology` is a fixed adjacency map with positions, enough for
//! tests and for hosts that feed snapshots in by hand.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{NodeId, SimTime};

/// Position (m) and velocity (m/s) of a node in the plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeKinematics {
    pub position: (f64, f64),
    pub velocity: (f64, f64),
}

impl NodeKinematics {
    pub fn new(position: (f64, f64), velocity: (f64, f64)) -> Self {
        Self { position, velocity }
    }

    pub fn speed(&self) -> f64 {
        self.velocity.0.hypot(self.velocity.1)
    }

    pub fn distance_to(&self, other: &NodeKinematics) -> f64 {
        (self.position.0 - other.position.0).hypot(self.position.1 - other.position.1)
    }
}

/// Node/connection query.
pub trait Topology {
    /// All node ids, ascending.
    fn node_ids(&self) -> Vec<NodeId>;

    /// Current radio neighbors of `node`.
    fn neighbors(&self, node: NodeId) -> Vec<NodeId>;

    fn kinematics(&self, node: NodeId) -> Option<NodeKinematics>;

    /// Link quality sample in [0, 1] between two neighbors.
    fn link_quality(&self, a: NodeId, b: NodeId) -> f64 {
        if self.neighbors(a).contains(&b) {
            1.0
        } else {
            0.0
        }
    }
}

/// Source of the current simulated time.
pub trait SimClock {
    fn now(&self) -> SimTime;
}

/// Clock whose time is set by the driver.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<SimTime>,
}

impl ManualClock {
    pub fn new(start: SimTime) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    pub fn set(&self, t: SimTime) {
        self.now.set(t);
    }
}

impl SimClock for ManualClock {
    fn now(&self) -> SimTime {
        self.now.get()
    }
}

/// Fixed undirected adjacency with optional kinematics.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    links: BTreeMap<NodeId, BTreeSet<NodeId>>,
    kinematics: BTreeMap<NodeId, NodeKinematics>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeId, kinematics: NodeKinematics) {
        self.links.entry(node).or_default();
        self.kinematics.insert(node, kinematics);
    }

    pub fn connect(&mut self, a: NodeId, b: NodeId) {
        self.links.entry(a).or_default().insert(b);
        self.links.entry(b).or_default().insert(a);
    }
}

impl Topology for StaticTopology {
    fn node_ids(&self) -> Vec<NodeId> {
        self.links.keys().copied().collect()
    }

    fn neighbors(&self, node: NodeId) -> Vec<NodeId> {
        self.links
            .get(&node)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn kinematics(&self, node: NodeId) -> Option<NodeKinematics> {
        self.kinematics.get(&node).copied()
    }
}
