//! # Kinematic Features
//!
//! Per-node movement features fed to the defense policy: current speed,
//! distance from the defending (vantage) node and the change in that
//! distance since the previous update.
//!
//! `d_distance` follows the registry's trend convention: previous minus
//! current, so a positive value means the node is closing in.
//!
//! With velocity gating enabled only nodes moving faster than the floor get
//! fresh features; slow nodes keep whatever was cached for them. Fast
//! movers are the ones whose link situation changes quickly enough to be
//! worth re-sampling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::topology::NodeKinematics;
use crate::NodeId;

/// Features for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KinematicFeatures {
    pub current_speed: f64,
    pub distance: f64,
    pub d_distance: f64,
}

/// Cache of the most recent features per node.
#[derive(Debug, Clone, Default)]
pub struct FeatureCache {
    features: BTreeMap<NodeId, KinematicFeatures>,
    velocity_floor: Option<f64>,
}

impl FeatureCache {
    /// `velocity_floor = Some(v)` enables gating at `v` m/s.
    pub fn new(velocity_floor: Option<f64>) -> Self {
        Self {
            features: BTreeMap::new(),
            velocity_floor,
        }
    }

    /// Refresh one node. Returns false if gating skipped the update.
    pub fn update(
        &mut self,
        node: NodeId,
        kinematics: &NodeKinematics,
        vantage: Option<&NodeKinematics>,
    ) -> bool {
        let speed = kinematics.speed();
        if let Some(floor) = self.velocity_floor {
            if speed <= floor {
                return false;
            }
        }

        let distance = vantage.map_or(0.0, |v| kinematics.distance_to(v));
        let d_distance = self
            .features
            .get(&node)
            .map_or(0.0, |previous| previous.distance - distance);

        self.features.insert(
            node,
            KinematicFeatures {
                current_speed: speed,
                distance,
                d_distance,
            },
        );
        true
    }

    /// Cached features, zeros for a node never sampled.
    pub fn get(&self, node: NodeId) -> KinematicFeatures {
        self.features.get(&node).copied().unwrap_or_default()
    }

    pub fn forget(&mut self, node: NodeId) {
        self.features.remove(&node);
    }
}
