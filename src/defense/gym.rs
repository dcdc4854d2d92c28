//! # Gym Coupling
//!
//! State/action/reward bundle exchanged with the rejection policy once per
//! decision cycle, plus the policy itself.
//!
//! The snapshot is rebuilt from scratch every cycle. Rows are ordered by
//! node id and every per-node vector in `GymStateVariables` has the same
//! length.
//!
//! ## Policy
//!
//! ```text
//! p = sigmoid(gain * (threshold - trust(next_node)))
//! reject next_node  iff  p >= 0.5
//! ```
//!
//! While training, the threshold takes one logistic-regression step toward
//! the oracle label of `next_node`:
//!
//! ```text
//! threshold += learning_rate * gain * (y - p)      clamped to [0, 1]
//! ```

use serde::{Deserialize, Serialize};

use super::kinematics::KinematicFeatures;
use crate::{DefenseConfig, NodeId};

/// Action emitted by the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GymActionVariables {
    /// Rejection propensity for `next_node`; >= 0.5 means exclude.
    pub reject_node: f64,
}

impl GymActionVariables {
    pub fn rejects(&self) -> bool {
        self.reject_node >= 0.5
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GymRewardVariables {
    pub value: f64,

    /// Set on the terminal reward of an episode.
    pub gameover: bool,
}

/// Per-node observation vectors, all of equal length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GymStateVariables {
    pub nodes: Vec<NodeId>,

    /// Trust score per node.
    pub context: Vec<f64>,

    pub current_speed: Vec<f64>,
    pub distance: Vec<f64>,
    pub d_distance: Vec<f64>,

    /// Oracle label per node (None in inference).
    pub ground_truth: Vec<Option<bool>>,

    /// True for the final snapshot of an episode.
    pub episode_over: bool,
}

impl GymStateVariables {
    pub fn push(
        &mut self,
        node: NodeId,
        trust_score: f64,
        features: KinematicFeatures,
        ground_truth: Option<bool>,
    ) {
        self.nodes.push(node);
        self.context.push(trust_score);
        self.current_speed.push(features.current_speed);
        self.distance.push(features.distance);
        self.d_distance.push(features.d_distance);
        self.ground_truth.push(ground_truth);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn index_of(&self, node: NodeId) -> Option<usize> {
        self.nodes.iter().position(|&n| n == node)
    }

    /// Labeled-malicious nodes still present in the snapshot.
    pub fn evaders(&self) -> usize {
        self.ground_truth.iter().filter(|l| **l == Some(true)).count()
    }
}

/// Full per-cycle snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GymVariables {
    /// Node the current reward refers to.
    pub reward_node: Option<NodeId>,

    /// Candidate for rejection: the lowest-trust node in the state.
    pub next_node: Option<NodeId>,

    pub state: GymStateVariables,
    pub reward: GymRewardVariables,
    pub action: GymActionVariables,
}

impl GymVariables {
    /// Wrap a state snapshot and pick the rejection candidate. Ties go to
    /// the lowest id.
    pub fn from_state(state: GymStateVariables) -> Self {
        let next_node = state
            .nodes
            .iter()
            .zip(&state.context)
            .fold(None::<(NodeId, f64)>, |best, (&node, &score)| match best {
                Some((_, best_score)) if best_score <= score => best,
                _ => Some((node, score)),
            })
            .map(|(node, _)| node);

        Self {
            reward_node: None,
            next_node,
            state,
            reward: GymRewardVariables::default(),
            action: GymActionVariables::default(),
        }
    }

    fn candidate(&self) -> Option<(usize, f64, Option<bool>)> {
        let idx = self.state.index_of(self.next_node?)?;
        Some((idx, self.state.context[idx], self.state.ground_truth[idx]))
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Threshold-based rejection policy with a learnable threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectPolicy {
    threshold: f64,
    learning_rate: f64,
    gain: f64,
}

impl RejectPolicy {
    pub fn new(config: &DefenseConfig) -> Self {
        Self {
            threshold: config.initial_threshold.clamp(0.0, 1.0),
            learning_rate: config.learning_rate.max(0.0),
            gain: config.gain,
        }
    }

    /// One policy step over a snapshot.
    ///
    /// Rewards: +1 for rejecting a node labeled malicious, -1 for rejecting
    /// one labeled benign, 0 otherwise. A terminal snapshot yields no action
    /// and -1 per labeled-malicious node that is still present.
    pub fn step(&self, vars: &GymVariables) -> (GymActionVariables, GymRewardVariables) {
        if vars.state.episode_over {
            let reward = GymRewardVariables {
                value: 0.0 - vars.state.evaders() as f64,
                gameover: true,
            };
            return (GymActionVariables::default(), reward);
        }

        let Some((_, trust, label)) = vars.candidate() else {
            return (GymActionVariables::default(), GymRewardVariables::default());
        };

        let action = GymActionVariables {
            reject_node: self.propensity(trust),
        };
        let value = match (action.rejects(), label) {
            (true, Some(true)) => 1.0,
            (true, Some(false)) => -1.0,
            _ => 0.0,
        };
        (
            action,
            GymRewardVariables {
                value,
                gameover: false,
            },
        )
    }

    /// Logistic update of the threshold toward the label of `next_node`.
    ///
    /// Returns the signed threshold change; zero when the candidate carries
    /// no label or the snapshot is terminal.
    pub fn learn(&mut self, vars: &GymVariables) -> f64 {
        if vars.state.episode_over {
            return 0.0;
        }
        let Some((_, trust, Some(label))) = vars.candidate() else {
            return 0.0;
        };
        let y = if label { 1.0 } else { 0.0 };
        let p = self.propensity(trust);
        let before = self.threshold;
        self.threshold =
            (self.threshold + self.learning_rate * self.gain * (y - p)).clamp(0.0, 1.0);
        self.threshold - before
    }

    pub fn propensity(&self, trust_score: f64) -> f64 {
        sigmoid(self.gain * (self.threshold - trust_score))
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MeshConfig;

    fn policy() -> RejectPolicy {
        RejectPolicy::new(&MeshConfig::default().defense)
    }

    fn snapshot(rows: &[(NodeId, f64, Option<bool>)]) -> GymVariables {
        let mut state = GymStateVariables::default();
        for &(node, trust, label) in rows {
            state.push(node, trust, KinematicFeatures::default(), label);
        }
        GymVariables::from_state(state)
    }

    #[test]
    fn test_next_node_is_lowest_trust() {
        let vars = snapshot(&[(1, 0.9, None), (4, 0.1, None), (6, 0.1, None)]);
        assert_eq!(vars.next_node, Some(4));
        assert_eq!(vars.state.len(), 3);
        assert_eq!(vars.state.distance.len(), 3);
    }

    #[test]
    fn test_rejecting_attacker_is_rewarded() {
        let vars = snapshot(&[(1, 0.9, Some(false)), (2, 0.02, Some(true))]);
        let (action, reward) = policy().step(&vars);
        assert!(action.rejects());
        assert_eq!(reward.value, 1.0);
        assert!(!reward.gameover);
    }

    #[test]
    fn test_rejecting_benign_node_is_penalized() {
        let vars = snapshot(&[(1, 0.1, Some(false))]);
        let (action, reward) = policy().step(&vars);
        assert!(action.rejects());
        assert_eq!(reward.value, -1.0);
    }

    #[test]
    fn test_keeping_benign_node_is_neutral() {
        let vars = snapshot(&[(1, 0.9, Some(false))]);
        let (action, reward) = policy().step(&vars);
        assert!(!action.rejects());
        assert_eq!(reward.value, 0.0);
    }

    #[test]
    fn test_gameover_counts_evaders() {
        let mut vars = snapshot(&[(1, 0.9, Some(false)), (2, 0.6, Some(true))]);
        vars.state.episode_over = true;
        let (action, reward) = policy().step(&vars);
        assert_eq!(action.reject_node, 0.0);
        assert!(reward.gameover);
        assert_eq!(reward.value, -1.0);
    }

    #[test]
    fn test_learning_moves_threshold_toward_label() {
        let mut up = policy();
        let attacker = snapshot(&[(2, 0.6, Some(true))]);
        assert!(up.learn(&attacker) > 0.0);
        assert!(up.threshold() > 0.5);

        let mut down = policy();
        let benign = snapshot(&[(1, 0.4, Some(false))]);
        assert!(down.learn(&benign) < 0.0);
        assert!(down.threshold() < 0.5);
    }

    #[test]
    fn test_unlabeled_candidate_does_not_learn() {
        let mut p = policy();
        assert_eq!(p.learn(&snapshot(&[(1, 0.2, None)])), 0.0);
        assert_eq!(p.threshold(), 0.5);
    }

    #[test]
    fn test_empty_state_is_a_no_op() {
        let vars = GymVariables::from_state(GymStateVariables::default());
        assert_eq!(vars.next_node, None);
        let (action, reward) = policy().step(&vars);
        assert!(!action.rejects());
        assert_eq!(reward, GymRewardVariables::default());
    }
}
