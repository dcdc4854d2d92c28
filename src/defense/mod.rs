//! # Adaptive Defense Controller
//!
//! Staged state machine that turns detection output into exclusions.
//!
//! ```text
//! NO_OPERATION -> MONITOR_ALWAYS | MONITOR_WHEN_VELOCITY -> TRAINING -> INFERENCE
//! ```
//!
//! Stages only move forward, at most one step per decision cycle, and never
//! past the configured `defense.strategy`. The triggers are:
//! - leave NO_OPERATION once enough nodes are tracked and the monitor start
//!   time has passed
//! - leave monitoring once enough labeled classifications have been seen
//!   and the minimum monitoring time has elapsed
//! - leave TRAINING once the learned threshold has settled, or after a hard
//!   cap on training cycles
//!
//! Monitoring only refreshes the gym state. Training and inference run the
//! `RejectPolicy` on the lowest-trust candidate and ask for its exclusion
//! when the rejection propensity reaches 0.5; only training updates the
//! policy threshold.

pub mod gym;
pub mod kinematics;

use std::collections::{BTreeMap, VecDeque};

use crate::detection::Classification;
use crate::stats::DefenseEvent;
use crate::topology::NodeKinematics;
use crate::{DefenseConfig, DefenseStrategy, NodeId, SimTime};
use gym::{GymStateVariables, GymVariables, RejectPolicy};
use kinematics::FeatureCache;

/// Stage of the controller. Same vocabulary as the configured ceiling.
pub type DefenseStage = DefenseStrategy;

impl DefenseStrategy {
    /// Position in the stage order. Both monitor variants share a rank.
    pub fn rank(self) -> u8 {
        match self {
            DefenseStrategy::NoOperation => 0,
            DefenseStrategy::MonitorAlways | DefenseStrategy::MonitorWhenVelocity => 1,
            DefenseStrategy::Training => 2,
            DefenseStrategy::Inference => 3,
        }
    }

    pub fn is_monitoring(self) -> bool {
        self.rank() == 1
    }

    pub fn label(self) -> &'static str {
        match self {
            DefenseStrategy::NoOperation => "NO_OPERATION",
            DefenseStrategy::MonitorAlways => "MONITOR_ALWAYS",
            DefenseStrategy::MonitorWhenVelocity => "MONITOR_WHEN_VELOCITY",
            DefenseStrategy::Training => "TRAINING",
            DefenseStrategy::Inference => "INFERENCE",
        }
    }
}

/// What the controller sees in one decision cycle.
#[derive(Debug, Clone, Copy)]
pub struct DefenseInput<'a> {
    pub now: SimTime,

    /// Nodes currently under trust tracking.
    pub active_nodes: usize,

    /// Nodes classified this cycle, ascending id.
    pub candidates: &'a [Classification],

    pub kinematics: &'a BTreeMap<NodeId, NodeKinematics>,
}

/// Result of one decision cycle.
#[derive(Debug, Clone, Default)]
pub struct DefenseDecision {
    /// Node the routing core should withdraw.
    pub exclude: Option<NodeId>,

    /// Snapshot handed to the policy; None while idle.
    pub gym: Option<GymVariables>,

    pub events: Vec<DefenseEvent>,
}

pub struct AdaptiveDefenseController {
    config: DefenseConfig,
    stage: DefenseStage,
    ceiling: DefenseStage,
    monitor_stage: DefenseStage,
    stage_entered_at: SimTime,
    cycles_in_stage: u64,
    labeled_seen: u64,
    policy: RejectPolicy,
    features: FeatureCache,
    threshold_history: VecDeque<f64>,
    cumulative_reward: f64,
    finished: bool,
}

impl AdaptiveDefenseController {
    pub fn new(config: &DefenseConfig) -> Self {
        let gated =
            config.velocity_gated || config.strategy == DefenseStrategy::MonitorWhenVelocity;
        let monitor_stage = if gated {
            DefenseStrategy::MonitorWhenVelocity
        } else {
            DefenseStrategy::MonitorAlways
        };

        Self {
            config: config.clone(),
            stage: DefenseStrategy::NoOperation,
            ceiling: config.strategy,
            monitor_stage,
            stage_entered_at: 0.0,
            cycles_in_stage: 0,
            labeled_seen: 0,
            policy: RejectPolicy::new(config),
            features: FeatureCache::new(gated.then_some(config.velocity_floor)),
            threshold_history: VecDeque::new(),
            cumulative_reward: 0.0,
            finished: false,
        }
    }

    /// Run one decision cycle.
    pub fn cycle(&mut self, input: &DefenseInput) -> DefenseDecision {
        let mut decision = DefenseDecision::default();
        if self.finished {
            return decision;
        }

        self.labeled_seen += input
            .candidates
            .iter()
            .filter(|c| c.ground_truth.is_some())
            .count() as u64;

        if let Some(event) = self.advance(input) {
            decision.events.push(event);
        }
        self.cycles_in_stage += 1;

        if self.stage == DefenseStrategy::NoOperation {
            return decision;
        }

        let mut gym = self.observe(input, false);

        if self.stage.rank() >= DefenseStrategy::Training.rank() {
            let (action, reward) = self.policy.step(&gym);
            gym.action = action;
            gym.reward = reward;

            if self.stage == DefenseStrategy::Training {
                gym.reward_node = gym.next_node;
                self.cumulative_reward += reward.value;
                self.policy.learn(&gym);
                self.push_threshold();
                if gym.reward_node.is_some() {
                    decision.events.push(DefenseEvent::Reward {
                        timestamp: input.now,
                        node: gym.reward_node,
                        value: reward.value,
                        gameover: false,
                        threshold: self.policy.threshold(),
                    });
                }
            }

            if action.rejects() {
                if let Some(node) = gym.next_node {
                    let trust_score = gym
                        .state
                        .index_of(node)
                        .map_or(0.0, |i| gym.state.context[i]);
                    log::warn!(
                        "[DEFENSE] {} rejects node {} (trust {:.3}, p={:.3})",
                        self.stage.label(),
                        node,
                        trust_score,
                        action.reject_node,
                    );
                    self.features.forget(node);
                    decision.exclude = Some(node);
                    decision.events.push(DefenseEvent::Exclusion {
                        timestamp: input.now,
                        node,
                        trust_score,
                        reject_node: action.reject_node,
                        stage: self.stage,
                    });
                }
            }
        }

        decision.gym = Some(gym);
        decision
    }

    /// Close the episode. Emits the terminal reward once, and only when the
    /// controller got as far as training.
    pub fn finish(&mut self, input: &DefenseInput) -> Option<DefenseDecision> {
        if self.finished {
            return None;
        }
        self.finished = true;
        if self.stage.rank() < DefenseStrategy::Training.rank() {
            return None;
        }

        let mut gym = self.observe(input, true);
        let (action, reward) = self.policy.step(&gym);
        gym.action = action;
        gym.reward = reward;
        self.cumulative_reward += reward.value;

        if reward.value < 0.0 {
            log::warn!(
                "[DEFENSE] Episode over with {} malicious node(s) never excluded",
                gym.state.evaders(),
            );
        }

        let event = DefenseEvent::Reward {
            timestamp: input.now,
            node: None,
            value: reward.value,
            gameover: true,
            threshold: self.policy.threshold(),
        };
        Some(DefenseDecision {
            exclude: None,
            gym: Some(gym),
            events: vec![event],
        })
    }

    fn observe(&mut self, input: &DefenseInput, episode_over: bool) -> GymVariables {
        let vantage = input.kinematics.get(&self.config.vantage_node).copied();
        let mut state = GymStateVariables {
            episode_over,
            ..Default::default()
        };
        for c in input.candidates {
            if let Some(k) = input.kinematics.get(&c.node) {
                self.features.update(c.node, k, vantage.as_ref());
            }
            state.push(c.node, c.trust_score, self.features.get(c.node), c.ground_truth);
        }
        GymVariables::from_state(state)
    }

    /// Take at most one forward step. Returns the transition event, if any.
    fn advance(&mut self, input: &DefenseInput) -> Option<DefenseEvent> {
        let next = match self.stage {
            DefenseStrategy::NoOperation => {
                let ready = input.active_nodes >= self.config.min_active_nodes
                    && input.now >= self.config.monitor_after_secs;
                ready.then_some(self.monitor_stage)
            }
            DefenseStrategy::MonitorAlways | DefenseStrategy::MonitorWhenVelocity => {
                let ready = self.labeled_seen >= self.config.training_after_labels
                    && input.now - self.stage_entered_at >= self.config.min_monitor_secs;
                ready.then_some(DefenseStrategy::Training)
            }
            DefenseStrategy::Training => {
                let settled =
                    self.cycles_in_stage >= self.config.training_cycles && self.threshold_settled();
                let capped = self.cycles_in_stage >= self.config.max_training_cycles;
                (settled || capped).then_some(DefenseStrategy::Inference)
            }
            DefenseStrategy::Inference => None,
        }?;

        if next.rank() > self.ceiling.rank() {
            return None;
        }

        let from = self.stage;
        self.stage = next;
        self.stage_entered_at = input.now;
        self.cycles_in_stage = 0;
        log::info!(
            "[DEFENSE] Stage {} -> {} at t={:.1}s (threshold {:.3})",
            from.label(),
            next.label(),
            input.now,
            self.policy.threshold(),
        );
        Some(DefenseEvent::StageTransition {
            timestamp: input.now,
            from,
            to: next,
        })
    }

    fn push_threshold(&mut self) {
        self.threshold_history.push_back(self.policy.threshold());
        while self.threshold_history.len() > self.config.stability_window + 1 {
            self.threshold_history.pop_front();
        }
    }

    /// Threshold spread over the last `stability_window` updates is below
    /// epsilon.
    fn threshold_settled(&self) -> bool {
        if self.threshold_history.len() <= self.config.stability_window {
            return false;
        }
        let (lo, hi) = self
            .threshold_history
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &t| {
                (lo.min(t), hi.max(t))
            });
        hi - lo < self.config.stability_epsilon
    }

    pub fn stage(&self) -> DefenseStage {
        self.stage
    }

    pub fn ceiling(&self) -> DefenseStage {
        self.ceiling
    }

    pub fn threshold(&self) -> f64 {
        self.policy.threshold()
    }

    pub fn cumulative_reward(&self) -> f64 {
        self.cumulative_reward
    }

    pub fn labeled_seen(&self) -> u64 {
        self.labeled_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Verdict;
    use crate::MeshConfig;

    fn config() -> DefenseConfig {
        let mut config = MeshConfig::default().defense;
        config.min_active_nodes = 1;
        config.monitor_after_secs = 0.0;
        config.min_monitor_secs = 2.0;
        config.training_after_labels = 2;
        config.training_cycles = 3;
        config.max_training_cycles = 6;
        config
    }

    fn class(node: NodeId, trust: f64, label: Option<bool>) -> Classification {
        Classification {
            node,
            trust_score: trust,
            verdict: if trust < 0.3 {
                Verdict::Malicious
            } else {
                Verdict::Benign
            },
            ground_truth: label,
        }
    }

    fn run_cycle(
        ctrl: &mut AdaptiveDefenseController,
        now: SimTime,
        candidates: &[Classification],
    ) -> DefenseDecision {
        let kinematics = BTreeMap::new();
        ctrl.cycle(&DefenseInput {
            now,
            active_nodes: candidates.len(),
            candidates,
            kinematics: &kinematics,
        })
    }

    #[test]
    fn test_stages_advance_in_order() {
        let mut ctrl = AdaptiveDefenseController::new(&config());
        let benign = [class(1, 0.95, Some(false)), class(2, 0.9, Some(false))];
        let mut seen = vec![ctrl.stage()];
        for step in 0..40 {
            run_cycle(&mut ctrl, step as f64, &benign);
            if *seen.last().unwrap() != ctrl.stage() {
                seen.push(ctrl.stage());
            }
        }
        assert_eq!(
            seen,
            vec![
                DefenseStrategy::NoOperation,
                DefenseStrategy::MonitorAlways,
                DefenseStrategy::Training,
                DefenseStrategy::Inference,
            ]
        );
    }

    #[test]
    fn test_ceiling_caps_progress() {
        let mut cfg = config();
        cfg.strategy = DefenseStrategy::MonitorAlways;
        let mut ctrl = AdaptiveDefenseController::new(&cfg);
        let attacker = [class(4, 0.0, Some(true))];
        for step in 0..30 {
            let decision = run_cycle(&mut ctrl, step as f64, &attacker);
            assert!(decision.exclude.is_none());
        }
        assert_eq!(ctrl.stage(), DefenseStrategy::MonitorAlways);
    }

    #[test]
    fn test_no_operation_ceiling_stays_idle() {
        let mut cfg = config();
        cfg.strategy = DefenseStrategy::NoOperation;
        let mut ctrl = AdaptiveDefenseController::new(&cfg);
        let decision = run_cycle(&mut ctrl, 5.0, &[class(1, 0.1, None)]);
        assert!(decision.gym.is_none());
        assert_eq!(ctrl.stage(), DefenseStrategy::NoOperation);
    }

    #[test]
    fn test_velocity_gating_selects_monitor_variant() {
        let mut cfg = config();
        cfg.velocity_gated = true;
        let mut ctrl = AdaptiveDefenseController::new(&cfg);
        run_cycle(&mut ctrl, 0.0, &[class(1, 0.9, None)]);
        assert_eq!(ctrl.stage(), DefenseStrategy::MonitorWhenVelocity);
    }

    #[test]
    fn test_training_excludes_attacker_with_positive_reward() {
        let mut ctrl = AdaptiveDefenseController::new(&config());
        let nodes = [class(1, 0.9, Some(false)), class(4, 0.02, Some(true))];
        let mut excluded = None;
        for step in 0..10 {
            let decision = run_cycle(&mut ctrl, step as f64, &nodes);
            if let Some(node) = decision.exclude {
                excluded = Some((node, ctrl.stage()));
                break;
            }
        }
        assert_eq!(excluded, Some((4, DefenseStrategy::Training)));
        assert!(ctrl.cumulative_reward() > 0.0);
    }

    #[test]
    fn test_monitor_never_excludes() {
        let mut cfg = config();
        cfg.training_after_labels = u64::MAX;
        let mut ctrl = AdaptiveDefenseController::new(&cfg);
        for step in 0..20 {
            let decision = run_cycle(&mut ctrl, step as f64, &[class(4, 0.0, Some(true))]);
            assert!(decision.exclude.is_none());
            if step > 0 {
                assert!(decision.gym.is_some());
            }
        }
    }

    #[test]
    fn test_finish_reports_evaders_once() {
        let mut ctrl = AdaptiveDefenseController::new(&config());
        let nodes = [class(1, 0.9, Some(false))];
        for step in 0..4 {
            run_cycle(&mut ctrl, step as f64, &nodes);
        }
        assert_eq!(ctrl.stage(), DefenseStrategy::Training);

        let evader = [class(1, 0.9, Some(false)), class(5, 0.8, Some(true))];
        let kinematics = BTreeMap::new();
        let input = DefenseInput {
            now: 10.0,
            active_nodes: 2,
            candidates: &evader,
            kinematics: &kinematics,
        };
        let last = ctrl.finish(&input).unwrap();
        let gym = last.gym.unwrap();
        assert!(gym.reward.gameover);
        assert_eq!(gym.reward.value, -1.0);
        assert!(ctrl.finish(&input).is_none());
    }

    #[test]
    fn test_finish_before_training_is_silent() {
        let mut ctrl = AdaptiveDefenseController::new(&config());
        let kinematics = BTreeMap::new();
        let input = DefenseInput {
            now: 0.0,
            active_nodes: 0,
            candidates: &[],
            kinematics: &kinematics,
        };
        assert!(ctrl.finish(&input).is_none());
    }
}
