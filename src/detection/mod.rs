//! # Detection Evaluator
//!
//! Thresholds trust scores into malicious/benign verdicts and, when a
//! ground-truth label is available, books each verdict into the run-wide
//! confusion matrix.
//!
//! The threshold is a tuning knob rather than a constant: lowering it
//! trades detection latency for fewer false positives.
//!
//! Ground truth comes from a `GroundTruthOracle`. During evaluation and
//! training the oracle knows who the attackers are; in pure inference it
//! knows nothing and recording silently does nothing.

pub mod confusion;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{DetectionConfig, NodeId};
pub use confusion::{ConfusionMatrix, DetectionResults, Outcome};

/// Classification of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Benign,
    Malicious,
}

impl Verdict {
    pub fn is_malicious(self) -> bool {
        self == Verdict::Malicious
    }
}

/// Source of true labels for evaluation.
pub trait GroundTruthOracle {
    /// Some(true) if `node` really is malicious, None if unknown.
    fn is_malicious(&self, node: NodeId) -> Option<bool>;
}

/// Oracle that knows the configured attacker set.
#[derive(Debug, Clone, Default)]
pub struct AttackerRoster {
    attackers: BTreeSet<NodeId>,
}

impl AttackerRoster {
    pub fn new(attackers: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            attackers: attackers.into_iter().collect(),
        }
    }
}

impl GroundTruthOracle for AttackerRoster {
    fn is_malicious(&self, node: NodeId) -> Option<bool> {
        Some(self.attackers.contains(&node))
    }
}

/// Oracle for inference runs: no labels at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOracle;

impl GroundTruthOracle for NoOracle {
    fn is_malicious(&self, _node: NodeId) -> Option<bool> {
        None
    }
}

/// One classified node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub node: NodeId,
    pub trust_score: f64,
    pub verdict: Verdict,

    /// Oracle label, when one was available.
    pub ground_truth: Option<bool>,
}

/// Threshold classifier plus confusion bookkeeping.
#[derive(Debug, Clone)]
pub struct DetectionEvaluator {
    threshold: f64,
    min_evidence: u32,
}

impl DetectionEvaluator {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_evidence: config.min_evidence,
        }
    }

    /// Malicious iff `trust_score < threshold`.
    pub fn classify(_node: NodeId, trust_score: f64, threshold: f64) -> Verdict {
        if trust_score < threshold {
            Verdict::Malicious
        } else {
            Verdict::Benign
        }
    }

    /// Classify with the configured threshold.
    pub fn evaluate(&self, node: NodeId, trust_score: f64) -> Verdict {
        Self::classify(node, trust_score, self.threshold)
    }

    /// Whether `evidence` reconciled observations are enough to classify.
    pub fn has_enough_evidence(&self, evidence: u32) -> bool {
        evidence >= self.min_evidence
    }

    /// Book a verdict against ground truth. Without a label this is a no-op
    /// and returns None.
    pub fn record(
        &self,
        results: &DetectionResults,
        node: NodeId,
        predicted: Verdict,
        ground_truth: Option<bool>,
    ) -> Option<Outcome> {
        let actual = ground_truth?;
        let outcome = Outcome::from_labels(predicted.is_malicious(), actual);
        results.record(outcome);
        if outcome == Outcome::FalsePositive {
            log::debug!("[DETECT] False positive on benign node {}", node);
        }
        Some(outcome)
    }

    /// Classify `node` and record the verdict with whatever the oracle knows.
    pub fn assess(
        &self,
        results: &DetectionResults,
        oracle: &dyn GroundTruthOracle,
        node: NodeId,
        trust_score: f64,
    ) -> Classification {
        let verdict = self.evaluate(node, trust_score);
        let ground_truth = oracle.is_malicious(node);
        self.record(results, node, verdict, ground_truth);
        Classification {
            node,
            trust_score,
            verdict,
            ground_truth,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn min_evidence(&self) -> u32 {
        self.min_evidence
    }
}
