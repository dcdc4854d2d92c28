//! # Evidence and Belief Mass
//!
//! Beta evidence pairs and the subjective-logic opinions derived from them.
//!
//! ## Mapping
//!
//! ```text
//! mTrust     = alpha / (alpha + beta + 2)
//! mDistrust  = beta  / (alpha + beta + 2)
//! mUncertain = 2     / (alpha + beta + 2)
//! ```
//!
//! The constant 2 is the weight of the non-informative prior. With no
//! evidence the opinion is pure uncertainty; every observation shifts mass
//! from uncertainty to belief or disbelief.

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Weight of the non-informative prior.
pub const PRIOR_WEIGHT: f64 = 2.0;

/// Trust score reported for a node nobody has evidence about.
pub const NEUTRAL_TRUST: f64 = 0.5;

/// Tolerance of the mass-sum invariant.
pub const MASS_TOLERANCE: f64 = 1e-6;

/// Positive/negative evidence accumulated for one node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustValueEntry {
    pub node: NodeId,

    /// Forwarded observations.
    pub alpha: f64,

    /// Not-forwarded observations.
    pub beta: f64,
}

impl TrustValueEntry {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            alpha: 0.0,
            beta: 0.0,
        }
    }

    pub fn record(&mut self, forwarded: bool) {
        if forwarded {
            self.alpha += 1.0;
        } else {
            self.beta += 1.0;
        }
    }

    pub fn evidence(&self) -> f64 {
        self.alpha + self.beta
    }

    /// Belief mass alpha / (alpha + beta + 2), or the neutral 0.5 when
    /// there is no evidence yet.
    pub fn score(&self) -> f64 {
        if self.evidence() <= 0.0 {
            NEUTRAL_TRUST
        } else {
            self.alpha / (self.evidence() + PRIOR_WEIGHT)
        }
    }

    /// Projected probability (alpha + 1) / (alpha + beta + 2), i.e. the
    /// Beta-distribution mean under a uniform prior.
    pub fn expected(&self) -> f64 {
        (self.alpha + 1.0) / (self.evidence() + PRIOR_WEIGHT)
    }
}

/// A (recommender, subject) opinion triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MassTableEntry {
    pub node_recommended: NodeId,
    pub node_subject: NodeId,
    pub m_trust: f64,
    pub m_distrust: f64,
    pub m_uncertain: f64,
}

impl MassTableEntry {
    /// Fully uncertain opinion.
    pub fn vacuous(node_recommended: NodeId, node_subject: NodeId) -> Self {
        Self {
            node_recommended,
            node_subject,
            m_trust: 0.0,
            m_distrust: 0.0,
            m_uncertain: 1.0,
        }
    }

    /// Opinion implied by an evidence pair.
    pub fn from_evidence(node_recommended: NodeId, evidence: &TrustValueEntry) -> Self {
        let mut entry = Self::vacuous(node_recommended, evidence.node);
        entry.update_from(evidence);
        entry
    }

    /// Recompute the triple from the subject's evidence.
    pub fn update_from(&mut self, evidence: &TrustValueEntry) {
        let alpha = evidence.alpha.max(0.0);
        let beta = evidence.beta.max(0.0);
        let total = alpha + beta + PRIOR_WEIGHT;
        self.m_trust = alpha / total;
        self.m_distrust = beta / total;
        self.m_uncertain = PRIOR_WEIGHT / total;
    }

    pub fn mass_sum(&self) -> f64 {
        self.m_trust + self.m_distrust + self.m_uncertain
    }

    pub fn is_consistent(&self) -> bool {
        let in_unit = |m: f64| (0.0..=1.0).contains(&m);
        in_unit(self.m_trust)
            && in_unit(self.m_distrust)
            && in_unit(self.m_uncertain)
            && (self.mass_sum() - 1.0).abs() <= MASS_TOLERANCE
    }
}

/// Human-readable trust band for logs.
pub fn trust_level_label(score: f64) -> &'static str {
    match score {
        s if s >= 0.8 => "TRUSTED",
        s if s >= 0.5 => "NEUTRAL",
        s if s >= 0.3 => "SUSPECT",
        s if s >= 0.1 => "DISTRUSTED",
        _ => "HOSTILE",
    }
}

/// Compact opinion string, e.g. `"TRUST 0.08 [b:0.08 d:0.75 u:0.17] HOSTILE"`.
pub fn format_trust(evidence: &TrustValueEntry) -> String {
    let entry = MassTableEntry::from_evidence(evidence.node, evidence);
    format!(
        "TRUST {:.2} [b:{:.2} d:{:.2} u:{:.2}] {}",
        evidence.score(),
        entry.m_trust,
        entry.m_distrust,
        entry.m_uncertain,
        trust_level_label(evidence.score()),
    )
}
