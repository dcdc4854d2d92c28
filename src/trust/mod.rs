//! # Trust Engine
//!
//! Turns reconciled forwarding outcomes into evidence and opinions.
//!
//! Every outcome bumps the subject's (alpha, beta) pair and then refreshes
//! the opinion of every recommender that watches the subject. The engine
//! itself holds no per-node state: all records live in the
//! `TargetNodeRegistry` and are only borrowed for the duration of an update.
//!
//! Outcomes for one node must be applied in arrival order. Within a single
//! reconciliation batch the order does not change the result, but batches
//! from different windows are not interchangeable once a node gets
//! excluded between them.

pub mod mass;

use crate::registry::TargetNodeRegistry;
use crate::{MeshError, MeshResult, NodeId};
use mass::{MassTableEntry, TrustValueEntry};

/// Result of a single evidence update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrustUpdate {
    pub node: NodeId,
    pub alpha: f64,
    pub beta: f64,
    pub trust_score: f64,
}

/// Stateless trust engine operating on the registry.
#[derive(Debug, Clone, Default)]
pub struct TrustEngine;

impl TrustEngine {
    pub fn new() -> Self {
        Self
    }

    /// Record one forwarded / not-forwarded outcome for `node`.
    pub fn update(
        &self,
        registry: &mut TargetNodeRegistry,
        node: NodeId,
        forwarded: bool,
    ) -> MeshResult<TrustUpdate> {
        let tracked = registry.get_mut(node).ok_or(MeshError::UnknownNode(node))?;
        tracked.trust.record(forwarded);

        let evidence = tracked.trust;
        for entry in tracked.masses.values_mut() {
            entry.update_from(&evidence);
        }

        Ok(TrustUpdate {
            node,
            alpha: evidence.alpha,
            beta: evidence.beta,
            trust_score: evidence.score(),
        })
    }

    /// Apply a reconciliation batch in order. Returns the last update, or
    /// None for an empty batch.
    pub fn apply_batch(
        &self,
        registry: &mut TargetNodeRegistry,
        node: NodeId,
        outcomes: &[bool],
    ) -> MeshResult<Option<TrustUpdate>> {
        let mut last = None;
        for &forwarded in outcomes {
            last = Some(self.update(registry, node, forwarded)?);
        }
        if let Some(update) = last {
            log::debug!(
                "[TRUST] Node {} after {} outcomes: alpha={} beta={} trust={:.3}",
                node,
                outcomes.len(),
                update.alpha,
                update.beta,
                update.trust_score,
            );
        }
        Ok(last)
    }

    /// Start keeping an opinion of `subject` on behalf of `observer`.
    ///
    /// The entry is seeded from the evidence gathered so far. Returns false
    /// if the pair already existed, the subject is untracked, the observer
    /// is excluded or has no routing engine, or the two are the same node.
    pub fn register_observer(
        &self,
        registry: &mut TargetNodeRegistry,
        subject: NodeId,
        observer: NodeId,
    ) -> bool {
        if subject == observer
            || registry.is_excluded(observer)
            || registry.is_unaccounted(observer)
        {
            return false;
        }
        let Some(tracked) = registry.get_mut(subject) else {
            return false;
        };
        if tracked.masses.contains_key(&observer) {
            return false;
        }
        let entry = MassTableEntry::from_evidence(observer, &tracked.trust);
        tracked.masses.insert(observer, entry);
        true
    }

    /// Belief mass for `node`; 0.5 when there is no evidence yet.
    pub fn trust_score(&self, registry: &TargetNodeRegistry, node: NodeId) -> Option<f64> {
        registry.get(node).map(|n| n.trust.score())
    }

    /// Projected probability for `node`.
    pub fn expected_trust(&self, registry: &TargetNodeRegistry, node: NodeId) -> Option<f64> {
        registry.get(node).map(|n| n.trust.expected())
    }

    pub fn evidence(&self, registry: &TargetNodeRegistry, node: NodeId) -> Option<TrustValueEntry> {
        registry.get(node).map(|n| n.trust)
    }

    /// Opinion held by `observer` about `subject`.
    pub fn opinion(
        &self,
        registry: &TargetNodeRegistry,
        observer: NodeId,
        subject: NodeId,
    ) -> Option<MassTableEntry> {
        registry.get(subject)?.masses.get(&observer).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(nodes: &[NodeId]) -> TargetNodeRegistry {
        let mut registry = TargetNodeRegistry::new(0.3);
        for &n in nodes {
            registry.track(n, 1.0);
        }
        registry
    }

    #[test]
    fn test_update_moves_alpha_and_beta() {
        let engine = TrustEngine::new();
        let mut registry = registry_with(&[1]);
        engine.update(&mut registry, 1, true).unwrap();
        let update = engine.update(&mut registry, 1, false).unwrap();
        assert_eq!(update.alpha, 1.0);
        assert_eq!(update.beta, 1.0);
        assert!((update.trust_score - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_node_is_an_error() {
        let engine = TrustEngine::new();
        let mut registry = registry_with(&[]);
        assert!(matches!(
            engine.update(&mut registry, 9, true),
            Err(MeshError::UnknownNode(9))
        ));
    }

    #[test]
    fn test_all_observer_opinions_refresh() {
        let engine = TrustEngine::new();
        let mut registry = registry_with(&[1, 2, 3]);
        assert!(engine.register_observer(&mut registry, 1, 2));
        assert!(engine.register_observer(&mut registry, 1, 3));
        assert!(!engine.register_observer(&mut registry, 1, 3));
        assert!(!engine.register_observer(&mut registry, 1, 1));

        engine.apply_batch(&mut registry, 1, &[false; 8]).unwrap();

        for observer in [2, 3] {
            let opinion = engine.opinion(&registry, observer, 1).unwrap();
            assert!((opinion.m_distrust - 0.8).abs() < 1e-12);
            assert!(opinion.is_consistent());
        }
    }

    #[test]
    fn test_late_observer_is_seeded_with_existing_evidence() {
        let engine = TrustEngine::new();
        let mut registry = registry_with(&[1, 2]);
        engine.apply_batch(&mut registry, 1, &[true, true]).unwrap();
        engine.register_observer(&mut registry, 1, 2);
        let opinion = engine.opinion(&registry, 2, 1).unwrap();
        assert!((opinion.m_trust - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_black_hole_trust_trends_to_zero() {
        let engine = TrustEngine::new();
        let mut registry = registry_with(&[7]);
        let mut last = engine.trust_score(&registry, 7).unwrap();
        for _ in 0..50 {
            let score = engine.update(&mut registry, 7, false).unwrap().trust_score;
            assert!(score <= last);
            last = score;
        }
        assert_eq!(last, 0.0);
        assert_eq!(engine.evidence(&registry, 7).unwrap().alpha, 0.0);
        assert!(engine.expected_trust(&registry, 7).unwrap() < 0.05);
    }

    #[test]
    fn test_observer_without_routing_engine_is_refused() {
        let engine = TrustEngine::new();
        let mut registry = registry_with(&[1, 2]);
        registry.mark_unaccounted(4);
        assert!(!engine.register_observer(&mut registry, 1, 4));
        assert!(engine.opinion(&registry, 4, 1).is_none());

        registry.exclude(2);
        assert!(!engine.register_observer(&mut registry, 1, 2));
    }
}
