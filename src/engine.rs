//! # Shield Engine
//!
//! Wires the pipeline together for one run and exposes the hooks a routing
//! core calls:
//!
//! ```text
//! on_neighbor / on_routing_obligation / on_observed / on_forward_attempt
//!        |
//! decision_cycle: reconcile -> trust -> classify -> defense -> exclude
//!        |
//! finish: terminal reward, final confusion matrix, summary
//! ```
//!
//! Run-wide state (registry, expectations, confusion counters, drop
//! counters) lives in a `RunContext` created with the engine and handed
//! back by `finish`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::attack::{AttackStrategyEngine, DropCause, DroppedStats};
use crate::defense::{AdaptiveDefenseController, DefenseDecision, DefenseInput, DefenseStage};
use crate::detection::{
    Classification, ConfusionMatrix, DetectionEvaluator, DetectionResults, GroundTruthOracle,
};
use crate::registry::TargetNodeRegistry;
use crate::routing::RoutingFabric;
use crate::stats::{DefenseEvent, StatsSink, ThroughputRecord, TrustDump};
use crate::topology::{NodeKinematics, Topology};
use crate::tracker::PacketExpectationTracker;
use crate::trust::mass::format_trust;
use crate::trust::TrustEngine;
use crate::{ForwardDecision, MeshConfig, MeshResult, NodeId, Packet, SimTime};

/// Run-scoped state.
pub struct RunContext {
    pub registry: TargetNodeRegistry,
    pub tracker: PacketExpectationTracker,
    pub results: Arc<DetectionResults>,
    pub dropped: DroppedStats,
}

impl RunContext {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            registry: TargetNodeRegistry::new(config.detection.connection_smoothing),
            tracker: PacketExpectationTracker::new(
                config.detection.reconcile_window_secs,
                config.detection.reconciled_retention_secs,
            ),
            results: Arc::new(DetectionResults::new()),
            dropped: DroppedStats::new(),
        }
    }
}

/// End-of-run report.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub finished_at: SimTime,
    pub confusion: ConfusionMatrix,
    pub dropped: DroppedStats,
    pub excluded: Vec<NodeId>,
    pub final_stage: DefenseStage,
    pub policy_threshold: f64,
    pub cumulative_reward: f64,
    pub tracked_nodes: usize,
}

pub struct ShieldEngine<S: StatsSink> {
    config: MeshConfig,
    ctx: RunContext,
    trust: TrustEngine,
    detector: DetectionEvaluator,
    controller: AdaptiveDefenseController,
    fabric: RoutingFabric,
    attack: AttackStrategyEngine,
    oracle: Box<dyn GroundTruthOracle>,
    sink: S,

    /// Nodes already reported as malicious, so the log says it once.
    flagged: BTreeSet<NodeId>,

    /// Last trust score of nodes that left the topology.
    departed: BTreeMap<NodeId, f64>,
}

impl<S: StatsSink> ShieldEngine<S> {
    /// Validate `config` and set up a run with the fabric it describes.
    pub fn new(config: &MeshConfig, oracle: Box<dyn GroundTruthOracle>, sink: S) -> MeshResult<Self> {
        config.validate()?;
        let fabric = RoutingFabric::from_config(config);
        Self::with_fabric(config, fabric, oracle, sink)
    }

    /// Set up a run over an externally built fabric.
    pub fn with_fabric(
        config: &MeshConfig,
        fabric: RoutingFabric,
        oracle: Box<dyn GroundTruthOracle>,
        sink: S,
    ) -> MeshResult<Self> {
        let attack = AttackStrategyEngine::from_config(&config.attack)?;
        log::info!(
            "[ENGINE] Run setup: strategy {:?} on {:?}, defense ceiling {}",
            attack.strategy().kind(),
            attack.attackers(),
            config.defense.strategy.label(),
        );
        Ok(Self {
            config: config.clone(),
            ctx: RunContext::new(config),
            trust: TrustEngine::new(),
            detector: DetectionEvaluator::new(&config.detection),
            controller: AdaptiveDefenseController::new(&config.defense),
            fabric,
            attack,
            oracle,
            sink,
            flagged: BTreeSet::new(),
            departed: BTreeMap::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Routing hooks
    // -----------------------------------------------------------------------

    /// `observer` currently has `neighbor` as a routing neighbor.
    ///
    /// Tracks the neighbor, folds in the link sample and registers the
    /// observer as a recommender. Returns false if the neighbor may not be
    /// tracked.
    pub fn on_neighbor(&mut self, observer: NodeId, neighbor: NodeId, link_quality: f64) -> bool {
        if self.fabric.slot(neighbor).is_none() {
            self.report_missing_hook(neighbor);
            return false;
        }
        if self.ctx.registry.observe_link(neighbor, link_quality).is_none() {
            return false;
        }
        self.trust
            .register_observer(&mut self.ctx.registry, neighbor, observer);
        true
    }

    /// `node` has been handed `packet` and is expected to pass it on.
    ///
    /// Packets addressed to `node` itself are not obligations.
    pub fn on_routing_obligation(&mut self, node: NodeId, packet: &Packet, now: SimTime) -> bool {
        if packet.destination == node {
            return false;
        }
        if self.fabric.slot(node).is_none() {
            self.report_missing_hook(node);
            return false;
        }
        if self.ctx.registry.is_excluded(node) || self.ctx.registry.is_unaccounted(node) {
            return false;
        }
        self.ctx
            .tracker
            .on_routing_obligation(node, packet.id, packet.ttl, now)
    }

    /// `node` was overheard transmitting `packet`.
    pub fn on_observed(&mut self, node: NodeId, packet: &Packet, now: SimTime) {
        self.ctx.tracker.on_observed(node, packet.id, packet.ttl, now);
    }

    /// Forwarding hook. Passes `native` through unless the holder runs the
    /// attack-augmented variant or has been excluded.
    pub fn on_forward_attempt(
        &mut self,
        packet: &Packet,
        holding_node: NodeId,
        now: SimTime,
        native: ForwardDecision,
    ) -> ForwardDecision {
        let decision = self.fabric.dispatch(
            packet,
            holding_node,
            now,
            native,
            &mut self.attack,
            &mut self.ctx.dropped,
        );
        match decision {
            Some(decision) => decision,
            None => {
                self.report_missing_hook(holding_node);
                native
            }
        }
    }

    /// One relay hop: raise the obligation, ask the forwarding hook and, if
    /// the packet goes out, record the overheard transmission.
    ///
    /// A native `Drop` is booked as a congestion loss.
    pub fn relay(
        &mut self,
        packet: &Packet,
        relay_node: NodeId,
        now: SimTime,
        native: ForwardDecision,
    ) -> ForwardDecision {
        self.on_routing_obligation(relay_node, packet, now);
        if !native.is_forward() {
            self.ctx.dropped.record(relay_node, DropCause::Congestion);
        }
        let decision = self.on_forward_attempt(packet, relay_node, now, native);
        if decision.is_forward() {
            let mut sent = *packet;
            sent.ttl = sent.ttl.saturating_sub(1);
            self.on_observed(relay_node, &sent, now);
        }
        decision
    }

    fn report_missing_hook(&mut self, node: NodeId) {
        if self.ctx.registry.mark_unaccounted(node) {
            self.ctx.tracker.forget(node);
            log::warn!(
                "[ROUTING] Node {} has no routing engine installed, leaving it out of trust accounting",
                node
            );
        }
    }

    // -----------------------------------------------------------------------
    // Decision cycle
    // -----------------------------------------------------------------------

    /// Reconcile expectations, update trust, classify, run the defense
    /// controller and apply its exclusion.
    pub fn decision_cycle(
        &mut self,
        now: SimTime,
        topology: &dyn Topology,
    ) -> MeshResult<DefenseDecision> {
        self.drop_departed(topology);

        for outcome in self.ctx.tracker.reconcile_all(now, &mut self.ctx.registry) {
            self.trust
                .apply_batch(&mut self.ctx.registry, outcome.node, &outcome.outcomes)?;
        }

        let candidates = self.classify();
        let kinematics = self.kinematics(topology);
        let decision = self.controller.cycle(&DefenseInput {
            now,
            active_nodes: self.ctx.registry.len(),
            candidates: &candidates,
            kinematics: &kinematics,
        });

        if let Some(node) = decision.exclude {
            self.exclude_node(node, now);
        }
        self.emit_events(&decision.events);
        Ok(decision)
    }

    /// Withdraw `node` from routing and trust tracking. Idempotent.
    pub fn exclude_node(&mut self, node: NodeId, now: SimTime) -> bool {
        let newly = self.fabric.exclude_node(node, now);
        self.ctx.registry.exclude(node);
        self.ctx.tracker.forget(node);
        newly
    }

    /// Classify every tracked node with enough evidence, ascending id.
    ///
    /// Labeled verdicts are booked into the confusion matrix.
    fn classify(&mut self) -> Vec<Classification> {
        let mut out = Vec::new();
        for node in self.ctx.registry.nodes() {
            if !self.detector.has_enough_evidence(node.forward.total()) {
                continue;
            }
            out.push(self.detector.assess(
                &self.ctx.results,
                self.oracle.as_ref(),
                node.id,
                node.trust.score(),
            ));
        }

        for c in &out {
            if c.verdict.is_malicious() && self.flagged.insert(c.node) {
                let opinion = self
                    .ctx
                    .registry
                    .get(c.node)
                    .map_or_else(String::new, |n| format_trust(&n.trust));
                log::info!("[DETECT] Node {} classified malicious: {}", c.node, opinion);
            }
        }
        out
    }

    /// End-of-episode view: every node still in play, evidence gate or not,
    /// plus the ones that left the topology without being excluded.
    fn terminal_snapshot(&self) -> Vec<Classification> {
        let tracked = self
            .ctx
            .registry
            .nodes()
            .map(|n| (n.id, n.trust.score()));
        let departed = self
            .departed
            .iter()
            .filter(|(id, _)| !self.ctx.registry.contains(**id))
            .map(|(&id, &score)| (id, score));

        let mut out: Vec<Classification> = tracked
            .chain(departed)
            .filter(|(id, _)| !self.ctx.registry.is_excluded(*id))
            .map(|(node, trust_score)| Classification {
                node,
                trust_score,
                verdict: self.detector.evaluate(node, trust_score),
                ground_truth: self.oracle.is_malicious(node),
            })
            .collect();
        out.sort_by_key(|c| c.node);
        out
    }

    fn kinematics(&self, topology: &dyn Topology) -> BTreeMap<NodeId, NodeKinematics> {
        let vantage = self.config.defense.vantage_node;
        self.ctx
            .registry
            .ids()
            .into_iter()
            .chain(std::iter::once(vantage))
            .filter_map(|node| topology.kinematics(node).map(|k| (node, k)))
            .collect()
    }

    /// Forget tracked nodes that are no longer part of the topology.
    fn drop_departed(&mut self, topology: &dyn Topology) {
        let present: BTreeSet<NodeId> = topology.node_ids().into_iter().collect();
        for node in self.ctx.registry.ids() {
            if !present.contains(&node) {
                if let Some(gone) = self.ctx.registry.remove(node) {
                    self.departed.insert(node, gone.trust.score());
                }
                self.ctx.tracker.forget(node);
                log::debug!("[REGISTRY] Node {} left the topology", node);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    /// Current trust state of every tracked node, also sent to the sink.
    pub fn dump_trust(&mut self, now: SimTime) -> Vec<TrustDump> {
        let registry = &self.ctx.registry;
        let dumps: Vec<TrustDump> = registry
            .nodes()
            .filter_map(|n| {
                Some(TrustDump {
                    timestamp: now,
                    node_id: n.id,
                    trust_score: self.trust.trust_score(registry, n.id)?,
                    expected_trust: self.trust.expected_trust(registry, n.id)?,
                    connection_strength: n.connection_strength,
                })
            })
            .collect();
        log_sink_error("trust dump", self.sink.record_trust(&dumps));
        dumps
    }

    pub fn record_throughput(&mut self, record: &ThroughputRecord) {
        log_sink_error("throughput", self.sink.record_throughput(record));
    }

    /// Snapshot the confusion matrix and send it to the sink.
    pub fn record_detection(&mut self, now: SimTime) -> ConfusionMatrix {
        let matrix = self.confusion();
        log_sink_error("detection", self.sink.record_detection(now, &matrix));
        matrix
    }

    fn emit_events(&mut self, events: &[DefenseEvent]) {
        for event in events {
            log_sink_error("defense event", self.sink.record_defense(event));
        }
    }

    /// End the run: terminal reward, final confusion snapshot, flush.
    pub fn finish(mut self, now: SimTime, topology: &dyn Topology) -> (RunSummary, S) {
        let candidates = self.terminal_snapshot();
        let kinematics = self.kinematics(topology);
        if let Some(last) = self.controller.finish(&DefenseInput {
            now,
            active_nodes: self.ctx.registry.len(),
            candidates: &candidates,
            kinematics: &kinematics,
        }) {
            self.emit_events(&last.events);
        }

        let confusion = self.record_detection(now);
        log_sink_error("flush", self.sink.flush());

        let summary = RunSummary {
            finished_at: now,
            confusion,
            dropped: self.ctx.dropped.clone(),
            excluded: self.fabric.excluded().iter().copied().collect(),
            final_stage: self.controller.stage(),
            policy_threshold: self.controller.threshold(),
            cumulative_reward: self.controller.cumulative_reward(),
            tracked_nodes: self.ctx.registry.len(),
        };
        log::info!(
            "[ENGINE] Run finished at t={:.1}s: tp={} tn={} fp={} fn={} excluded={:?}",
            now,
            confusion.tp,
            confusion.tn,
            confusion.fp,
            confusion.fn_,
            summary.excluded,
        );
        (summary, self.sink)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn confusion(&self) -> ConfusionMatrix {
        self.ctx.results.snapshot()
    }

    /// Shared handle on the detection counters.
    pub fn results(&self) -> Arc<DetectionResults> {
        Arc::clone(&self.ctx.results)
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn fabric(&self) -> &RoutingFabric {
        &self.fabric
    }

    pub fn controller(&self) -> &AdaptiveDefenseController {
        &self.controller
    }

    pub fn trust_score(&self, node: NodeId) -> Option<f64> {
        self.trust.trust_score(&self.ctx.registry, node)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }
}

fn log_sink_error(what: &str, result: MeshResult<()>) {
    if let Err(e) = result {
        log::error!("[STATS] Failed to record {}: {}", what, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{AttackerRoster, NoOracle};
    use crate::stats::MemorySink;
    use crate::topology::StaticTopology;
    use crate::{AttackStrategyKind, DefenseStrategy};

    fn line_topology() -> StaticTopology {
        let mut topo = StaticTopology::new();
        for node in 0..4 {
            topo.add_node(node, NodeKinematics::default());
        }
        topo.connect(0, 1);
        topo.connect(1, 2);
        topo.connect(2, 3);
        topo
    }

    fn config(strategy: AttackStrategyKind) -> MeshConfig {
        let mut config = MeshConfig::default();
        config.simulation.n_nodes = 4;
        config.simulation.n_sinks = 1;
        config.attack.strategy = strategy;
        config.attack.attackers = vec![2];
        config.defense.strategy = DefenseStrategy::NoOperation;
        config
    }

    #[test]
    fn test_black_hole_relay_is_flagged() {
        let cfg = config(AttackStrategyKind::PacketDropPerc);
        let roster = AttackerRoster::new(cfg.attack.attackers.clone());
        let mut engine = ShieldEngine::new(&cfg, Box::new(roster), MemorySink::new()).unwrap();
        let topo = line_topology();

        engine.on_neighbor(1, 2, 1.0);
        for id in 0..20u16 {
            let packet = Packet::new(id, 64, 0, 3, 800);
            let decision = engine.relay(&packet, 2, id as f64 * 0.1, ForwardDecision::Forward);
            assert_eq!(decision, ForwardDecision::Drop);
        }
        engine.decision_cycle(10.0, &topo).unwrap();

        assert_eq!(engine.trust_score(2), Some(0.0));
        let m = engine.confusion();
        assert_eq!(m.tp, 1);
        assert_eq!(m.total(), 1);
        assert_eq!(engine.context().dropped.drop_count(2), 20);
    }

    #[test]
    fn test_packets_to_self_are_not_obligations() {
        let cfg = config(AttackStrategyKind::NoOperation);
        let mut engine = ShieldEngine::new(&cfg, Box::new(NoOracle), MemorySink::new()).unwrap();
        let packet = Packet::new(1, 64, 0, 2, 800);
        assert!(!engine.on_routing_obligation(2, &packet, 0.0));
        assert!(engine.on_routing_obligation(1, &packet, 0.0));
    }

    #[test]
    fn test_missing_hook_is_kept_out_of_accounting() {
        let mut cfg = config(AttackStrategyKind::NoOperation);
        cfg.general.unrouted_nodes = vec![1];
        let mut engine = ShieldEngine::new(&cfg, Box::new(NoOracle), MemorySink::new()).unwrap();
        let packet = Packet::new(1, 64, 0, 3, 800);

        assert!(!engine.on_neighbor(0, 1, 1.0));
        assert_eq!(
            engine.on_forward_attempt(&packet, 1, 0.0, ForwardDecision::Forward),
            ForwardDecision::Forward
        );
        assert!(engine.context().registry.is_unaccounted(1));
        assert!(!engine.context().registry.contains(1));
    }

    #[test]
    fn test_exclusion_is_idempotent() {
        let cfg = config(AttackStrategyKind::NoOperation);
        let mut engine = ShieldEngine::new(&cfg, Box::new(NoOracle), MemorySink::new()).unwrap();
        engine.on_neighbor(0, 1, 1.0);
        assert!(engine.exclude_node(1, 1.0));
        let once = engine.fabric().snapshot();
        assert!(!engine.exclude_node(1, 2.0));
        assert_eq!(engine.fabric().snapshot(), once);
        assert!(!engine.on_neighbor(0, 1, 1.0));
    }

    #[test]
    fn test_departed_nodes_are_forgotten() {
        let cfg = config(AttackStrategyKind::NoOperation);
        let mut engine = ShieldEngine::new(&cfg, Box::new(NoOracle), MemorySink::new()).unwrap();
        engine.on_neighbor(0, 1, 1.0);
        let empty = StaticTopology::new();
        engine.decision_cycle(1.0, &empty).unwrap();
        assert!(!engine.context().registry.contains(1));
    }

    #[test]
    fn test_gameover_counts_evaders_below_evidence_gate() {
        let mut cfg = config(AttackStrategyKind::PacketDropPerc);
        cfg.defense.strategy = DefenseStrategy::Training;
        cfg.defense.min_active_nodes = 1;
        cfg.defense.min_monitor_secs = 0.0;
        cfg.defense.training_after_labels = 0;
        let roster = AttackerRoster::new([2, 3]);
        let mut engine = ShieldEngine::new(&cfg, Box::new(roster), MemorySink::new()).unwrap();

        engine.on_neighbor(1, 2, 1.0);
        engine.on_neighbor(2, 3, 1.0);
        for id in 0..6u16 {
            let packet = Packet::new(id, 64, 0, 1, 800);
            engine.relay(&packet, 2, id as f64 * 0.1, ForwardDecision::Forward);
        }

        // Node 3 leaves before the first cycle; node 2 stays under min_evidence.
        let mut shrunk = StaticTopology::new();
        for node in 0..3 {
            shrunk.add_node(node, NodeKinematics::default());
        }
        for now in [10.0, 11.0, 12.0] {
            let decision = engine.decision_cycle(now, &shrunk).unwrap();
            assert!(decision.exclude.is_none());
        }
        assert_eq!(engine.controller().stage(), DefenseStrategy::Training);
        assert_eq!(engine.trust_score(2), Some(0.0));
        assert_eq!(engine.confusion().total(), 0);

        let (summary, sink) = engine.finish(13.0, &shrunk);
        let terminal: Vec<f64> = sink
            .defense
            .iter()
            .filter_map(|e| match e {
                DefenseEvent::Reward {
                    gameover: true,
                    value,
                    ..
                } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(terminal, vec![-2.0]);
        assert_eq!(summary.cumulative_reward, -2.0);
    }

    #[test]
    fn test_finish_returns_summary_and_sink() {
        let cfg = config(AttackStrategyKind::NoOperation);
        let mut engine = ShieldEngine::new(&cfg, Box::new(NoOracle), MemorySink::new()).unwrap();
        engine.on_neighbor(0, 1, 0.5);
        let dumps = engine.dump_trust(1.0);
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].trust_score, 0.5);
        assert_eq!(dumps[0].expected_trust, 0.5);

        let (summary, sink) = engine.finish(2.0, &line_topology());
        assert_eq!(summary.final_stage, DefenseStrategy::NoOperation);
        assert_eq!(sink.trust.len(), 1);
        assert_eq!(sink.detection.len(), 1);
    }
}
