//! # Experiment Harness
//!
//! Synthetic stand-in for the network simulator so the pipeline can be
//! driven end to end:
//! - `n_nodes` constant-velocity movers bouncing inside a square area
//! - `n_sinks` constant-rate flows, node `i + n_sinks` sending to node `i`
//! - every packet takes one relay hop through the node that minimizes the
//!   longer of the two hop distances, or is lost when none is in range
//!
//! Each simulated second produces a throughput record and a trust dump;
//! every `decision_interval_secs` the engine runs a decision cycle. The run
//! stops early if the shutdown flag is raised.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::detection::GroundTruthOracle;
use crate::engine::{RunSummary, ShieldEngine};
use crate::stats::{StatsSink, ThroughputRecord};
use crate::topology::{ManualClock, NodeKinematics, SimClock, Topology};
use crate::{ForwardDecision, MeshConfig, MeshResult, NodeId, Packet, PacketId, SimTime, SimulationConfig};

/// Simulation steps per simulated second.
pub const TICKS_PER_SECOND: u32 = 20;

/// Initial TTL of generated data packets.
const DEFAULT_TTL: u8 = 64;

/// Movers in a square with reflecting borders.
#[derive(Debug, Clone)]
pub struct MobileTopology {
    nodes: Vec<NodeKinematics>,
    area: f64,
    range: f64,
}

impl MobileTopology {
    /// Uniform positions, uniform speed in `[0, node_speed]`, uniform heading.
    pub fn random<R: Rng>(config: &SimulationConfig, rng: &mut R) -> Self {
        let nodes = (0..config.n_nodes)
            .map(|_| {
                let position = (
                    rng.gen_range(0.0..=config.area_m),
                    rng.gen_range(0.0..=config.area_m),
                );
                let speed = rng.gen_range(0.0..=config.node_speed);
                let heading = rng.gen_range(0.0..std::f64::consts::TAU);
                NodeKinematics::new(position, (speed * heading.cos(), speed * heading.sin()))
            })
            .collect();
        Self::from_nodes(nodes, config.area_m, config.radio_range_m)
    }

    pub fn from_nodes(nodes: Vec<NodeKinematics>, area: f64, range: f64) -> Self {
        Self { nodes, area, range }
    }

    /// Move everyone by `dt` seconds, reflecting at the borders.
    pub fn advance(&mut self, dt: f64) {
        let area = self.area;
        for node in &mut self.nodes {
            let (x, vx) = reflect(node.position.0 + node.velocity.0 * dt, node.velocity.0, area);
            let (y, vy) = reflect(node.position.1 + node.velocity.1 * dt, node.velocity.1, area);
            node.position = (x, y);
            node.velocity = (vx, vy);
        }
    }

    pub fn distance(&self, a: NodeId, b: NodeId) -> Option<f64> {
        let ka = self.nodes.get(a as usize)?;
        let kb = self.nodes.get(b as usize)?;
        Some(ka.distance_to(kb))
    }

    pub fn range(&self) -> f64 {
        self.range
    }

    /// Relay for `source -> sink` minimizing the longer hop, within range.
    pub fn best_relay(
        &self,
        source: NodeId,
        sink: NodeId,
        usable: impl Fn(NodeId) -> bool,
    ) -> Option<NodeId> {
        let mut best: Option<(NodeId, f64)> = None;
        for relay in 0..self.nodes.len() as NodeId {
            if relay == source || relay == sink || !usable(relay) {
                continue;
            }
            let (Some(d1), Some(d2)) = (self.distance(source, relay), self.distance(relay, sink))
            else {
                continue;
            };
            let worst = d1.max(d2);
            if worst > self.range {
                continue;
            }
            if best.map_or(true, |(_, b)| worst < b) {
                best = Some((relay, worst));
            }
        }
        best.map(|(relay, _)| relay)
    }
}

fn reflect(mut pos: f64, mut vel: f64, area: f64) -> (f64, f64) {
    if pos < 0.0 {
        pos = -pos;
        vel = -vel;
    }
    if pos > area {
        pos = 2.0 * area - pos;
        vel = -vel;
    }
    (pos.clamp(0.0, area), vel)
}

impl Topology for MobileTopology {
    fn node_ids(&self) -> Vec<NodeId> {
        (0..self.nodes.len() as NodeId).collect()
    }

    fn neighbors(&self, node: NodeId) -> Vec<NodeId> {
        self.node_ids()
            .into_iter()
            .filter(|&other| {
                other != node && self.distance(node, other).is_some_and(|d| d <= self.range)
            })
            .collect()
    }

    fn kinematics(&self, node: NodeId) -> Option<NodeKinematics> {
        self.nodes.get(node as usize).copied()
    }

    /// `max(0, 1 - distance / range)`.
    fn link_quality(&self, a: NodeId, b: NodeId) -> f64 {
        match self.distance(a, b) {
            Some(d) if self.range > 0.0 => (1.0 - d / self.range).max(0.0),
            _ => 0.0,
        }
    }
}

/// One constant-rate application flow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Flow {
    pub source: NodeId,
    pub sink: NodeId,
    pub start: SimTime,
    next_send: SimTime,
}

/// Traffic totals of a harness run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub summary: RunSummary,
    pub packets_sent: u64,
    pub packets_delivered: u64,
    pub packets_unroutable: u64,
    pub seconds_run: u32,
    pub interrupted: bool,
}

pub struct Scenario {
    config: MeshConfig,
    clock: ManualClock,
    topology: MobileTopology,
    flows: Vec<Flow>,
    rng: StdRng,
    next_packet: PacketId,
}

impl Scenario {
    pub fn new(config: &MeshConfig) -> MeshResult<Self> {
        config.validate()?;
        let sim = &config.simulation;
        let mut rng = StdRng::seed_from_u64(sim.seed);
        let topology = MobileTopology::random(sim, &mut rng);
        let flows = (0..sim.n_sinks)
            .map(|i| {
                let start = sim.app_start_secs + rng.gen_range(0.0..1.0);
                Flow {
                    source: i + sim.n_sinks,
                    sink: i,
                    start,
                    next_send: start,
                }
            })
            .collect();

        Ok(Self {
            config: config.clone(),
            clock: ManualClock::new(0.0),
            topology,
            flows,
            rng,
            next_packet: 0,
        })
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn topology(&self) -> &MobileTopology {
        &self.topology
    }

    /// Run the scenario end to end, reporting into `sink`.
    pub fn run<S: StatsSink>(
        mut self,
        oracle: Box<dyn GroundTruthOracle>,
        sink: S,
        shutdown: &AtomicBool,
    ) -> MeshResult<(ScenarioOutcome, S)> {
        let mut engine = ShieldEngine::new(&self.config, oracle, sink)?;
        let sim = self.config.simulation.clone();
        let general = self.config.general.clone();

        let dt = 1.0 / TICKS_PER_SECOND as f64;
        let total_ticks = (sim.total_time_secs * TICKS_PER_SECOND as f64).round() as u64;
        let decision_ticks = ((self.config.defense.decision_interval_secs * TICKS_PER_SECOND as f64)
            .round() as u64)
            .max(1);
        let send_interval = if sim.packets_per_second > 0.0 {
            1.0 / sim.packets_per_second
        } else {
            f64::INFINITY
        };

        let mut sent = 0u64;
        let mut delivered = 0u64;
        let mut unroutable = 0u64;
        let mut second_bytes = 0u64;
        let mut second_packets = 0u32;
        let mut seconds_run = 0u32;
        let mut interrupted = false;

        self.refresh_neighbors(&mut engine);

        for tick in 1..=total_ticks {
            self.clock.set(tick as f64 * dt);
            let now = self.clock.now();
            self.topology.advance(dt);

            for f in 0..self.flows.len() {
                while self.flows[f].next_send <= now && self.flows[f].next_send < sim.total_time_secs {
                    let flow = self.flows[f];
                    self.flows[f].next_send += send_interval;
                    sent += 1;
                    match self.send(&mut engine, &flow, now, sim.packet_size_bytes, sim.congestion_drop) {
                        Some(true) => {
                            delivered += 1;
                            second_bytes += sim.packet_size_bytes as u64;
                            second_packets += 1;
                        }
                        Some(false) => {}
                        None => unroutable += 1,
                    }
                }
            }

            if tick % decision_ticks == 0 {
                engine.decision_cycle(now, &self.topology)?;
            }

            if tick % TICKS_PER_SECOND as u64 == 0 {
                seconds_run += 1;
                let record = ThroughputRecord::from_bytes(
                    now,
                    second_bytes,
                    second_packets,
                    sim.n_sinks,
                    &general.protocol_name,
                    general.tx_power_dbm,
                );
                engine.record_throughput(&record);
                engine.dump_trust(now);
                second_bytes = 0;
                second_packets = 0;

                self.refresh_neighbors(&mut engine);

                if shutdown.load(Ordering::SeqCst) {
                    log::warn!("[SCENARIO] Shutdown requested at t={:.0}s, finishing early", now);
                    interrupted = true;
                    break;
                }
            }
        }

        let (summary, sink) = engine.finish(self.clock.now(), &self.topology);
        log::info!(
            "[SCENARIO] {} sent, {} delivered, {} without route",
            sent,
            delivered,
            unroutable,
        );
        Ok((
            ScenarioOutcome {
                summary,
                packets_sent: sent,
                packets_delivered: delivered,
                packets_unroutable: unroutable,
                seconds_run,
                interrupted,
            },
            sink,
        ))
    }

    /// Push current neighbor relations and link samples into the engine.
    fn refresh_neighbors<S: StatsSink>(&self, engine: &mut ShieldEngine<S>) {
        for observer in self.topology.node_ids() {
            for neighbor in self.topology.neighbors(observer) {
                let quality = self.topology.link_quality(observer, neighbor);
                engine.on_neighbor(observer, neighbor, quality);
            }
        }
    }

    /// Send one packet of `flow`. Some(delivered) if a relay was found,
    /// None if there was no route.
    fn send<S: StatsSink>(
        &mut self,
        engine: &mut ShieldEngine<S>,
        flow: &Flow,
        now: SimTime,
        size_bytes: u32,
        congestion_drop: f64,
    ) -> Option<bool> {
        let fabric = engine.fabric();
        let relay = self
            .topology
            .best_relay(flow.source, flow.sink, |n| fabric.can_relay(n))?;

        let packet = Packet::new(self.next_packet, DEFAULT_TTL, flow.source, flow.sink, size_bytes);
        self.next_packet = self.next_packet.wrapping_add(1);

        let native = if congestion_drop > 0.0 && self.rng.gen_bool(congestion_drop) {
            ForwardDecision::Drop
        } else {
            ForwardDecision::Forward
        };
        Some(engine.relay(&packet, relay, now, native).is_forward())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(points: &[(f64, f64)]) -> MobileTopology {
        let nodes = points
            .iter()
            .map(|&p| NodeKinematics::new(p, (0.0, 0.0)))
            .collect();
        MobileTopology::from_nodes(nodes, 100.0, 60.0)
    }

    #[test]
    fn test_best_relay_minimizes_longer_hop() {
        let topo = topology(&[(0.0, 0.0), (100.0, 0.0), (50.0, 0.0), (30.0, 0.0)]);
        assert_eq!(topo.best_relay(0, 1, |_| true), Some(2));
        assert_eq!(topo.best_relay(0, 1, |n| n != 2), None);
    }

    #[test]
    fn test_link_quality_falls_with_distance() {
        let topo = topology(&[(0.0, 0.0), (30.0, 0.0), (90.0, 0.0)]);
        assert!((topo.link_quality(0, 1) - 0.5).abs() < 1e-12);
        assert_eq!(topo.link_quality(0, 2), 0.0);
        assert_eq!(topo.neighbors(0), vec![1]);
    }

    #[test]
    fn test_movers_bounce_off_borders() {
        let nodes = vec![NodeKinematics::new((99.0, 1.0), (4.0, -4.0))];
        let mut topo = MobileTopology::from_nodes(nodes, 100.0, 60.0);
        topo.advance(1.0);
        let k = topo.kinematics(0).unwrap();
        assert_eq!(k.position, (97.0, 3.0));
        assert_eq!(k.velocity, (-4.0, 4.0));
    }

    #[test]
    fn test_flows_pair_sources_with_sinks() {
        let config = MeshConfig::default();
        let scenario = Scenario::new(&config).unwrap();
        let flows = scenario.flows();
        assert_eq!(flows.len(), 5);
        for (i, flow) in flows.iter().enumerate() {
            assert_eq!(flow.sink, i as NodeId);
            assert_eq!(flow.source, i as NodeId + 5);
            assert!(flow.start >= 100.0 && flow.start < 101.0);
        }
    }
}
