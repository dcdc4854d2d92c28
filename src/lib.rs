//! # SENTINEL MANET - Core Library
//!
//! Grey-hole attack model and trust-based defense for AODV-style ad-hoc
//! networks.
//!
//! The crate instruments an on-demand routing engine with two things:
//! a misbehavior module that selectively drops data packets at a relay
//! (`attack`), and a trust pipeline that watches who forwards what, scores
//! every neighbor with a subjective-logic opinion, classifies nodes and
//! finally withdraws the worst offender from the routing fabric.
//!
//! ## Pipeline
//! ```text
//! routing hook -> tracker -> trust -> detection -> defense -> exclusion
//!                                                        \-> stats sink
//! ```
//!
//! Route discovery, radio propagation and mobility belong to the host
//! simulator. The `scenario` module carries a small synthetic harness so the
//! pipeline can be exercised end to end without one.

pub mod attack;
pub mod defense;
pub mod detection;
pub mod engine;
pub mod registry;
pub mod routing;
pub mod scenario;
pub mod stats;
pub mod topology;
pub mod tracker;
pub mod trust;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Unified error type for SENTINEL MANET.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Node {0} is not under trust tracking")]
    UnknownNode(NodeId),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Statistics sink error: {0}")]
    Stats(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

pub type MeshResult<T> = Result<T, MeshError>;

// ---------------------------------------------------------------------------
// Core Types
// ---------------------------------------------------------------------------

/// Node identifier as handed out by the host simulator.
pub type NodeId = u32;

/// Sequence-like packet identifier (wraps at 65535).
pub type PacketId = u16;

/// Simulated time in seconds.
pub type SimTime = f64;

/// A data packet as seen by the forwarding hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub id: PacketId,

    /// Remaining time-to-live.
    pub ttl: u8,

    pub source: NodeId,
    pub destination: NodeId,
    pub size_bytes: u32,
}

impl Packet {
    pub fn new(id: PacketId, ttl: u8, source: NodeId, destination: NodeId, size_bytes: u32) -> Self {
        Self {
            id,
            ttl,
            source,
            destination,
            size_bytes,
        }
    }

    /// True if the packet touches `node` as either endpoint.
    pub fn involves(&self, node: NodeId) -> bool {
        self.source == node || self.destination == node
    }
}

/// Outcome of a per-hop forwarding decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardDecision {
    Forward,
    Drop,
}

impl ForwardDecision {
    pub fn is_forward(self) -> bool {
        self == ForwardDecision::Forward
    }
}

/// Misbehavior strategies an attack-augmented node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttackStrategyKind {
    NoOperation,
    PacketDropPerc,
    PacketDropConnection,
    PacketDropNeighbours,
    PacketDropInTime,
    PacketDropSelect,
}

impl AttackStrategyKind {
    /// Map the legacy numeric strategy attribute (0-5) onto a strategy.
    pub fn from_code(code: u32) -> MeshResult<Self> {
        match code {
            0 => Ok(Self::NoOperation),
            1 => Ok(Self::PacketDropPerc),
            2 => Ok(Self::PacketDropConnection),
            3 => Ok(Self::PacketDropNeighbours),
            4 => Ok(Self::PacketDropInTime),
            5 => Ok(Self::PacketDropSelect),
            other => Err(MeshError::Config(format!(
                "unknown attack strategy code {}",
                other
            ))),
        }
    }
}

/// Defense stages. Also used as the configured ceiling for the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefenseStrategy {
    NoOperation,
    MonitorAlways,
    MonitorWhenVelocity,
    Training,
    Inference,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Top-level configuration.
///
/// Loaded from `sentinel-manet.toml` or a path supplied via CLI flag. The
/// whole structure is immutable once a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub general: GeneralConfig,
    pub simulation: SimulationConfig,
    pub attack: AttackConfig,
    pub detection: DetectionConfig,
    pub defense: DefenseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Routing engine being instrumented. Only "AODV" is supported.
    pub protocol_name: String,

    /// Transmit power in dBm, reported in the throughput CSV.
    pub tx_power_dbm: f64,

    /// Directory receiving the CSV and JSONL outputs.
    pub output_dir: PathBuf,

    /// File name of the throughput CSV inside `output_dir`.
    pub csv_file_name: String,

    /// Nodes that come up without a routing engine installed.
    #[serde(default)]
    pub unrouted_nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub n_nodes: u32,

    /// Number of sink nodes; node `i + n_sinks` streams to node `i`.
    pub n_sinks: u32,

    pub total_time_secs: f64,

    /// Side of the square deployment area in meters.
    pub area_m: f64,

    /// Upper bound of the uniform node speed in m/s.
    pub node_speed: f64,

    /// Radio range in meters used to pick relays.
    pub radio_range_m: f64,

    pub packet_size_bytes: u32,
    pub packets_per_second: f64,

    /// Applications start uniformly in `[app_start_secs, app_start_secs + 1)`.
    pub app_start_secs: f64,

    /// Probability that a benign relay drops a packet to congestion.
    pub congestion_drop: f64,

    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackConfig {
    pub strategy: AttackStrategyKind,

    /// Drop probability for PACKET_DROP_PERC.
    pub percent_drop: f64,

    /// Nodes running the attack-augmented protocol.
    #[serde(default)]
    pub attackers: Vec<NodeId>,

    /// Neighbours whose traffic is dropped by PACKET_DROP_NEIGHBOURS.
    #[serde(default)]
    pub target_neighbours: Vec<NodeId>,

    pub seed: u64,

    /// Flow dropped by PACKET_DROP_CONNECTION.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_flow: Option<FlowConfig>,

    /// Predicate for PACKET_DROP_SELECT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<SelectorConfig>,

    /// Attack windows for PACKET_DROP_IN_TIME.
    #[serde(default)]
    pub drop_windows: Vec<TimeWindowConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowConfig {
    pub source: NodeId,
    pub destination: NodeId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeWindowConfig {
    pub start_secs: f64,
    pub end_secs: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Match packets whose TTL is strictly below this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_below: Option<u8>,

    /// Match packets at least this large.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size_bytes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Nodes whose trust score falls below this are classified malicious.
    pub threshold: f64,

    /// Reconciled observations required before a node is classified.
    pub min_evidence: u32,

    /// Round-trip timeout after which an expectation is reconciled.
    pub reconcile_window_secs: f64,

    /// How long reconciled packet ids are remembered.
    pub reconciled_retention_secs: f64,

    /// EMA weight of a fresh connection-strength sample, in (0, 1].
    pub connection_smoothing: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefenseConfig {
    /// Furthest stage the controller is allowed to reach.
    pub strategy: DefenseStrategy,

    /// Monitor in MONITOR_WHEN_VELOCITY when the ceiling is TRAINING or
    /// INFERENCE. Rejected together with a MONITOR_ALWAYS ceiling.
    #[serde(default)]
    pub velocity_gated: bool,

    /// Node whose point of view is used for distance features.
    pub vantage_node: NodeId,

    /// Speed (m/s) a node must exceed for velocity-gated feature updates.
    pub velocity_floor: f64,

    pub decision_interval_secs: f64,
    pub min_active_nodes: usize,
    pub monitor_after_secs: f64,
    pub min_monitor_secs: f64,
    pub training_after_labels: u64,
    pub training_cycles: u64,
    pub max_training_cycles: u64,
    pub stability_window: usize,
    pub stability_epsilon: f64,

    /// Starting value of the learned rejection threshold.
    pub initial_threshold: f64,
    pub learning_rate: f64,

    /// Steepness of the rejection sigmoid.
    pub gain: f64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                protocol_name: "AODV".to_string(),
                tx_power_dbm: 10.0,
                output_dir: PathBuf::from("./sentinel-data"),
                csv_file_name: "manet-routing.output.csv".to_string(),
                unrouted_nodes: vec![],
            },
            simulation: SimulationConfig {
                n_nodes: 20,
                n_sinks: 5,
                total_time_secs: 200.0,
                area_m: 100.0,
                node_speed: 10.0,
                radio_range_m: 60.0,
                packet_size_bytes: 800,
                packets_per_second: 4.0,
                app_start_secs: 100.0,
                congestion_drop: 0.0,
                seed: 1,
            },
            attack: AttackConfig {
                strategy: AttackStrategyKind::PacketDropPerc,
                percent_drop: 1.0,
                attackers: vec![12],
                target_neighbours: vec![],
                seed: 7,
                target_flow: None,
                select: None,
                drop_windows: vec![],
            },
            detection: DetectionConfig {
                threshold: 0.3,
                min_evidence: 10,
                reconcile_window_secs: 2.0,
                reconciled_retention_secs: 20.0,
                connection_smoothing: 0.3,
            },
            defense: DefenseConfig {
                strategy: DefenseStrategy::Inference,
                velocity_gated: false,
                vantage_node: 0,
                velocity_floor: 1.0,
                decision_interval_secs: 1.0,
                min_active_nodes: 2,
                monitor_after_secs: 0.0,
                min_monitor_secs: 10.0,
                training_after_labels: 20,
                training_cycles: 20,
                max_training_cycles: 60,
                stability_window: 5,
                stability_epsilon: 0.01,
                initial_threshold: 0.5,
                learning_rate: 0.05,
                gain: 10.0,
            },
        }
    }
}

impl MeshConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file(path: &std::path::Path) -> MeshResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MeshConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration to a TOML file.
    pub fn write_default(path: &std::path::Path) -> MeshResult<()> {
        let config = Self::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| MeshError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations a run must not start with.
    pub fn validate(&self) -> MeshResult<()> {
        if self.general.protocol_name != "AODV" {
            return Err(MeshError::Config(format!(
                "No such protocol: {}",
                self.general.protocol_name
            )));
        }

        check_unit("attack.percent_drop", self.attack.percent_drop)?;
        check_unit("detection.threshold", self.detection.threshold)?;
        check_unit("defense.initial_threshold", self.defense.initial_threshold)?;
        check_unit("simulation.congestion_drop", self.simulation.congestion_drop)?;

        let smoothing = self.detection.connection_smoothing;
        if !(smoothing > 0.0 && smoothing <= 1.0) {
            return Err(MeshError::Config(format!(
                "detection.connection_smoothing must be in (0, 1], got {}",
                smoothing
            )));
        }
        check_positive("detection.reconcile_window_secs", self.detection.reconcile_window_secs)?;
        check_non_negative(
            "detection.reconciled_retention_secs",
            self.detection.reconciled_retention_secs,
        )?;

        check_positive("simulation.area_m", self.simulation.area_m)?;
        check_positive("simulation.radio_range_m", self.simulation.radio_range_m)?;
        check_non_negative("simulation.node_speed", self.simulation.node_speed)?;
        check_non_negative("simulation.total_time_secs", self.simulation.total_time_secs)?;
        check_non_negative("simulation.packets_per_second", self.simulation.packets_per_second)?;
        check_non_negative("simulation.app_start_secs", self.simulation.app_start_secs)?;

        check_positive("defense.decision_interval_secs", self.defense.decision_interval_secs)?;
        check_positive("defense.gain", self.defense.gain)?;
        check_non_negative("defense.learning_rate", self.defense.learning_rate)?;
        check_non_negative("defense.velocity_floor", self.defense.velocity_floor)?;
        check_non_negative("defense.stability_epsilon", self.defense.stability_epsilon)?;
        if self.defense.velocity_gated && self.defense.strategy == DefenseStrategy::MonitorAlways {
            return Err(MeshError::Config(
                "defense.velocity_gated contradicts defense.strategy = MONITOR_ALWAYS".to_string(),
            ));
        }

        let sim = &self.simulation;
        if u64::from(sim.n_sinks) * 2 > u64::from(sim.n_nodes) {
            return Err(MeshError::Config(format!(
                "{} sinks need at least {} nodes, got {}",
                sim.n_sinks,
                u64::from(sim.n_sinks) * 2,
                sim.n_nodes
            )));
        }
        for attacker in &self.attack.attackers {
            if *attacker >= self.simulation.n_nodes {
                return Err(MeshError::Config(format!(
                    "attacker {} is outside the {} node topology",
                    attacker, self.simulation.n_nodes
                )));
            }
        }

        // Builds the tagged strategy, failing on missing parameters.
        attack::AttackStrategy::from_config(&self.attack)?;
        Ok(())
    }
}

fn check_positive(name: &str, value: f64) -> MeshResult<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(MeshError::Config(format!("{} must be positive, got {}", name, value)))
    }
}

fn check_non_negative(name: &str, value: f64) -> MeshResult<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(MeshError::Config(format!("{} must not be negative, got {}", name, value)))
    }
}

fn check_unit(name: &str, value: f64) -> MeshResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(MeshError::Config(format!(
            "{} must be in [0, 1], got {}",
            name, value
        )))
    }
}
