//! # Statistics Sink
//!
//! Record types the run emits and the `StatsSink` trait that receives
//! them:
//! - throughput per simulated second (the CSV of the experiment program)
//! - confusion-matrix snapshots on demand
//! - trust dumps, one row per tracked node
//! - defense events: stage transitions, exclusions, rewards
//!
//! Sinks may fail (full disk, closed pipe). Callers log the failure and
//! carry on; a broken sink never aborts a run.

pub mod file_sink;

use serde::{Deserialize, Serialize};

use crate::detection::ConfusionMatrix;
use crate::{DefenseStrategy, MeshResult, NodeId, SimTime};
pub use file_sink::FileSink;

/// One row of the throughput CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputRecord {
    pub timestamp: SimTime,
    pub receive_rate_kbps: f64,
    pub packets_received: u32,
    pub sink_count: u32,
    pub protocol_name: String,
    pub tx_power: f64,
}

impl ThroughputRecord {
    /// Build a record from the bytes received during one interval.
    pub fn from_bytes(
        timestamp: SimTime,
        bytes: u64,
        packets_received: u32,
        sink_count: u32,
        protocol_name: &str,
        tx_power: f64,
    ) -> Self {
        Self {
            timestamp,
            receive_rate_kbps: bytes as f64 * 8.0 / 1000.0,
            packets_received,
            sink_count,
            protocol_name: protocol_name.to_string(),
            tx_power,
        }
    }
}

/// Trust state of one tracked node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustDump {
    pub timestamp: SimTime,
    pub node_id: NodeId,
    pub trust_score: f64,

    /// Projected probability (alpha + 1) / (alpha + beta + 2).
    pub expected_trust: f64,
    pub connection_strength: f64,
}

/// Something the defense controller did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DefenseEvent {
    StageTransition {
        timestamp: SimTime,
        from: DefenseStrategy,
        to: DefenseStrategy,
    },
    Exclusion {
        timestamp: SimTime,
        node: NodeId,
        trust_score: f64,
        reject_node: f64,
        stage: DefenseStrategy,
    },
    Reward {
        timestamp: SimTime,
        node: Option<NodeId>,
        value: f64,
        gameover: bool,
        threshold: f64,
    },
}

impl DefenseEvent {
    pub fn timestamp(&self) -> SimTime {
        match self {
            DefenseEvent::StageTransition { timestamp, .. }
            | DefenseEvent::Exclusion { timestamp, .. }
            | DefenseEvent::Reward { timestamp, .. } => *timestamp,
        }
    }
}

/// Receiver of run statistics.
pub trait StatsSink {
    fn record_throughput(&mut self, record: &ThroughputRecord) -> MeshResult<()>;

    fn record_detection(&mut self, timestamp: SimTime, matrix: &ConfusionMatrix) -> MeshResult<()>;

    fn record_trust(&mut self, dumps: &[TrustDump]) -> MeshResult<()>;

    fn record_defense(&mut self, event: &DefenseEvent) -> MeshResult<()>;

    fn flush(&mut self) -> MeshResult<()> {
        Ok(())
    }
}

/// In-memory sink, used by tests and by hosts that post-process a run.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub throughput: Vec<ThroughputRecord>,
    pub detection: Vec<(SimTime, ConfusionMatrix)>,
    pub trust: Vec<TrustDump>,
    pub defense: Vec<DefenseEvent>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage transitions in the order they happened.
    pub fn transitions(&self) -> Vec<(DefenseStrategy, DefenseStrategy)> {
        self.defense
            .iter()
            .filter_map(|e| match e {
                DefenseEvent::StageTransition { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    pub fn exclusions(&self) -> Vec<NodeId> {
        self.defense
            .iter()
            .filter_map(|e| match e {
                DefenseEvent::Exclusion { node, .. } => Some(*node),
                _ => None,
            })
            .collect()
    }
}

impl StatsSink for MemorySink {
    fn record_throughput(&mut self, record: &ThroughputRecord) -> MeshResult<()> {
        self.throughput.push(record.clone());
        Ok(())
    }

    fn record_detection(&mut self, timestamp: SimTime, matrix: &ConfusionMatrix) -> MeshResult<()> {
        self.detection.push((timestamp, *matrix));
        Ok(())
    }

    fn record_trust(&mut self, dumps: &[TrustDump]) -> MeshResult<()> {
        self.trust.extend_from_slice(dumps);
        Ok(())
    }

    fn record_defense(&mut self, event: &DefenseEvent) -> MeshResult<()> {
        self.defense.push(event.clone());
        Ok(())
    }
}
