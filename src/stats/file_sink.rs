//! File-backed statistics sink.
//!
//! Throughput goes to a CSV with the column layout of the original
//! experiment output. Trust dumps, detection snapshots and defense events
//! go to one JSONL file each, one JSON object per line, so they can be
//! sliced with jq or grep.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{DefenseEvent, StatsSink, ThroughputRecord, TrustDump};
use crate::detection::ConfusionMatrix;
use crate::trust::mass::trust_level_label;
use crate::{GeneralConfig, MeshResult, SimTime};

pub const CSV_HEADER: &str =
    "SimulationSecond,ReceiveRate,PacketsReceived,NumberOfSinks,RoutingProtocol,TransmissionPower";

pub const TRUST_LOG: &str = "trust.jsonl";
pub const DETECTION_LOG: &str = "detection.jsonl";
pub const DEFENSE_LOG: &str = "defense.jsonl";

/// Writes the CSV and JSONL outputs of a run into one directory.
pub struct FileSink {
    dir: PathBuf,
    csv: BufWriter<File>,
    trust: BufWriter<File>,
    detection: BufWriter<File>,
    defense: BufWriter<File>,
}

impl FileSink {
    /// Create the output directory and (re)create all output files.
    pub fn create(config: &GeneralConfig) -> MeshResult<Self> {
        Self::create_in(&config.output_dir, &config.csv_file_name)
    }

    pub fn create_in(dir: &Path, csv_file_name: &str) -> MeshResult<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }

        let mut csv = BufWriter::new(File::create(dir.join(csv_file_name))?);
        writeln!(csv, "{}", CSV_HEADER)?;

        log::info!("[STATS] Writing run output to {}", dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            csv,
            trust: open_log(&dir.join(TRUST_LOG))?,
            detection: open_log(&dir.join(DETECTION_LOG))?,
            defense: open_log(&dir.join(DEFENSE_LOG))?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn open_log(path: &Path) -> MeshResult<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    Ok(BufWriter::new(file))
}

fn write_line(out: &mut BufWriter<File>, value: &serde_json::Value) -> MeshResult<()> {
    let line = serde_json::to_string(value)?;
    writeln!(out, "{}", line)?;
    Ok(())
}

impl StatsSink for FileSink {
    fn record_throughput(&mut self, record: &ThroughputRecord) -> MeshResult<()> {
        writeln!(
            self.csv,
            "{},{},{},{},{},{}",
            record.timestamp,
            record.receive_rate_kbps,
            record.packets_received,
            record.sink_count,
            record.protocol_name,
            record.tx_power,
        )?;
        Ok(())
    }

    fn record_detection(&mut self, timestamp: SimTime, matrix: &ConfusionMatrix) -> MeshResult<()> {
        let entry = serde_json::json!({
            "logged_at": chrono::Utc::now().to_rfc3339(),
            "timestamp": timestamp,
            "tp": matrix.tp,
            "tn": matrix.tn,
            "fp": matrix.fp,
            "fn": matrix.fn_,
            "accuracy": matrix.accuracy(),
            "precision": matrix.precision(),
            "recall": matrix.recall(),
        });
        write_line(&mut self.detection, &entry)
    }

    fn record_trust(&mut self, dumps: &[TrustDump]) -> MeshResult<()> {
        for dump in dumps {
            let entry = serde_json::json!({
                "timestamp": dump.timestamp,
                "node_id": dump.node_id,
                "trust_score": dump.trust_score,
                "trust_level": trust_level_label(dump.trust_score),
                "expected_trust": dump.expected_trust,
                "connection_strength": dump.connection_strength,
            });
            write_line(&mut self.trust, &entry)?;
        }
        Ok(())
    }

    fn record_defense(&mut self, event: &DefenseEvent) -> MeshResult<()> {
        let entry = serde_json::to_value(event)?;
        write_line(&mut self.defense, &entry)
    }

    fn flush(&mut self) -> MeshResult<()> {
        self.csv.flush()?;
        self.trust.flush()?;
        self.detection.flush()?;
        self.defense.flush()?;
        Ok(())
    }
}
