//! # SENTINEL MANET - CLI Entry Point
//!
//! Command-line interface for the grey-hole experiment harness.
//!
//! Commands:
//! - `run`          - Run the configured scenario and write its outputs
//! - `check-config` - Load and validate a configuration file
//! - `init-config`  - Generate a default configuration file

use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sentinel_manet::detection::{AttackerRoster, GroundTruthOracle, NoOracle};
use sentinel_manet::scenario::{Scenario, ScenarioOutcome};
use sentinel_manet::stats::FileSink;
use sentinel_manet::{AttackStrategyKind, MeshConfig, MeshError, MeshResult};

/// SENTINEL MANET - grey-hole attack model and trust-based defense.
///
/// Runs a synthetic ad-hoc network where some relays drop data packets,
/// scores every relay from overheard forwarding behavior and withdraws the
/// ones it stops trusting.
#[derive(Parser, Debug)]
#[command(name = "sentinel-manet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "sentinel-manet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the experiment.
    Run {
        /// Override `simulation.seed`.
        #[arg(long)]
        seed: Option<u64>,

        /// Override `attack.strategy` with the legacy numeric code (0-5).
        #[arg(long)]
        attack_code: Option<u32>,

        /// Withhold ground truth (pure inference run, no confusion matrix).
        #[arg(long)]
        no_oracle: bool,
    },

    /// Load and validate the configuration file.
    CheckConfig,

    /// Generate a default configuration file.
    InitConfig,
}

fn main() -> MeshResult<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            seed,
            attack_code,
            no_oracle,
        } => cmd_run(&cli.config, seed, attack_code, no_oracle),
        Commands::CheckConfig => cmd_check_config(&cli.config),
        Commands::InitConfig => cmd_init_config(&cli.config),
    }
}

fn load_config(config_path: &Path) -> MeshResult<MeshConfig> {
    if config_path.exists() {
        info!("Loading configuration from: {}", config_path.display());
        MeshConfig::from_file(config_path)
    } else {
        info!("No config file found, using defaults. Run 'init-config' to generate one.");
        Ok(MeshConfig::default())
    }
}

/// Run the scenario and write CSV, JSONL and summary outputs.
fn cmd_run(
    config_path: &Path,
    seed: Option<u64>,
    attack_code: Option<u32>,
    no_oracle: bool,
) -> MeshResult<()> {
    let mut config = load_config(config_path)?;
    if let Some(seed) = seed {
        config.simulation.seed = seed;
    }
    if let Some(code) = attack_code {
        config.attack.strategy = AttackStrategyKind::from_code(code)?;
    }
    config.validate()?;

    let started = chrono::Utc::now();
    info!(
        "SENTINEL MANET run starting at {} ({} nodes, {:.0}s, attack {:?} on {:?})",
        started.to_rfc3339(),
        config.simulation.n_nodes,
        config.simulation.total_time_secs,
        config.attack.strategy,
        config.attack.attackers,
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!("Could not install signal handler: {}. The run cannot be interrupted cleanly.", e);
    }

    let oracle: Box<dyn GroundTruthOracle> = if no_oracle {
        Box::new(NoOracle)
    } else {
        Box::new(AttackerRoster::new(config.attack.attackers.iter().copied()))
    };

    let sink = FileSink::create(&config.general)?;
    let scenario = Scenario::new(&config)?;
    let (outcome, sink) = scenario.run(oracle, sink, &shutdown)?;

    let summary_path = sink.dir().join("summary.json");
    write_summary(&summary_path, &outcome, &started)?;
    print_summary(&outcome);
    println!();
    println!("Outputs written to: {}", sink.dir().display());

    let elapsed = chrono::Utc::now() - started;
    info!("Run finished in {} ms", elapsed.num_milliseconds());
    Ok(())
}

fn write_summary(
    path: &Path,
    outcome: &ScenarioOutcome,
    started: &chrono::DateTime<chrono::Utc>,
) -> MeshResult<()> {
    let doc = serde_json::json!({
        "started_at": started.to_rfc3339(),
        "outcome": outcome,
        "accuracy": outcome.summary.confusion.accuracy(),
        "precision": outcome.summary.confusion.precision(),
        "recall": outcome.summary.confusion.recall(),
        "false_positive_rate": outcome.summary.confusion.false_positive_rate(),
        "f1": outcome.summary.confusion.f1(),
    });
    std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}

fn print_summary(outcome: &ScenarioOutcome) {
    let s = &outcome.summary;
    let m = &s.confusion;
    println!("SENTINEL MANET run summary");
    println!("==========================");
    if outcome.interrupted {
        println!("  (interrupted after {} simulated seconds)", outcome.seconds_run);
    }
    println!(
        "  Packets: {} sent, {} delivered, {} without route",
        outcome.packets_sent, outcome.packets_delivered, outcome.packets_unroutable
    );
    println!(
        "  Drops: {} attack, {} congestion",
        s.dropped.attack_drops(),
        s.dropped.congestion_drops()
    );
    println!("  Confusion: tp={} tn={} fp={} fn={}", m.tp, m.tn, m.fp, m.fn_);
    println!(
        "  Accuracy {:.3}  Precision {:.3}  Recall {:.3}  F1 {:.3}",
        m.accuracy(),
        m.precision(),
        m.recall(),
        m.f1()
    );
    println!(
        "  Defense: final stage {}, threshold {:.3}, reward {:.1}",
        s.final_stage.label(),
        s.policy_threshold,
        s.cumulative_reward
    );
    println!("  Excluded nodes: {:?}", s.excluded);
}

/// Validate a configuration file without running anything.
fn cmd_check_config(config_path: &Path) -> MeshResult<()> {
    if !config_path.exists() {
        return Err(MeshError::Config(format!(
            "Configuration file not found: {}",
            config_path.display()
        )));
    }
    let config = MeshConfig::from_file(config_path)?;
    println!("Configuration OK: {}", config_path.display());
    println!("  Protocol: {}", config.general.protocol_name);
    println!(
        "  Attack: {:?} (p={}) on {:?}",
        config.attack.strategy, config.attack.percent_drop, config.attack.attackers
    );
    println!(
        "  Detection threshold: {} (min evidence {})",
        config.detection.threshold, config.detection.min_evidence
    );
    println!("  Defense ceiling: {}", config.defense.strategy.label());
    Ok(())
}

/// Generate a default configuration file.
fn cmd_init_config(config_path: &Path) -> MeshResult<()> {
    if config_path.exists() {
        return Err(MeshError::Config(format!(
            "Configuration file already exists: {}. Remove it first or use a different path.",
            config_path.display()
        )));
    }

    MeshConfig::write_default(config_path)?;
    println!("Default configuration written to: {}", config_path.display());
    println!();
    println!("Key settings to configure:");
    println!("  [attack]     - strategy, percent_drop and the attacker node ids");
    println!("  [detection]  - threshold (default 0.3) and min_evidence");
    println!("  [defense]    - furthest defense stage (default INFERENCE)");
    println!("  [simulation] - topology size, flows and run length");

    Ok(())
}
