use clap::{Parser, Subcommand};
use std::time::Duration;

use crate::engine::calibration::CalibrationSettings;
use crate::engine::chaos::ChaosPreset;
use crate::engine::settings::IntegrationMode;
use crate::models::MatchRequest;

/// Football match prediction engine
#[derive(Parser, Debug, Clone)]
#[command(name = "goalcast", version, about)]
pub struct Config {
    /// SQLite pattern database path
    #[arg(long, env = "GOALCAST_DB", default_value = "goalcast.db", global = true)]
    pub database_path: String,

    /// Run without a pattern database (simulation only)
    #[arg(long, env = "GOALCAST_NO_DATABASE", default_value = "false", global = true)]
    pub no_database: bool,

    /// Simulation worker threads (0 = one per core)
    #[arg(long, env = "GOALCAST_THREADS", default_value = "0", global = true)]
    pub threads: usize,

    /// Stop the simulation after this many seconds and report partial results
    #[arg(long, env = "GOALCAST_TIMEOUT_SECS", global = true)]
    pub timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Simulate a match and price every market
    Predict {
        /// JSON match request
        #[arg(long)]
        request: String,

        /// Override the request's iteration count
        #[arg(long)]
        iterations: Option<u64>,

        /// Override the request's seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override the evidence integration mode (replace, hybrid, compare)
        #[arg(long)]
        mode: Option<IntegrationMode>,

        /// Replace the request's chaos settings with a preset
        /// (conservative, moderate, aggressive, extreme, maximum)
        #[arg(long)]
        chaos: Option<ChaosPreset>,
    },
    /// Store a real final score under the request's pattern
    RecordResult {
        #[arg(long)]
        request: String,

        #[arg(long)]
        home_goals: u32,

        #[arg(long)]
        away_goals: u32,
    },
    /// Derive reversion thresholds from simulated seasons
    Calibrate {
        #[arg(long, default_value = "20000")]
        sequences: u64,

        #[arg(long, default_value = "100")]
        sequence_len: usize,

        #[arg(long, default_value = "0.85")]
        percentile: f64,

        #[arg(long, default_value = "24301")]
        seed: u64,
    },
    /// Show what the database knows about one pattern
    Stats {
        #[arg(long)]
        pattern_id: String,
    },
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.no_database && self.database_path.trim().is_empty() {
            anyhow::bail!("database_path must not be empty. Use --no-database to run without one.");
        }
        if self.threads > 1024 {
            anyhow::bail!("threads must be at most 1024");
        }
        if self.timeout_secs == Some(0) {
            anyhow::bail!("timeout_secs must be positive");
        }
        match &self.command {
            Command::Predict { iterations, .. } => {
                if *iterations == Some(0) {
                    anyhow::bail!("iterations must be positive");
                }
            }
            Command::RecordResult { .. } => {
                if self.no_database {
                    anyhow::bail!("record-result needs a pattern database");
                }
            }
            Command::Calibrate {
                sequences,
                sequence_len,
                percentile,
                ..
            } => {
                if *sequences == 0 || *sequence_len == 0 {
                    anyhow::bail!("sequences and sequence_len must be positive");
                }
                if !(*percentile > 0.0 && *percentile < 1.0) {
                    anyhow::bail!("percentile must be between 0.0 and 1.0 (exclusive)");
                }
            }
            Command::Stats { pattern_id } => {
                if pattern_id.len() != 64 || !pattern_id.chars().all(|c| c.is_ascii_hexdigit()) {
                    anyhow::bail!("pattern_id must be a 64-character hex SHA-256 digest");
                }
                if self.no_database {
                    anyhow::bail!("stats needs a pattern database");
                }
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Read a request file and apply command-line overrides to it.
pub fn load_request(
    path: &str,
    iterations: Option<u64>,
    seed: Option<u64>,
    mode: Option<IntegrationMode>,
    chaos: Option<ChaosPreset>,
) -> anyhow::Result<MatchRequest> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read request {}: {}", path, e))?;
    let mut request = MatchRequest::from_json(&text)?;
    if let Some(n) = iterations {
        request.config.iterations = n;
    }
    if seed.is_some() {
        request.config.seed = seed;
    }
    if let Some(mode) = mode {
        request.config.evidence.mode = mode;
    }
    if let Some(preset) = chaos {
        request.config.chaos = preset.config();
    }
    Ok(request)
}

pub fn calibration_settings(
    sequences: u64,
    sequence_len: usize,
    percentile: f64,
    seed: u64,
) -> CalibrationSettings {
    CalibrationSettings {
        sequences,
        sequence_len,
        percentile,
        seed,
        ..Default::default()
    }
}
