//! Command-line arguments of the `posture` binary.

use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

/// Posture shell: dispatch named postures to actuator groups.
#[derive(Parser, Debug)]
#[command(name = "posture")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dispatch named postures to actuator groups and track their completion", long_about = None)]
pub struct Cli {
    /// Posture library (YAML); overrides `postures_path` from the config
    #[arg(long = "postures", short = 'p', value_name = "PATH")]
    pub postures: Option<PathBuf>,

    /// Extra posture files merged into the library, existing postures win
    #[arg(long = "merge", short = 'm', value_name = "PATH")]
    pub merge: Vec<PathBuf>,

    /// Let postures from `--merge` files replace existing ones
    #[arg(long = "overwrite")]
    pub overwrite: bool,

    /// Write the merged library to PATH and exit
    #[arg(long = "save", value_name = "PATH")]
    pub save: Option<PathBuf>,

    /// Settle posture chained after every batch ("-" disables chaining)
    #[arg(long = "settle", value_name = "POSTURE")]
    pub settle: Option<String>,

    /// Speed-up of the simulated transport
    #[arg(long = "speedup", value_name = "FACTOR")]
    pub speedup: Option<f64>,

    /// Run one request (`<target> <posture> [timescale]`), wait, and exit
    #[arg(long = "run", value_name = "REQUEST")]
    pub run: Option<String>,
}

impl Cli {
    /// Fold the command-line overrides into `cfg`.
    pub fn apply_to(&self, cfg: &mut Config) {
        if let Some(path) = &self.postures {
            cfg.postures_path = Some(path.clone());
        }
        if let Some(settle) = &self.settle {
            cfg.settle_posture = settle_from_arg(settle);
        }
        if let Some(speedup) = self.speedup
            && speedup.is_finite()
            && speedup > 0.0
        {
            cfg.sim_speedup = speedup;
        }
    }
}

/// `-` clears the settle posture.
pub fn settle_from_arg(raw: &str) -> String {
    match raw.trim() {
        "-" => String::new(),
        other => other.to_string(),
    }
}
