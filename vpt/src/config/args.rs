//! Command-line argument parsing for perturbation-theory runs.

use clap::Parser;

/// Vibrational perturbation theory with YAML configuration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config_file: String,

    /// Override the perturbation order
    #[arg(long)]
    pub order: Option<usize>,

    /// Override output file (default stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Force odd-order energy corrections to zero
    #[arg(long)]
    pub ignore_odd_order_energies: bool,

    /// Use intermediate normalization
    #[arg(long)]
    pub intermediate_normalization: bool,

    /// Override the strong-coupling detection threshold
    #[arg(long)]
    pub strong_coupling_threshold: Option<f64>,

    /// Override the checkpoint directory
    #[arg(long)]
    pub checkpoint_dir: Option<String>,

    /// Trade recomputation for lower peak memory in the coupled-space builder
    #[arg(long)]
    pub memory_constrained: bool,

    /// Write the corrections archive to this path after the run
    #[arg(long)]
    pub save_corrections: Option<String>,
}
