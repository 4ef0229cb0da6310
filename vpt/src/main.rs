//! Perturbation-Theory Command-Line Interface
//!
//! This is the main entry point for running VPT calculations with YAML
//! configuration.

use std::fs;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::info;

use basis::BasisStateSpace;
use vpt::checkpoint::{DiskCheckpointer, NullCheckpointer};
use vpt::config::{Args, Config};
use vpt::io::{print_energy_report, setup_output};
use vpt::PerturbationTheorySolver;

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    setup_output(args.output.as_ref());

    // Load and parse configuration
    info!("Reading configuration from: {}", args.config_file);
    let config_content = fs::read_to_string(&args.config_file)
        .wrap_err_with(|| format!("Unable to read configuration file: {}", args.config_file))?;

    let config: Config = serde_yml::from_str::<Config>(&config_content)
        .wrap_err("Failed to parse configuration file")?
        .with_defaults();

    info!("Configuration loaded:\n{:?}", config);

    let provider = config.build_provider()?;
    let mut options = config.to_solver_options()?;

    // Override with command-line arguments if provided
    if let Some(order) = args.order {
        info!("Overriding order with: {}", order);
        options.order = order;
    }
    if args.ignore_odd_order_energies {
        options.ignore_odd_order_energies = true;
    }
    if args.intermediate_normalization {
        options.intermediate_normalization = true;
    }
    if let Some(threshold) = args.strong_coupling_threshold {
        info!("Overriding strong-coupling threshold with: {}", threshold);
        options.strong_coupling_threshold = Some(threshold);
    }
    if args.memory_constrained {
        options.memory_constrained = true;
    }

    let basis = Arc::new(basis::HarmonicBasis::new(config.n_modes()));
    let states = BasisStateSpace::from_excitations(basis, &config.states)
        .wrap_err("Invalid target states")?;

    let mut solver = PerturbationTheorySolver::new(&provider, states, options)?;
    let checkpoint_dir = args.checkpoint_dir.as_ref().or(config.checkpoint_dir.as_ref());
    solver = match checkpoint_dir {
        Some(dir) => {
            info!("Checkpointing to: {}", dir);
            solver.with_checkpointer(Box::new(DiskCheckpointer::new(dir)))
        }
        None => solver.with_checkpointer(Box::new(NullCheckpointer)),
    };

    info!("\nApplying perturbation theory...\n");
    let corrections = solver.apply_vpt()?;

    info!("\nPerturbation theory finished.");
    let mut report = Vec::new();
    print_energy_report(&mut report, &corrections)?;
    for line in String::from_utf8_lossy(&report).lines() {
        info!("{}", line);
    }

    if let Some(path) = &args.save_corrections {
        fs::write(path, corrections.to_json())
            .wrap_err_with(|| format!("Unable to write corrections archive: {}", path))?;
        info!("Corrections archive written to: {}", path);
    }

    Ok(())
}
