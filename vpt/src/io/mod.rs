//! Input/Output operations for perturbation-theory runs.
//!
//! This module handles logging setup and the final energy report.

mod output;

pub use output::{print_energy_report, setup_output};
