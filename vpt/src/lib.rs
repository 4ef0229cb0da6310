// Main library file for vibrational perturbation theory calculations

pub mod checkpoint;
pub mod config;
pub mod io;
pub mod representation;
pub mod solver_impl;

pub use representation::{
    Perturbation, PerturbationList, RepresentationProvider, TabulatedProvider,
};
pub use solver_impl::{
    Corrections, DegeneracySpec, DegenerateStateSpace, PerturbationTheoryError,
    PerturbationTheorySolver, SolverOptions,
};
