//! Configuration management for perturbation-theory runs.
//!
//! This module handles the YAML configuration surface, defaults, and the
//! conversion into solver options and a tabulated representation provider.

mod args;

pub use args::Args;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use basis::{BasisState, HarmonicBasis, SelectionRules};

use crate::representation::TabulatedProvider;
use crate::solver_impl::{DegeneracySpec, PerturbationTheoryError, Result, SolverOptions};

/// Main configuration structure for a perturbation-theory run.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub system: SystemConfig,
    /// Target states as excitation vectors.
    pub states: Vec<Vec<u32>>,
    #[serde(default)]
    pub solver: SolverParams,
    pub degeneracy: Option<DegeneracyConfig>,
    /// Perturbation operators `H1, H2, ...` in order.
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
    pub checkpoint_dir: Option<String>,
}

/// The harmonic system: one frequency per mode.
#[derive(Debug, Deserialize, Serialize)]
pub struct SystemConfig {
    pub frequencies: Vec<f64>,
}

/// Solver-specific parameters.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SolverParams {
    pub order: Option<usize>,
    pub ignore_odd_order_energies: Option<bool>,
    pub intermediate_normalization: Option<bool>,
    pub strong_coupling_threshold: Option<f64>,
    pub non_zero_cutoff: Option<f64>,
    pub memory_constrained: Option<bool>,
    pub zero_order_overrides: Option<Vec<ZeroOrderOverride>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZeroOrderOverride {
    pub state: Vec<u32>,
    pub energy: f64,
}

/// Degeneracy specification variants, decided once here at the boundary.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DegeneracyConfig {
    EnergyCutoff { energy_cutoff: f64 },
    Groups { groups: Vec<Vec<Vec<u32>>> },
    Polyad { polyad: Vec<i64> },
}

/// One tabulated perturbation operator: its selection rules plus explicit
/// matrix elements.
#[derive(Debug, Deserialize, Serialize)]
pub struct OperatorConfig {
    pub rules: Vec<Vec<i32>>,
    #[serde(default)]
    pub elements: Vec<ElementConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ElementConfig {
    pub bra: Vec<u32>,
    pub ket: Vec<u32>,
    pub value: f64,
}

impl SolverParams {
    /// Apply default values to any missing parameters.
    pub fn with_defaults(mut self) -> Self {
        if self.order.is_none() {
            self.order = Some(2);
        }
        if self.ignore_odd_order_energies.is_none() {
            self.ignore_odd_order_energies = Some(false);
        }
        if self.intermediate_normalization.is_none() {
            self.intermediate_normalization = Some(false);
        }
        if self.non_zero_cutoff.is_none() {
            self.non_zero_cutoff = Some(1.0e-14);
        }
        if self.memory_constrained.is_none() {
            self.memory_constrained = Some(false);
        }
        self
    }
}

impl Config {
    /// Apply defaults to all configuration sections.
    pub fn with_defaults(mut self) -> Self {
        self.solver = self.solver.with_defaults();
        self
    }

    pub fn n_modes(&self) -> usize {
        self.system.frequencies.len()
    }

    /// Validates the shape of every section; all failures happen here,
    /// before any numeric work begins.
    pub fn validate(&self) -> Result<()> {
        let n_modes = self.n_modes();
        if n_modes == 0 {
            return Err(PerturbationTheoryError::Configuration(
                "the system needs at least one mode frequency".into(),
            ));
        }
        if self.states.is_empty() {
            return Err(PerturbationTheoryError::Configuration(
                "no target states supplied".into(),
            ));
        }
        for state in &self.states {
            if state.len() != n_modes {
                return Err(PerturbationTheoryError::Configuration(format!(
                    "target state {:?} has {} modes, expected {}",
                    state,
                    state.len(),
                    n_modes
                )));
            }
        }
        if let Some(order) = self.solver.order {
            if order < 1 {
                return Err(PerturbationTheoryError::Configuration(
                    "perturbation order must be at least 1".into(),
                ));
            }
        }
        for (k, op) in self.operators.iter().enumerate() {
            for element in &op.elements {
                if element.bra.len() != n_modes || element.ket.len() != n_modes {
                    return Err(PerturbationTheoryError::Configuration(format!(
                        "H({}) element <{:?}|...|{:?}> does not match the {}-mode system",
                        k + 1,
                        element.bra,
                        element.ket,
                        n_modes
                    )));
                }
            }
        }
        if let Some(overrides) = &self.solver.zero_order_overrides {
            for entry in overrides {
                if entry.state.len() != n_modes {
                    return Err(PerturbationTheoryError::Configuration(format!(
                        "zero-order override state {:?} does not match the {}-mode system",
                        entry.state, n_modes
                    )));
                }
            }
        }
        Ok(())
    }

    /// Builds the tabulated provider the config describes.
    pub fn build_provider(&self) -> Result<TabulatedProvider> {
        self.validate()?;
        let basis = Arc::new(HarmonicBasis::new(self.n_modes()));
        let mut provider =
            TabulatedProvider::new(basis, self.system.frequencies.clone());
        for op in &self.operators {
            provider.add_operator(SelectionRules::new(op.rules.clone()));
        }
        for (k, op) in self.operators.iter().enumerate() {
            for element in &op.elements {
                provider.set_element(
                    k + 1,
                    &BasisState::new(element.bra.clone()),
                    &BasisState::new(element.ket.clone()),
                    element.value,
                );
            }
        }
        Ok(provider)
    }

    /// Maps the configuration (after defaults) onto solver options.
    pub fn to_solver_options(&self) -> Result<SolverOptions> {
        self.validate()?;
        let degeneracy = match &self.degeneracy {
            None => DegeneracySpec::Singletons,
            Some(DegeneracyConfig::EnergyCutoff { energy_cutoff }) => {
                DegeneracySpec::EnergyCutoff(*energy_cutoff)
            }
            Some(DegeneracyConfig::Groups { groups }) => DegeneracySpec::Groups(groups.clone()),
            Some(DegeneracyConfig::Polyad { polyad }) => DegeneracySpec::Polyad(polyad.clone()),
        };
        let zero_order_overrides = self
            .solver
            .zero_order_overrides
            .as_ref()
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (BasisState::new(e.state.clone()), e.energy))
                    .collect()
            })
            .unwrap_or_default();
        Ok(SolverOptions {
            order: self.solver.order.unwrap_or(2),
            degeneracy,
            ignore_odd_order_energies: self.solver.ignore_odd_order_energies.unwrap_or(false),
            intermediate_normalization: self.solver.intermediate_normalization.unwrap_or(false),
            strong_coupling_threshold: self.solver.strong_coupling_threshold,
            zero_order_overrides,
            non_zero_cutoff: self.solver.non_zero_cutoff.unwrap_or(1.0e-14),
            memory_constrained: self.solver.memory_constrained.unwrap_or(false),
        })
    }
}
