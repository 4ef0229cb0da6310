//! Rayleigh-Schrödinger perturbation theory solver.
//!
//! The driver here owns the full pipeline: coupled-space determination,
//! representation materialization (both checkpoint-backed), the per-state
//! non-degenerate recursion, optional strong-coupling regrouping with a
//! single bounded re-run, and the post-PT variational resolution of
//! degenerate groups.

extern crate nalgebra as na;

pub mod corrections;
pub mod degeneracy;
pub mod spaces;

mod nondeg;
mod post_pt;

use na::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use basis::{BasisState, BasisStateSpace, SelectionRuleStateSpace, StateSpaceError};

use crate::checkpoint::{Checkpointer, NullCheckpointer};
use crate::representation::{
    assemble_representations, Perturbation, PerturbationList, RepresentationProvider,
};

pub use corrections::{Corrections, CorrectionsArchive, SparseTriplets};
pub use degeneracy::{DegeneracySpec, DegenerateStateSpace};
pub use spaces::CoupledSpaceBuilder;

#[derive(Debug, Error)]
pub enum PerturbationTheoryError {
    /// A resolvent denominator fell below the cutoff outside the declared
    /// degenerate group. The caller is expected to resubmit with a degeneracy
    /// specification covering the offending states (or relaxed cutoffs /
    /// explicit zero-order energies); the solver never retries this.
    #[error(
        "degeneracies encountered: state {state} couples to states {others:?} through \
         near-degenerate energies (mean {mean:.8e}, stddev {stddev:.3e}); declare a \
         degenerate group covering them and re-run"
    )]
    DegeneracyEncountered {
        state: u64,
        others: Vec<u64>,
        mean: f64,
        stddev: f64,
    },

    /// The cumulative norm invariant failed after the recursion finished.
    #[error("state {state} isn't normalized after its corrections at order {order} (overlap = {overlap})")]
    NormalizationFailure { state: u64, order: usize, overlap: f64 },

    /// A projected-out coefficient survived where the resolvent should have
    /// zeroed it.
    #[error(
        "state {state} retains coefficient {overlap} on its degenerate partners at order {order}; \
         the resolvent should have projected it out"
    )]
    OverlapInconsistency { state: u64, order: usize, overlap: f64 },

    /// Malformed setup, rejected before any numeric work.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    StateSpace(#[from] StateSpaceError),
}

pub type Result<T> = std::result::Result<T, PerturbationTheoryError>;

/// The flat option surface of a solver run.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Perturbation order to correct to (>= 1).
    pub order: usize,
    /// How target states are grouped into degenerate sets.
    pub degeneracy: DegeneracySpec,
    /// Force odd-order energy corrections to zero (a documented
    /// approximation for symmetry-constrained systems, never assumed).
    pub ignore_odd_order_energies: bool,
    /// Use intermediate normalization (`<n^(0)|psi> = 1` exactly) instead of
    /// the order-by-order overlap convention.
    pub intermediate_normalization: bool,
    /// When set, inspect first-order couplings after the first pass and
    /// re-run once with strongly-coupled pairs merged into degenerate groups.
    pub strong_coupling_threshold: Option<f64>,
    /// Replacement zero-order energies for individual states.
    pub zero_order_overrides: Vec<(BasisState, f64)>,
    /// Threshold below which a number is treated as an exact zero.
    pub non_zero_cutoff: f64,
    /// Trade recomputation for lower peak memory in the coupled-space
    /// builder.
    pub memory_constrained: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            order: 2,
            degeneracy: DegeneracySpec::Singletons,
            ignore_odd_order_energies: false,
            intermediate_normalization: false,
            strong_coupling_threshold: None,
            zero_order_overrides: Vec::new(),
            non_zero_cutoff: 1.0e-14,
            memory_constrained: false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RuleSpaceRecord {
    sources: Vec<Vec<u32>>,
    transformed: Vec<Vec<Vec<u32>>>,
}

#[derive(Serialize, Deserialize)]
struct CoupledSpacesRecord {
    spaces: Vec<RuleSpaceRecord>,
}

#[derive(Serialize, Deserialize)]
struct RepresentationsRecord {
    terms: Vec<Option<SparseTriplets>>,
}

#[derive(Serialize, Deserialize)]
struct ResultsRecord {
    states: Vec<Vec<u32>>,
    energies: Vec<f64>,
    energy_corrections: Vec<Vec<f64>>,
}

#[derive(Serialize, Deserialize)]
struct DegenerateDataRecord {
    groups: Vec<Vec<Vec<u32>>>,
    rotation: SparseTriplets,
    energies: Vec<f64>,
}

/// Applies perturbation theory to a set of target states given a
/// representation provider. Supports degenerate and non-degenerate PT.
pub struct PerturbationTheorySolver<'a, P: RepresentationProvider> {
    provider: &'a P,
    states: BasisStateSpace,
    options: SolverOptions,
    checkpointer: Box<dyn Checkpointer>,
    coupled_states: Option<Vec<SelectionRuleStateSpace>>,
    flat_total_space: Option<BasisStateSpace>,
    representations: Option<PerturbationList>,
    zero_order_energies: Option<DVector<f64>>,
}

impl<'a, P: RepresentationProvider> PerturbationTheorySolver<'a, P> {
    pub fn new(
        provider: &'a P,
        states: BasisStateSpace,
        options: SolverOptions,
    ) -> Result<Self> {
        if options.order < 1 {
            return Err(PerturbationTheoryError::Configuration(
                "perturbation order must be at least 1".into(),
            ));
        }
        if states.is_empty() {
            return Err(PerturbationTheoryError::Configuration(
                "no target states supplied".into(),
            ));
        }
        if provider.n_perturbations() < 1 {
            return Err(PerturbationTheoryError::Configuration(
                "the provider must supply at least the zero-order Hamiltonian".into(),
            ));
        }
        Ok(PerturbationTheorySolver {
            provider,
            states,
            options,
            checkpointer: Box::new(NullCheckpointer),
            coupled_states: None,
            flat_total_space: None,
            representations: None,
            zero_order_energies: None,
        })
    }

    pub fn with_checkpointer(mut self, checkpointer: Box<dyn Checkpointer>) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    /// Supplies precomputed coupled spaces instead of running the builder.
    pub fn with_coupled_states(
        mut self,
        coupled: Vec<SelectionRuleStateSpace>,
    ) -> Result<Self> {
        let expected = self.provider.n_perturbations() - 1;
        if coupled.len() != expected {
            return Err(PerturbationTheoryError::Configuration(format!(
                "coupled states must be specified for all perturbations (got {}, expected {})",
                coupled.len(),
                expected
            )));
        }
        self.coupled_states = Some(coupled);
        self.flat_total_space = None;
        Ok(self)
    }

    pub fn states(&self) -> &BasisStateSpace {
        &self.states
    }

    /// The coupled space of each perturbation order (building them if
    /// needed).
    pub fn coupled_states(&mut self) -> Result<&[SelectionRuleStateSpace]> {
        self.load_state_spaces()?;
        Ok(self.coupled_states.as_deref().expect("just loaded"))
    }

    pub fn flat_total_space(&mut self) -> Result<&BasisStateSpace> {
        self.load_state_spaces()?;
        Ok(self.flat_total_space.as_ref().expect("just loaded"))
    }

    pub fn representations(&mut self) -> Result<&PerturbationList> {
        self.ensure_representations()?;
        Ok(self.representations.as_ref().expect("just built"))
    }

    pub fn zero_order_energies(&mut self) -> Result<&DVector<f64>> {
        self.ensure_representations()?;
        Ok(self.zero_order_energies.as_ref().expect("just built"))
    }

    /// Runs the full pipeline and returns the corrections, rotated through
    /// the post-PT variational pass when degenerate groups are in play.
    pub fn apply_vpt(&mut self) -> Result<Corrections> {
        let target_energies = self.target_zero_order_energies();
        let mut degenerate = DegenerateStateSpace::from_spec(
            &self.options.degeneracy,
            &self.states,
            &target_energies,
        )?;

        let mut corrs = self.get_corrections(&degenerate)?;

        if let Some(threshold) = self.options.strong_coupling_threshold {
            let pairs = {
                let flat = self.flat_total_space.as_ref().expect("loaded by get_corrections");
                let reps = self.representations.as_ref().expect("loaded by get_corrections");
                let e0 = self.zero_order_energies.as_ref().expect("loaded by get_corrections");
                degeneracy::detect_strong_couplings(&reps[1], e0, &self.states, flat, threshold)
            };
            let merged = degeneracy::merge_strong_couplings(&degenerate, &pairs, &self.states);
            if merged.n_groups() != degenerate.n_groups() {
                // exactly one bounded re-run; a second escalation is never
                // triggered automatically
                info!(
                    "strong couplings regrouped {} -> {} groups; re-running corrections once",
                    degenerate.n_groups(),
                    merged.n_groups()
                );
                degenerate = merged;
                corrs = self.get_corrections(&degenerate)?;
            }
        }

        if degenerate.has_multimember() {
            info!("applying post-PT variational calculation");
            let (energies, rotation) =
                post_pt::apply_post_pt_variational(&corrs, degenerate.groups())?;
            let record = DegenerateDataRecord {
                groups: degenerate.groups().iter().map(|g| g.excitations()).collect(),
                rotation: SparseTriplets::from_csr(&rotation),
                energies: energies.clone(),
            };
            self.checkpointer.set(
                "degenerate_data",
                &serde_json::to_vec(&record).expect("record serialization"),
            );
            corrs.degenerate_energies = Some(energies);
            corrs.degenerate_transformation = Some(rotation);
        }

        let results = ResultsRecord {
            states: self.states.excitations(),
            energies: corrs.energies().iter().copied().collect(),
            energy_corrections: corrs.energy_corrections.clone(),
        };
        self.checkpointer.set(
            "results",
            &serde_json::to_vec(&results).expect("record serialization"),
        );

        Ok(corrs)
    }

    /// One correction pass over every degenerate group.
    pub fn get_corrections(&mut self, degenerate: &DegenerateStateSpace) -> Result<Corrections> {
        self.ensure_representations()?;
        let flat = self.flat_total_space.as_ref().expect("loaded");
        let reps = self.representations.as_ref().expect("loaded");
        let e0 = self.zero_order_energies.as_ref().expect("loaded");

        let order = self.options.order;
        let nstates = self.states.len();
        info!(
            "applying PT: order {}, {} states, {} degenerate sets",
            order,
            nstates,
            degenerate.groups().iter().filter(|g| g.len() > 1).count()
        );

        let ctx = nondeg::EngineContext {
            perts: reps,
            zero_order: e0,
            flat,
            order,
            non_zero_cutoff: self.options.non_zero_cutoff,
            ignore_odd_orders: self.options.ignore_odd_order_energies,
            intermediate_normalization: self.options.intermediate_normalization,
        };

        let mut energy_corrections = vec![Vec::new(); nstates];
        let mut overlaps = vec![Vec::new(); nstates];
        let mut dense: Vec<Vec<DVector<f64>>> = vec![Vec::new(); nstates];

        // groups are sequential on purpose: each state's recursion is
        // independent and writes disjoint output rows
        for group in degenerate.groups() {
            let deg_positions = flat.find(group)?;
            for state in group.iter() {
                let n_pos = flat
                    .position(state)
                    .expect("targets are members of the flat total space");
                let result = nondeg::apply_nondeg_equations(&ctx, n_pos, &deg_positions)?;
                let s = self
                    .states
                    .position(state)
                    .expect("groups partition the target space");
                energy_corrections[s] = result.energies;
                overlaps[s] = result.overlaps;
                dense[s] = result.wavefunctions;
            }
        }

        // sparsify the correction rows and collect per-target support
        let cutoff = self.options.non_zero_cutoff;
        let mut supports: Vec<Vec<usize>> = vec![Vec::new(); nstates];
        let mut wavefunctions = Vec::with_capacity(order + 1);
        for o in 0..=order {
            let mut coo = nalgebra_sparse::coo::CooMatrix::new(nstates, flat.len());
            for (s, rows) in dense.iter().enumerate() {
                for (m, &v) in rows[o].iter().enumerate() {
                    if v.abs() > cutoff {
                        coo.push(s, m, v);
                        if !supports[s].contains(&m) {
                            supports[s].push(m);
                        }
                    }
                }
            }
            wavefunctions.push(nalgebra_sparse::csr::CsrMatrix::from(&coo));
        }
        let support_spaces = supports
            .into_iter()
            .map(|mut positions| {
                positions.sort_unstable();
                flat.take_subspace(&positions)
            })
            .collect();

        Ok(Corrections {
            states: self.states.clone(),
            coupled_states: SelectionRuleStateSpace::new(self.states.clone(), support_spaces),
            total_basis: flat.clone(),
            energy_corrections,
            overlaps,
            wavefunctions,
            hamiltonians: reps.clone(),
            degenerate_states: Some(degenerate.groups().to_vec()),
            degenerate_transformation: None,
            degenerate_energies: None,
        })
    }

    /// Zero-order energies of the target states alone, straight from the
    /// provider's diagonal block (the degeneracy classifier needs these
    /// before any coupled-space work happens).
    fn target_zero_order_energies(&self) -> Vec<f64> {
        let block = self
            .provider
            .matrix_elements(0, &self.states, &self.states, true);
        let mut e0 = vec![0.0; self.states.len()];
        for (i, _, v) in block.triplet_iter() {
            e0[i] = *v;
        }
        for (state, value) in &self.options.zero_order_overrides {
            if let Some(pos) = self.states.position(state) {
                e0[pos] = *value;
            }
        }
        e0
    }

    fn load_state_spaces(&mut self) -> Result<()> {
        if self.coupled_states.is_none() {
            info!("trying to load coupled states from checkpoint...");
            let cached = self.checkpointer.get("coupled_states").and_then(|bytes| {
                serde_json::from_slice::<CoupledSpacesRecord>(&bytes).ok()
            });
            let expected = self.provider.n_perturbations() - 1;
            let decoded = cached.and_then(|record| self.decode_coupled_record(record, expected));
            let spaces = match decoded {
                Some(spaces) => {
                    info!("loaded coupled states from checkpoint");
                    spaces
                }
                None => {
                    info!("failed to load, building instead...");
                    let mut builder = CoupledSpaceBuilder::new(
                        self.provider,
                        self.options.order,
                        self.options.memory_constrained,
                    );
                    let built = builder.build(&self.states);
                    let record = CoupledSpacesRecord {
                        spaces: built
                            .iter()
                            .map(|space| RuleSpaceRecord {
                                sources: space.sources().excitations(),
                                transformed: space
                                    .transformed()
                                    .iter()
                                    .map(|t| t.excitations())
                                    .collect(),
                            })
                            .collect(),
                    };
                    self.checkpointer.set(
                        "coupled_states",
                        &serde_json::to_vec(&record).expect("record serialization"),
                    );
                    built
                }
            };
            for (k, space) in spaces.iter().enumerate() {
                info!("H({}): {} coupled states", k + 1, space.to_single().len());
            }
            self.coupled_states = Some(spaces);
        }

        if self.flat_total_space.is_none() {
            let coupled = self.coupled_states.as_ref().expect("just set");
            let flat = coupled
                .iter()
                .fold(self.states.clone(), |acc, space| {
                    acc.union(&space.to_single())
                });
            info!("total coupled space dimension: {}", flat.len());
            self.flat_total_space = Some(flat);
        }
        Ok(())
    }

    fn decode_coupled_record(
        &self,
        record: CoupledSpacesRecord,
        expected: usize,
    ) -> Option<Vec<SelectionRuleStateSpace>> {
        if record.spaces.len() != expected {
            return None;
        }
        let basis = self.states.basis().clone();
        let mut spaces = Vec::with_capacity(expected);
        for entry in record.spaces {
            let sources = BasisStateSpace::from_excitations(basis.clone(), &entry.sources).ok()?;
            if entry.transformed.len() != sources.len() {
                return None;
            }
            let transformed = entry
                .transformed
                .iter()
                .map(|excs| BasisStateSpace::from_excitations(basis.clone(), excs).ok())
                .collect::<Option<Vec<_>>>()?;
            spaces.push(SelectionRuleStateSpace::new(sources, transformed));
        }
        Some(spaces)
    }

    fn ensure_representations(&mut self) -> Result<()> {
        if self.representations.is_some() {
            return Ok(());
        }
        self.load_state_spaces()?;
        let flat = self.flat_total_space.as_ref().expect("loaded").clone();
        let coupled = self.coupled_states.as_ref().expect("loaded");

        info!("trying to load representations from checkpoint...");
        let cached = self
            .checkpointer
            .get("representations")
            .and_then(|bytes| serde_json::from_slice::<RepresentationsRecord>(&bytes).ok())
            .and_then(|record| {
                if record.terms.len() != coupled.len() + 1 {
                    return None;
                }
                let terms = record
                    .terms
                    .iter()
                    .map(|t| match t {
                        None => Some(Perturbation::Zero),
                        Some(triplets) if triplets.nrows == flat.len() => {
                            Some(Perturbation::Matrix(triplets.to_csr()))
                        }
                        Some(_) => None,
                    })
                    .collect::<Option<Vec<_>>>()?;
                Some(PerturbationList::new(terms))
            });

        let reps = match cached {
            Some(reps) => {
                info!("loaded representations from checkpoint");
                reps
            }
            None => {
                info!(
                    "failed to load, building representations for {} perturbation orders...",
                    coupled.len() + 1
                );
                let built = assemble_representations(self.provider, &flat, coupled);
                let record = RepresentationsRecord {
                    terms: built
                        .iter()
                        .map(|term| match term {
                            Perturbation::Zero => None,
                            Perturbation::Matrix(m) => Some(SparseTriplets::from_csr(m)),
                        })
                        .collect(),
                };
                self.checkpointer.set(
                    "representations",
                    &serde_json::to_vec(&record).expect("record serialization"),
                );
                built
            }
        };

        let mut e0 = reps[0].diagonal(flat.len());
        for (state, value) in &self.options.zero_order_overrides {
            match flat.position(state) {
                Some(pos) => e0[pos] = *value,
                None => {
                    return Err(PerturbationTheoryError::Configuration(format!(
                        "zero-order energy override for state {} outside the total space",
                        state
                    )))
                }
            }
        }
        self.zero_order_energies = Some(e0);
        self.representations = Some(reps);
        Ok(())
    }
}
