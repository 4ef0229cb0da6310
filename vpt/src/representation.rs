//! Sparse perturbation-operator representations and the provider boundary.
//!
//! The solver never builds matrix elements itself: a [`RepresentationProvider`]
//! hands back blocks of elements restricted to a pair of state spaces, and the
//! assembly here embeds them into symmetric sparse matrices over the flat total
//! space. Absent perturbation orders are carried as [`Perturbation::Zero`] so
//! that every product can short-circuit exactly instead of multiplying through
//! an empty matrix.

extern crate nalgebra as na;

use std::collections::{BTreeMap, HashMap};
use std::ops::Index;
use std::sync::Arc;

use na::{DMatrix, DVector};
use nalgebra_sparse::coo::CooMatrix;
use nalgebra_sparse::csr::CsrMatrix;
use rayon::prelude::*;
use tracing::debug;

use basis::{BasisState, BasisStateSpace, HarmonicBasis, SelectionRuleStateSpace, SelectionRules};

/// External source of matrix elements for the perturbation expansion
/// `H0, H1, ..., H_order`.
///
/// Implementations signal "no elements" by returning an empty block, never by
/// erroring. Element values must be symmetric under bra/ket exchange.
pub trait RepresentationProvider: Sync {
    /// Number of operators in the expansion, counting `H0`.
    fn n_perturbations(&self) -> usize;

    /// Allowed quantum-number transitions for `H_order` (`order >= 1`).
    fn selection_rules(&self, order: usize) -> SelectionRules;

    /// Matrix elements `<bra_i|H_order|ket_j>` in local block coordinates.
    /// With `diagonal` set only the `(i, i)` elements are requested
    /// (`bra` and `ket` are the same space).
    fn matrix_elements(
        &self,
        order: usize,
        bra: &BasisStateSpace,
        ket: &BasisStateSpace,
        diagonal: bool,
    ) -> CooMatrix<f64>;
}

/// One term of the perturbation expansion as the solver consumes it.
#[derive(Debug, Clone)]
pub enum Perturbation {
    /// A legitimately absent order; every product with it is exactly zero and
    /// is skipped without any sparse arithmetic.
    Zero,
    Matrix(CsrMatrix<f64>),
}

impl Perturbation {
    pub fn is_zero(&self) -> bool {
        matches!(self, Perturbation::Zero)
    }

    pub fn element(&self, i: usize, j: usize) -> f64 {
        match self {
            Perturbation::Zero => 0.0,
            Perturbation::Matrix(m) => m
                .get_entry(i, j)
                .map(|e| e.into_value())
                .unwrap_or(0.0),
        }
    }

    /// Dense copy of the diagonal (length `n`).
    pub fn diagonal(&self, n: usize) -> DVector<f64> {
        let mut diag = DVector::zeros(n);
        if let Perturbation::Matrix(m) = self {
            for (i, j, v) in m.triplet_iter() {
                if i == j {
                    diag[i] = *v;
                }
            }
        }
        diag
    }

    /// `H v`, or `None` when the operator is the exact scalar zero.
    pub fn apply_vec(&self, v: &DVector<f64>) -> Option<DVector<f64>> {
        match self {
            Perturbation::Zero => None,
            Perturbation::Matrix(m) => {
                let mut out = DVector::zeros(m.nrows());
                for (i, j, val) in m.triplet_iter() {
                    out[i] += val * v[j];
                }
                Some(out)
            }
        }
    }

    /// `H M` for a dense right factor, or `None` for the zero operator.
    pub fn apply_dense(&self, rhs: &DMatrix<f64>) -> Option<DMatrix<f64>> {
        match self {
            Perturbation::Zero => None,
            Perturbation::Matrix(m) => {
                let mut out = DMatrix::zeros(m.nrows(), rhs.ncols());
                for (i, j, val) in m.triplet_iter() {
                    for c in 0..rhs.ncols() {
                        out[(i, c)] += val * rhs[(j, c)];
                    }
                }
                Some(out)
            }
        }
    }

    /// `<i|H|v>`: a single row contracted against a dense vector.
    pub fn row_dot(&self, i: usize, v: &DVector<f64>) -> f64 {
        match self {
            Perturbation::Zero => 0.0,
            Perturbation::Matrix(m) => {
                let row = m.row(i);
                row.col_indices()
                    .iter()
                    .zip(row.values())
                    .map(|(&j, val)| val * v[j])
                    .sum()
            }
        }
    }
}

static ZERO: Perturbation = Perturbation::Zero;

/// The expansion `H0..=H_order`, indexable past the end: any order beyond the
/// stored terms reads as [`Perturbation::Zero`].
#[derive(Debug, Clone)]
pub struct PerturbationList {
    terms: Vec<Perturbation>,
}

impl PerturbationList {
    pub fn new(terms: Vec<Perturbation>) -> Self {
        PerturbationList { terms }
    }

    /// Number of stored terms, counting `H0`.
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Perturbation> {
        self.terms.iter()
    }
}

impl Index<usize> for PerturbationList {
    type Output = Perturbation;

    fn index(&self, order: usize) -> &Perturbation {
        self.terms.get(order).unwrap_or(&ZERO)
    }
}

/// Materializes the expansion over the flat total space: a diagonal `H0` plus
/// one symmetric sparse matrix per coupled space.
///
/// Element blocks are computed in a data-parallel map over the independent
/// (source, reachable-set) pairs and merged deterministically by index before
/// the sparse matrices are built.
pub fn assemble_representations<P: RepresentationProvider>(
    provider: &P,
    flat: &BasisStateSpace,
    coupled: &[SelectionRuleStateSpace],
) -> PerturbationList {
    let n = flat.len();
    let mut terms = Vec::with_capacity(coupled.len() + 1);

    let diag_block = provider.matrix_elements(0, flat, flat, true);
    let mut h0 = CooMatrix::new(n, n);
    for (i, j, v) in diag_block.triplet_iter() {
        h0.push(i, j, *v);
    }
    terms.push(Perturbation::Matrix(CsrMatrix::from(&h0)));

    for (k, space) in coupled.iter().enumerate() {
        let order = k + 1;
        let blocks: Vec<Vec<(usize, usize, f64)>> = (0..space.sources().len())
            .into_par_iter()
            .map(|pos| {
                let result_space = space.result_for(pos);
                if result_space.is_empty() {
                    return Vec::new();
                }
                let bra = space.sources().take_subspace(&[pos]);
                let block = provider.matrix_elements(order, &bra, result_space, false);
                let i_flat = flat
                    .position(bra.state(0))
                    .expect("coupled sources live in the flat total space");
                let mut entries = Vec::with_capacity(block.nnz());
                for (_, j_local, v) in block.triplet_iter() {
                    let j_flat = flat
                        .position(result_space.state(j_local))
                        .expect("coupled results live in the flat total space");
                    entries.push((i_flat, j_flat, *v));
                }
                entries
            })
            .collect();

        // symmetric embedding; the BTreeMap keeps the merge order independent
        // of the parallel schedule
        let mut merged: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for block in blocks {
            for (i, j, v) in block {
                merged.insert((i, j), v);
                merged.insert((j, i), v);
            }
        }
        merged.retain(|_, v| *v != 0.0);

        if merged.is_empty() {
            debug!("H({}) has no elements over its coupled space", order);
            terms.push(Perturbation::Zero);
        } else {
            let mut coo = CooMatrix::new(n, n);
            for ((i, j), v) in merged {
                coo.push(i, j, v);
            }
            terms.push(Perturbation::Matrix(CsrMatrix::from(&coo)));
        }
    }

    PerturbationList::new(terms)
}

/// A representation provider backed by explicit element tables: a harmonic
/// diagonal for `H0` plus, per order, a rule set and tabulated couplings.
///
/// This is the provider the binary and the scenario tests run against; real
/// Hamiltonian expansions plug in through the same trait.
pub struct TabulatedProvider {
    basis: Arc<HarmonicBasis>,
    frequencies: Vec<f64>,
    operators: Vec<TabulatedOperator>,
}

struct TabulatedOperator {
    rules: SelectionRules,
    elements: HashMap<(u64, u64), f64>,
}

impl TabulatedProvider {
    pub fn new(basis: Arc<HarmonicBasis>, frequencies: Vec<f64>) -> Self {
        assert_eq!(
            frequencies.len(),
            basis.n_modes(),
            "one harmonic frequency per mode"
        );
        TabulatedProvider {
            basis,
            frequencies,
            operators: Vec::new(),
        }
    }

    pub fn basis(&self) -> &Arc<HarmonicBasis> {
        &self.basis
    }

    /// Registers the next perturbation order with its selection rules.
    pub fn add_operator(&mut self, rules: SelectionRules) {
        self.operators.push(TabulatedOperator {
            rules,
            elements: HashMap::new(),
        });
    }

    /// Tabulates `<bra|H_order|ket>`; storage is symmetric.
    pub fn set_element(&mut self, order: usize, bra: &BasisState, ket: &BasisState, value: f64) {
        assert!(order >= 1 && order <= self.operators.len(), "unknown order");
        let bi = self.basis.index_of(bra);
        let ki = self.basis.index_of(ket);
        let key = (bi.min(ki), bi.max(ki));
        self.operators[order - 1].elements.insert(key, value);
    }

    /// Harmonic zero-order energy `sum_m w_m (q_m + 1/2)`.
    pub fn zero_order_energy(&self, state: &BasisState) -> f64 {
        state
            .quanta()
            .iter()
            .zip(self.frequencies.iter())
            .map(|(&q, &w)| w * (q as f64 + 0.5))
            .sum()
    }
}

impl RepresentationProvider for TabulatedProvider {
    fn n_perturbations(&self) -> usize {
        self.operators.len() + 1
    }

    fn selection_rules(&self, order: usize) -> SelectionRules {
        assert!(order >= 1 && order <= self.operators.len(), "unknown order");
        self.operators[order - 1].rules.clone()
    }

    fn matrix_elements(
        &self,
        order: usize,
        bra: &BasisStateSpace,
        ket: &BasisStateSpace,
        diagonal: bool,
    ) -> CooMatrix<f64> {
        let mut coo = CooMatrix::new(bra.len(), ket.len());
        if order == 0 {
            for (i, state) in bra.iter().enumerate() {
                coo.push(i, i, self.zero_order_energy(state));
            }
            return coo;
        }
        let op = &self.operators[order - 1];
        for (i, &bi) in bra.indices().iter().enumerate() {
            if diagonal {
                if let Some(&v) = op.elements.get(&(bi, bi)) {
                    coo.push(i, i, v);
                }
                continue;
            }
            for (j, &ki) in ket.indices().iter().enumerate() {
                let key = (bi.min(ki), bi.max(ki));
                if let Some(&v) = op.elements.get(&key) {
                    coo.push(i, j, v);
                }
            }
        }
        coo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_state_setup() -> (Arc<HarmonicBasis>, BasisStateSpace, TabulatedProvider) {
        let basis = Arc::new(HarmonicBasis::new(1));
        let states =
            BasisStateSpace::from_excitations(basis.clone(), &[vec![0], vec![1]]).unwrap();
        let mut provider = TabulatedProvider::new(basis.clone(), vec![1.0]);
        provider.add_operator(SelectionRules::new(vec![vec![1], vec![-1]]));
        provider.set_element(
            1,
            &BasisState::new(vec![0]),
            &BasisState::new(vec![1]),
            0.25,
        );
        (basis, states, provider)
    }

    #[test]
    fn test_tabulated_zero_order_energies() {
        let (_, states, provider) = two_state_setup();
        assert_eq!(provider.zero_order_energy(states.state(0)), 0.5);
        assert_eq!(provider.zero_order_energy(states.state(1)), 1.5);
    }

    #[test]
    fn test_past_the_end_indexing_reads_zero() {
        let perts = PerturbationList::new(vec![Perturbation::Zero]);
        assert!(perts[5].is_zero());
    }

    #[test]
    fn test_assembly_embeds_symmetric_elements() {
        let (_, states, provider) = two_state_setup();
        let coupled = vec![states.apply_selection_rules(&provider.selection_rules(1), 1)];
        let flat = states.union(&coupled[0].to_single());
        let reps = assemble_representations(&provider, &flat, &coupled);

        // H0 diagonal
        assert_eq!(reps[0].element(0, 0), 0.5);
        assert_eq!(reps[0].element(1, 1), 1.5);
        // H1 symmetric off-diagonal
        assert_eq!(reps[1].element(0, 1), 0.25);
        assert_eq!(reps[1].element(1, 0), 0.25);
        assert_eq!(reps[1].element(0, 0), 0.0);
        // H2 absent entirely
        assert!(reps[2].is_zero());
    }

    #[test]
    fn test_zero_short_circuits_products() {
        let v = DVector::from_vec(vec![1.0, 2.0]);
        assert!(Perturbation::Zero.apply_vec(&v).is_none());
        assert_eq!(Perturbation::Zero.row_dot(0, &v), 0.0);
    }

    #[test]
    fn test_apply_vec_matches_elements() {
        let (_, states, provider) = two_state_setup();
        let coupled = vec![states.apply_selection_rules(&provider.selection_rules(1), 1)];
        let flat = states.union(&coupled[0].to_single());
        let reps = assemble_representations(&provider, &flat, &coupled);

        let n = flat.len();
        let mut unit = DVector::zeros(n);
        unit[0] = 1.0;
        let applied = reps[1].apply_vec(&unit).unwrap();
        assert_eq!(applied[1], 0.25);
        assert_eq!(applied[0], 0.0);
    }
}
