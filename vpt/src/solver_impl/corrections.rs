//! The corrections produced by a perturbation-theory run, with the services
//! downstream consumers need: subspace restriction, operator representations
//! in the corrected basis, overlap diagnostics, and a flat archive format
//! whose round-trip reproduces every number bit for bit.

extern crate nalgebra as na;

use std::sync::Arc;

use na::{DMatrix, DVector};
use nalgebra_sparse::coo::CooMatrix;
use nalgebra_sparse::csr::CsrMatrix;
use serde::{Deserialize, Serialize};

use basis::{BasisStateSpace, HarmonicBasis, SelectionRuleStateSpace};

use crate::representation::{Perturbation, PerturbationList};
use crate::solver_impl::{PerturbationTheoryError, Result};

/// Per-order corrections for a set of target states.
///
/// Owned by the solver invocation that produced it; read-only downstream.
#[derive(Debug, Clone)]
pub struct Corrections {
    /// The target states.
    pub states: BasisStateSpace,
    /// Per-target support: the states each target's corrections touch.
    pub coupled_states: SelectionRuleStateSpace,
    /// The flat total space the wavefunction rows are expressed over.
    pub total_basis: BasisStateSpace,
    /// `energy_corrections[s][k]` is the order-`k` energy of target `s`.
    pub energy_corrections: Vec<Vec<f64>>,
    /// `overlaps[s][k]` is `<n^(0)|n^(k)>` for target `s`.
    pub overlaps: Vec<Vec<f64>>,
    /// One sparse `(n_targets x n_total)` coefficient matrix per order.
    pub wavefunctions: Vec<CsrMatrix<f64>>,
    /// The Hamiltonian expansion the corrections were computed from.
    pub hamiltonians: PerturbationList,
    /// The degenerate grouping used, when one was in play.
    pub degenerate_states: Option<Vec<BasisStateSpace>>,
    /// Block-diagonal rotation from the post-PT variational pass.
    pub degenerate_transformation: Option<CsrMatrix<f64>>,
    /// Rotated energies replacing the summed corrections.
    pub degenerate_energies: Option<Vec<f64>>,
}

impl Corrections {
    /// Correction order (the highest `k` with data).
    pub fn order(&self) -> usize {
        self.energy_corrections[0].len() - 1
    }

    pub fn is_degenerate(&self) -> bool {
        self.degenerate_transformation.is_some()
    }

    /// Total energies: the degenerate-rotated ones when present, otherwise
    /// the per-order sums.
    pub fn energies(&self) -> DVector<f64> {
        match &self.degenerate_energies {
            Some(engs) => DVector::from_vec(engs.clone()),
            None => DVector::from_vec(self.summed_energies()),
        }
    }

    /// Per-order sums, ignoring any degenerate rotation.
    pub fn summed_energies(&self) -> Vec<f64> {
        self.energy_corrections
            .iter()
            .map(|row| row.iter().sum())
            .collect()
    }

    /// Restriction to the targets in `space` (degenerate data, which is tied
    /// to the full target list, is carried through untouched).
    pub fn take_subspace(&self, space: &BasisStateSpace) -> Result<Corrections> {
        let positions = self.states.find(space)?;
        let wavefunctions = self
            .wavefunctions
            .iter()
            .map(|w| take_rows(w, &positions))
            .collect();
        Ok(Corrections {
            states: self.states.take_subspace(&positions),
            coupled_states: self.coupled_states.take_sources(space),
            total_basis: self.total_basis.clone(),
            energy_corrections: positions
                .iter()
                .map(|&p| self.energy_corrections[p].clone())
                .collect(),
            overlaps: positions.iter().map(|&p| self.overlaps[p].clone()).collect(),
            wavefunctions,
            hamiltonians: self.hamiltonians.clone(),
            degenerate_states: self.degenerate_states.clone(),
            degenerate_transformation: self.degenerate_transformation.clone(),
            degenerate_energies: self.degenerate_energies.clone(),
        })
    }

    /// Representation of an operator expansion in the corrected basis:
    ///
    /// ```text
    /// O^(k) = sum_{a+b+c=k} psi^(a) . O_c . psi^(b)^T
    /// ```
    ///
    /// A shorter expansion is zero-padded; asking for more orders than the
    /// corrections carry is a configuration error. With `subspace` given the
    /// wavefunction columns are restricted to it (the expansion must then be
    /// defined over that subspace).
    pub fn operator_representation(
        &self,
        expansion: &PerturbationList,
        order: Option<usize>,
        subspace: Option<&BasisStateSpace>,
    ) -> Result<Vec<DMatrix<f64>>> {
        let mordor = self.order();
        let order = order.unwrap_or(mordor);
        if order > mordor {
            return Err(PerturbationTheoryError::Configuration(format!(
                "can't correct up to order {} when zero-order states were only corrected up to order {}",
                order, mordor
            )));
        }
        let n_terms = order + 1;

        let wfns: Vec<DMatrix<f64>> = match subspace {
            None => (0..n_terms).map(|k| to_dense(&self.wavefunctions[k])).collect(),
            Some(sub) => {
                let sel = self.total_basis.find(sub)?;
                (0..n_terms)
                    .map(|k| {
                        let full = to_dense(&self.wavefunctions[k]);
                        full.select_columns(sel.iter())
                    })
                    .collect()
            }
        };

        let g = self.states.len();
        let mut reps = Vec::with_capacity(n_terms);
        for k in 0..n_terms {
            let mut op = DMatrix::zeros(g, g);
            for a in 0..=k {
                for b in 0..=(k - a) {
                    let c = k - a - b;
                    // zero operators short-circuit the whole product
                    if let Some(tmp) = expansion[c].apply_dense(&wfns[b].transpose()) {
                        op += &wfns[a] * tmp;
                    }
                }
            }
            reps.push(op);
        }
        Ok(reps)
    }

    /// Per-order overlap matrices `sum_i psi^(i) . psi^(k-i)^T`.
    pub fn overlap_matrices(&self) -> Vec<DMatrix<f64>> {
        let order = self.order();
        let dense: Vec<DMatrix<f64>> =
            (0..=order).map(|k| to_dense(&self.wavefunctions[k])).collect();
        (0..=order)
            .map(|k| {
                let mut ov = DMatrix::zeros(self.states.len(), self.states.len());
                for i in 0..=k {
                    ov += &dense[i] * dense[k - i].transpose();
                }
                ov
            })
            .collect()
    }

    pub fn to_archive(&self) -> CorrectionsArchive {
        CorrectionsArchive {
            n_modes: self.states.basis().n_modes(),
            states: self.states.excitations(),
            coupled_states: self
                .coupled_states
                .transformed()
                .iter()
                .map(|s| s.excitations())
                .collect(),
            total_states: self.total_basis.excitations(),
            energies: self.energy_corrections.clone(),
            overlaps: self.overlaps.clone(),
            wavefunctions: self.wavefunctions.iter().map(SparseTriplets::from_csr).collect(),
            hamiltonians: self
                .hamiltonians
                .iter()
                .map(|h| match h {
                    Perturbation::Zero => None,
                    Perturbation::Matrix(m) => Some(SparseTriplets::from_csr(m)),
                })
                .collect(),
            degenerate_states: self
                .degenerate_states
                .as_ref()
                .map(|groups| groups.iter().map(|g| g.excitations()).collect()),
            degenerate_transformation: self
                .degenerate_transformation
                .as_ref()
                .map(SparseTriplets::from_csr),
            degenerate_energies: self.degenerate_energies.clone(),
        }
    }

    pub fn from_archive(archive: &CorrectionsArchive) -> Result<Corrections> {
        let basis = Arc::new(HarmonicBasis::new(archive.n_modes));
        let states = BasisStateSpace::from_excitations(basis.clone(), &archive.states)?;
        let total_basis =
            BasisStateSpace::from_excitations(basis.clone(), &archive.total_states)?;
        let supports = archive
            .coupled_states
            .iter()
            .map(|excs| BasisStateSpace::from_excitations(basis.clone(), excs))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let degenerate_states = match &archive.degenerate_states {
            None => None,
            Some(groups) => Some(
                groups
                    .iter()
                    .map(|excs| BasisStateSpace::from_excitations(basis.clone(), excs))
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            ),
        };
        Ok(Corrections {
            coupled_states: SelectionRuleStateSpace::new(states.clone(), supports),
            states,
            total_basis,
            energy_corrections: archive.energies.clone(),
            overlaps: archive.overlaps.clone(),
            wavefunctions: archive.wavefunctions.iter().map(SparseTriplets::to_csr).collect(),
            hamiltonians: PerturbationList::new(
                archive
                    .hamiltonians
                    .iter()
                    .map(|h| match h {
                        None => Perturbation::Zero,
                        Some(t) => Perturbation::Matrix(t.to_csr()),
                    })
                    .collect(),
            ),
            degenerate_states,
            degenerate_transformation: archive
                .degenerate_transformation
                .as_ref()
                .map(SparseTriplets::to_csr),
            degenerate_energies: archive.degenerate_energies.clone(),
        })
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_archive()).expect("archive serialization is infallible")
    }

    pub fn from_json(bytes: &[u8]) -> Result<Corrections> {
        let archive: CorrectionsArchive = serde_json::from_slice(bytes).map_err(|err| {
            PerturbationTheoryError::Configuration(format!("malformed corrections archive: {}", err))
        })?;
        Self::from_archive(&archive)
    }
}

/// Flat serialization of a [`Corrections`] value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionsArchive {
    pub n_modes: usize,
    pub states: Vec<Vec<u32>>,
    pub coupled_states: Vec<Vec<Vec<u32>>>,
    pub total_states: Vec<Vec<u32>>,
    pub energies: Vec<Vec<f64>>,
    pub overlaps: Vec<Vec<f64>>,
    pub wavefunctions: Vec<SparseTriplets>,
    pub hamiltonians: Vec<Option<SparseTriplets>>,
    pub degenerate_states: Option<Vec<Vec<Vec<u32>>>>,
    pub degenerate_transformation: Option<SparseTriplets>,
    pub degenerate_energies: Option<Vec<f64>>,
}

/// Triplet form of a sparse matrix, the archive's exchange format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseTriplets {
    pub nrows: usize,
    pub ncols: usize,
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    pub values: Vec<f64>,
}

impl SparseTriplets {
    pub fn from_csr(m: &CsrMatrix<f64>) -> Self {
        let mut rows = Vec::with_capacity(m.nnz());
        let mut cols = Vec::with_capacity(m.nnz());
        let mut values = Vec::with_capacity(m.nnz());
        for (i, j, v) in m.triplet_iter() {
            rows.push(i);
            cols.push(j);
            values.push(*v);
        }
        SparseTriplets {
            nrows: m.nrows(),
            ncols: m.ncols(),
            rows,
            cols,
            values,
        }
    }

    pub fn to_csr(&self) -> CsrMatrix<f64> {
        let coo = CooMatrix::try_from_triplets(
            self.nrows,
            self.ncols,
            self.rows.clone(),
            self.cols.clone(),
            self.values.clone(),
        )
        .expect("triplets produced from a valid matrix");
        CsrMatrix::from(&coo)
    }
}

fn to_dense(m: &CsrMatrix<f64>) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(m.nrows(), m.ncols());
    for (i, j, v) in m.triplet_iter() {
        out[(i, j)] = *v;
    }
    out
}

fn take_rows(m: &CsrMatrix<f64>, positions: &[usize]) -> CsrMatrix<f64> {
    let mut coo = CooMatrix::new(positions.len(), m.ncols());
    for (new_row, &old_row) in positions.iter().enumerate() {
        let row = m.row(old_row);
        for (&j, &v) in row.col_indices().iter().zip(row.values()) {
            coo.push(new_row, j, v);
        }
    }
    CsrMatrix::from(&coo)
}
