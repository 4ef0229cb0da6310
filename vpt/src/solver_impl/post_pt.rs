//! Post-PT variational resolution of degenerate groups.
//!
//! Each multi-member group gets an effective Hamiltonian built in the basis
//! of its non-degenerate corrections and diagonalized outright; the resulting
//! rotation replaces perturbative mixing inside the group, which is exactly
//! where the perturbative series is not trustworthy.

extern crate nalgebra as na;

use na::DMatrix;
use nalgebra_sparse::coo::CooMatrix;
use nalgebra_sparse::csr::CsrMatrix;
use tracing::{info, warn};

use basis::BasisStateSpace;

use crate::solver_impl::corrections::Corrections;
use crate::solver_impl::Result;

/// Rotated energies plus the block-diagonal rotation over all targets.
///
/// Singleton groups contribute identity blocks; multi-member groups get the
/// eigenvectors of their effective Hamiltonian, resorted onto the input
/// states.
pub(crate) fn apply_post_pt_variational(
    corrs: &Corrections,
    degenerate: &[BasisStateSpace],
) -> Result<(Vec<f64>, CsrMatrix<f64>)> {
    let n = corrs.states.len();
    let mut energies = corrs.summed_energies();
    let mut rotation = CooMatrix::new(n, n);

    for group in degenerate {
        let positions = corrs.states.find(group)?;
        if positions.len() == 1 {
            rotation.push(positions[0], positions[0], 1.0);
            continue;
        }
        let (group_energies, block) = degenerate_rotation(corrs, group)?;
        for (r, &i) in positions.iter().enumerate() {
            energies[i] = group_energies[r];
            for (c, &j) in positions.iter().enumerate() {
                rotation.push(i, j, block[(r, c)]);
            }
        }
    }

    Ok((energies, CsrMatrix::from(&rotation)))
}

/// Diagonalizes one group's effective Hamiltonian and maps the eigenvectors
/// back onto the input states.
pub(crate) fn degenerate_rotation(
    corrs: &Corrections,
    group: &BasisStateSpace,
) -> Result<(Vec<f64>, DMatrix<f64>)> {
    let subcorrs = corrs.take_subspace(group)?;
    let transformed = subcorrs.operator_representation(&corrs.hamiltonians, None, None)?;
    let g = group.len();
    let mut h_eff = DMatrix::zeros(g, g);
    for term in &transformed {
        h_eff += term;
    }

    info!("degenerate block of {} states:", g);
    for state in group.iter() {
        info!("  {}", state);
    }

    let eig = h_eff.symmetric_eigen();
    // ascending-eigenvalue order before the overlap matching
    let mut ascending: Vec<usize> = (0..g).collect();
    ascending.sort_by(|&a, &b| {
        eig.eigenvalues[a]
            .partial_cmp(&eig.eigenvalues[b])
            .expect("eigenvalues of a real symmetric matrix")
    });
    let eigenvalues: Vec<f64> = ascending.iter().map(|&i| eig.eigenvalues[i]).collect();
    let vectors = eig.eigenvectors.select_columns(ascending.iter());

    for i in 0..g {
        let max_ov = vectors.column(i).iter().map(|v| v * v).fold(0.0, f64::max);
        if max_ov < 0.5 {
            // downstream labels for this state are ambiguous
            warn!("state {} of degenerate block is more than 50% mixed", i);
        }
    }

    // greedily hand each input state the eigenvector it overlaps most,
    // zeroing the claimed column so no two inputs share one; this is a
    // matching heuristic, not a globally optimal assignment
    let mut claim = vectors.map(|v| v.abs());
    let mut sorting = vec![0usize; g];
    for i in 0..g {
        let mut best = 0;
        let mut best_val = f64::MIN;
        for o in 0..g {
            if claim[(i, o)] > best_val {
                best_val = claim[(i, o)];
                best = o;
            }
        }
        sorting[i] = best;
        for r in 0..g {
            claim[(r, best)] = 0.0;
        }
    }

    let sorted_energies: Vec<f64> = sorting.iter().map(|&o| eigenvalues[o]).collect();
    let block = vectors.select_columns(sorting.iter());

    info!("rotated energies for the block: {:?}", sorted_energies);

    Ok((sorted_energies, block))
}
