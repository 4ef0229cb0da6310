//! The numeric non-degenerate perturbation recursion for a single state.
//!
//! Iterative equations, per target state `n`:
//!
//! ```text
//! En^(k)        = <n^(0)|H^(k)|n^(0)> + sum(<n^(0)|H^(k-i)|n^(i)> - E^(k-i)<n^(0)|n^(i)>, i=1..k-1)
//! <n^(0)|n^(k)> = -1/2 sum(<n^(i)|n^(k-i)>, i=1..k-1)
//! |n^(k)>       = sum(Pi_n (E^(k-i) - H^(k-i)) |n^(i)>, i=0..k-1) + <n^(0)|n^(k)> |n^(0)>
//! ```
//!
//! where `Pi_n` is the resolvent `1/(E_m - E_n)` outside the degenerate group
//! of `n` and exactly zero on it. Projecting the group out is the device that
//! keeps vanishing denominators out of the sums; a small denominator outside
//! the group is an error, never a silent NaN.

extern crate nalgebra as na;

use na::DVector;
use tracing::debug;

use basis::BasisStateSpace;

use crate::representation::PerturbationList;
use crate::solver_impl::{PerturbationTheoryError, Result};

/// Shared inputs for the per-state recursion.
pub(crate) struct EngineContext<'a> {
    pub perts: &'a PerturbationList,
    pub zero_order: &'a DVector<f64>,
    pub flat: &'a BasisStateSpace,
    pub order: usize,
    pub non_zero_cutoff: f64,
    pub ignore_odd_orders: bool,
    pub intermediate_normalization: bool,
}

/// Raw per-order corrections for one state, dense over the flat space.
pub(crate) struct StateCorrections {
    pub energies: Vec<f64>,
    pub overlaps: Vec<f64>,
    pub wavefunctions: Vec<DVector<f64>>,
}

/// Diagonal of the resolvent for state `n`: `1/(E_m - E_n)` for every state
/// outside the degenerate group, exactly zero inside it.
fn build_resolvent(
    ctx: &EngineContext,
    n_pos: usize,
    in_group: &[bool],
) -> Result<DVector<f64>> {
    let n = ctx.flat.len();
    let e_n = ctx.zero_order[n_pos];
    let mut pi = DVector::zeros(n);
    let mut offenders = Vec::new();
    for m in 0..n {
        if in_group[m] {
            continue;
        }
        let gap = ctx.zero_order[m] - e_n;
        if gap.abs() < ctx.non_zero_cutoff {
            offenders.push(m);
        } else {
            pi[m] = 1.0 / gap;
        }
    }
    if !offenders.is_empty() {
        // summary statistics over the offending energies plus E_n itself
        let mut bad = vec![e_n];
        bad.extend(offenders.iter().map(|&m| ctx.zero_order[m]));
        let mean = bad.iter().sum::<f64>() / bad.len() as f64;
        let var = bad.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / bad.len() as f64;
        return Err(PerturbationTheoryError::DegeneracyEncountered {
            state: ctx.flat.indices()[n_pos],
            others: offenders.iter().map(|&m| ctx.flat.indices()[m]).collect(),
            mean,
            stddev: var.sqrt(),
        });
    }
    Ok(pi)
}

/// Runs the recursion for the state at flat position `n_pos`, with
/// `deg_positions` naming the members of its degenerate group (always
/// including `n_pos` itself).
pub(crate) fn apply_nondeg_equations(
    ctx: &EngineContext,
    n_pos: usize,
    deg_positions: &[usize],
) -> Result<StateCorrections> {
    let n = ctx.flat.len();
    let order = ctx.order;
    let state_index = ctx.flat.indices()[n_pos];

    let mut in_group = vec![false; n];
    for &d in deg_positions {
        in_group[d] = true;
    }
    let pi = build_resolvent(ctx, n_pos, &in_group)?;

    let mut energies = Vec::with_capacity(order + 1);
    let mut overlaps = Vec::with_capacity(order + 1);
    let mut wfns: Vec<DVector<f64>> = Vec::with_capacity(order + 1);

    energies.push(ctx.zero_order[n_pos]);
    overlaps.push(1.0);
    let mut unit = DVector::zeros(n);
    unit[n_pos] = 1.0;
    wfns.push(unit);

    for k in 1..=order {
        let ek = if ctx.ignore_odd_orders && k % 2 == 1 {
            debug!("skipping order {} for the energy (assumed to be 0)", k);
            0.0
        } else {
            let mut ek = ctx.perts[k].element(n_pos, n_pos);
            for i in 1..k {
                ek += ctx.perts[k - i].row_dot(n_pos, &wfns[i]) - energies[k - i] * overlaps[i];
            }
            ek
        };
        energies.push(ek);

        // |n^(k)> before the overlap coefficient goes in
        let mut psi = DVector::zeros(n);
        for i in 0..k {
            let e_coeff = energies[k - i];
            let h_psi = ctx.perts[k - i].apply_vec(&wfns[i]);
            match h_psi {
                None => {
                    if e_coeff.abs() > ctx.non_zero_cutoff {
                        for m in 0..n {
                            psi[m] += pi[m] * e_coeff * wfns[i][m];
                        }
                    }
                }
                Some(hv) => {
                    if e_coeff.abs() > ctx.non_zero_cutoff {
                        for m in 0..n {
                            psi[m] += pi[m] * (e_coeff * wfns[i][m] - hv[m]);
                        }
                    } else {
                        // skip a pointless dense combination when the energy
                        // factor is an exact zero
                        for m in 0..n {
                            psi[m] -= pi[m] * hv[m];
                        }
                    }
                }
            }
        }

        // the resolvent must have zeroed the whole degenerate group
        for &d in deg_positions {
            if psi[d] != 0.0 {
                return Err(PerturbationTheoryError::OverlapInconsistency {
                    state: state_index,
                    order: k,
                    overlap: psi[d],
                });
            }
        }

        let ok = if ctx.intermediate_normalization {
            0.0
        } else {
            -0.5 * (1..k).map(|i| wfns[i].dot(&wfns[k - i])).sum::<f64>()
        };
        overlaps.push(ok);
        psi[n_pos] = ok;
        wfns.push(psi);
    }

    if !ctx.intermediate_normalization {
        let mut total = 0.0;
        for k in 0..=order {
            for i in 0..=k {
                total += wfns[i].dot(&wfns[k - i]);
            }
        }
        if (total - 1.0).abs() > 0.005 {
            return Err(PerturbationTheoryError::NormalizationFailure {
                state: state_index,
                order,
                overlap: total,
            });
        }
    }

    Ok(StateCorrections {
        energies,
        overlaps,
        wavefunctions: wfns,
    })
}
