//! Partitioning of target states into degenerate groups.
//!
//! Groups come from one of four specifications decided once at the config
//! boundary, plus the post-hoc strong-coupling detection that can merge
//! groups after a first correction pass.

extern crate nalgebra as na;

use na::DVector;
use tracing::{debug, info};

use basis::{BasisState, BasisStateSpace};

use crate::representation::Perturbation;
use crate::solver_impl::{PerturbationTheoryError, Result};

/// How target states should be grouped into degenerate sets.
#[derive(Debug, Clone, PartialEq)]
pub enum DegeneracySpec {
    /// Every state is its own group (plain non-degenerate theory).
    Singletons,
    /// Cluster states whose zero-order energies lie within the cutoff.
    EnergyCutoff(f64),
    /// Explicit excitation-vector groups.
    Groups(Vec<Vec<Vec<u32>>>),
    /// Group states sharing the value of a quantum-number linear functional.
    Polyad(Vec<i64>),
}

/// A partition of the target space into disjoint groups, each with at least
/// one member; the union of the groups is the full target space.
#[derive(Debug, Clone)]
pub struct DegenerateStateSpace {
    groups: Vec<BasisStateSpace>,
}

impl DegenerateStateSpace {
    pub fn groups(&self) -> &[BasisStateSpace] {
        &self.groups
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn has_multimember(&self) -> bool {
        self.groups.iter().any(|g| g.len() > 1)
    }

    pub fn singletons(states: &BasisStateSpace) -> Self {
        let groups = (0..states.len())
            .map(|p| states.take_subspace(&[p]))
            .collect();
        DegenerateStateSpace { groups }
    }

    /// Builds the partition for a spec; `zero_order` carries the zero-order
    /// energy of each target state, parallel to `states`.
    pub fn from_spec(
        spec: &DegeneracySpec,
        states: &BasisStateSpace,
        zero_order: &[f64],
    ) -> Result<Self> {
        assert_eq!(states.len(), zero_order.len());
        let grouped = match spec {
            DegeneracySpec::Singletons => Self::singletons(states),
            DegeneracySpec::EnergyCutoff(cutoff) => {
                info!("grouping degeneracies by energy cutoff: {:.6e}", cutoff);
                Self::by_energy_cutoff(states, zero_order, *cutoff)?
            }
            DegeneracySpec::Groups(groups) => {
                info!("grouping degeneracies from {} explicit groups", groups.len());
                Self::by_explicit_groups(states, groups)?
            }
            DegeneracySpec::Polyad(vector) => {
                info!("grouping degeneracies by polyad vector {:?}", vector);
                Self::by_polyad(states, vector)?
            }
        };
        let n_multi = grouped.groups.iter().filter(|g| g.len() > 1).count();
        info!("{} degenerate state sets found", n_multi);
        Ok(grouped)
    }

    /// Single-pass greedy clustering: each still-ungrouped state, in target
    /// processing order, seeds a group of the ungrouped states within the
    /// cutoff of its energy. Deliberately NOT transitively closed across
    /// multi-hop chains (state A near B near C does not put A with C).
    fn by_energy_cutoff(
        states: &BasisStateSpace,
        zero_order: &[f64],
        cutoff: f64,
    ) -> Result<Self> {
        if cutoff <= 0.0 {
            return Err(PerturbationTheoryError::Configuration(format!(
                "energy cutoff must be positive, got {}",
                cutoff
            )));
        }
        let mut assigned = vec![false; states.len()];
        let mut groups = Vec::new();
        for n in 0..states.len() {
            if assigned[n] {
                continue;
            }
            let members: Vec<usize> = (0..states.len())
                .filter(|&m| !assigned[m] && (zero_order[m] - zero_order[n]).abs() < cutoff)
                .collect();
            for &m in &members {
                assigned[m] = true;
            }
            groups.push(states.take_subspace(&members));
        }
        Ok(DegenerateStateSpace { groups })
    }

    /// Each target joins the first listed group that contains it; targets in
    /// no group become singletons. Group members outside the target space are
    /// dropped.
    fn by_explicit_groups(states: &BasisStateSpace, groups: &[Vec<Vec<u32>>]) -> Result<Self> {
        let n_modes = states.basis().n_modes();
        let mut group_members: Vec<Vec<usize>> = vec![Vec::new(); groups.len()];
        let mut leftovers = Vec::new();
        for (pos, state) in states.iter().enumerate() {
            let mut placed = false;
            for (gi, group) in groups.iter().enumerate() {
                for exc in group {
                    if exc.len() != n_modes {
                        return Err(PerturbationTheoryError::Configuration(format!(
                            "degenerate group {} has a state with {} modes, expected {}",
                            gi,
                            exc.len(),
                            n_modes
                        )));
                    }
                    if state.quanta() == exc.as_slice() {
                        group_members[gi].push(pos);
                        placed = true;
                        break;
                    }
                }
                if placed {
                    break;
                }
            }
            if !placed {
                leftovers.push(pos);
            }
        }
        let mut out = Vec::new();
        for members in group_members {
            if !members.is_empty() {
                out.push(states.take_subspace(&members));
            }
        }
        for pos in leftovers {
            out.push(states.take_subspace(&[pos]));
        }
        Ok(DegenerateStateSpace { groups: out })
    }

    fn by_polyad(states: &BasisStateSpace, vector: &[i64]) -> Result<Self> {
        let n_modes = states.basis().n_modes();
        if vector.len() != n_modes {
            return Err(PerturbationTheoryError::Configuration(format!(
                "polyad vector has {} entries, expected {}",
                vector.len(),
                n_modes
            )));
        }
        let value = |state: &BasisState| -> i64 {
            state
                .quanta()
                .iter()
                .zip(vector.iter())
                .map(|(&q, &w)| q as i64 * w)
                .sum()
        };
        let mut seen = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (pos, state) in states.iter().enumerate() {
            let v = value(state);
            match seen.iter().position(|&s| s == v) {
                Some(gi) => groups[gi].push(pos),
                None => {
                    seen.push(v);
                    groups.push(vec![pos]);
                }
            }
        }
        Ok(DegenerateStateSpace {
            groups: groups
                .into_iter()
                .map(|members| states.take_subspace(&members))
                .collect(),
        })
    }
}

/// Pairs of target states whose first-order coupling is too large for their
/// zero-order gap (positions within the target space).
///
/// A gap below machine floor with any coupling at all counts as strong.
pub fn detect_strong_couplings(
    h1: &Perturbation,
    zero_order: &DVector<f64>,
    states: &BasisStateSpace,
    flat: &BasisStateSpace,
    threshold: f64,
) -> Vec<(usize, usize)> {
    let positions: Vec<usize> = states
        .iter()
        .map(|s| flat.position(s).expect("targets live in the flat space"))
        .collect();
    let mut pairs = Vec::new();
    for i in 0..positions.len() {
        for j in (i + 1)..positions.len() {
            let coupling = h1.element(positions[i], positions[j]);
            if coupling == 0.0 {
                continue;
            }
            let gap = (zero_order[positions[i]] - zero_order[positions[j]]).abs();
            if gap < f64::EPSILON || coupling.abs() / gap > threshold {
                debug!(
                    "strong coupling between targets {} and {}: |c| = {:.6e}, gap = {:.6e}",
                    i,
                    j,
                    coupling.abs(),
                    gap
                );
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// Merges strongly-coupled pairs into the existing grouping, transitively:
/// coupled pairs are unioned with whatever groups their members already
/// belong to.
pub fn merge_strong_couplings(
    existing: &DegenerateStateSpace,
    pairs: &[(usize, usize)],
    states: &BasisStateSpace,
) -> DegenerateStateSpace {
    // union-find over target positions, seeded with the existing groups
    let mut parent: Vec<usize> = (0..states.len()).collect();
    fn find(parent: &mut Vec<usize>, x: usize) -> usize {
        let mut root = x;
        while parent[root] != root {
            root = parent[root];
        }
        let mut cur = x;
        while parent[cur] != root {
            let next = parent[cur];
            parent[cur] = root;
            cur = next;
        }
        root
    }
    fn union(parent: &mut Vec<usize>, a: usize, b: usize) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra != rb {
            parent[rb.max(ra)] = rb.min(ra);
        }
    }
    for group in existing.groups() {
        let members: Vec<usize> = group
            .iter()
            .map(|s| states.position(s).expect("groups partition the target space"))
            .collect();
        for w in members.windows(2) {
            union(&mut parent, w[0], w[1]);
        }
    }
    for &(i, j) in pairs {
        union(&mut parent, i, j);
    }

    // rebuild groups ordered by their first member
    let mut roots: Vec<usize> = Vec::new();
    let mut members: Vec<Vec<usize>> = Vec::new();
    for pos in 0..states.len() {
        let root = find(&mut parent, pos);
        match roots.iter().position(|&r| r == root) {
            Some(gi) => members[gi].push(pos),
            None => {
                roots.push(root);
                members.push(vec![pos]);
            }
        }
    }
    DegenerateStateSpace {
        groups: members
            .into_iter()
            .map(|m| states.take_subspace(&m))
            .collect(),
    }
}
