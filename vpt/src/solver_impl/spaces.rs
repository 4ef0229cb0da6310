//! Coupled-space determination by symbolic replay of the perturbation
//! recursion.
//!
//! The numeric recursion is walked with operator application replaced by
//! selection-rule application (set valued), addition replaced by set union,
//! and resolvent/projection steps replaced by no-ops (they change
//! coefficients, never membership). The result is, per perturbation order,
//! the minimal set of bra states whose matrix elements the numeric pass will
//! touch, found without ever enumerating the full product basis.

use std::collections::HashMap;

use tracing::{debug, info};

use basis::{BasisStateSpace, SelectionRuleStateSpace, SelectionRules};

use crate::representation::RepresentationProvider;

/// Which projection was applied to an operator's output before it entered the
/// memo. The non-degenerate replay only ever uses `Identity`; the degenerate
/// recursions project the degenerate subspace out of transformed spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectionKey {
    Identity,
    DropDegenerate,
}

/// Memo for one operator handle: which input states have been transformed
/// under which projection, and the accumulated transformed space.
///
/// This is an incremental least-fixed-point structure, not a plain cache:
/// each request transforms only the difference from previously-seen inputs
/// and unions the new results in.
struct OperatorMemo {
    seen: HashMap<ProjectionKey, BasisStateSpace>,
    drop_space: Option<BasisStateSpace>,
    accumulated: Option<SelectionRuleStateSpace>,
}

impl OperatorMemo {
    fn new() -> Self {
        OperatorMemo {
            seen: HashMap::new(),
            drop_space: None,
            accumulated: None,
        }
    }

    fn seen_under(&self, key: ProjectionKey) -> Option<BasisStateSpace> {
        // identity transforms subsume projected ones, so they count for
        // every projection
        let identity = self.seen.get(&ProjectionKey::Identity);
        match key {
            ProjectionKey::Identity => identity.cloned(),
            other => match (identity, self.seen.get(&other)) {
                (Some(a), Some(b)) => Some(a.union(b)),
                (Some(a), None) => Some(a.clone()),
                (None, Some(b)) => Some(b.clone()),
                (None, None) => None,
            },
        }
    }

    fn record_seen(&mut self, key: ProjectionKey, inputs: &BasisStateSpace) {
        let merged = match self.seen.get(&key) {
            Some(prev) => prev.union(inputs),
            None => inputs.clone(),
        };
        self.seen.insert(key, merged);
    }

    fn total_seen(&self) -> Option<BasisStateSpace> {
        self.seen
            .values()
            .cloned()
            .reduce(|acc, space| acc.union(&space))
    }
}

/// Replays the non-degenerate recursion symbolically to find the coupled
/// space each perturbation order needs.
///
/// Operators are handled through small integer ids (1-based perturbation
/// orders) mapping into an arena of memos, so the incremental bookkeeping
/// never depends on operator object identity.
pub struct CoupledSpaceBuilder {
    order: usize,
    memory_constrained: bool,
    rules: Vec<SelectionRules>,
    memos: Vec<OperatorMemo>,
}

impl CoupledSpaceBuilder {
    pub fn new<P: RepresentationProvider>(
        provider: &P,
        order: usize,
        memory_constrained: bool,
    ) -> Self {
        let n_perts = provider.n_perturbations();
        let rules: Vec<SelectionRules> =
            (1..n_perts).map(|k| provider.selection_rules(k)).collect();
        let memos = (1..n_perts).map(|_| OperatorMemo::new()).collect();
        CoupledSpaceBuilder {
            order,
            memory_constrained,
            rules,
            memos,
        }
    }

    /// Runs the replay for the given input space and returns the coupled
    /// space of each perturbation order `1..n_perturbations`.
    pub fn build(&mut self, input: &BasisStateSpace) -> Vec<SelectionRuleStateSpace> {
        let n_perts = self.rules.len() + 1;
        let basis = input.basis().clone();
        let empty = BasisStateSpace::empty(basis.clone());

        // corrs[i] tracks the states carrying the order-i wavefunction
        // correction; the energy terms are wholly subsumed by these
        let mut corrs: Vec<BasisStateSpace> = vec![input.clone()];
        for k in 1..=self.order {
            info!(
                "getting states for {}",
                (0..k)
                    .filter(|&i| k - i < n_perts && !self.rules[k - i - 1].is_empty())
                    .map(|i| format!("H({})|n({})>", k - i, i))
                    .collect::<Vec<_>>()
                    .join("+")
            );
            // every earlier correction space rides along
            let mut space = corrs[..k]
                .iter()
                .fold(empty.clone(), |acc, s| acc.union(s));
            for i in 0..k {
                let h = k - i;
                if h >= n_perts || self.rules[h - 1].is_empty() {
                    // absent or elementless order contributes nothing
                    continue;
                }
                debug!("H({})|n({})>", h, i);
                // at the final order the transform only needs to reach the
                // memo, not the returned space
                let ret_space = k < self.order;
                let transformed = self.apply(h, &corrs[i], None, ret_space);
                if ret_space {
                    space = space.union(&transformed);
                }
            }
            corrs.push(space);
        }

        (1..n_perts).map(|h| self.finalize(h, &basis)).collect()
    }

    /// Symbolic application of `H_handle` to `input`, optionally projecting
    /// `drop` out of the result. Transforms only the difference from inputs
    /// this operator has already seen and folds the rest in from the memo.
    fn apply(
        &mut self,
        handle: usize,
        input: &BasisStateSpace,
        drop: Option<&BasisStateSpace>,
        ret_space: bool,
    ) -> BasisStateSpace {
        let rules = self.rules[handle - 1].clone();
        let memo = &mut self.memos[handle - 1];
        let key = match drop {
            None => ProjectionKey::Identity,
            Some(space) => {
                if let Some(prev) = &memo.drop_space {
                    assert_eq!(prev, space, "one degenerate projection space per operator");
                } else {
                    memo.drop_space = Some(space.clone());
                }
                ProjectionKey::DropDegenerate
            }
        };

        let seen = memo.seen_under(key).unwrap_or_else(|| {
            BasisStateSpace::empty(input.basis().clone())
        });
        let diffs = input.difference(&seen);
        memo.record_seen(key, input);

        if self.memory_constrained {
            // provenance is not kept; recompute the transform for the whole
            // input (peak memory traded for repeated rule application)
            if !ret_space {
                return BasisStateSpace::empty(input.basis().clone());
            }
            let fresh = input.apply_selection_rules(&rules, 1);
            let fresh = match drop {
                Some(space) => fresh.drop_states(space),
                None => fresh,
            };
            return fresh.to_single();
        }

        let existing = if diffs.len() == input.len() {
            None
        } else {
            memo.accumulated
                .as_ref()
                .map(|acc| acc.take_sources(input))
        };

        let fresh = if diffs.is_empty() {
            None
        } else {
            let transformed = diffs.apply_selection_rules(&rules, 1);
            let transformed = match drop {
                Some(space) => transformed.drop_states(space),
                None => transformed,
            };
            memo.accumulated = Some(match memo.accumulated.take() {
                Some(acc) => acc.union(&transformed),
                None => transformed.clone(),
            });
            Some(transformed)
        };

        if !ret_space {
            return BasisStateSpace::empty(input.basis().clone());
        }

        let mut result = BasisStateSpace::empty(input.basis().clone());
        if let Some(existing) = existing {
            result = result.union(&existing.to_single());
        }
        if let Some(fresh) = fresh {
            result = result.union(&fresh.to_single());
        }
        if let Some(space) = drop {
            result = result.difference(space);
        }
        result
    }

    /// The coupled space accumulated for `H_handle` over the whole replay.
    fn finalize(
        &self,
        handle: usize,
        basis: &std::sync::Arc<basis::HarmonicBasis>,
    ) -> SelectionRuleStateSpace {
        let memo = &self.memos[handle - 1];
        if self.memory_constrained {
            // one extra full application rebuilds the provenance that the
            // constrained memo dropped
            return match memo.total_seen() {
                Some(seen) => seen.apply_selection_rules(&self.rules[handle - 1], 1),
                None => SelectionRuleStateSpace::empty(basis.clone()),
            };
        }
        match &memo.accumulated {
            Some(acc) => acc.clone(),
            None => SelectionRuleStateSpace::empty(basis.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use basis::{HarmonicBasis, SelectionRules};

    use super::*;
    use crate::representation::TabulatedProvider;

    fn ladder_provider() -> (Arc<HarmonicBasis>, TabulatedProvider) {
        let basis = Arc::new(HarmonicBasis::new(1));
        let mut provider = TabulatedProvider::new(basis.clone(), vec![1.0]);
        provider.add_operator(SelectionRules::new(vec![vec![1], vec![-1]]));
        (basis, provider)
    }

    fn space(basis: &Arc<HarmonicBasis>, excs: &[&[u32]]) -> BasisStateSpace {
        let excs: Vec<Vec<u32>> = excs.iter().map(|q| q.to_vec()).collect();
        BasisStateSpace::from_excitations(basis.clone(), &excs).unwrap()
    }

    #[test]
    fn test_projected_application_drops_the_degenerate_space() {
        let (basis, provider) = ladder_provider();
        let mut builder = CoupledSpaceBuilder::new(&provider, 2, false);
        let input = space(&basis, &[&[1]]);
        let degenerate = space(&basis, &[&[0]]);

        // |1> reaches {|0>, |2>}; projecting the degenerate space out leaves |2>
        let projected = builder.apply(1, &input, Some(&degenerate), true);
        assert_eq!(projected.indices(), &[2]);

        // the unprojected transform of the same input still computes in full
        let unprojected = builder.apply(1, &input, None, true);
        assert_eq!(unprojected.indices(), &[0, 2]);
    }

    #[test]
    fn test_identity_transforms_subsume_projected_requests() {
        let (basis, provider) = ladder_provider();
        let mut builder = CoupledSpaceBuilder::new(&provider, 2, false);
        let input = space(&basis, &[&[1]]);
        let degenerate = space(&basis, &[&[0]]);

        let unprojected = builder.apply(1, &input, None, true);
        assert_eq!(unprojected.indices(), &[0, 2]);

        // already transformed under identity: the projected request reuses
        // the memo instead of recomputing, then applies the projection
        let projected = builder.apply(1, &input, Some(&degenerate), true);
        assert_eq!(projected.indices(), &[2]);
    }
}
