//! Selection rules and the state spaces generated by applying them.
//!
//! A selection rule is a multiset of nonzero quantum changes, e.g. `[+1, +1, -1]`
//! for one flavor of cubic coupling. Applying a rule to a state distributes the
//! changes over distinct modes in every possible way; applying a rule *set* to a
//! state space walks that transition structure algebraically, without ever
//! materializing a graph, which keeps unbounded-degree couplings tractable.

use std::collections::HashSet;
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::space::BasisStateSpace;
use crate::states::{BasisState, HarmonicBasis};

/// A set of quantum-number transition rules for one perturbation operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRules {
    rules: Vec<Vec<i32>>,
}

impl SelectionRules {
    /// Normalizes the rule vectors by dropping no-op zero entries. An empty
    /// rule is legitimate: it keeps the state itself reachable (diagonal
    /// elements of even-order operators).
    pub fn new(rules: Vec<Vec<i32>>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| rule.into_iter().filter(|&c| c != 0).collect())
            .collect();
        SelectionRules { rules }
    }

    pub fn none() -> Self {
        SelectionRules { rules: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Vec<i32>] {
        &self.rules
    }

    /// All distinct states reachable from `state` by one application of one
    /// rule in the set.
    pub fn apply_to_state(&self, state: &BasisState) -> Vec<BasisState> {
        let n_modes = state.n_modes();
        let mut seen: HashSet<BasisState> = HashSet::new();
        for rule in &self.rules {
            if rule.is_empty() {
                seen.insert(state.clone());
                continue;
            }
            if rule.len() > n_modes {
                continue;
            }
            // distribute the changes over every ordered choice of distinct
            // modes; duplicate entries in the rule collapse in the set
            for modes in (0..n_modes).permutations(rule.len()) {
                let mut quanta: Vec<i64> =
                    state.quanta().iter().map(|&q| q as i64).collect();
                for (&mode, &change) in modes.iter().zip(rule.iter()) {
                    quanta[mode] += change as i64;
                }
                if quanta.iter().all(|&q| q >= 0) {
                    seen.insert(BasisState::new(
                        quanta.into_iter().map(|q| q as u32).collect(),
                    ));
                }
            }
        }
        seen.into_iter().collect()
    }
}

/// A state space that remembers, for each source state, the set of states an
/// operator's selection rules connect it to.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionRuleStateSpace {
    sources: BasisStateSpace,
    transformed: Vec<BasisStateSpace>,
}

impl SelectionRuleStateSpace {
    pub fn new(sources: BasisStateSpace, transformed: Vec<BasisStateSpace>) -> Self {
        assert_eq!(
            sources.len(),
            transformed.len(),
            "one result space per source state"
        );
        SelectionRuleStateSpace {
            sources,
            transformed,
        }
    }

    pub fn empty(basis: Arc<HarmonicBasis>) -> Self {
        SelectionRuleStateSpace {
            sources: BasisStateSpace::empty(basis),
            transformed: Vec::new(),
        }
    }

    pub fn sources(&self) -> &BasisStateSpace {
        &self.sources
    }

    pub fn transformed(&self) -> &[BasisStateSpace] {
        &self.transformed
    }

    pub fn result_for(&self, source_position: usize) -> &BasisStateSpace {
        &self.transformed[source_position]
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Flattens into a plain state space, losing the per-source grouping.
    pub fn to_single(&self) -> BasisStateSpace {
        let identity = BasisStateSpace::empty(self.sources.basis().clone());
        self.transformed
            .iter()
            .fold(identity, |acc, space| acc.union(space))
    }

    /// Projects every result space onto `space`.
    pub fn take_states(&self, space: &BasisStateSpace) -> Self {
        SelectionRuleStateSpace {
            sources: self.sources.clone(),
            transformed: self
                .transformed
                .iter()
                .map(|t| t.intersection(space))
                .collect(),
        }
    }

    /// Projects every result space out of `space`.
    pub fn drop_states(&self, space: &BasisStateSpace) -> Self {
        SelectionRuleStateSpace {
            sources: self.sources.clone(),
            transformed: self
                .transformed
                .iter()
                .map(|t| t.difference(space))
                .collect(),
        }
    }

    /// Restricts to the source states that are members of `space`.
    pub fn take_sources(&self, space: &BasisStateSpace) -> Self {
        let mut keep = Vec::new();
        let mut kept_results = Vec::new();
        for (pos, source) in self.sources.iter().enumerate() {
            if space.contains(source) {
                keep.push(pos);
                kept_results.push(self.transformed[pos].clone());
            }
        }
        SelectionRuleStateSpace {
            sources: self.sources.take_subspace(&keep),
            transformed: kept_results,
        }
    }

    /// Merges two rule spaces, unioning result spaces for shared sources.
    pub fn union(&self, other: &SelectionRuleStateSpace) -> Self {
        let basis = self.sources.basis().clone();
        let merged_sources = self.sources.union(other.sources());
        let mut transformed = Vec::with_capacity(merged_sources.len());
        for source in merged_sources.iter() {
            let mut result = BasisStateSpace::empty(basis.clone());
            if let Some(pos) = self.sources.position(source) {
                result = result.union(&self.transformed[pos]);
            }
            if let Some(pos) = other.sources.position(source) {
                result = result.union(&other.transformed[pos]);
            }
            transformed.push(result);
        }
        SelectionRuleStateSpace {
            sources: merged_sources,
            transformed,
        }
    }
}

impl BasisStateSpace {
    /// States reachable from each member by applying any single rule from
    /// `rules` up to `iterations` times (breadth-first over the transition
    /// structure, computed from quantum-number arithmetic).
    pub fn apply_selection_rules(
        &self,
        rules: &SelectionRules,
        iterations: usize,
    ) -> SelectionRuleStateSpace {
        let basis = self.basis().clone();
        let mut transformed = Vec::with_capacity(self.len());
        for source in self.iter() {
            let mut reachable: HashSet<BasisState> = HashSet::new();
            let mut frontier = vec![source.clone()];
            for _ in 0..iterations {
                let mut next = Vec::new();
                for state in &frontier {
                    for result in rules.apply_to_state(state) {
                        if reachable.insert(result.clone()) {
                            next.push(result);
                        }
                    }
                }
                if next.is_empty() {
                    break;
                }
                frontier = next;
            }
            let mut states: Vec<BasisState> = reachable.into_iter().collect();
            states.sort_by_key(|s| basis.index_of(s));
            transformed.push(
                BasisStateSpace::new(basis.clone(), states)
                    .expect("reachable states share the source's mode count"),
            );
        }
        SelectionRuleStateSpace::new(self.clone(), transformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(basis: &Arc<HarmonicBasis>, excs: &[&[u32]]) -> BasisStateSpace {
        let excs: Vec<Vec<u32>> = excs.iter().map(|q| q.to_vec()).collect();
        BasisStateSpace::from_excitations(basis.clone(), &excs).unwrap()
    }

    #[test]
    fn test_single_mode_raising_lowering() {
        let state = BasisState::new(vec![1]);
        let rules = SelectionRules::new(vec![vec![1], vec![-1]]);
        let mut results: Vec<u32> = rules
            .apply_to_state(&state)
            .iter()
            .map(|s| s.quanta()[0])
            .collect();
        results.sort();
        assert_eq!(results, vec![0, 2]);
    }

    #[test]
    fn test_lowering_discards_negative_quanta() {
        let state = BasisState::ground(1);
        let rules = SelectionRules::new(vec![vec![-1]]);
        assert!(rules.apply_to_state(&state).is_empty());
    }

    #[test]
    fn test_multi_mode_rule_uses_distinct_modes() {
        // [+1, +1] on a two-mode state can only excite both modes at once
        let state = BasisState::ground(2);
        let rules = SelectionRules::new(vec![vec![1, 1]]);
        let results = rules.apply_to_state(&state);
        assert_eq!(results, vec![BasisState::new(vec![1, 1])]);
    }

    #[test]
    fn test_empty_rule_keeps_state_reachable() {
        let state = BasisState::new(vec![2, 0]);
        let rules = SelectionRules::new(vec![vec![]]);
        assert_eq!(rules.apply_to_state(&state), vec![state]);
    }

    #[test]
    fn test_closure_at_one_iteration() {
        // one application of one rule, and nothing else
        let basis = Arc::new(HarmonicBasis::new(2));
        let seed = space(&basis, &[&[0, 0]]);
        let rules = SelectionRules::new(vec![vec![1], vec![1, -1]]);
        let expanded = seed.apply_selection_rules(&rules, 1);

        let expected = space(&basis, &[&[0, 1], &[1, 0]]);
        assert_eq!(expanded.result_for(0), &expected);
    }

    #[test]
    fn test_iterated_expansion_accumulates() {
        let basis = Arc::new(HarmonicBasis::new(1));
        let seed = space(&basis, &[&[0]]);
        let rules = SelectionRules::new(vec![vec![1]]);
        let expanded = seed.apply_selection_rules(&rules, 3);
        assert_eq!(expanded.result_for(0).indices(), &[1, 2, 3]);
    }

    #[test]
    fn test_to_single_flattens_per_source_grouping() {
        let basis = Arc::new(HarmonicBasis::new(1));
        let seed = space(&basis, &[&[0], &[2]]);
        let rules = SelectionRules::new(vec![vec![1], vec![-1]]);
        let expanded = seed.apply_selection_rules(&rules, 1);
        // 0 -> {1}; 2 -> {1, 3}
        assert_eq!(expanded.to_single().indices(), &[1, 3]);
    }

    #[test]
    fn test_take_and_drop_states() {
        let basis = Arc::new(HarmonicBasis::new(1));
        let seed = space(&basis, &[&[1]]);
        let rules = SelectionRules::new(vec![vec![1], vec![-1]]);
        let expanded = seed.apply_selection_rules(&rules, 1);

        let keep = space(&basis, &[&[0]]);
        assert_eq!(expanded.take_states(&keep).result_for(0).indices(), &[0]);
        assert_eq!(expanded.drop_states(&keep).result_for(0).indices(), &[2]);
    }

    #[test]
    fn test_union_merges_shared_sources() {
        let basis = Arc::new(HarmonicBasis::new(1));
        let seed = space(&basis, &[&[1]]);
        let up = seed.apply_selection_rules(&SelectionRules::new(vec![vec![1]]), 1);
        let down = seed.apply_selection_rules(&SelectionRules::new(vec![vec![-1]]), 1);
        let merged = up.union(&down);
        assert_eq!(merged.sources().len(), 1);
        assert_eq!(merged.result_for(0).indices(), &[0, 2]);
    }

    #[test]
    fn test_take_sources_restricts() {
        let basis = Arc::new(HarmonicBasis::new(1));
        let seed = space(&basis, &[&[0], &[1]]);
        let rules = SelectionRules::new(vec![vec![1]]);
        let expanded = seed.apply_selection_rules(&rules, 1);
        let only_one = expanded.take_sources(&space(&basis, &[&[1]]));
        assert_eq!(only_one.sources().indices(), &[1]);
        assert_eq!(only_one.result_for(0).indices(), &[2]);
    }
}
