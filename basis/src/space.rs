//! Finite, ordered collections of basis states with set algebra.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::states::{BasisState, HarmonicBasis};

#[derive(Debug, Error)]
pub enum StateSpaceError {
    /// A requested state is not a member of the space.
    #[error("states not found in space: {missing:?}")]
    LookupFailure { missing: Vec<BasisState> },

    /// A state with the wrong number of modes was handed to a space.
    #[error("mode count mismatch: space has {expected} modes, state has {found}")]
    ModeMismatch { expected: usize, found: usize },
}

/// An ordered set of basis states bound to a full-basis bijection.
///
/// Indices are derived from the excitations at construction and cached for
/// the lifetime of the space. All set operations return new spaces; nothing
/// mutates in place after construction.
#[derive(Debug, Clone)]
pub struct BasisStateSpace {
    basis: Arc<HarmonicBasis>,
    states: Vec<BasisState>,
    indices: Vec<u64>,
    positions: HashMap<u64, usize>,
}

impl BasisStateSpace {
    /// Builds a space from explicit states, deduplicating while preserving
    /// first-occurrence order.
    pub fn new(
        basis: Arc<HarmonicBasis>,
        states: Vec<BasisState>,
    ) -> Result<Self, StateSpaceError> {
        let mut kept = Vec::with_capacity(states.len());
        let mut indices = Vec::with_capacity(states.len());
        let mut positions = HashMap::with_capacity(states.len());
        for state in states {
            if state.n_modes() != basis.n_modes() {
                return Err(StateSpaceError::ModeMismatch {
                    expected: basis.n_modes(),
                    found: state.n_modes(),
                });
            }
            let index = basis.index_of(&state);
            if let std::collections::hash_map::Entry::Vacant(entry) = positions.entry(index) {
                entry.insert(kept.len());
                kept.push(state);
                indices.push(index);
            }
        }
        Ok(BasisStateSpace {
            basis,
            states: kept,
            indices,
            positions,
        })
    }

    pub fn from_excitations(
        basis: Arc<HarmonicBasis>,
        excitations: &[Vec<u32>],
    ) -> Result<Self, StateSpaceError> {
        let states = excitations
            .iter()
            .map(|q| BasisState::new(q.clone()))
            .collect();
        Self::new(basis, states)
    }

    pub fn empty(basis: Arc<HarmonicBasis>) -> Self {
        BasisStateSpace {
            basis,
            states: Vec::new(),
            indices: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn basis(&self) -> &Arc<HarmonicBasis> {
        &self.basis
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[BasisState] {
        &self.states
    }

    pub fn state(&self, position: usize) -> &BasisState {
        &self.states[position]
    }

    /// Cached full-basis indices, parallel to [`Self::states`].
    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    pub fn iter(&self) -> impl Iterator<Item = &BasisState> {
        self.states.iter()
    }

    pub fn excitations(&self) -> Vec<Vec<u32>> {
        self.states.iter().map(|s| s.quanta().to_vec()).collect()
    }

    pub fn contains(&self, state: &BasisState) -> bool {
        state.n_modes() == self.basis.n_modes()
            && self
                .positions
                .contains_key(&self.basis.index_of(state))
    }

    pub fn contains_index(&self, index: u64) -> bool {
        self.positions.contains_key(&index)
    }

    /// Opt-in lookup that reports absence as `None` instead of failing.
    pub fn position(&self, state: &BasisState) -> Option<usize> {
        if state.n_modes() != self.basis.n_modes() {
            return None;
        }
        self.positions.get(&self.basis.index_of(state)).copied()
    }

    pub fn position_of_index(&self, index: u64) -> Option<usize> {
        self.positions.get(&index).copied()
    }

    /// Positions of every state of `other` within this space.
    ///
    /// Fails with a [`StateSpaceError::LookupFailure`] naming the missing
    /// states if any of them is absent.
    pub fn find(&self, other: &BasisStateSpace) -> Result<Vec<usize>, StateSpaceError> {
        self.find_states(other.states())
    }

    pub fn find_states(&self, states: &[BasisState]) -> Result<Vec<usize>, StateSpaceError> {
        let mut found = Vec::with_capacity(states.len());
        let mut missing = Vec::new();
        for state in states {
            match self.position(state) {
                Some(pos) => found.push(pos),
                None => missing.push(state.clone()),
            }
        }
        if missing.is_empty() {
            Ok(found)
        } else {
            Err(StateSpaceError::LookupFailure { missing })
        }
    }

    /// Set union; the result is renumbered into ascending index order.
    pub fn union(&self, other: &BasisStateSpace) -> BasisStateSpace {
        let mut states = self.states.clone();
        for state in other.iter() {
            if !self.contains(state) {
                states.push(state.clone());
            }
        }
        Self::sorted_from_states(self.basis.clone(), states)
    }

    /// Set difference (`self` minus `other`), renumbered by index.
    pub fn difference(&self, other: &BasisStateSpace) -> BasisStateSpace {
        let states = self
            .states
            .iter()
            .filter(|s| !other.contains(s))
            .cloned()
            .collect();
        Self::sorted_from_states(self.basis.clone(), states)
    }

    /// Set intersection, renumbered by index.
    pub fn intersection(&self, other: &BasisStateSpace) -> BasisStateSpace {
        let states = self
            .states
            .iter()
            .filter(|s| other.contains(s))
            .cloned()
            .collect();
        Self::sorted_from_states(self.basis.clone(), states)
    }

    /// New space holding the states at `positions`, in the given order.
    pub fn take_subspace(&self, positions: &[usize]) -> BasisStateSpace {
        let states = positions
            .iter()
            .map(|&p| self.states[p].clone())
            .collect();
        // positions address existing members, so this cannot fail
        Self::new(self.basis.clone(), states).expect("subspace of a valid space")
    }

    fn sorted_from_states(basis: Arc<HarmonicBasis>, mut states: Vec<BasisState>) -> Self {
        states.sort_by_key(|s| basis.index_of(s));
        Self::new(basis, states).expect("members of valid spaces")
    }
}

impl PartialEq for BasisStateSpace {
    fn eq(&self, other: &Self) -> bool {
        self.basis == other.basis && self.indices == other.indices
    }
}

impl Eq for BasisStateSpace {}
