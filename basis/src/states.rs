//! Basis states and the full-basis index bijection.
//!
//! A [`BasisState`] is an integer vector of per-mode excitation quanta. The
//! [`HarmonicBasis`] context orders the (conceptually unbounded) product basis
//! shell-major: all states with total quanta `T` precede those with `T + 1`,
//! and states within a shell are ordered lexicographically. Ranking and
//! unranking are exact inverses, so every state owns a unique scalar index
//! that can be derived (and cached) without enumerating the basis.

use serde::{Deserialize, Serialize};

use crate::helper::{shell_dimension, states_below_shell};

/// A single product-basis state, identified by its excitation quanta.
///
/// Immutable once created; equality and hashing go through the quanta.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BasisState {
    quanta: Vec<u32>,
}

impl BasisState {
    pub fn new(quanta: Vec<u32>) -> Self {
        BasisState { quanta }
    }

    /// The ground state (all modes unexcited).
    pub fn ground(n_modes: usize) -> Self {
        BasisState {
            quanta: vec![0; n_modes],
        }
    }

    pub fn quanta(&self) -> &[u32] {
        &self.quanta
    }

    pub fn n_modes(&self) -> usize {
        self.quanta.len()
    }

    pub fn total_quanta(&self) -> u32 {
        self.quanta.iter().sum()
    }
}

impl std::fmt::Display for BasisState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "|")?;
        for (i, q) in self.quanta.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", q)?;
        }
        write!(f, ">")
    }
}

/// The full harmonic-oscillator product basis for a fixed number of modes.
///
/// Stateless bijection context: it never materializes states, it only ranks
/// and unranks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarmonicBasis {
    n_modes: usize,
}

impl HarmonicBasis {
    pub fn new(n_modes: usize) -> Self {
        assert!(n_modes > 0, "basis needs at least one mode");
        HarmonicBasis { n_modes }
    }

    pub fn n_modes(&self) -> usize {
        self.n_modes
    }

    /// Scalar index of a state under the shell-major/lexicographic ordering.
    pub fn index_of(&self, state: &BasisState) -> u64 {
        assert_eq!(
            state.n_modes(),
            self.n_modes,
            "state has {} modes, basis has {}",
            state.n_modes(),
            self.n_modes
        );
        let total = state.total_quanta();
        states_below_shell(self.n_modes, total) + self.rank_in_shell(state.quanta(), total)
    }

    /// Inverse of [`Self::index_of`].
    pub fn state_from_index(&self, index: u64) -> BasisState {
        // locate the shell first
        let mut total = 0u32;
        let mut offset = 0u64;
        loop {
            let dim = shell_dimension(self.n_modes, total);
            if index < offset + dim {
                break;
            }
            offset += dim;
            total += 1;
        }
        let mut rank = index - offset;

        // then walk the lexicographic rank back into quanta
        let mut quanta = vec![0u32; self.n_modes];
        let mut remaining = total;
        for i in 0..self.n_modes - 1 {
            let tail_modes = self.n_modes - i - 1;
            for v in 0..=remaining {
                let below = shell_dimension(tail_modes, remaining - v);
                if rank < below {
                    quanta[i] = v;
                    remaining -= v;
                    break;
                }
                rank -= below;
            }
        }
        quanta[self.n_modes - 1] = remaining;
        BasisState::new(quanta)
    }

    fn rank_in_shell(&self, quanta: &[u32], total: u32) -> u64 {
        let mut rank = 0u64;
        let mut remaining = total;
        for (i, &q) in quanta.iter().enumerate().take(self.n_modes - 1) {
            let tail_modes = self.n_modes - i - 1;
            for v in 0..q {
                rank += shell_dimension(tail_modes, remaining - v);
            }
            remaining -= q;
        }
        rank
    }
}
