// Basis-state bookkeeping for harmonic-oscillator product bases

pub mod helper;
pub mod selection;
pub mod space;
pub mod states;

pub use selection::{SelectionRuleStateSpace, SelectionRules};
pub use space::{BasisStateSpace, StateSpaceError};
pub use states::{BasisState, HarmonicBasis};
