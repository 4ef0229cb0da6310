//! End-to-end scenarios for the perturbation-theory pipeline: the trivial
//! oscillator, variational resolution of a two-state degeneracy, automatic
//! strong-coupling escalation, and archive round-trips.

use std::sync::Arc;

use approx::assert_relative_eq;

use basis::{BasisState, BasisStateSpace, HarmonicBasis, SelectionRules};
use vpt::config::Config;
use vpt::representation::TabulatedProvider;
use vpt::solver_impl::{DegeneracySpec, PerturbationTheoryError};
use vpt::{Corrections, PerturbationTheorySolver, SolverOptions};

fn space(basis: &Arc<HarmonicBasis>, excs: &[&[u32]]) -> BasisStateSpace {
    let excs: Vec<Vec<u32>> = excs.iter().map(|q| q.to_vec()).collect();
    BasisStateSpace::from_excitations(basis.clone(), &excs).unwrap()
}

/// Scenario A: single mode, H1 = H2 = 0, order 2. The corrections must be
/// purely zero-order.
#[test]
fn trivial_oscillator_keeps_zero_order_results() {
    let basis = Arc::new(HarmonicBasis::new(1));
    let mut provider = TabulatedProvider::new(basis.clone(), vec![1.0]);
    provider.add_operator(SelectionRules::new(vec![vec![1], vec![-1], vec![3], vec![-3]]));
    provider.add_operator(SelectionRules::new(vec![vec![], vec![2], vec![-2]]));
    // no elements tabulated: both perturbations are identically zero

    let states = space(&basis, &[&[0]]);
    let mut solver =
        PerturbationTheorySolver::new(&provider, states, SolverOptions::default()).unwrap();
    let corrs = solver.apply_vpt().unwrap();

    assert_eq!(corrs.energy_corrections[0], vec![0.5, 0.0, 0.0]);
    assert_eq!(corrs.overlaps[0], vec![1.0, 0.0, 0.0]);

    // the wavefunction stays the unit vector at |0> through every order
    let zero_pos = corrs.total_basis.position(&BasisState::new(vec![0])).unwrap();
    assert_eq!(
        corrs.wavefunctions[0]
            .get_entry(0, zero_pos)
            .unwrap()
            .into_value(),
        1.0
    );
    for k in 1..=2 {
        assert_eq!(corrs.wavefunctions[k].nnz(), 0);
    }
}

/// Scenario A against the diagonal: zeroth-order energy must equal the H0
/// diagonal element for excited targets too.
#[test]
fn zero_order_energies_match_the_diagonal() {
    let basis = Arc::new(HarmonicBasis::new(2));
    let mut provider = TabulatedProvider::new(basis.clone(), vec![1.0, 2.0]);
    provider.add_operator(SelectionRules::new(vec![vec![1], vec![-1]]));

    let states = space(&basis, &[&[0, 0], &[1, 0], &[0, 1], &[2, 1]]);
    let mut solver =
        PerturbationTheorySolver::new(&provider, states.clone(), SolverOptions::default())
            .unwrap();
    let corrs = solver.apply_vpt().unwrap();

    for (i, state) in states.iter().enumerate() {
        assert_eq!(
            corrs.energy_corrections[i][0],
            provider.zero_order_energy(state)
        );
    }
}

fn degenerate_pair_provider(c: f64, second_freq: f64) -> (Arc<HarmonicBasis>, TabulatedProvider) {
    let basis = Arc::new(HarmonicBasis::new(2));
    let mut provider = TabulatedProvider::new(basis.clone(), vec![1.0, second_freq]);
    provider.add_operator(SelectionRules::new(vec![vec![1, -1]]));
    provider.set_element(
        1,
        &BasisState::new(vec![1, 0]),
        &BasisState::new(vec![0, 1]),
        c,
    );
    (basis, provider)
}

/// Scenario B: an exactly degenerate pair with coupling `c`, declared as a
/// group, resolves variationally to `E0 +/- |c|`; undeclared, the engine
/// refuses with DegeneracyEncountered.
#[test]
fn two_state_degeneracy_resolves_to_rotated_energies() {
    let c = 0.25;
    let (basis, provider) = degenerate_pair_provider(c, 1.0);
    let states = space(&basis, &[&[1, 0], &[0, 1]]);

    let options = SolverOptions {
        degeneracy: DegeneracySpec::Groups(vec![vec![vec![1, 0], vec![0, 1]]]),
        ..Default::default()
    };
    let mut solver =
        PerturbationTheorySolver::new(&provider, states.clone(), options).unwrap();
    let corrs = solver.apply_vpt().unwrap();

    assert!(corrs.is_degenerate());
    let mut energies: Vec<f64> = corrs.energies().iter().copied().collect();
    energies.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_relative_eq!(energies[0], 2.0 - c, epsilon = 1e-12);
    assert_relative_eq!(energies[1], 2.0 + c, epsilon = 1e-12);

    // same system, no degeneracy declared: loud failure
    let mut undeclared =
        PerturbationTheorySolver::new(&provider, states, SolverOptions::default()).unwrap();
    assert!(matches!(
        undeclared.apply_vpt(),
        Err(PerturbationTheoryError::DegeneracyEncountered { .. })
    ));
}

/// Scenario C: a small gap and a large coupling ratio escalate automatically
/// and reproduce the declared-group result after one re-run.
#[test]
fn strong_coupling_escalation_reproduces_variational_energies() {
    let c = 0.01;
    let (basis, provider) = degenerate_pair_provider(c, 1.0001);
    let states = space(&basis, &[&[1, 0], &[0, 1]]);

    let options = SolverOptions {
        strong_coupling_threshold: Some(10.0),
        ..Default::default()
    };
    let mut solver =
        PerturbationTheorySolver::new(&provider, states.clone(), options).unwrap();
    let escalated = solver.apply_vpt().unwrap();
    assert!(escalated.is_degenerate());

    // reference: the same pair declared degenerate up front
    let declared_options = SolverOptions {
        degeneracy: DegeneracySpec::Groups(vec![vec![vec![1, 0], vec![0, 1]]]),
        ..Default::default()
    };
    let mut reference =
        PerturbationTheorySolver::new(&provider, states, declared_options).unwrap();
    let declared = reference.apply_vpt().unwrap();

    let mut a: Vec<f64> = escalated.energies().iter().copied().collect();
    let mut b: Vec<f64> = declared.energies().iter().copied().collect();
    a.sort_by(|x, y| x.partial_cmp(y).unwrap());
    b.sort_by(|x, y| x.partial_cmp(y).unwrap());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_relative_eq!(*x, *y, epsilon = 1e-12);
    }

    // and both agree with E0 +/- |c| to the accuracy of the small gap
    let mean = 0.5 * ((1.5 + 0.5 * 1.0001) + (0.5 + 1.5 * 1.0001));
    assert_relative_eq!(a[0], mean - c, epsilon = 1e-4);
    assert_relative_eq!(a[1], mean + c, epsilon = 1e-4);
}

/// Serialization round-trip: energies, overlaps, and coefficients come back
/// bit for bit.
#[test]
fn corrections_archive_roundtrip_is_exact() {
    let c = 0.25;
    let (basis, provider) = degenerate_pair_provider(c, 1.0);
    let states = space(&basis, &[&[1, 0], &[0, 1]]);
    let options = SolverOptions {
        degeneracy: DegeneracySpec::Groups(vec![vec![vec![1, 0], vec![0, 1]]]),
        ..Default::default()
    };
    let mut solver = PerturbationTheorySolver::new(&provider, states, options).unwrap();
    let corrs = solver.apply_vpt().unwrap();

    let bytes = corrs.to_json();
    let restored = Corrections::from_json(&bytes).unwrap();

    assert_eq!(restored.states.indices(), corrs.states.indices());
    assert_eq!(restored.total_basis.indices(), corrs.total_basis.indices());
    assert_eq!(restored.energy_corrections, corrs.energy_corrections);
    assert_eq!(restored.overlaps, corrs.overlaps);
    for (a, b) in restored.wavefunctions.iter().zip(corrs.wavefunctions.iter()) {
        assert_eq!(a.nrows(), b.nrows());
        let at: Vec<_> = a.triplet_iter().map(|(i, j, v)| (i, j, *v)).collect();
        let bt: Vec<_> = b.triplet_iter().map(|(i, j, v)| (i, j, *v)).collect();
        assert_eq!(at, bt);
    }
    assert_eq!(restored.degenerate_energies, corrs.degenerate_energies);
    let rt = restored.degenerate_transformation.as_ref().unwrap();
    let ot = corrs.degenerate_transformation.as_ref().unwrap();
    let rtt: Vec<_> = rt.triplet_iter().map(|(i, j, v)| (i, j, *v)).collect();
    let ott: Vec<_> = ot.triplet_iter().map(|(i, j, v)| (i, j, *v)).collect();
    assert_eq!(rtt, ott);
}

/// The YAML configuration surface drives the same pipeline.
#[test]
fn yaml_config_runs_end_to_end() {
    let yaml = r#"
system:
  frequencies: [1.0]
states:
  - [0]
solver:
  order: 2
operators:
  - rules: [[1], [-1]]
    elements:
      - bra: [0]
        ket: [1]
        value: 0.1
"#;
    let config: Config = serde_yml::from_str(yaml).unwrap();
    let config = config.with_defaults();
    let provider = config.build_provider().unwrap();
    let options = config.to_solver_options().unwrap();

    let basis = Arc::new(HarmonicBasis::new(config.n_modes()));
    let states = BasisStateSpace::from_excitations(basis, &config.states).unwrap();
    let mut solver = PerturbationTheorySolver::new(&provider, states, options).unwrap();
    let corrs = solver.apply_vpt().unwrap();
    assert_relative_eq!(corrs.energies()[0], 0.49, epsilon = 1e-12);
}

/// Malformed configurations die at setup, before any numeric work.
#[test]
fn malformed_config_is_rejected_up_front() {
    let yaml = r#"
system:
  frequencies: [1.0, 2.0]
states:
  - [0]
"#;
    let config: Config = serde_yml::from_str::<Config>(yaml).unwrap().with_defaults();
    assert!(config.build_provider().is_err());
}
