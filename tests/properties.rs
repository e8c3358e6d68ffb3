use itertools::iproduct;
use ndarray::{Array1, Array2, Array3, Axis};
use proptest::prelude::*;
use tram_rs::lse::max_abs_change;
use tram_rs::testsystems::*;
use tram_rs::{wham, Dtram, Tram};

/// Strictly positive transition counts and bounded biases for 1-3 conditions over 2-4 states
fn counts_and_biases() -> impl Strategy<Value = (Array3<usize>, Array2<f64>)> {
    (1usize..=3, 2usize..=4).prop_flat_map(|(n_conditions, n_states)| {
        (
            prop::collection::vec(1usize..50, n_conditions * n_states * n_states),
            prop::collection::vec(-2.0f64..2.0, n_conditions * n_states),
        )
            .prop_map(move |(counts, biases)| {
                (
                    Array3::from_shape_vec((n_conditions, n_states, n_states), counts)
                        .expect("vector length matches shape"),
                    Array2::from_shape_vec((n_conditions, n_states), biases)
                        .expect("vector length matches shape"),
                )
            })
    })
}

fn dtram(c_k_ij: Array3<usize>, b_k_i: Array2<f64>) -> tram_rs::DtramEstimate {
    Dtram::builder()
        .c_k_ij(c_k_ij)
        .b_k_i(b_k_i)
        .maximum_iterations(100_000)
        .tolerance(1e-12)
        .build()
        .expect("generated inputs are valid")
        .estimate()
}

fn total_probability(f_i: &Array1<f64>) -> f64 {
    f_i.iter().map(|f| (-f).exp()).sum()
}

fn tram(trajectories: Trajectories) -> tram_rs::TramEstimate {
    let Trajectories {
        c_k_ij,
        n_k_i,
        m_x,
        b_k_x,
    } = trajectories;
    Tram::builder()
        .c_k_ij(c_k_ij)
        .n_k_i(n_k_i)
        .b_k_x(b_k_x)
        .m_x(m_x)
        .maximum_iterations(100_000)
        .build()
        .expect("sampled trajectories are consistent")
        .estimate()
}

/// Per-sweep changes of WHAM run by hand from `f_i = 0`, until they drop below `1e-12`
fn wham_changes(n_k_i: &Array2<usize>, b_k_i: &Array2<f64>) -> Vec<f64> {
    let (n_conditions, n_states) = b_k_i.dim();
    let (log_n_k, log_n_i) = wham::log_sample_sizes(n_k_i.view());
    let mut workspace = wham::Workspace::new(n_conditions, n_states);
    let mut f_i = Array1::zeros(n_states);
    let mut new_f_i = f_i.clone();
    let mut f_k = Array1::zeros(n_conditions);
    let mut new_f_k = f_k.clone();

    let mut changes = Vec::new();
    for _ in 0..10_000 {
        wham::update_normalizers(f_i.view(), b_k_i.view(), &mut workspace, new_f_k.view_mut());
        wham::update_free_energies(
            log_n_k.view(),
            log_n_i.view(),
            new_f_k.view(),
            b_k_i.view(),
            &mut workspace,
            new_f_i.view_mut(),
        );
        let change = max_abs_change(&f_i, &new_f_i).max(max_abs_change(&f_k, &new_f_k));
        std::mem::swap(&mut f_i, &mut new_f_i);
        std::mem::swap(&mut f_k, &mut new_f_k);
        changes.push(change);
        if change < 1e-12 {
            break;
        }
    }
    changes
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn dtram_transition_matrices_are_reversible((c_k_ij, b_k_i) in counts_and_biases()) {
        let estimate = dtram(c_k_ij, b_k_i);
        prop_assert!(estimate.status.converged());
        prop_assert!((total_probability(&estimate.f_i) - 1.0).abs() < 1e-10);

        let (n_conditions, n_states) = estimate.f_k_i.dim();
        for (k, i) in iproduct!(0..n_conditions, 0..n_states) {
            let mut row = 0.0;
            for j in 0..n_states {
                let p_ij = estimate.p_k_ij[[k, i, j]];
                prop_assert!(p_ij >= 0.0);
                row += p_ij;

                let forward = (estimate.f_k[k] - estimate.f_k_i[[k, i]]).exp() * p_ij;
                let backward =
                    (estimate.f_k[k] - estimate.f_k_i[[k, j]]).exp() * estimate.p_k_ij[[k, j, i]];
                prop_assert!((forward - backward).abs() < 1e-10);
            }
            prop_assert!((row - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn dtram_ignores_constant_shifts_per_condition(
        (c_k_ij, b_k_i) in counts_and_biases(),
        shift in -5.0f64..5.0,
    ) {
        let mut shifted = b_k_i.clone();
        shifted.row_mut(0).mapv_inplace(|b| b + shift);

        let reference = dtram(c_k_ij.clone(), b_k_i);
        let estimate = dtram(c_k_ij, shifted);
        for (&a, &b) in reference.f_i.iter().zip(estimate.f_i.iter()) {
            prop_assert!((a - b).abs() < 1e-6);
        }
        prop_assert!((estimate.f_k[0] - reference.f_k[0] - shift).abs() < 1e-6);
    }

    #[test]
    fn wham_is_normalized_and_shift_invariant(
        (c_k_ij, b_k_i) in counts_and_biases(),
        shift in -5.0f64..5.0,
    ) {
        // reuse the row sums of the transition counts as visit histograms
        let n_k_i = c_k_ij.sum_axis(Axis(2));
        let mut shifted = b_k_i.clone();
        shifted.row_mut(0).mapv_inplace(|b| b + shift);

        let reference = wham::estimate(n_k_i.clone(), b_k_i, 100_000, 1e-12)
            .expect("generated inputs are valid");
        let estimate = wham::estimate(n_k_i, shifted, 100_000, 1e-12)
            .expect("generated inputs are valid");
        prop_assert!(reference.status.converged());
        prop_assert!((total_probability(&reference.f_i) - 1.0).abs() < 1e-10);
        for (&a, &b) in reference.f_i.iter().zip(estimate.f_i.iter()) {
            prop_assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn dtram_per_state_shifts_only_move_f_i(
        (c_k_ij, b_k_i) in counts_and_biases(),
        shifts in prop::collection::vec(-3.0f64..3.0, 4),
    ) {
        let n_states = b_k_i.len_of(Axis(1));
        let shifts = Array1::from(shifts[..n_states].to_vec());
        let shifted = &b_k_i + &shifts;

        let reference = dtram(c_k_ij.clone(), b_k_i);
        let estimate = dtram(c_k_ij, shifted);
        let offset = estimate.f_k_i[[0, 0]] - reference.f_k_i[[0, 0]];
        for (&a, &b) in reference.f_k_i.iter().zip(estimate.f_k_i.iter()) {
            prop_assert!((b - a - offset).abs() < 1e-6);
        }
        for (&a, &b) in reference.p_k_ij.iter().zip(estimate.p_k_ij.iter()) {
            prop_assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn wham_per_state_shifts_only_move_f_i(
        (c_k_ij, b_k_i) in counts_and_biases(),
        shifts in prop::collection::vec(-3.0f64..3.0, 4),
    ) {
        let n_k_i = c_k_ij.sum_axis(Axis(2));
        let n_states = b_k_i.len_of(Axis(1));
        let shifts = Array1::from(shifts[..n_states].to_vec());
        let shifted = &b_k_i + &shifts;

        let reference = wham::estimate(n_k_i.clone(), b_k_i, 100_000, 1e-12)
            .expect("generated inputs are valid");
        let estimate = wham::estimate(n_k_i, shifted, 100_000, 1e-12)
            .expect("generated inputs are valid");
        prop_assert!(reference.status.converged());
        prop_assert!(estimate.status.converged());

        let offset = estimate.f_i[0] + shifts[0] - reference.f_i[0];
        for i in 0..n_states {
            prop_assert!((estimate.f_i[i] + shifts[i] - reference.f_i[i] - offset).abs() < 1e-6);
        }
    }

    #[test]
    fn wham_changes_never_grow_after_a_few_sweeps((c_k_ij, b_k_i) in counts_and_biases()) {
        let n_k_i = c_k_ij.sum_axis(Axis(2));
        let changes = wham_changes(&n_k_i, &b_k_i);
        prop_assert!(changes.last().map_or(false, |&change| change < 1e-12));
        for pair in changes.windows(2).skip(5) {
            // below this the change is rounding noise
            if pair[0] > 1e-11 {
                prop_assert!(pair[1] <= pair[0], "change grew from {} to {}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn tram_per_state_shifts_only_move_f_i(
        seed in any::<u64>(),
        shifts in prop::collection::vec(-3.0f64..3.0, 3),
    ) {
        let model = DiscreteModel::default();
        let trajectories = model
            .sample_trajectories_with_seed(300, 0, seed)
            .expect("valid test system");
        let mut shifted = trajectories.clone();
        for mut b_x in shifted.b_k_x.outer_iter_mut() {
            for (b, &state) in b_x.iter_mut().zip(trajectories.m_x.iter()) {
                *b += shifts[state];
            }
        }

        let reference = tram(trajectories);
        let estimate = tram(shifted);

        // the first trajectory starts in state 0, so that entry is always finite
        let offset = estimate.f_k_i[[0, 0]] - reference.f_k_i[[0, 0]];
        for (&a, &b) in reference.f_k_i.iter().zip(estimate.f_k_i.iter()) {
            if a.is_finite() {
                prop_assert!((b - a - offset).abs() < 1e-8);
            } else {
                prop_assert_eq!(a, b);
            }
        }
        for (i, (&a, &b)) in reference.f_i.iter().zip(estimate.f_i.iter()).enumerate() {
            if a.is_finite() {
                prop_assert!((b + shifts[i] - a - offset).abs() < 1e-8);
            }
        }
        for (&a, &b) in reference.p_k_ij.iter().zip(estimate.p_k_ij.iter()) {
            prop_assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn tram_transition_matrices_are_reversible(seed in any::<u64>(), n_steps in 200usize..500) {
        let model = DiscreteModel::default();
        let Trajectories { c_k_ij, n_k_i, m_x, b_k_x } =
            model.sample_trajectories_with_seed(n_steps, 0, seed).expect("valid test system");
        let estimate = Tram::builder()
            .c_k_ij(c_k_ij)
            .n_k_i(n_k_i)
            .b_k_x(b_k_x)
            .m_x(m_x)
            .maximum_iterations(100_000)
            .build()
            .expect("sampled trajectories are consistent")
            .estimate();
        prop_assert!((total_probability(&estimate.f_i) - 1.0).abs() < 1e-10);

        let (n_conditions, n_states) = estimate.f_k_i.dim();
        for (k, i) in iproduct!(0..n_conditions, 0..n_states) {
            let row: f64 = (0..n_states).map(|j| estimate.p_k_ij[[k, i, j]]).sum();
            prop_assert!((row - 1.0).abs() < 1e-10);
            for j in 0..n_states {
                let forward = (-estimate.f_k_i[[k, i]]).exp() * estimate.p_k_ij[[k, i, j]];
                let backward = (-estimate.f_k_i[[k, j]]).exp() * estimate.p_k_ij[[k, j, i]];
                prop_assert!((forward - backward).abs() < 1e-10);
            }
        }
    }
}
