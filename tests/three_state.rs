use anyhow::Result;
use itertools::iproduct;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tram_rs::testsystems::*;
use tram_rs::{wham, Dtram, Tram};

const N_SAMPLES: usize = 10_000;
const MAXIMUM_ITERATIONS: usize = 10_000;
const TOLERANCE: f64 = 1e-15;
const ATOL: f64 = 0.1;

fn assert_close(name: &str, estimate: f64, exact: f64) {
    assert!(
        (estimate - exact).abs() < ATOL,
        "{}: estimate {} differs from exact {}",
        name,
        estimate,
        exact
    );
}

#[test]
fn wham_recovers_unbiased_free_energies() -> Result<()> {
    let model = DiscreteModel::default();
    let mut rng = StdRng::seed_from_u64(1);
    let n_k_i = model.sample_independent(N_SAMPLES, &mut rng)?;

    let estimate = wham::estimate(
        n_k_i,
        model.b_k_i().clone(),
        MAXIMUM_ITERATIONS,
        TOLERANCE,
    )?;
    assert!(estimate.status.error() < 1e-12);

    let f_i = model.f_i();
    for i in 0..model.n_states() {
        assert_close("f_i", estimate.f_i[i], f_i[i]);
    }
    let f_k = model.f_k();
    for k in 0..model.n_conditions() {
        assert_close("f_k", estimate.f_k[k], f_k[k]);
    }
    Ok(())
}

#[test]
fn dtram_recovers_biased_free_energies_and_kinetics() -> Result<()> {
    let model = DiscreteModel::default();
    let trajectories = model.sample_trajectories_with_seed(N_SAMPLES, 0, 2)?;

    let estimate = Dtram::builder()
        .c_k_ij(trajectories.c_k_ij)
        .b_k_i(model.b_k_i().clone())
        .maximum_iterations(MAXIMUM_ITERATIONS)
        .tolerance(TOLERANCE)
        .build()?
        .estimate();
    assert!(estimate.status.error() < 1e-12);

    let f_k_i = model.f_k_i();
    let p_k_ij = model.transition_matrices();
    for (k, i) in iproduct!(0..model.n_conditions(), 0..model.n_states()) {
        assert_close("f_k_i", estimate.f_k_i[[k, i]], f_k_i[[k, i]]);
        for j in 0..model.n_states() {
            assert_close("p_k_ij", estimate.p_k_ij[[k, i, j]], p_k_ij[[k, i, j]]);
        }
    }
    Ok(())
}

#[test]
fn tram_recovers_biased_free_energies_and_kinetics() -> Result<()> {
    let model = DiscreteModel::default();
    let Trajectories {
        c_k_ij,
        n_k_i,
        m_x,
        b_k_x,
    } = model.sample_trajectories_with_seed(N_SAMPLES, 0, 3)?;

    let estimate = Tram::builder()
        .c_k_ij(c_k_ij)
        .n_k_i(n_k_i)
        .b_k_x(b_k_x)
        .m_x(m_x)
        .maximum_iterations(MAXIMUM_ITERATIONS)
        .tolerance(TOLERANCE)
        .build()?
        .estimate();
    assert!(estimate.status.error() < 1e-12);

    let f_i = model.f_i();
    let f_k_i = model.f_k_i();
    let p_k_ij = model.transition_matrices();
    for i in 0..model.n_states() {
        assert_close("f_i", estimate.f_i[i], f_i[i]);
    }
    for (k, i) in iproduct!(0..model.n_conditions(), 0..model.n_states()) {
        assert_close("f_k_i", estimate.f_k_i[[k, i]], f_k_i[[k, i]]);
        for j in 0..model.n_states() {
            assert_close("p_k_ij", estimate.p_k_ij[[k, i, j]], p_k_ij[[k, i, j]]);
        }
    }
    Ok(())
}

#[test]
fn dtram_and_tram_agree_on_state_indexed_biases() -> Result<()> {
    let model = DiscreteModel::default();
    let trajectories = model.sample_trajectories_with_seed(2_000, 1, 4)?;

    let dtram = Dtram::builder()
        .c_k_ij(trajectories.c_k_ij.clone())
        .b_k_i(model.b_k_i().clone())
        .maximum_iterations(MAXIMUM_ITERATIONS)
        .tolerance(1e-13)
        .build()?
        .estimate();
    let tram = Tram::builder()
        .c_k_ij(trajectories.c_k_ij)
        .n_k_i(trajectories.n_k_i)
        .b_k_x(trajectories.b_k_x)
        .m_x(trajectories.m_x)
        .maximum_iterations(MAXIMUM_ITERATIONS)
        .tolerance(1e-13)
        .build()?
        .estimate();

    // with frame biases that only depend on the state, TRAM reduces to dTRAM
    for i in 0..model.n_states() {
        assert!((dtram.f_i[i] - tram.f_i[i]).abs() < 1e-6);
    }
    Ok(())
}
