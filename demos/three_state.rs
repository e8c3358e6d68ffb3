use anyhow::Result;
use itertools::Itertools;
use ndarray::Axis;
use tram_rs::testsystems::*;
use tram_rs::{wham, Dtram, Tram};

fn main() -> Result<()> {
    // Generate some sample data
    let testcase = DiscreteModel::default();
    let n_k_i = testcase.sample_independent_with_seed(10_000, 1)?;
    let Trajectories {
        c_k_ij,
        n_k_i: frames_k_i,
        m_x,
        b_k_x,
    } = testcase.sample_trajectories_with_seed(10_000, 0, 2)?;

    println!("visits per condition: {:?}", n_k_i.sum_axis(Axis(1)));

    let wham = wham::estimate(n_k_i, testcase.b_k_i().clone(), 10_000, 1e-15)?;

    let dtram = Dtram::builder()
        .c_k_ij(c_k_ij.clone())
        .b_k_i(testcase.b_k_i().clone())
        .maximum_iterations(10_000)
        .tolerance(1e-15)
        .build()?
        .estimate();

    let tram = Tram::builder()
        .c_k_ij(c_k_ij)
        .n_k_i(frames_k_i)
        .b_k_x(b_k_x)
        .m_x(m_x)
        .maximum_iterations(10_000)
        .tolerance(1e-15)
        .build()?
        .estimate();

    for (name, status) in &[
        ("WHAM", wham.status),
        ("dTRAM", dtram.status),
        ("TRAM", tram.status),
    ] {
        println!(
            "{:>5}: {} sweeps, converged: {}",
            name,
            status.iterations(),
            status.converged()
        );
    }

    let exact = testcase.f_i();
    println!("\n state      exact       WHAM      dTRAM       TRAM");
    for i in 0..testcase.n_states() {
        println!(
            "{:>6} {:>10.4} {:>10.4} {:>10.4} {:>10.4}",
            i, exact[i], wham.f_i[i], dtram.f_i[i], tram.f_i[i]
        );
    }

    println!("\nTRAM transition matrices (exact in brackets)");
    let p_exact = testcase.transition_matrices();
    for (k, (p_ij, exact_ij)) in tram
        .p_k_ij
        .outer_iter()
        .zip(p_exact.outer_iter())
        .enumerate()
    {
        println!("condition {}", k);
        for (row, exact_row) in p_ij.genrows().into_iter().zip(exact_ij.genrows()) {
            println!(
                "  {}",
                row.iter()
                    .zip(exact_row.iter())
                    .map(|(p, e)| format!("{:.3} ({:.3})", p, e))
                    .join("  ")
            );
        }
    }

    Ok(())
}
