//! Reversible transition-matrix machinery shared by dTRAM and TRAM.
//!
//! Under condition $K$ the transition matrix is parametrized by the stationary weights
//! $\pi^K_i = e^{-f^K_i}$ and exchange factors $\nu^K_i$ (kept as `log_nu_k_i`):
//!
//! $$
//!     p^K_{ij} = \frac{(c^K_{ij} + c^K_{ji})\, \pi^K_j}{\nu^K_i \pi^K_j + \nu^K_j \pi^K_i}
//!     \qquad (i \neq j)
//! $$
//!
//! which satisfies detailed balance by construction. The same denominator is used for the
//! $i \to j$ and $j \to i$ terms.

use crate::lse::*;
use ndarray::{ArrayView2, ArrayView3, ArrayViewMut1, ArrayViewMut2, ArrayViewMut3, Axis};

/// Log of a self-transition count, falling back to the prior when nothing was observed
fn log_self_transitions(count: usize) -> f64 {
    if count == 0 {
        LOG_PRIOR
    } else {
        (PRIOR + count as f64).ln()
    }
}

/// Seed `log_nu_k_i` with the mean of each state's outgoing and incoming transition counts.
pub(crate) fn seed_exchange(c_k_ij: ArrayView3<'_, usize>, mut log_nu_k_i: ArrayViewMut2<'_, f64>) {
    for (counts, mut log_nu_i) in c_k_ij.outer_iter().zip(log_nu_k_i.outer_iter_mut()) {
        for (i, log_nu) in log_nu_i.iter_mut().enumerate() {
            let outgoing: usize = counts.row(i).sum();
            let incoming: usize = counts.column(i).sum();
            *log_nu = (PRIOR + 0.5 * (outgoing + incoming) as f64).ln();
        }
    }
}

/// One sweep of the exchange-factor fixed point
///
/// $$ \nu^K_i \leftarrow c^K_{ii} + \sum_{j \neq i} \frac{(c^K_{ij} + c^K_{ji})\, \nu^K_i \pi^K_j}
///     {\nu^K_i \pi^K_j + \nu^K_j \pi^K_i} $$
///
/// reading only `old_log_nu_k_i` and writing only `log_nu_k_i`.
pub(crate) fn exchange_sweep(
    old_log_nu_k_i: ArrayView2<'_, f64>,
    f_k_i: ArrayView2<'_, f64>,
    c_k_ij: ArrayView3<'_, usize>,
    scratch_m: &mut [f64],
    mut log_nu_k_i: ArrayViewMut2<'_, f64>,
) {
    let (n_conditions, n_states) = old_log_nu_k_i.dim();
    for k in 0..n_conditions {
        for i in 0..n_states {
            let mut o = 0;
            for j in 0..n_states {
                let c_ij = c_k_ij[[k, i, j]];
                if i == j {
                    scratch_m[o] = log_self_transitions(c_ij);
                    o += 1;
                    continue;
                }
                let c_sym = c_ij + c_k_ij[[k, j, i]];
                if c_sym == 0 {
                    continue;
                }
                let divisor = logsumexp_pair(
                    old_log_nu_k_i[[k, j]] - f_k_i[[k, i]],
                    old_log_nu_k_i[[k, i]] - f_k_i[[k, j]],
                );
                scratch_m[o] =
                    (c_sym as f64).ln() + old_log_nu_k_i[[k, i]] - f_k_i[[k, j]] - divisor;
                o += 1;
            }
            log_nu_k_i[[k, i]] = logsumexp(&scratch_m[..o]);
        }
    }
}

/// Log reweighting factors $\ln R^K_i$: the effective number of visits to $i$ under $K$ divided
/// by $\pi^K_i$.
///
/// $$ R^K_i = \frac{c^K_{ii}}{\pi^K_i} + \sum_{j \neq i} \frac{(c^K_{ij} + c^K_{ji})\, \nu^K_j}
///     {\nu^K_i \pi^K_j + \nu^K_j \pi^K_i} + \frac{N^K_i - \sum_j c^K_{ji}}{\pi^K_i} $$
///
/// The last term only applies when visit counts are given and only when positive: it accounts for
/// frames that are not the end point of an observed transition, such as the first frame of a
/// trajectory.
pub(crate) fn reweighting_factors(
    log_nu_k_i: ArrayView2<'_, f64>,
    f_k_i: ArrayView2<'_, f64>,
    c_k_ij: ArrayView3<'_, usize>,
    n_k_i: Option<ArrayView2<'_, usize>>,
    scratch_m: &mut [f64],
    mut log_r_k_i: ArrayViewMut2<'_, f64>,
) {
    let (n_conditions, n_states) = log_nu_k_i.dim();
    for k in 0..n_conditions {
        for i in 0..n_states {
            let mut o = 0;
            let mut incoming = 0;
            for j in 0..n_states {
                let c_ij = c_k_ij[[k, i, j]];
                let c_ji = c_k_ij[[k, j, i]];
                incoming += c_ji;
                if i == j {
                    scratch_m[o] = log_self_transitions(c_ij) + f_k_i[[k, i]];
                    o += 1;
                    continue;
                }
                let c_sym = c_ij + c_ji;
                if c_sym == 0 {
                    continue;
                }
                let divisor = logsumexp_pair(
                    log_nu_k_i[[k, j]] - f_k_i[[k, i]],
                    log_nu_k_i[[k, i]] - f_k_i[[k, j]],
                );
                scratch_m[o] = (c_sym as f64).ln() + log_nu_k_i[[k, j]] - divisor;
                o += 1;
            }

            let mut log_r = logsumexp(&scratch_m[..o]);
            if let Some(n_k_i) = n_k_i {
                match n_k_i[[k, i]].checked_sub(incoming) {
                    Some(extra) if extra > 0 => {
                        log_r = logsumexp_pair(log_r, (extra as f64).ln() + f_k_i[[k, i]]);
                    }
                    _ => {}
                }
            }
            log_r_k_i[[k, i]] = log_r;
        }
    }
}

/// Detailed-balance transition matrices from converged exchange factors and free energies.
///
/// If the largest off-diagonal row sum of a condition exceeds one, every off-diagonal entry of
/// that condition is divided by it; this keeps detailed balance intact. The diagonal takes the
/// remaining probability, so a state without observed transitions is absorbing.
pub(crate) fn transition_matrices(
    log_nu_k_i: ArrayView2<'_, f64>,
    f_k_i: ArrayView2<'_, f64>,
    c_k_ij: ArrayView3<'_, usize>,
    mut p_k_ij: ArrayViewMut3<'_, f64>,
) {
    let (n_conditions, n_states) = log_nu_k_i.dim();
    for k in 0..n_conditions {
        let mut p_ij = p_k_ij.index_axis_mut(Axis(0), k);
        let mut max_sum = 0.0_f64;
        for i in 0..n_states {
            let mut row_sum = 0.0;
            for j in 0..n_states {
                let c_sym = c_k_ij[[k, i, j]] + c_k_ij[[k, j, i]];
                p_ij[[i, j]] = if i == j || c_sym == 0 {
                    0.0
                } else {
                    let divisor = logsumexp_pair(
                        log_nu_k_i[[k, i]] - f_k_i[[k, j]],
                        log_nu_k_i[[k, j]] - f_k_i[[k, i]],
                    );
                    ((c_sym as f64).ln() - f_k_i[[k, j]] - divisor).exp()
                };
                row_sum += p_ij[[i, j]];
            }
            max_sum = max_sum.max(row_sum);
        }

        if max_sum > 1.0 {
            p_ij.mapv_inplace(|p| p / max_sum);
        }
        for i in 0..n_states {
            let off_diagonal: f64 = p_ij.row(i).sum();
            p_ij[[i, i]] = 1.0 - off_diagonal;
        }
    }
}

/// $f^K = -\ln \sum_i e^{-f^K_i}$ for every condition
pub(crate) fn condition_free_energies(
    f_k_i: ArrayView2<'_, f64>,
    scratch_m: &mut [f64],
    mut f_k: ArrayViewMut1<'_, f64>,
) {
    for (f_i, f) in f_k_i.outer_iter().zip(f_k.iter_mut()) {
        *f = -logsumexp_neg(f_i, scratch_m);
    }
}
