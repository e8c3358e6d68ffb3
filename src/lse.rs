//! Log-domain reductions shared by all estimators.
//!
//! Every sum over exponentials of (possibly large) reduced energies goes through
//! [`logsumexp`]. Missing data is represented by `-inf` in log space and simply contributes
//! nothing to a reduction.

use ndarray::{ArrayBase, ArrayView1, Data, Dimension, Zip};

/// Pseudo-count added to self-transition counts and to exchange-factor seeds.
pub const PRIOR: f64 = 1.0e-10;

/// `PRIOR.ln()`
pub const LOG_PRIOR: f64 = -23.025850929940457;

/// Numerically stable evaluation of $\ln \sum_k e^{x_k}$.
///
/// The running maximum is subtracted before exponentiating and the remaining terms are added up
/// with compensated summation.
///
/// - `-inf` entries are masked out; an empty or fully masked slice yields `-inf`.
/// - A `+inf` entry dominates and yields `+inf`.
/// - Any NaN entry yields NaN.
pub fn logsumexp(values: &[f64]) -> f64 {
    let mut max = f64::NEG_INFINITY;
    for &value in values {
        if value.is_nan() {
            return f64::NAN;
        }
        max = max.max(value);
    }
    if max.is_infinite() {
        return max;
    }

    let mut sum = 0.0;
    let mut compensation = 0.0;
    for &value in values {
        let y = (value - max).exp() - compensation;
        let t = sum + y;
        compensation = (t - sum) - y;
        sum = t;
    }
    max + sum.ln()
}

/// $\ln(e^a + e^b)$ with the same masking rules as [`logsumexp`]
pub fn logsumexp_pair(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    let (max, min) = if a > b { (a, b) } else { (b, a) };
    if max.is_infinite() || min == f64::NEG_INFINITY {
        return max;
    }
    max + (min - max).exp().ln_1p()
}

/// $\ln \sum_i e^{-f_i}$, using `scratch` to hold the negated values.
///
/// Adding the result to every `f_i` normalizes $e^{-f_i}$ to a probability distribution.
///
/// # Panics
///
/// Panics if `scratch` is shorter than `free_energies`.
pub fn logsumexp_neg(free_energies: ArrayView1<'_, f64>, scratch: &mut [f64]) -> f64 {
    let n = free_energies.len();
    for (slot, &f) in scratch[..n].iter_mut().zip(free_energies.iter()) {
        *slot = -f;
    }
    logsumexp(&scratch[..n])
}

/// Largest absolute elementwise difference between two equally shaped arrays.
///
/// Entries that are equal (including matching infinities of unvisited states) count as no change.
///
/// # Panics
///
/// Panics if the shapes differ.
pub fn max_abs_change<S, T, D>(old: &ArrayBase<S, D>, new: &ArrayBase<T, D>) -> f64
where
    S: Data<Elem = f64>,
    T: Data<Elem = f64>,
    D: Dimension,
{
    let mut max = 0.0_f64;
    Zip::from(old).and(new).apply(|&a, &b| {
        let change = if a == b { 0.0 } else { (a - b).abs() };
        // a NaN is sticky so a broken sweep never reads as converged
        if change.is_nan() {
            max = f64::NAN;
        } else if change > max {
            max = change;
        }
    });
    max
}
