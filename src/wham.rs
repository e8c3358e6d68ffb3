//! The weighted histogram analysis method (WHAM).
//!
//! WHAM only uses how often each state was visited under each bias condition, $N^K_i$, and the
//! reduced bias energies $b^K_i$. It alternates between the condition normalizers
//!
//! $$ f^K = -\ln \sum_i e^{-f_i - b^K_i} $$
//!
//! and the unbiased state free energies
//!
//! $$ f_i = \ln \sum_K N^K e^{f^K - b^K_i} - \ln \sum_K N^K_i $$
//!
//! where $N^K = \sum_i N^K_i$ is the number of samples drawn under condition $K$.
//!
//! # References
//!
//! 1. Ferrenberg AM and Swendsen RH. Optimized Monte Carlo data analysis. Phys. Rev. Lett.
//! 63:1195, 1989 <http://dx.doi.org/10.1103/PhysRevLett.63.1195>

use crate::convergence::*;
use crate::errors::*;
use crate::lse::*;
use crate::validation::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};

/// Scratch space for the WHAM sweeps: one slot per condition and one per state
#[derive(Debug, Clone)]
pub struct Workspace {
    scratch_k: Vec<f64>,
    scratch_m: Vec<f64>,
}

impl Workspace {
    /// Allocate a workspace for `n_conditions` bias conditions and `n_states` states
    pub fn new(n_conditions: usize, n_states: usize) -> Self {
        Self {
            scratch_k: vec![0.0; n_conditions],
            scratch_m: vec![0.0; n_states],
        }
    }

    /// (conditions, states) this workspace was allocated for
    pub fn dim(&self) -> (usize, usize) {
        (self.scratch_k.len(), self.scratch_m.len())
    }

    /// Fail unless the workspace fits a problem of the given size
    pub fn check(&self, n_conditions: usize, n_states: usize) -> Result<()> {
        if self.dim() != (n_conditions, n_states) {
            return Err(EstimatorError::WorkspaceMismatch {
                expected: (n_conditions, n_states),
                found: self.dim(),
            });
        }
        Ok(())
    }
}

/// $\ln N^K$ and $\ln \sum_K N^K_i$; empty conditions and unvisited states map to `-inf`
pub fn log_sample_sizes(n_k_i: ArrayView2<'_, usize>) -> (Array1<f64>, Array1<f64>) {
    let log_count = |n: usize| (n as f64).ln();
    let log_n_k = n_k_i.sum_axis(Axis(1)).mapv(log_count);
    let log_n_i = n_k_i.sum_axis(Axis(0)).mapv(log_count);
    (log_n_k, log_n_i)
}

/// Recompute every condition's normalizer $f^K$ from the current `f_i`.
///
/// # Panics
///
/// Panics if the array shapes or the workspace do not match `b_k_i`.
pub fn update_normalizers(
    f_i: ArrayView1<'_, f64>,
    b_k_i: ArrayView2<'_, f64>,
    workspace: &mut Workspace,
    mut f_k: ArrayViewMut1<'_, f64>,
) {
    assert_eq!(workspace.dim(), b_k_i.dim(), "workspace does not fit b_k_i");
    for (f_k, b_i) in f_k.iter_mut().zip(b_k_i.outer_iter()) {
        for (slot, (&f, &b)) in workspace.scratch_m.iter_mut().zip(f_i.iter().zip(b_i)) {
            *slot = -(f + b);
        }
        *f_k = -logsumexp(&workspace.scratch_m);
    }
}

/// Recompute the unbiased free energies from the normalizers `f_k`, then normalize them so that
/// $\sum_i e^{-f_i} = 1$. States that were never visited get $f_i = +\infty$.
///
/// # Panics
///
/// Panics if the array shapes or the workspace do not match `b_k_i`.
pub fn update_free_energies(
    log_n_k: ArrayView1<'_, f64>,
    log_n_i: ArrayView1<'_, f64>,
    f_k: ArrayView1<'_, f64>,
    b_k_i: ArrayView2<'_, f64>,
    workspace: &mut Workspace,
    mut f_i: ArrayViewMut1<'_, f64>,
) {
    assert_eq!(workspace.dim(), b_k_i.dim(), "workspace does not fit b_k_i");
    for (i, (f, &log_n)) in f_i.iter_mut().zip(log_n_i).enumerate() {
        if log_n == f64::NEG_INFINITY {
            *f = f64::INFINITY;
            continue;
        }
        for (k, slot) in workspace.scratch_k.iter_mut().enumerate() {
            *slot = log_n_k[k] + f_k[k] - b_k_i[[k, i]];
        }
        *f = logsumexp(&workspace.scratch_k) - log_n;
    }

    let shift = logsumexp_neg(f_i.view(), &mut workspace.scratch_m);
    if shift.is_finite() {
        f_i.mapv_inplace(|f| f + shift);
    }
}

/// WHAM estimator over state visit counts from several bias conditions.
///
/// # Example
///
/// ```
/// use ndarray::array;
/// use tram_rs::wham::Wham;
///
/// let wham = Wham::builder()
///     .n_k_i(array![[60, 40], [30, 70]])
///     .b_k_i(array![[0.0, 0.0], [0.0, -0.5]])
///     .build()
///     .unwrap();
/// let estimate = wham.estimate();
/// assert!(estimate.status.converged());
/// ```
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct Wham {
    /// `n_k_i[k, i]` is the number of samples in state `i` drawn under condition `k`
    n_k_i: Array2<usize>,

    /// `b_k_i[k, i]` is the reduced bias energy of state `i` under condition `k`
    b_k_i: Array2<f64>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "1000")]
    maximum_iterations: usize,

    /// Stop once neither `f_i` nor `f_k` changes by more than this between sweeps
    #[builder(default = "1.0e-10")]
    tolerance: f64,
}

impl WhamBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        validate_policy(self.maximum_iterations, self.tolerance)
    }

    /// Build the estimator, checking the shapes and values of its inputs
    pub fn build(&self) -> Result<Wham> {
        let new = self.build_inner()?;
        new.check()?;
        Ok(new)
    }
}

/// Output of [`Wham::estimate`]
#[derive(Debug, Clone)]
pub struct WhamEstimate {
    /// `f_k[k]` is the free energy of condition `k`, consistent with the final `f_i`
    pub f_k: Array1<f64>,
    /// `f_i[i]` is the unbiased free energy of state `i`, normalized so that $\sum_i e^{-f_i} = 1$
    pub f_i: Array1<f64>,
    /// Whether the driver met its tolerance
    pub status: Status,
}

impl Wham {
    /// Get a new builder for the `Wham` struct. `Wham` can only be constructed via the builder.
    pub fn builder() -> WhamBuilder {
        WhamBuilder::default()
    }

    fn check(&self) -> Result<()> {
        let (n_conditions, n_states) = self.b_k_i.dim();
        check_nonempty("conditions", n_conditions)?;
        check_nonempty("states", n_states)?;
        check_shape("n_k_i", self.n_k_i.shape(), self.b_k_i.shape())?;
        check_finite("b_k_i", &self.b_k_i)
    }

    /// $K$, the number of bias conditions
    pub fn n_conditions(&self) -> usize {
        self.b_k_i.len_of(Axis(0))
    }

    /// $M$, the number of discrete states
    pub fn n_states(&self) -> usize {
        self.b_k_i.len_of(Axis(1))
    }

    /// `n_k_i[k, i]` is the number of samples in state `i` drawn under condition `k`
    pub fn n_k_i(&self) -> &Array2<usize> {
        &self.n_k_i
    }

    /// `b_k_i[k, i]` is the reduced bias energy of state `i` under condition `k`
    pub fn b_k_i(&self) -> &Array2<f64> {
        &self.b_k_i
    }

    /// The iteration budget and tolerance used by [`Wham::estimate`]
    pub fn convergence(&self) -> Convergence {
        Convergence {
            maximum_iterations: self.maximum_iterations,
            tolerance: self.tolerance,
        }
    }

    /// Alternate the normalizer and free energy updates until both stop changing.
    ///
    /// `f_k` is recomputed from the final `f_i`, so the two outputs are always consistent even
    /// when the iteration budget ran out.
    pub fn estimate(&self) -> WhamEstimate {
        let (n_conditions, n_states) = self.b_k_i.dim();
        let b_k_i = self.b_k_i.view();
        let (log_n_k, log_n_i) = log_sample_sizes(self.n_k_i.view());
        let mut workspace = Workspace::new(n_conditions, n_states);

        let mut f_i = Array1::zeros(n_states);
        let mut new_f_i = f_i.clone();
        let mut f_k = Array1::zeros(n_conditions);
        let mut new_f_k = f_k.clone();

        let status = self.convergence().run("WHAM", |_| {
            update_normalizers(f_i.view(), b_k_i, &mut workspace, new_f_k.view_mut());
            update_free_energies(
                log_n_k.view(),
                log_n_i.view(),
                new_f_k.view(),
                b_k_i,
                &mut workspace,
                new_f_i.view_mut(),
            );
            let error = max_abs_change(&f_i, &new_f_i).max(max_abs_change(&f_k, &new_f_k));

            std::mem::swap(&mut f_i, &mut new_f_i);
            std::mem::swap(&mut f_k, &mut new_f_k);
            error
        });

        update_normalizers(f_i.view(), b_k_i, &mut workspace, f_k.view_mut());
        WhamEstimate { f_k, f_i, status }
    }
}

/// Build a [`Wham`] estimator and run it in one go.
///
/// `maximum_iterations` and `tolerance` take the place of the builder defaults.
pub fn estimate(
    n_k_i: Array2<usize>,
    b_k_i: Array2<f64>,
    maximum_iterations: usize,
    tolerance: f64,
) -> Result<WhamEstimate> {
    let wham = Wham::builder()
        .n_k_i(n_k_i)
        .b_k_i(b_k_i)
        .maximum_iterations(maximum_iterations)
        .tolerance(tolerance)
        .build()?;
    Ok(wham.estimate())
}
