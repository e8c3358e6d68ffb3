//! The discrete transition-based reweighting analysis method (dTRAM).
//!
//! dTRAM combines transition counts $c^K_{ij}$ observed under several bias conditions $K$ with
//! the known reduced bias energies $b^K_i$ of each discrete state. The unbiased free energies $f_i$
//! and the exchange factors $\nu^K_i$ are found by alternating two fixed-point sweeps:
//!
//! 1. [`update_exchange`] refreshes $\nu^K_i$ for the current $f_i$;
//! 2. [`update_free_energies`] refreshes $f_i$ for the new $\nu^K_i$.
//!
//! The sweeps are pure: they read the previous iterate and write the next one into a separate,
//! caller-owned buffer. [`Dtram::estimate`] is a ready-made driver loop; callers that want their
//! own convergence policy can drive the sweeps directly.
//!
//! # References
//!
//! 1. Wu H, Mey ASJS, Rosta E and Noé F. Statistically optimal analysis of state-discretized
//! trajectory data from multiple thermodynamic states. J. Chem. Phys. 141:214106, 2014
//! <http://dx.doi.org/10.1063/1.4902240>

use crate::convergence::*;
use crate::errors::*;
use crate::lse::*;
use crate::reversible;
use crate::validation::*;
use ndarray::{
    s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, ArrayViewMut2,
    ArrayViewMut3, Axis, Zip,
};

/// Scratch space threaded through the dTRAM sweeps
///
/// Capacity: one slot per state, one per condition and two (conditions × states) tables.
/// Allocate it once per problem size and reuse it for every sweep.
#[derive(Debug, Clone)]
pub struct Workspace {
    scratch_m: Vec<f64>,
    scratch_k: Vec<f64>,
    f_k_i: Array2<f64>,
    log_r_k_i: Array2<f64>,
}

impl Workspace {
    /// Allocate a workspace for `n_conditions` bias conditions and `n_states` states
    pub fn new(n_conditions: usize, n_states: usize) -> Self {
        Self {
            scratch_m: vec![0.0; n_states],
            scratch_k: vec![0.0; n_conditions],
            f_k_i: Array2::zeros((n_conditions, n_states)),
            log_r_k_i: Array2::zeros((n_conditions, n_states)),
        }
    }

    /// (conditions, states) this workspace was allocated for
    pub fn dim(&self) -> (usize, usize) {
        self.f_k_i.dim()
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

/// $f^K_i = f_i + b^K_i$
pub fn biased_free_energies(
    b_k_i: ArrayView2<'_, f64>,
    f_i: ArrayView1<'_, f64>,
    mut f_k_i: ArrayViewMut2<'_, f64>,
) {
    Zip::from(&mut f_k_i)
        .and(&b_k_i)
        .and_broadcast(&f_i)
        .apply(|f_k, &b, &f| *f_k = f + b);
}

/// Seed the log exchange factors from the transition counts.
///
/// Each $\nu^K_i$ starts at the mean of the state's outgoing and incoming counts (plus a tiny
/// prior, so states without counts get a very negative but finite value).
pub fn initialize_exchange(c_k_ij: ArrayView3<'_, usize>, log_nu_k_i: ArrayViewMut2<'_, f64>) {
    reversible::seed_exchange(c_k_ij, log_nu_k_i);
}

/// One sweep of the exchange factors for fixed free energies `f_i`.
///
/// # Panics
///
/// Panics if the array shapes or the workspace do not match `b_k_i`.
pub fn update_exchange(
    old_log_nu_k_i: ArrayView2<'_, f64>,
    b_k_i: ArrayView2<'_, f64>,
    f_i: ArrayView1<'_, f64>,
    c_k_ij: ArrayView3<'_, usize>,
    workspace: &mut Workspace,
    log_nu_k_i: ArrayViewMut2<'_, f64>,
) {
    assert_eq!(workspace.dim(), b_k_i.dim(), "workspace does not fit b_k_i");
    biased_free_energies(b_k_i, f_i, workspace.f_k_i.view_mut());
    reversible::exchange_sweep(
        old_log_nu_k_i,
        workspace.f_k_i.view(),
        c_k_ij,
        &mut workspace.scratch_m,
        log_nu_k_i,
    );
}

/// One sweep of the unbiased free energies for fixed exchange factors.
///
/// Solves
///
/// $$ e^{-f_i} = \frac{\sum_K \sum_j c^K_{ji}}{\sum_K e^{-b^K_i} R^K_i} $$
///
/// where the reweighting factors $R^K_i$ are evaluated at `old_f_i`, then normalizes the result so
/// that $\sum_i e^{-f_i} = 1$. A state that no transition ever ends in has $f_i = +\infty$.
///
/// # Panics
///
/// Panics if the array shapes or the workspace do not match `b_k_i`.
pub fn update_free_energies(
    log_nu_k_i: ArrayView2<'_, f64>,
    b_k_i: ArrayView2<'_, f64>,
    old_f_i: ArrayView1<'_, f64>,
    c_k_ij: ArrayView3<'_, usize>,
    workspace: &mut Workspace,
    mut f_i: ArrayViewMut1<'_, f64>,
) {
    assert_eq!(workspace.dim(), b_k_i.dim(), "workspace does not fit b_k_i");
    let Workspace {
        scratch_m,
        scratch_k,
        f_k_i,
        log_r_k_i,
    } = workspace;

    biased_free_energies(b_k_i, old_f_i, f_k_i.view_mut());
    reversible::reweighting_factors(
        log_nu_k_i,
        f_k_i.view(),
        c_k_ij,
        None,
        scratch_m,
        log_r_k_i.view_mut(),
    );

    for (i, f) in f_i.iter_mut().enumerate() {
        let incoming: usize = c_k_ij.slice(s![.., .., i]).sum();
        if incoming == 0 {
            *f = f64::INFINITY;
            continue;
        }
        for (slot, (&log_r, &b)) in scratch_k
            .iter_mut()
            .zip(log_r_k_i.column(i).iter().zip(b_k_i.column(i).iter()))
        {
            *slot = log_r - b;
        }
        *f = logsumexp(scratch_k) - (incoming as f64).ln();
    }

    let shift = logsumexp_neg(f_i.view(), scratch_m);
    if shift.is_finite() {
        f_i.mapv_inplace(|f| f + shift);
    }
}

/// Free energy of every condition's full ensemble, $f^K = -\ln \sum_i e^{-f_i - b^K_i}$
///
/// # Panics
///
/// Panics if the array shapes or the workspace do not match `b_k_i`.
pub fn finalize_f_k(
    b_k_i: ArrayView2<'_, f64>,
    f_i: ArrayView1<'_, f64>,
    workspace: &mut Workspace,
    f_k: ArrayViewMut1<'_, f64>,
) {
    assert_eq!(workspace.dim(), b_k_i.dim(), "workspace does not fit b_k_i");
    biased_free_energies(b_k_i, f_i, workspace.f_k_i.view_mut());
    reversible::condition_free_energies(workspace.f_k_i.view(), &mut workspace.scratch_m, f_k);
}

/// Detailed-balance transition matrices $P^K_{ij}$ for every condition.
///
/// Every row sums to one; states without any observed transition are absorbing.
///
/// # Panics
///
/// Panics if the array shapes or the workspace do not match `b_k_i`.
pub fn finalize_transition_matrix(
    log_nu_k_i: ArrayView2<'_, f64>,
    b_k_i: ArrayView2<'_, f64>,
    f_i: ArrayView1<'_, f64>,
    c_k_ij: ArrayView3<'_, usize>,
    workspace: &mut Workspace,
    p_k_ij: ArrayViewMut3<'_, f64>,
) {
    assert_eq!(workspace.dim(), b_k_i.dim(), "workspace does not fit b_k_i");
    biased_free_energies(b_k_i, f_i, workspace.f_k_i.view_mut());
    reversible::transition_matrices(log_nu_k_i, workspace.f_k_i.view(), c_k_ij, p_k_ij);
}

/// dTRAM estimator over transition counts from several bias conditions.
///
/// # Example
///
/// ```
/// use ndarray::array;
/// use tram_rs::dtram::Dtram;
///
/// let dtram = Dtram::builder()
///     .c_k_ij(array![[[80, 20], [20, 30]], [[30, 20], [20, 80]]])
///     .b_k_i(array![[0.0, 0.0], [1.0, 0.0]])
///     .maximum_iterations(100_000)
///     .build()
///     .unwrap();
/// let estimate = dtram.estimate();
/// assert!(estimate.status.converged());
/// ```
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct Dtram {
    /// `c_k_ij[k, i, j]` is the number of transitions from state `i` to state `j` observed under
    /// condition `k`
    c_k_ij: Array3<usize>,

    /// `b_k_i[k, i]` is the reduced bias energy of state `i` under condition `k`
    b_k_i: Array2<f64>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "1000")]
    maximum_iterations: usize,

    /// Stop once no `f_k_i` changes by more than this between sweeps
    #[builder(default = "1.0e-10")]
    tolerance: f64,
}

impl DtramBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        validate_policy(self.maximum_iterations, self.tolerance)
    }

    /// Build the estimator, checking the shapes and values of its inputs
    pub fn build(&self) -> Result<Dtram> {
        let new = self.build_inner()?;
        new.check()?;
        Ok(new)
    }
}

/// Output of [`Dtram::estimate`]
#[derive(Debug, Clone)]
pub struct DtramEstimate {
    /// `f_k[k]` is the free energy of condition `k`'s whole ensemble
    pub f_k: Array1<f64>,
    /// `f_i[i]` is the unbiased free energy of state `i`, normalized so that $\sum_i e^{-f_i} = 1$
    pub f_i: Array1<f64>,
    /// `f_k_i[k, i]` is the free energy of state `i` under condition `k`
    pub f_k_i: Array2<f64>,
    /// `log_nu_k_i[k, i]` is the log exchange factor of state `i` under condition `k`
    pub log_nu_k_i: Array2<f64>,
    /// `p_k_ij[k, i, j]` is the estimated transition probability from `i` to `j` under `k`
    pub p_k_ij: Array3<f64>,
    /// Whether the driver met its tolerance
    pub status: Status,
}

impl Dtram {
    /// Get a new builder for the `Dtram` struct. `Dtram` can only be constructed via the builder.
    pub fn builder() -> DtramBuilder {
        DtramBuilder::default()
    }

    fn check(&self) -> Result<()> {
        let (n_conditions, n_states) = self.b_k_i.dim();
        check_nonempty("conditions", n_conditions)?;
        check_nonempty("states", n_states)?;
        check_shape(
            "c_k_ij",
            self.c_k_ij.shape(),
            &[n_conditions, n_states, n_states],
        )?;
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

    /// `c_k_ij[k, i, j]` is the number of transitions from `i` to `j` observed under `k`
    pub fn c_k_ij(&self) -> &Array3<usize> {
        &self.c_k_ij
    }

    /// `b_k_i[k, i]` is the reduced bias energy of state `i` under condition `k`
    pub fn b_k_i(&self) -> &Array2<f64> {
        &self.b_k_i
    }

    /// The iteration budget and tolerance used by [`Dtram::estimate`]
    pub fn convergence(&self) -> Convergence {
        Convergence {
            maximum_iterations: self.maximum_iterations,
            tolerance: self.tolerance,
        }
    }

    /// Iterate the dTRAM equations until `f_k_i` stops changing, then derive `f_k` and the
    /// transition matrices.
    ///
    /// Running out of iterations is not an error: the last iterate is returned and
    /// `status` says so.
    pub fn estimate(&self) -> DtramEstimate {
        let (n_conditions, n_states) = self.b_k_i.dim();
        let b_k_i = self.b_k_i.view();
        let c_k_ij = self.c_k_ij.view();
        let mut workspace = Workspace::new(n_conditions, n_states);

        let mut log_nu_k_i = Array2::zeros((n_conditions, n_states));
        initialize_exchange(c_k_ij, log_nu_k_i.view_mut());
        let mut new_log_nu_k_i = log_nu_k_i.clone();
        let mut f_i = Array1::zeros(n_states);
        let mut new_f_i = f_i.clone();
        let mut f_k_i = self.b_k_i.clone();
        let mut new_f_k_i = f_k_i.clone();

        let status = self.convergence().run("dTRAM", |_| {
            update_exchange(
                log_nu_k_i.view(),
                b_k_i,
                f_i.view(),
                c_k_ij,
                &mut workspace,
                new_log_nu_k_i.view_mut(),
            );
            update_free_energies(
                new_log_nu_k_i.view(),
                b_k_i,
                f_i.view(),
                c_k_ij,
                &mut workspace,
                new_f_i.view_mut(),
            );
            biased_free_energies(b_k_i, new_f_i.view(), new_f_k_i.view_mut());
            let error = max_abs_change(&f_k_i, &new_f_k_i);

            std::mem::swap(&mut log_nu_k_i, &mut new_log_nu_k_i);
            std::mem::swap(&mut f_i, &mut new_f_i);
            std::mem::swap(&mut f_k_i, &mut new_f_k_i);
            error
        });

        let mut f_k = Array1::zeros(n_conditions);
        finalize_f_k(b_k_i, f_i.view(), &mut workspace, f_k.view_mut());
        let mut p_k_ij = Array3::zeros((n_conditions, n_states, n_states));
        finalize_transition_matrix(
            log_nu_k_i.view(),
            b_k_i,
            f_i.view(),
            c_k_ij,
            &mut workspace,
            p_k_ij.view_mut(),
        );

        DtramEstimate {
            f_k,
            f_i,
            f_k_i,
            log_nu_k_i,
            p_k_ij,
            status,
        }
    }
}
