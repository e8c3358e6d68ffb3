//! The transition-based reweighting analysis method (TRAM).
//!
//! TRAM generalizes dTRAM from per-state biases $b^K_i$ to per-frame biases $b^K_x$: every frame
//! $x$ of the concatenated trajectories carries its own bias energy under every condition, while
//! $M_x$ records which discrete state the frame is in. Free energies are therefore tracked per
//! (condition, state) throughout the iteration, and the unbiased $f_i$ only appears at the end.
//!
//! A driver alternates [`update_exchange`] and [`update_f_k_i`], then calls
//! [`finalize_global_f_i`], [`normalize`] and [`finalize_transition_matrix`]. [`Tram::estimate`]
//! does exactly that.
//!
//! # References
//!
//! 1. Wu H, Paul F, Wehmeyer C and Noé F. Multiensemble Markov models of molecular
//! thermodynamics and kinetics. Proc. Natl. Acad. Sci. USA 113:E3221, 2016
//! <http://dx.doi.org/10.1073/pnas.1525092113>

use crate::convergence::*;
use crate::errors::*;
use crate::lse::*;
use crate::reversible;
use crate::validation::*;
use ndarray::{
    Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, ArrayViewMut2,
    ArrayViewMut3, Axis,
};

/// Scratch space threaded through the TRAM sweeps: one slot per state and one per condition
#[derive(Debug, Clone)]
pub struct Workspace {
    scratch_m: Vec<f64>,
    scratch_k: Vec<f64>,
}

impl Workspace {
    /// Allocate a workspace for `n_conditions` bias conditions and `n_states` states
    pub fn new(n_conditions: usize, n_states: usize) -> Self {
        Self {
            scratch_m: vec![0.0; n_states],
            scratch_k: vec![0.0; n_conditions],
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

/// Seed the log exchange factors from the transition counts; see
/// [`dtram::initialize_exchange`](crate::dtram::initialize_exchange).
pub fn initialize_exchange(c_k_ij: ArrayView3<'_, usize>, log_nu_k_i: ArrayViewMut2<'_, f64>) {
    reversible::seed_exchange(c_k_ij, log_nu_k_i);
}

/// One sweep of the exchange factors for fixed per-condition free energies `f_k_i`.
///
/// No bias term is needed here: it is already folded into `f_k_i`.
///
/// # Panics
///
/// Panics if the array shapes or the workspace do not match `f_k_i`.
pub fn update_exchange(
    old_log_nu_k_i: ArrayView2<'_, f64>,
    f_k_i: ArrayView2<'_, f64>,
    c_k_ij: ArrayView3<'_, usize>,
    workspace: &mut Workspace,
    log_nu_k_i: ArrayViewMut2<'_, f64>,
) {
    assert_eq!(workspace.dim(), f_k_i.dim(), "workspace does not fit f_k_i");
    reversible::exchange_sweep(
        old_log_nu_k_i,
        f_k_i,
        c_k_ij,
        &mut workspace.scratch_m,
        log_nu_k_i,
    );
}

/// $\ln \sum_L R^L_i e^{-b^L_x}$: the reweighting denominator of frame `x`, which is in `state`
fn frame_log_weight(
    log_r_k_i: &ArrayView2<'_, f64>,
    b_k_x: &ArrayView2<'_, f64>,
    x: usize,
    state: usize,
    scratch_k: &mut [f64],
) -> f64 {
    for (k, slot) in scratch_k.iter_mut().enumerate() {
        *slot = log_r_k_i[[k, state]] - b_k_x[[k, x]];
    }
    logsumexp(scratch_k)
}

/// One sweep of the per-condition free energies.
///
/// First the reweighting factors `log_r_k_i` are evaluated at `old_f_k_i`, then every frame $x$
/// in state $i$ contributes to
///
/// $$ e^{-f^K_i} = \sum_{x : M_x = i} \frac{e^{-b^K_x}}{\sum_L R^L_i e^{-b^L_x}} $$
///
/// Finally `f_k_i` is shifted so that $\sum_i e^{-f^{K_\mathrm{ref}}_i} = 1$ for
/// `reference_condition`. States without frames keep $f^K_i = +\infty$.
///
/// `log_r_k_i` is an output as well: [`finalize_global_f_i`] needs it. The return value is the
/// constant that was added to every entry of `f_k_i` by the normalization (zero if none was
/// possible); the driver applies it to the global free energies too.
///
/// # Panics
///
/// Panics if the array shapes or the workspace do not match, or if `reference_condition` is out of
/// range.
#[allow(clippy::too_many_arguments)]
pub fn update_f_k_i(
    log_nu_k_i: ArrayView2<'_, f64>,
    old_f_k_i: ArrayView2<'_, f64>,
    c_k_ij: ArrayView3<'_, usize>,
    b_k_x: ArrayView2<'_, f64>,
    m_x: ArrayView1<'_, usize>,
    n_k_i: ArrayView2<'_, usize>,
    reference_condition: usize,
    workspace: &mut Workspace,
    mut f_k_i: ArrayViewMut2<'_, f64>,
    mut log_r_k_i: ArrayViewMut2<'_, f64>,
) -> f64 {
    assert_eq!(workspace.dim(), old_f_k_i.dim(), "workspace does not fit f_k_i");
    reversible::reweighting_factors(
        log_nu_k_i,
        old_f_k_i,
        c_k_ij,
        Some(n_k_i),
        &mut workspace.scratch_m,
        log_r_k_i.view_mut(),
    );

    let log_r_k_i = log_r_k_i.view();
    f_k_i.fill(f64::INFINITY);
    for (x, &state) in m_x.iter().enumerate() {
        let divisor = frame_log_weight(&log_r_k_i, &b_k_x, x, state, &mut workspace.scratch_k);
        for k in 0..f_k_i.len_of(Axis(0)) {
            f_k_i[[k, state]] = -logsumexp_pair(-f_k_i[[k, state]], -(divisor + b_k_x[[k, x]]));
        }
    }

    let shift = logsumexp_neg(
        f_k_i.index_axis(Axis(0), reference_condition),
        &mut workspace.scratch_m,
    );
    if !shift.is_finite() {
        return 0.0;
    }
    f_k_i.mapv_inplace(|f| f + shift);
    shift
}

/// Unbiased free energy of every state, aggregated over all frames and conditions:
///
/// $$ e^{-f_i} = \sum_{x : M_x = i} \frac{1}{\sum_L R^L_i e^{-b^L_x}} $$
///
/// The result shares its additive constant with the `f_k_i` that produced `log_r_k_i`, before
/// that sweep's normalization; call [`normalize`] to pin it.
///
/// # Panics
///
/// Panics if the array shapes or the workspace do not match `log_r_k_i`.
pub fn finalize_global_f_i(
    b_k_x: ArrayView2<'_, f64>,
    m_x: ArrayView1<'_, usize>,
    log_r_k_i: ArrayView2<'_, f64>,
    workspace: &mut Workspace,
    mut f_i: ArrayViewMut1<'_, f64>,
) {
    assert_eq!(workspace.dim(), log_r_k_i.dim(), "workspace does not fit log_r_k_i");
    f_i.fill(f64::INFINITY);
    for (x, &state) in m_x.iter().enumerate() {
        let divisor = frame_log_weight(&log_r_k_i, &b_k_x, x, state, &mut workspace.scratch_k);
        f_i[state] = -logsumexp_pair(-f_i[state], -divisor);
    }
}

/// Shift `f_i` and `f_k_i` by the same constant so that $\sum_i e^{-f_i} = 1$
///
/// # Panics
///
/// Panics if the workspace does not match `f_k_i`.
pub fn normalize(
    mut f_i: ArrayViewMut1<'_, f64>,
    mut f_k_i: ArrayViewMut2<'_, f64>,
    workspace: &mut Workspace,
) {
    assert_eq!(workspace.dim(), f_k_i.dim(), "workspace does not fit f_k_i");
    let shift = logsumexp_neg(f_i.view(), &mut workspace.scratch_m);
    if shift.is_finite() {
        f_i.mapv_inplace(|f| f + shift);
        f_k_i.mapv_inplace(|f| f + shift);
    }
}

/// Free energy of every condition's full ensemble, $f^K = -\ln \sum_i e^{-f^K_i}$
pub fn finalize_f_k(
    f_k_i: ArrayView2<'_, f64>,
    workspace: &mut Workspace,
    f_k: ArrayViewMut1<'_, f64>,
) {
    assert_eq!(workspace.dim(), f_k_i.dim(), "workspace does not fit f_k_i");
    reversible::condition_free_energies(f_k_i, &mut workspace.scratch_m, f_k);
}

/// Detailed-balance transition matrices $P^K_{ij}$ for every condition, using `f_k_i` directly.
pub fn finalize_transition_matrix(
    log_nu_k_i: ArrayView2<'_, f64>,
    f_k_i: ArrayView2<'_, f64>,
    c_k_ij: ArrayView3<'_, usize>,
    p_k_ij: ArrayViewMut3<'_, f64>,
) {
    reversible::transition_matrices(log_nu_k_i, f_k_i, c_k_ij, p_k_ij);
}

/// TRAM estimator over transition counts and per-frame bias energies.
///
/// `m_x`, `b_k_x` and `n_k_i` describe the same concatenated trajectory data: frame `x` is in
/// state `m_x[x]`, `b_k_x[k, x]` is its bias energy under condition `k`, and `n_k_i[k, i]` counts
/// how many frames of condition `k`'s trajectories are in state `i`.
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct Tram {
    /// `c_k_ij[k, i, j]` is the number of transitions from state `i` to state `j` observed under
    /// condition `k`
    c_k_ij: Array3<usize>,

    /// `n_k_i[k, i]` is the number of frames sampled in state `i` under condition `k`
    n_k_i: Array2<usize>,

    /// `b_k_x[k, x]` is the reduced bias energy of frame `x` evaluated at condition `k`
    b_k_x: Array2<f64>,

    /// `m_x[x]` is the discrete state of frame `x`
    m_x: Array1<usize>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "1000")]
    maximum_iterations: usize,

    /// Stop once no `f_k_i` changes by more than this between sweeps
    #[builder(default = "1.0e-10")]
    tolerance: f64,

    /// Condition whose state free energies are normalized during the iteration
    #[builder(default = "0")]
    reference_condition: usize,
}

impl TramBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        validate_policy(self.maximum_iterations, self.tolerance)
    }

    /// Build the estimator, checking the shapes and values of its inputs
    pub fn build(&self) -> Result<Tram> {
        let new = self.build_inner()?;
        new.check()?;
        Ok(new)
    }
}

/// Output of [`Tram::estimate`]
#[derive(Debug, Clone)]
pub struct TramEstimate {
    /// `f_k[k]` is the free energy of condition `k`'s whole ensemble
    pub f_k: Array1<f64>,
    /// `f_i[i]` is the unbiased free energy of state `i`, normalized so that $\sum_i e^{-f_i} = 1$
    pub f_i: Array1<f64>,
    /// `f_k_i[k, i]` is the free energy of state `i` under condition `k`, on the same scale as `f_i`
    pub f_k_i: Array2<f64>,
    /// `log_nu_k_i[k, i]` is the log exchange factor of state `i` under condition `k`
    pub log_nu_k_i: Array2<f64>,
    /// `log_r_k_i[k, i]` is the log reweighting factor of the final sweep
    pub log_r_k_i: Array2<f64>,
    /// `p_k_ij[k, i, j]` is the estimated transition probability from `i` to `j` under `k`
    pub p_k_ij: Array3<f64>,
    /// Whether the driver met its tolerance
    pub status: Status,
}

impl Tram {
    /// Get a new builder for the `Tram` struct. `Tram` can only be constructed via the builder.
    pub fn builder() -> TramBuilder {
        TramBuilder::default()
    }

    fn check(&self) -> Result<()> {
        let (n_conditions, n_states) = self.n_k_i.dim();
        check_nonempty("conditions", n_conditions)?;
        check_nonempty("states", n_states)?;
        check_nonempty("frames", self.m_x.len())?;
        check_shape(
            "c_k_ij",
            self.c_k_ij.shape(),
            &[n_conditions, n_states, n_states],
        )?;
        check_shape(
            "b_k_x",
            self.b_k_x.shape(),
            &[n_conditions, self.m_x.len()],
        )?;
        check_finite("b_k_x", &self.b_k_x)?;
        check_state_indices(self.m_x.view(), n_states)?;
        check_frame_counts(self.n_k_i.view(), self.m_x.view())?;
        if self.reference_condition >= n_conditions {
            return Err(EstimatorError::BuilderError(format!(
                "reference_condition {} is out of range for {} conditions",
                self.reference_condition, n_conditions
            )));
        }
        Ok(())
    }

    /// $K$, the number of bias conditions
    pub fn n_conditions(&self) -> usize {
        self.n_k_i.len_of(Axis(0))
    }

    /// $M$, the number of discrete states
    pub fn n_states(&self) -> usize {
        self.n_k_i.len_of(Axis(1))
    }

    /// $X$, the total number of frames
    pub fn n_frames(&self) -> usize {
        self.m_x.len()
    }

    /// `c_k_ij[k, i, j]` is the number of transitions from `i` to `j` observed under `k`
    pub fn c_k_ij(&self) -> &Array3<usize> {
        &self.c_k_ij
    }

    /// `n_k_i[k, i]` is the number of frames sampled in state `i` under condition `k`
    pub fn n_k_i(&self) -> &Array2<usize> {
        &self.n_k_i
    }

    /// `b_k_x[k, x]` is the reduced bias energy of frame `x` evaluated at condition `k`
    pub fn b_k_x(&self) -> &Array2<f64> {
        &self.b_k_x
    }

    /// `m_x[x]` is the discrete state of frame `x`
    pub fn m_x(&self) -> &Array1<usize> {
        &self.m_x
    }

    /// The iteration budget and tolerance used by [`Tram::estimate`]
    pub fn convergence(&self) -> Convergence {
        Convergence {
            maximum_iterations: self.maximum_iterations,
            tolerance: self.tolerance,
        }
    }

    /// Iterate the TRAM equations until `f_k_i` stops changing, then derive the unbiased free
    /// energies and the transition matrices.
    ///
    /// Running out of iterations is not an error: the last iterate is returned and
    /// `status` says so.
    pub fn estimate(&self) -> TramEstimate {
        let (n_conditions, n_states) = self.n_k_i.dim();
        let c_k_ij = self.c_k_ij.view();
        let mut workspace = Workspace::new(n_conditions, n_states);

        let mut log_nu_k_i = Array2::zeros((n_conditions, n_states));
        initialize_exchange(c_k_ij, log_nu_k_i.view_mut());
        let mut new_log_nu_k_i = log_nu_k_i.clone();
        let mut f_k_i = Array2::zeros((n_conditions, n_states));
        let mut new_f_k_i = f_k_i.clone();
        let mut log_r_k_i = Array2::zeros((n_conditions, n_states));

        // offset between the raw f_i that log_r_k_i produces and the stored f_k_i
        let mut last_shift = 0.0;
        let status = self.convergence().run("TRAM", |_| {
            update_exchange(
                log_nu_k_i.view(),
                f_k_i.view(),
                c_k_ij,
                &mut workspace,
                new_log_nu_k_i.view_mut(),
            );
            last_shift = update_f_k_i(
                new_log_nu_k_i.view(),
                f_k_i.view(),
                c_k_ij,
                self.b_k_x.view(),
                self.m_x.view(),
                self.n_k_i.view(),
                self.reference_condition,
                &mut workspace,
                new_f_k_i.view_mut(),
                log_r_k_i.view_mut(),
            );
            let error = max_abs_change(&f_k_i, &new_f_k_i);

            std::mem::swap(&mut log_nu_k_i, &mut new_log_nu_k_i);
            std::mem::swap(&mut f_k_i, &mut new_f_k_i);
            error
        });

        let mut f_i = Array1::zeros(n_states);
        finalize_global_f_i(
            self.b_k_x.view(),
            self.m_x.view(),
            log_r_k_i.view(),
            &mut workspace,
            f_i.view_mut(),
        );
        f_i.mapv_inplace(|f| f + last_shift);
        normalize(f_i.view_mut(), f_k_i.view_mut(), &mut workspace);

        let mut f_k = Array1::zeros(n_conditions);
        finalize_f_k(f_k_i.view(), &mut workspace, f_k.view_mut());
        let mut p_k_ij = Array3::zeros((n_conditions, n_states, n_states));
        finalize_transition_matrix(log_nu_k_i.view(), f_k_i.view(), c_k_ij, p_k_ij.view_mut());

        TramEstimate {
            f_k,
            f_i,
            f_k_i,
            log_nu_k_i,
            log_r_k_i,
            p_k_ij,
            status,
        }
    }
}
