use crate::errors::*;
use crate::lse::*;
use ndarray::{array, Array1, Array2, Array3, Axis, Zip};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Test cases using a discrete system simulated under several bias conditions.
///
/// The unbiased system has reduced energies `energies[i]`; under condition `k` every state is
/// shifted by `b_k_i[k, i]`. Dynamics are Metropolis-Hastings with the symmetric proposal
/// probabilities `selection[i, j]`, so every quantity the estimators produce is known exactly.
///
/// # Examples
///
/// Generate trajectories with default parameters and compare an estimate to the exact answer.
///
/// ```
/// use tram_rs::dtram::Dtram;
/// use tram_rs::testsystems::*;
///
/// let testcase = DiscreteModel::default();
/// let Trajectories { c_k_ij, .. } = testcase.sample_trajectories_with_seed(5000, 0, 42).unwrap();
///
/// let estimate = Dtram::builder()
///     .c_k_ij(c_k_ij)
///     .b_k_i(testcase.b_k_i().clone())
///     .maximum_iterations(10_000)
///     .build()
///     .unwrap()
///     .estimate();
/// let f_i = testcase.f_i();
/// for i in 0..testcase.n_states() {
///     assert!((estimate.f_i[i] - f_i[i]).abs() < 0.2);
/// }
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct DiscreteModel {
    /// Reduced energy of each state without bias
    #[builder(default = "array![1.0, 2.0, 0.0]")]
    energies: Array1<f64>,

    /// Reduced bias energy of each state under each condition
    #[builder(default = "array![[0.0, 0.0, 0.0], [1.0, 0.0, 2.0]]")]
    b_k_i: Array2<f64>,

    /// Symmetric proposal probabilities; what a row leaves out is proposed as staying put
    #[builder(default = "array![[0.5, 0.5, 0.0], [0.5, 0.0, 0.5], [0.0, 0.5, 0.5]]")]
    selection: Array2<f64>,
}

impl DiscreteModelBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        let n_states = self.energies.as_ref().map(|e| e.len());

        if let (Some(n_states), Some(b_k_i)) = (n_states, &self.b_k_i) {
            if b_k_i.len_of(Axis(1)) != n_states || b_k_i.len_of(Axis(0)) == 0 {
                return Err(format!(
                    "b_k_i must have shape (conditions, {}) with at least one condition (not {:?})",
                    n_states,
                    b_k_i.shape()
                ));
            }
        }

        if let (Some(n_states), Some(selection)) = (n_states, &self.selection) {
            if selection.dim() != (n_states, n_states) {
                return Err(format!(
                    "selection must have shape ({0}, {0}) (not {1:?})",
                    n_states,
                    selection.shape()
                ));
            }
            if selection.iter().any(|&p| !(p >= 0.0)) {
                return Err("selection probabilities must be non-negative".to_string());
            }
            if selection.genrows().into_iter().any(|row| row.sum() > 1.0 + 1e-12) {
                return Err("selection rows must not sum to more than one".to_string());
            }
            let symmetric = selection
                .indexed_iter()
                .all(|((i, j), &p)| (p - selection[[j, i]]).abs() < 1e-12);
            if !symmetric {
                return Err("selection must be symmetric".to_string());
            }
        }

        let energies_finite = self
            .energies
            .as_ref()
            .map_or(true, |e| e.iter().all(|v| v.is_finite()));
        let bias_finite = self
            .b_k_i
            .as_ref()
            .map_or(true, |b| b.iter().all(|v| v.is_finite()));
        if !(energies_finite && bias_finite) {
            return Err("energies and b_k_i must be finite".to_string());
        }

        Ok(())
    }

    /// Build the test case
    pub fn build(&self) -> Result<DiscreteModel> {
        Ok(self.build_inner()?)
    }
}

impl DiscreteModel {
    /// Get a new builder for the `DiscreteModel` struct. `DiscreteModel` can only be constructed
    /// via the builder.
    pub fn builder() -> DiscreteModelBuilder {
        DiscreteModelBuilder::default()
    }

    /// $K$, the number of bias conditions
    pub fn n_conditions(&self) -> usize {
        self.b_k_i.len_of(Axis(0))
    }

    /// $M$, the number of states
    pub fn n_states(&self) -> usize {
        self.energies.len()
    }

    /// Reduced energy of each state without bias
    pub fn energies(&self) -> &Array1<f64> {
        &self.energies
    }

    /// `b_k_i[k, i]` is the reduced bias energy of state `i` under condition `k`
    pub fn b_k_i(&self) -> &Array2<f64> {
        &self.b_k_i
    }

    /// Exact unbiased free energies, normalized so that $\sum_i e^{-f_i} = 1$
    pub fn f_i(&self) -> Array1<f64> {
        let mut scratch = vec![0.0; self.n_states()];
        let shift = logsumexp_neg(self.energies.view(), &mut scratch);
        self.energies.mapv(|e| e + shift)
    }

    /// Exact biased free energies $f^K_i = f_i + b^K_i$
    pub fn f_k_i(&self) -> Array2<f64> {
        &self.b_k_i + &self.f_i()
    }

    /// Exact free energy of each condition's ensemble
    pub fn f_k(&self) -> Array1<f64> {
        let f_k_i = self.f_k_i();
        let mut scratch = vec![0.0; self.n_states()];
        f_k_i
            .outer_iter()
            .map(|f_i| -logsumexp_neg(f_i, &mut scratch))
            .collect()
    }

    /// `pi_k_i[k, i]` is the stationary probability of state `i` under condition `k`
    pub fn pi_k_i(&self) -> Array2<f64> {
        let mut pi_k_i = self.f_k_i();
        for (mut pi_i, f_k) in pi_k_i.outer_iter_mut().zip(self.f_k().iter()) {
            pi_i.mapv_inplace(|f| (f_k - f).exp());
        }
        pi_k_i
    }

    /// Metropolis-Hastings transition matrix of every condition
    pub fn transition_matrices(&self) -> Array3<f64> {
        let n_states = self.n_states();
        let mut p_k_ij = Array3::zeros((self.n_conditions(), n_states, n_states));
        for (mut p_ij, b_i) in p_k_ij.outer_iter_mut().zip(self.b_k_i.outer_iter()) {
            let u_i = &self.energies + &b_i;
            Zip::indexed(&mut p_ij).apply(|(i, j), p| {
                if i != j {
                    *p = self.selection[[i, j]] * (u_i[i] - u_i[j]).min(0.0).exp();
                }
            });
            for i in 0..n_states {
                let off_diagonal = p_ij.row(i).sum();
                p_ij[[i, i]] = (1.0 - off_diagonal).max(0.0);
            }
        }
        p_k_ij
    }

    /// Draw `n_samples` independent samples from every condition's stationary distribution and
    /// histogram them into `n_k_i`
    pub fn sample_independent<R>(&self, n_samples: usize, rng: &mut R) -> Result<Array2<usize>>
    where
        R: Rng + ?Sized,
    {
        let pi_k_i = self.pi_k_i();
        let mut n_k_i = Array2::zeros(pi_k_i.dim());
        for (pi_i, mut n_i) in pi_k_i.outer_iter().zip(n_k_i.outer_iter_mut()) {
            let distribution = WeightedIndex::<f64>::new(pi_i.iter())?;
            for _ in 0..n_samples {
                n_i[distribution.sample(rng)] += 1;
            }
        }
        Ok(n_k_i)
    }

    /// Draw independent samples with a specified seed
    pub fn sample_independent_with_seed(
        &self,
        n_samples: usize,
        seed: u64,
    ) -> Result<Array2<usize>> {
        self.sample_independent(n_samples, &mut StdRng::seed_from_u64(seed))
    }

    /// Run one Markov chain of `n_steps` transitions per condition, each starting in
    /// `initial_state`, and collect the statistics TRAM and dTRAM consume.
    pub fn sample_trajectories<R>(
        &self,
        n_steps: usize,
        initial_state: usize,
        rng: &mut R,
    ) -> Result<Trajectories>
    where
        R: Rng + ?Sized,
    {
        let (n_conditions, n_states) = (self.n_conditions(), self.n_states());
        if initial_state >= n_states {
            return Err(EstimatorError::StateOutOfRange {
                frame: 0,
                state: initial_state,
                n_states,
            });
        }

        let p_k_ij = self.transition_matrices();
        let mut c_k_ij = Array3::zeros((n_conditions, n_states, n_states));
        let mut n_k_i = Array2::zeros((n_conditions, n_states));
        let mut m_x = Vec::with_capacity(n_conditions * (n_steps + 1));

        for k in 0..n_conditions {
            let rows = p_k_ij
                .index_axis(Axis(0), k)
                .genrows()
                .into_iter()
                .map(|row| WeightedIndex::<f64>::new(row.iter()))
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut state = initial_state;
            n_k_i[[k, state]] += 1;
            m_x.push(state);
            for _ in 0..n_steps {
                let next = rows[state].sample(rng);
                c_k_ij[[k, state, next]] += 1;
                n_k_i[[k, next]] += 1;
                m_x.push(next);
                state = next;
            }
        }

        let m_x = Array1::from(m_x);
        let b_k_x = Array2::from_shape_fn((n_conditions, m_x.len()), |(k, x)| {
            self.b_k_i[[k, m_x[x]]]
        });
        Ok(Trajectories {
            c_k_ij,
            n_k_i,
            m_x,
            b_k_x,
        })
    }

    /// Run the Markov chains with a specified seed
    pub fn sample_trajectories_with_seed(
        &self,
        n_steps: usize,
        initial_state: usize,
        seed: u64,
    ) -> Result<Trajectories> {
        self.sample_trajectories(n_steps, initial_state, &mut StdRng::seed_from_u64(seed))
    }
}

impl Default for DiscreteModel {
    fn default() -> Self {
        Self {
            energies: array![1.0, 2.0, 0.0],
            b_k_i: array![[0.0, 0.0, 0.0], [1.0, 0.0, 2.0]],
            selection: array![[0.5, 0.5, 0.0], [0.5, 0.0, 0.5], [0.0, 0.5, 0.5]],
        }
    }
}

/// Trajectory statistics sampled from a test case
#[derive(Debug, Clone)]
pub struct Trajectories {
    /// `c_k_ij[k, i, j]` is the number of `i` to `j` transitions observed under condition `k`
    pub c_k_ij: Array3<usize>,
    /// `n_k_i[k, i]` is the number of frames in state `i` under condition `k`
    pub n_k_i: Array2<usize>,
    /// `m_x[x]` is the state of frame `x` (trajectories concatenated in condition order)
    pub m_x: Array1<usize>,
    /// `b_k_x[k, x]` is the bias energy of frame `x` evaluated at condition `k`
    pub b_k_x: Array2<f64>,
}
