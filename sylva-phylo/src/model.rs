//! Continuous-time Markov substitution models over 2 to 20 states.
//!
//! A [`SubstitutionModel`] owns its rate parameters, equilibrium frequencies,
//! the generator Q built from them, an optional eigendecomposition and a memo
//! of transition matrices keyed by branch length. Every parameter change
//! rebuilds Q, drops the memo and, if the model had been decomposed,
//! decomposes again.
//!
//! Families differ only in how Q is assembled:
//!
//! - **Equal rates / GTR / empirical** — Qᵢⱼ = Rᵢⱼ πⱼ, scaled so that
//!   −Σ πᵢ Qᵢᵢ = 1 and branch lengths are expected substitutions per site.
//! - **Mk** — Qᵢⱼ = Rᵢⱼ directly, unscaled; π is only the root prior.
//!
//! Transition matrices are always computed with the Padé exponential in
//! [`Matrix::expm`]. Derivatives and stochastic-mapping integrals use the
//! eigendecomposition when Q is reversible and exact generator identities
//! otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use sylva_core::{Result, Summarizable, SylvaError};
use tracing::debug;

use crate::empirical::{EmpiricalMatrix, AA_STATES};
use crate::linalg::Matrix;
use crate::rates::RateCategories;
use crate::tree::{NodeId, Tree};

/// Smallest supported state count.
pub const MIN_STATES: usize = 2;
/// Largest supported state count.
pub const MAX_STATES: usize = 20;

const CACHE_LIMIT: usize = 4096;
const DETAILED_BALANCE_TOL: f64 = 1e-10;
/// Below this |Δλ|·t the eigen double integral switches to its series.
const SERIES_THRESHOLD: f64 = 1e-3;

/// How Q is assembled from the rate parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ModelFamily {
    /// All exchangeabilities equal (Jukes–Cantor generalized to n states).
    EqualRates,
    /// General time-reversible: free exchangeabilities and frequencies.
    Gtr,
    /// HKY85: one transition/transversion ratio and free frequencies.
    Hky85,
    /// Unscaled Mk model for discrete traits.
    Mk,
    /// A published amino-acid matrix.
    Empirical(EmpiricalMatrix),
}

impl ModelFamily {
    /// Scaled families fix one rate to 1 and normalize the mean rate.
    pub fn is_scaled(self) -> bool {
        !matches!(self, Self::Mk)
    }
}

/// Which entries of R are free and how they share parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RateLayout {
    /// One rate shared by every pair of states.
    Equal,
    /// Rᵢⱼ = Rⱼᵢ, parameters in row-major upper-triangle order.
    Symmetric,
    /// Every off-diagonal entry free, row-major.
    Asymmetric,
    /// Only adjacent ordinal states communicate.
    Ordered,
    /// Nucleotide transitions (A↔G, C↔T) share one rate and transversions
    /// another. Four states only.
    Kappa,
    /// No free rates.
    Fixed,
}

impl RateLayout {
    /// Number of free rate parameters for `n_states` states.
    ///
    /// Scaled layouts fix the last rate to 1. Unscaled `Ordered` carries
    /// separate up (i → i+1) and down (i+1 → i) rates; scaled `Ordered` is
    /// symmetric.
    pub fn parameter_count(self, n_states: usize, scaled: bool) -> usize {
        let n = n_states;
        let full = match self {
            Self::Fixed => return 0,
            Self::Equal => 1,
            Self::Symmetric => n * (n - 1) / 2,
            Self::Asymmetric => n * (n - 1),
            Self::Ordered if scaled => n - 1,
            Self::Ordered => 2 * (n - 1),
            Self::Kappa => 2,
        };
        if scaled {
            full - 1
        } else {
            full
        }
    }
}

/// Memo of P(t) keyed on the exact bit pattern of `t`.
#[derive(Debug, Clone, Default)]
pub struct TransitionCache {
    entries: HashMap<u64, Arc<Matrix>>,
}

impl TransitionCache {
    /// Cached matrix for `t`, if present.
    pub fn get(&self, t: f64) -> Option<Arc<Matrix>> {
        self.entries.get(&t.to_bits()).cloned()
    }

    fn insert(&mut self, t: f64, p: Arc<Matrix>) {
        if self.entries.len() >= CACHE_LIMIT {
            self.entries.clear();
        }
        self.entries.insert(t.to_bits(), p);
    }

    /// Number of memoized branch lengths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Frozen per-edge transition matrices for one tree, model and set of rate
/// categories.
///
/// This is the only model state a parallel likelihood pass reads. It is
/// produced single-threaded by [`SubstitutionModel::finalize`] and is
/// immutable while shared.
#[derive(Debug, Clone)]
pub struct TransitionSet {
    n_states: usize,
    frequencies: Vec<f64>,
    category_rates: Vec<f64>,
    category_weights: Vec<f64>,
    matrices: Vec<Vec<Arc<Matrix>>>,
}

impl TransitionSet {
    /// Number of states.
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// Root prior.
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Number of rate categories.
    pub fn n_categories(&self) -> usize {
        self.category_rates.len()
    }

    /// Number of tree nodes the set was built for.
    pub fn n_nodes(&self) -> usize {
        self.matrices.len()
    }

    /// Rate multiplier per category.
    pub fn category_rates(&self) -> &[f64] {
        &self.category_rates
    }

    /// Prior weight per category.
    pub fn category_weights(&self) -> &[f64] {
        &self.category_weights
    }

    /// P(rₖ · len(node)) for the edge above `node`. The root maps to the
    /// identity.
    pub fn matrix(&self, node: NodeId, category: usize) -> &Matrix {
        &self.matrices[node][category]
    }

    /// Recompute the matrices of one edge after its length changed.
    pub fn refresh_edge(
        &mut self,
        model: &mut SubstitutionModel,
        node: NodeId,
        length: f64,
    ) -> Result<()> {
        let row = self.matrices.get_mut(node).ok_or_else(|| {
            SylvaError::InvalidInput(format!("node index {} out of range", node))
        })?;
        for (slot, &r) in row.iter_mut().zip(&self.category_rates) {
            *slot = model.transition_probabilities(length * r)?;
        }
        Ok(())
    }
}

/// Joint expectations along one branch for stochastic mapping.
///
/// Entry `(a, b)` is an expectation restricted to paths that start in `a`
/// and end in `b`; it is not divided by Pₐᵦ(t).
#[derive(Debug, Clone, PartialEq)]
pub struct MappingMatrices {
    /// Expected number of labelled `from → to` substitutions.
    pub counts: Matrix,
    /// Expected time spent in state `from`.
    pub dwell: Matrix,
}

#[derive(Debug, Clone)]
struct Eigen {
    values: Vec<f64>,
    /// Columns are right eigenvectors of Q.
    right: Matrix,
    /// Inverse of `right`.
    left: Matrix,
}

impl Eigen {
    /// V · diag(f(λ)) · V⁻¹.
    fn reconstruct(&self, f: impl Fn(f64) -> f64) -> Matrix {
        let n = self.values.len();
        let weights: Vec<f64> = self.values.iter().map(|&l| f(l)).collect();
        let mut out = Matrix::zeros(n);
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += self.right[(i, k)] * weights[k] * self.left[(k, j)];
                }
                out[(i, j)] = sum;
            }
        }
        out
    }
}

/// A substitution model over a runtime state count.
#[derive(Debug, Clone)]
pub struct SubstitutionModel {
    n_states: usize,
    family: ModelFamily,
    layout: RateLayout,
    rates: Vec<f64>,
    exchangeabilities: Matrix,
    frequencies: Vec<f64>,
    q: Matrix,
    reversible: bool,
    decomposed: bool,
    eigen: Option<Eigen>,
    cache: TransitionCache,
}

impl SubstitutionModel {
    /// Build a model from its family, layout, rate parameters and
    /// frequencies.
    ///
    /// `rates` must have [`RateLayout::parameter_count`] entries and
    /// `frequencies` one entry per state.
    pub fn new(
        n_states: usize,
        family: ModelFamily,
        layout: RateLayout,
        rates: &[f64],
        frequencies: &[f64],
    ) -> Result<Self> {
        if !(MIN_STATES..=MAX_STATES).contains(&n_states) {
            return Err(SylvaError::InvalidInput(format!(
                "state count must be between {} and {}, got {}",
                MIN_STATES, MAX_STATES, n_states
            )));
        }
        let fixed = matches!(family, ModelFamily::Empirical(_));
        if fixed != (layout == RateLayout::Fixed) {
            return Err(SylvaError::InvalidInput(format!(
                "{:?} layout does not fit the {:?} family",
                layout, family
            )));
        }
        if (layout == RateLayout::Kappa || family == ModelFamily::Hky85) && n_states != 4 {
            return Err(SylvaError::InvalidInput(format!(
                "transition/transversion rates need 4 states, got {}",
                n_states
            )));
        }
        if family == ModelFamily::Hky85 && layout != RateLayout::Kappa {
            return Err(SylvaError::InvalidInput(format!(
                "{:?} layout does not fit the {:?} family",
                layout, family
            )));
        }
        if fixed && n_states != AA_STATES {
            return Err(SylvaError::InvalidInput(format!(
                "empirical matrices have {} states, got {}",
                AA_STATES, n_states
            )));
        }
        let expected = layout.parameter_count(n_states, family.is_scaled());
        if rates.len() != expected {
            return Err(SylvaError::InvalidParameterCount {
                what: "rate parameters",
                expected,
                got: rates.len(),
            });
        }
        if frequencies.len() != n_states {
            return Err(SylvaError::InvalidParameterCount {
                what: "base frequencies",
                expected: n_states,
                got: frequencies.len(),
            });
        }

        let mut model = Self {
            n_states,
            family,
            layout,
            rates: rates.to_vec(),
            exchangeabilities: Matrix::zeros(n_states),
            frequencies: frequencies.to_vec(),
            q: Matrix::zeros(n_states),
            reversible: false,
            decomposed: false,
            eigen: None,
            cache: TransitionCache::default(),
        };
        model.rebuild()?;
        Ok(model)
    }

    /// Jukes–Cantor 1969 nucleotide model.
    pub fn jc69() -> Self {
        Self::uniform(4)
    }

    /// Equal exchangeabilities and uniform frequencies over `n_states`
    /// states.
    pub fn equal_rates(n_states: usize) -> Result<Self> {
        if !(MIN_STATES..=MAX_STATES).contains(&n_states) {
            return Err(SylvaError::InvalidInput(format!(
                "state count must be between {} and {}, got {}",
                MIN_STATES, MAX_STATES, n_states
            )));
        }
        Ok(Self::uniform(n_states))
    }

    /// Equal-rates model for a state count already known to be in range.
    fn uniform(n: usize) -> Self {
        let mut q = Matrix::zeros(n);
        let off = 1.0 / (n - 1) as f64;
        for i in 0..n {
            for j in 0..n {
                q[(i, j)] = if i == j { -1.0 } else { off };
            }
        }
        let mut r = Matrix::zeros(n);
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    r[(i, j)] = 1.0;
                }
            }
        }
        Self {
            n_states: n,
            family: ModelFamily::EqualRates,
            layout: RateLayout::Equal,
            rates: Vec::new(),
            exchangeabilities: r,
            frequencies: vec![1.0 / n as f64; n],
            q,
            reversible: true,
            decomposed: false,
            eigen: None,
            cache: TransitionCache::default(),
        }
    }

    /// GTR nucleotide model. `rates` are the exchangeabilities AC, AG, AT,
    /// CG, CT; GT is fixed to 1. Frequencies are in A, C, G, T order.
    pub fn gtr(rates: &[f64], frequencies: &[f64]) -> Result<Self> {
        Self::new(4, ModelFamily::Gtr, RateLayout::Symmetric, rates, frequencies)
    }

    /// HKY85 with transitions (AG, CT) at `kappa` times the transversion
    /// rate. The only rate parameter is `kappa`.
    pub fn hky85(kappa: f64, frequencies: &[f64]) -> Result<Self> {
        Self::new(4, ModelFamily::Hky85, RateLayout::Kappa, &[kappa], frequencies)
    }

    /// Unscaled Mk model over `n_states` states, all rates initially 1 and a
    /// uniform root prior.
    pub fn mk(n_states: usize, layout: RateLayout) -> Result<Self> {
        if layout == RateLayout::Fixed {
            return Err(SylvaError::InvalidInput(
                "Mk models need at least one free rate".into(),
            ));
        }
        let n = n_states.max(MIN_STATES);
        let count = layout.parameter_count(n, false);
        Self::new(
            n_states,
            ModelFamily::Mk,
            layout,
            &vec![1.0; count],
            &vec![1.0 / n as f64; n],
        )
    }

    /// Model from a published amino-acid matrix and its frequencies.
    pub fn from_empirical(matrix: EmpiricalMatrix) -> Self {
        let frequencies = matrix.frequencies();
        let exchangeabilities = matrix.exchangeabilities();
        let q = rate_matrix_from(&exchangeabilities, &frequencies, true);
        let reversible = detailed_balance(&q, &frequencies);
        Self {
            n_states: AA_STATES,
            family: ModelFamily::Empirical(matrix),
            layout: RateLayout::Fixed,
            rates: Vec::new(),
            exchangeabilities,
            frequencies,
            q,
            reversible,
            decomposed: false,
            eigen: None,
            cache: TransitionCache::default(),
        }
    }

    /// Jones–Taylor–Thornton.
    pub fn jtt() -> Self {
        Self::from_empirical(EmpiricalMatrix::Jtt)
    }

    /// Whelan–Goldman.
    pub fn wag() -> Self {
        Self::from_empirical(EmpiricalMatrix::Wag)
    }

    /// Le–Gascuel.
    pub fn lg() -> Self {
        Self::from_empirical(EmpiricalMatrix::Lg)
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn layout(&self) -> RateLayout {
        self.layout
    }

    /// Current free rate parameters.
    pub fn rate_parameters(&self) -> &[f64] {
        &self.rates
    }

    /// Equilibrium frequencies (the root prior for Mk).
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Full exchangeability matrix R with a zero diagonal.
    pub fn exchangeabilities(&self) -> &Matrix {
        &self.exchangeabilities
    }

    /// The generator Q.
    pub fn rate_matrix(&self) -> &Matrix {
        &self.q
    }

    /// True when Q satisfies detailed balance against its reference
    /// distribution.
    pub fn is_reversible(&self) -> bool {
        self.reversible
    }

    /// True once [`decompose`](Self::decompose) has run.
    pub fn is_decomposed(&self) -> bool {
        self.decomposed
    }

    /// Number of free rate parameters.
    pub fn n_rate_params(&self) -> usize {
        self.layout
            .parameter_count(self.n_states, self.family.is_scaled())
    }

    /// True when the frequencies are free parameters of the model.
    pub fn estimates_frequencies(&self) -> bool {
        matches!(self.family, ModelFamily::Gtr | ModelFamily::Hky85)
    }

    /// Free parameters excluding branch lengths.
    pub fn n_free_params(&self) -> usize {
        let freqs = if self.estimates_frequencies() {
            self.n_states - 1
        } else {
            0
        };
        self.n_rate_params() + freqs
    }

    /// The transition-probability memo.
    pub fn cache(&self) -> &TransitionCache {
        &self.cache
    }

    /// Replace the free rate parameters.
    ///
    /// A length mismatch fails with [`SylvaError::InvalidParameterCount`] and
    /// leaves the model untouched.
    pub fn set_rate_parameters(&mut self, values: &[f64]) -> Result<()> {
        let expected = self.n_rate_params();
        if values.len() != expected {
            return Err(SylvaError::InvalidParameterCount {
                what: "rate parameters",
                expected,
                got: values.len(),
            });
        }
        let previous = std::mem::replace(&mut self.rates, values.to_vec());
        if let Err(e) = self.rebuild() {
            self.rates = previous;
            self.rebuild()?;
            return Err(e);
        }
        Ok(())
    }

    /// Replace the equilibrium frequencies. Non-negativity and summing to
    /// one are the caller's responsibility.
    pub fn set_base_frequencies(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.n_states {
            return Err(SylvaError::InvalidParameterCount {
                what: "base frequencies",
                expected: self.n_states,
                got: values.len(),
            });
        }
        let previous = std::mem::replace(&mut self.frequencies, values.to_vec());
        if let Err(e) = self.rebuild() {
            self.frequencies = previous;
            self.rebuild()?;
            return Err(e);
        }
        Ok(())
    }

    /// Rebuild R and Q from the current parameters, drop cached P(t) and
    /// redo the eigendecomposition if one was in use.
    fn rebuild(&mut self) -> Result<()> {
        self.exchangeabilities = match self.family {
            ModelFamily::Empirical(m) => m.exchangeabilities(),
            _ => expand_rates(
                self.layout,
                self.n_states,
                self.family.is_scaled(),
                &self.rates,
            ),
        };
        self.build_rate_matrix();
        self.cache.clear();
        self.eigen = None;
        debug!(
            family = ?self.family,
            states = self.n_states,
            reversible = self.reversible,
            "rebuilt rate matrix"
        );
        if self.decomposed {
            self.decompose()?;
        }
        Ok(())
    }

    /// Assemble Q from R and π. Scaled families satisfy −Σ πᵢ Qᵢᵢ = 1.
    pub fn build_rate_matrix(&mut self) {
        let scaled = self.family.is_scaled();
        self.q = rate_matrix_from(&self.exchangeabilities, &self.frequencies, scaled);
        let reference = self.reference_distribution();
        self.reversible = detailed_balance(&self.q, &reference);
    }

    /// Distribution detailed balance is checked against: π for scaled
    /// families, uniform for Mk.
    fn reference_distribution(&self) -> Vec<f64> {
        if self.family.is_scaled() {
            self.frequencies.clone()
        } else {
            vec![1.0 / self.n_states as f64; self.n_states]
        }
    }

    /// Eigendecompose Q for the derivative and mapping paths.
    ///
    /// Reversible generators are symmetrized with the reference
    /// distribution and decomposed with Jacobi rotations. Non-reversible
    /// generators keep no decomposition; derivatives then use
    /// P′ = QP and P″ = Q²P.
    pub fn decompose(&mut self) -> Result<()> {
        self.eigen = if self.reversible {
            Some(self.symmetric_decomposition()?)
        } else {
            debug!(
                family = ?self.family,
                "non-reversible generator; using generator identities"
            );
            None
        };
        self.decomposed = true;
        Ok(())
    }

    fn symmetric_decomposition(&self) -> Result<Eigen> {
        let n = self.n_states;
        let reference = self.reference_distribution();
        let sqrt_pi: Vec<f64> = reference.iter().map(|&p| p.sqrt()).collect();

        // B = Π^{1/2} Q Π^{-1/2} is symmetric under detailed balance.
        let mut b = Matrix::zeros(n);
        for i in 0..n {
            for j in 0..n {
                b[(i, j)] = sqrt_pi[i] * self.q[(i, j)] / sqrt_pi[j];
            }
        }
        let b = {
            let mut sym = b.clone();
            sym.add_scaled(&b.transpose(), 1.0);
            sym.scaled(0.5)
        };
        let (values, u) = b.symmetric_eigen();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SylvaError::Numerical(
                "eigendecomposition produced non-finite eigenvalues".into(),
            ));
        }

        let mut right = Matrix::zeros(n);
        let mut left = Matrix::zeros(n);
        for i in 0..n {
            for k in 0..n {
                right[(i, k)] = u[(i, k)] / sqrt_pi[i];
                left[(k, i)] = u[(i, k)] * sqrt_pi[i];
            }
        }
        debug!(states = n, "decomposed rate matrix");
        Ok(Eigen {
            values,
            right,
            left,
        })
    }

    /// P(t) = exp(Qt), memoized on the exact value of `t`.
    ///
    /// Takes `&mut self` because it fills the memo; parallel readers use a
    /// [`TransitionSet`] from [`finalize`](Self::finalize) instead.
    pub fn transition_probabilities(&mut self, t: f64) -> Result<Arc<Matrix>> {
        let t = check_branch_length(t)?;
        if let Some(p) = self.cache.get(t) {
            return Ok(p);
        }
        let p = Arc::new(self.compute_transition(t)?);
        self.cache.insert(t, Arc::clone(&p));
        Ok(p)
    }

    /// P(t) without touching the memo.
    pub fn compute_transition(&self, t: f64) -> Result<Matrix> {
        let t = check_branch_length(t)?;
        let mut p = self.q.scaled(t).expm()?;
        let n = self.n_states;
        for i in 0..n {
            for j in 0..n {
                if p[(i, j)] < 0.0 {
                    p[(i, j)] = 0.0;
                }
            }
        }
        Ok(p)
    }

    /// ∂P/∂t at `t`.
    pub fn first_derivative(&self, t: f64) -> Result<Matrix> {
        let t = check_branch_length(t)?;
        match &self.eigen {
            Some(e) => Ok(e.reconstruct(|l| l * (l * t).exp())),
            None => Ok(self.q.matmul(&self.compute_transition(t)?)),
        }
    }

    /// ∂²P/∂t² at `t`.
    pub fn second_derivative(&self, t: f64) -> Result<Matrix> {
        let t = check_branch_length(t)?;
        match &self.eigen {
            Some(e) => Ok(e.reconstruct(|l| l * l * (l * t).exp())),
            None => {
                let qp = self.q.matmul(&self.compute_transition(t)?);
                Ok(self.q.matmul(&qp))
            }
        }
    }

    /// P(t), ∂P/∂t and ∂²P/∂t² together.
    pub fn transition_with_derivatives(&self, t: f64) -> Result<(Matrix, Matrix, Matrix)> {
        let p = self.compute_transition(t)?;
        match &self.eigen {
            Some(e) => Ok((
                p,
                e.reconstruct(|l| l * (l * t).exp()),
                e.reconstruct(|l| l * l * (l * t).exp()),
            )),
            None => {
                let d1 = self.q.matmul(&p);
                let d2 = self.q.matmul(&d1);
                Ok((p, d1, d2))
            }
        }
    }

    /// Expected labelled `from → to` substitution counts and expected dwell
    /// time in `from` along a branch of length `t`.
    ///
    /// Reversible models use the eigen double integral
    /// Iₖₗ = (e^{λₖt} − e^{λₗt}) / (λₖ − λₗ), switching to a series when the
    /// eigenvalue gap is tiny. Other models use the Van Loan block
    /// exponential.
    pub fn stochastic_mapping_matrices(
        &self,
        t: f64,
        from: usize,
        to: usize,
    ) -> Result<MappingMatrices> {
        let t = check_branch_length(t)?;
        let n = self.n_states;
        if from >= n || to >= n {
            return Err(SylvaError::InvalidInput(format!(
                "state index out of range for {} states: {} -> {}",
                n, from, to
            )));
        }
        if from == to {
            return Err(SylvaError::InvalidInput(
                "a labelled substitution needs distinct states".into(),
            ));
        }
        let rate = self.q[(from, to)];
        let (integral_counts, dwell) = match &self.eigen {
            Some(e) => (
                eigen_integral(e, t, from, to),
                eigen_integral(e, t, from, from),
            ),
            None => (
                van_loan_integral(&self.q, t, from, to)?,
                van_loan_integral(&self.q, t, from, from)?,
            ),
        };
        Ok(MappingMatrices {
            counts: integral_counts.scaled(rate),
            dwell,
        })
    }

    /// Warm the memo for every edge and rate category of `tree` and return
    /// the frozen matrices a parallel pass reads.
    pub fn finalize(&mut self, tree: &Tree, rates: &RateCategories) -> Result<TransitionSet> {
        let identity = Arc::new(Matrix::identity(self.n_states));
        let mut matrices = Vec::with_capacity(tree.node_count());
        for id in 0..tree.node_count() {
            if id == tree.root() {
                matrices.push(vec![Arc::clone(&identity); rates.n_categories()]);
                continue;
            }
            let length = tree.branch_length(id);
            let row = rates
                .rates()
                .iter()
                .map(|&r| self.transition_probabilities(length * r))
                .collect::<Result<Vec<_>>>()?;
            matrices.push(row);
        }
        Ok(TransitionSet {
            n_states: self.n_states,
            frequencies: self.frequencies.clone(),
            category_rates: rates.rates().to_vec(),
            category_weights: rates.weights().to_vec(),
            matrices,
        })
    }
}

impl Summarizable for SubstitutionModel {
    fn summary(&self) -> String {
        let name = match self.family {
            ModelFamily::EqualRates => "EqualRates".to_string(),
            ModelFamily::Gtr => "GTR".to_string(),
            ModelFamily::Hky85 => "HKY85".to_string(),
            ModelFamily::Mk => format!("Mk({:?})", self.layout),
            ModelFamily::Empirical(m) => m.name().to_string(),
        };
        format!(
            "{}: {} states, {} free parameters",
            name,
            self.n_states,
            self.n_free_params()
        )
    }
}

fn check_branch_length(t: f64) -> Result<f64> {
    if !t.is_finite() || t < 0.0 {
        return Err(SylvaError::InvalidInput(format!(
            "branch length must be finite and non-negative, got {}",
            t
        )));
    }
    // -0.0 and 0.0 share one cache key.
    Ok(if t == 0.0 { 0.0 } else { t })
}

/// Fill R from a parameter vector. Scaled layouts append the fixed rate 1.
fn expand_rates(layout: RateLayout, n: usize, scaled: bool, values: &[f64]) -> Matrix {
    let mut full = values.to_vec();
    if scaled && layout != RateLayout::Fixed {
        full.push(1.0);
    }
    let mut r = Matrix::zeros(n);
    match layout {
        RateLayout::Fixed => {}
        RateLayout::Equal => {
            for i in 0..n {
                for j in 0..n {
                    if i != j {
                        r[(i, j)] = full[0];
                    }
                }
            }
        }
        RateLayout::Symmetric => {
            let mut idx = 0;
            for i in 0..n {
                for j in (i + 1)..n {
                    r[(i, j)] = full[idx];
                    r[(j, i)] = full[idx];
                    idx += 1;
                }
            }
        }
        RateLayout::Asymmetric => {
            let mut idx = 0;
            for i in 0..n {
                for j in 0..n {
                    if i != j {
                        r[(i, j)] = full[idx];
                        idx += 1;
                    }
                }
            }
        }
        RateLayout::Ordered => {
            for i in 0..n - 1 {
                r[(i, i + 1)] = full[i];
                r[(i + 1, i)] = if scaled { full[i] } else { full[n - 1 + i] };
            }
        }
        RateLayout::Kappa => {
            for i in 0..n {
                for j in 0..n {
                    if i != j {
                        // A=0, C=1, G=2, T=3: transitions differ by 2.
                        r[(i, j)] = if i.abs_diff(j) == 2 { full[0] } else { full[1] };
                    }
                }
            }
        }
    }
    r
}

fn rate_matrix_from(r: &Matrix, freqs: &[f64], scaled: bool) -> Matrix {
    let n = r.n();
    let mut q = Matrix::zeros(n);
    for i in 0..n {
        let mut off_diag = 0.0;
        for j in 0..n {
            if i != j {
                q[(i, j)] = if scaled { r[(i, j)] * freqs[j] } else { r[(i, j)] };
                off_diag += q[(i, j)];
            }
        }
        q[(i, i)] = -off_diag;
    }
    if scaled {
        let mu: f64 = (0..n).map(|i| -freqs[i] * q[(i, i)]).sum();
        if mu > 0.0 {
            q = q.scaled(1.0 / mu);
        }
    }
    q
}

/// πᵢ Qᵢⱼ = πⱼ Qⱼᵢ for every pair, with strictly positive π.
fn detailed_balance(q: &Matrix, pi: &[f64]) -> bool {
    if pi.iter().any(|&p| p <= 0.0 || !p.is_finite()) {
        return false;
    }
    let n = q.n();
    let scale = q.norm_one().max(1.0);
    for i in 0..n {
        for j in (i + 1)..n {
            if (pi[i] * q[(i, j)] - pi[j] * q[(j, i)]).abs() > DETAILED_BALANCE_TOL * scale {
                return false;
            }
        }
    }
    true
}

/// ∫₀ᵗ e^{λₖs} e^{λₗ(t−s)} ds.
fn exp_integral(lk: f64, ll: f64, t: f64) -> f64 {
    let d = lk - ll;
    let x = d * t;
    if x.abs() < SERIES_THRESHOLD {
        t * (ll * t).exp() * (1.0 + x / 2.0 + x * x / 6.0 + x * x * x / 24.0)
    } else {
        ((lk * t).exp() - (ll * t).exp()) / d
    }
}

/// Entry (a, b) is ∫₀ᵗ Pₐᵢ(s) Pⱼᵦ(t−s) ds.
fn eigen_integral(e: &Eigen, t: f64, i: usize, j: usize) -> Matrix {
    let n = e.values.len();
    let mut c = Matrix::zeros(n);
    for k in 0..n {
        for l in 0..n {
            c[(k, l)] = e.left[(k, i)] * e.right[(j, l)] * exp_integral(e.values[k], e.values[l], t);
        }
    }
    e.right.matmul(&c).matmul(&e.left)
}

/// Upper-right block of exp([[Q, Eᵢⱼ], [0, Q]] t).
fn van_loan_integral(q: &Matrix, t: f64, i: usize, j: usize) -> Result<Matrix> {
    let n = q.n();
    let mut block = Matrix::zeros(2 * n);
    for a in 0..n {
        for b in 0..n {
            block[(a, b)] = q[(a, b)] * t;
            block[(n + a, n + b)] = q[(a, b)] * t;
        }
    }
    block[(i, n + j)] = t;
    let e = block.expm()?;
    let mut out = Matrix::zeros(n);
    for a in 0..n {
        for b in 0..n {
            out[(a, b)] = e[(a, n + b)];
        }
    }
    Ok(out)
}
