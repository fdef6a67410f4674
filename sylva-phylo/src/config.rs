//! Tunable settings for evaluation, branch-length optimization and the
//! objective adapter.

/// Whether conditional likelihoods are accumulated as probabilities or as
/// log-probabilities.
///
/// One mode applies to every node and child of a pass, leaves included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Accumulation {
    /// Plain products and sums. Fast, but can underflow on deep trees.
    Linear,
    /// Log-sum-exp at every child.
    #[default]
    Log,
}

/// Parallel evaluation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EvaluatorConfig {
    /// Worker threads; 0 means one per available core.
    pub n_workers: usize,
    pub accumulation: Accumulation,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            n_workers: 0,
            accumulation: Accumulation::Log,
        }
    }
}

impl EvaluatorConfig {
    pub fn with_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers;
        self
    }

    pub fn with_accumulation(mut self, accumulation: Accumulation) -> Self {
        self.accumulation = accumulation;
        self
    }

    /// Worker count with 0 resolved against the machine.
    pub fn resolved_workers(&self) -> usize {
        if self.n_workers > 0 {
            return self.n_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Newton–Raphson branch-length settings.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewtonConfig {
    /// Newton steps per edge visit.
    pub max_iterations: usize,
    /// Stop once |∂lnL/∂t| falls below this.
    pub gradient_tolerance: f64,
    /// Floor a proposal is clamped to.
    pub min_branch_length: f64,
    /// Ceiling a proposal is clamped to.
    pub max_branch_length: f64,
    /// Traversal passes, alternating pre-order and post-order.
    pub passes: usize,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            gradient_tolerance: 1e-6,
            min_branch_length: 1e-8,
            max_branch_length: 100.0,
            passes: 4,
        }
    }
}

impl NewtonConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_tolerance = tolerance;
        self
    }

    pub fn with_branch_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_branch_length = min;
        self.max_branch_length = max;
        self
    }

    pub fn with_passes(mut self, passes: usize) -> Self {
        self.passes = passes;
        self
    }
}

/// Objective adapter settings.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PenaltyConfig {
    /// Value returned for infeasible parameter vectors.
    pub penalty: f64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self { penalty: 1e10 }
    }
}
