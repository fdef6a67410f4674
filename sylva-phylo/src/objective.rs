//! Negative log-likelihood as a function of a flat parameter vector, for
//! gradient-free optimizers.
//!
//! The vector is laid out as
//!
//! ```text
//! [ rate parameters | free frequencies (n − 1) | Γ shape | invariable proportion ]
//! ```
//!
//! with the last three groups present only when the [`ParameterLayout`] asks
//! for them. The last frequency is `1 − Σ` of the free ones. Infeasible
//! vectors and non-finite likelihoods map to a large finite penalty so the
//! optimizer always sees a total order.

use sylva_core::{Result, SylvaError};

use crate::config::PenaltyConfig;
use crate::model::SubstitutionModel;
use crate::parallel::{log_likelihood, ParallelEvaluator};
use crate::patterns::SitePatterns;
use crate::rates::RateCategories;
use crate::tree::Tree;

/// Which parameter groups the vector carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParameterLayout {
    pub n_rates: usize,
    /// Free equilibrium frequencies; `n_states − 1` entries when set.
    pub n_frequencies: usize,
    /// Number of Γ categories when the shape is estimated.
    pub gamma_categories: Option<usize>,
    pub invariant: bool,
}

impl ParameterLayout {
    /// Layout matching `model` and the heterogeneity in `rates`.
    ///
    /// Frequencies are free only if requested and the model family
    /// estimates them.
    pub fn for_model(
        model: &SubstitutionModel,
        rates: &RateCategories,
        free_frequencies: bool,
    ) -> Result<Self> {
        if free_frequencies && !model.estimates_frequencies() {
            return Err(SylvaError::InvalidInput(
                "this model family keeps its frequencies fixed".into(),
            ));
        }
        let invariant = rates.proportion_invariant() > 0.0;
        let gamma_categories = rates
            .alpha()
            .map(|_| rates.n_categories() - usize::from(invariant));
        Ok(Self {
            n_rates: model.n_rate_params(),
            n_frequencies: if free_frequencies { model.n_states() - 1 } else { 0 },
            gamma_categories,
            invariant,
        })
    }

    /// Expected parameter vector length.
    pub fn len(&self) -> usize {
        self.n_rates
            + self.n_frequencies
            + usize::from(self.gamma_categories.is_some())
            + usize::from(self.invariant)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `f(parameters) → −lnL` over a fixed tree and patterns.
#[derive(Debug)]
pub struct ModelObjective<'a> {
    tree: &'a Tree,
    patterns: &'a SitePatterns,
    evaluator: &'a ParallelEvaluator,
    model: SubstitutionModel,
    rates: RateCategories,
    layout: ParameterLayout,
    config: PenaltyConfig,
    evaluations: usize,
}

impl<'a> ModelObjective<'a> {
    pub fn new(
        tree: &'a Tree,
        patterns: &'a SitePatterns,
        evaluator: &'a ParallelEvaluator,
        model: SubstitutionModel,
        rates: RateCategories,
        free_frequencies: bool,
        config: PenaltyConfig,
    ) -> Result<Self> {
        let layout = ParameterLayout::for_model(&model, &rates, free_frequencies)?;
        Ok(Self {
            tree,
            patterns,
            evaluator,
            model,
            rates,
            layout,
            config,
            evaluations: 0,
        })
    }

    pub fn layout(&self) -> ParameterLayout {
        self.layout
    }

    /// Model holding the most recently evaluated parameters.
    pub fn model(&self) -> &SubstitutionModel {
        &self.model
    }

    /// Rate categories of the most recently evaluated parameters.
    pub fn rates(&self) -> &RateCategories {
        &self.rates
    }

    /// Number of calls to [`value`](Self::value) so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn into_model(self) -> SubstitutionModel {
        self.model
    }

    /// Parameter vector describing the current model and rates.
    pub fn initial_parameters(&self) -> Vec<f64> {
        let mut params = self.model.rate_parameters().to_vec();
        params.extend_from_slice(&self.model.frequencies()[..self.layout.n_frequencies]);
        if let Some(alpha) = self.rates.alpha().filter(|_| self.layout.gamma_categories.is_some()) {
            params.push(alpha);
        }
        if self.layout.invariant {
            params.push(self.rates.proportion_invariant());
        }
        params
    }

    /// −lnL at `params`.
    ///
    /// A vector of the wrong length is an error. Negative or non-finite
    /// rates, frequencies outside [0, 1] or summing above 1, a non-positive
    /// shape, an invariable proportion outside [0, 1) and a non-finite
    /// likelihood all return the configured penalty.
    pub fn value(&mut self, params: &[f64]) -> Result<f64> {
        if params.len() != self.layout.len() {
            return Err(SylvaError::InvalidParameterCount {
                what: "objective parameters",
                expected: self.layout.len(),
                got: params.len(),
            });
        }
        self.evaluations += 1;
        Ok(self.evaluate(params).unwrap_or(self.config.penalty))
    }

    /// `None` for anything that should be penalized.
    fn evaluate(&mut self, params: &[f64]) -> Option<f64> {
        let (rates, rest) = params.split_at(self.layout.n_rates);
        let (free_freqs, rest) = rest.split_at(self.layout.n_frequencies);
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return None;
        }

        let frequencies = if free_freqs.is_empty() {
            None
        } else {
            if free_freqs.iter().any(|f| !f.is_finite() || *f < 0.0 || *f > 1.0) {
                return None;
            }
            let last = 1.0 - free_freqs.iter().sum::<f64>();
            if last < 0.0 {
                return None;
            }
            let mut full = free_freqs.to_vec();
            full.push(last);
            Some(full)
        };

        let mut rest = rest.iter().copied();
        let categories = match (self.layout.gamma_categories, self.layout.invariant) {
            (None, false) => RateCategories::single(),
            (None, true) => RateCategories::invariant(rest.next()?).ok()?,
            (Some(k), false) => RateCategories::gamma(rest.next()?, k).ok()?,
            (Some(k), true) => {
                let alpha = rest.next()?;
                let p = rest.next()?;
                RateCategories::gamma_invariant(alpha, k, p).ok()?
            }
        };

        self.model.set_rate_parameters(rates).ok()?;
        if let Some(freqs) = frequencies {
            self.model.set_base_frequencies(&freqs).ok()?;
        }
        self.rates = categories;
        let ll = log_likelihood(self.tree, &mut self.model, &self.rates, self.patterns, self.evaluator).ok()?;
        Some(-ll)
    }
}
