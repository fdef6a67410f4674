//! Site-parallel likelihood evaluation on a dedicated worker pool.
//!
//! Each worker owns a [`PruningEngine`] and runs independent single-pattern
//! passes. The tree, patterns and [`TransitionSet`] are shared read-only.
//! Per-site results are collected in site order and summed sequentially,
//! so the total does not depend on the worker count or on completion order.

use rayon::prelude::*;
use rayon::ThreadPool;
use sylva_core::{Result, SylvaError};
use tracing::{debug, info_span};

use crate::config::EvaluatorConfig;
use crate::model::{SubstitutionModel, TransitionSet};
use crate::partials::check_shapes;
use crate::patterns::SitePatterns;
use crate::pruning::PruningEngine;
use crate::rates::RateCategories;
use crate::tree::Tree;

/// A fixed pool of workers evaluating site patterns.
pub struct ParallelEvaluator {
    pool: ThreadPool,
    config: EvaluatorConfig,
}

impl std::fmt::Debug for ParallelEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelEvaluator")
            .field("workers", &self.pool.current_num_threads())
            .field("config", &self.config)
            .finish()
    }
}

impl ParallelEvaluator {
    /// Start the worker pool.
    pub fn new(config: EvaluatorConfig) -> Result<Self> {
        let n_workers = config.resolved_workers();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .thread_name(|i| format!("sylva-worker-{}", i))
            .build()
            .map_err(|e| {
                SylvaError::InvalidInput(format!("failed to create worker pool: {}", e))
            })?;
        debug!(workers = n_workers, "started likelihood worker pool");
        Ok(Self { pool, config })
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Number of worker threads.
    pub fn n_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Σ weight · ln L over every pattern.
    pub fn evaluate(
        &self,
        tree: &Tree,
        transitions: &TransitionSet,
        patterns: &SitePatterns,
    ) -> Result<f64> {
        self.evaluate_sites(tree, transitions, patterns, &patterns.sites())
    }

    /// Σ weight · ln L over the given `(pattern, weight)` pairs.
    ///
    /// Blocks until every site is done. A non-finite site value flows into
    /// the total unchanged; shape mismatches and out-of-range sites are
    /// errors.
    pub fn evaluate_sites(
        &self,
        tree: &Tree,
        transitions: &TransitionSet,
        patterns: &SitePatterns,
        sites: &[(usize, f64)],
    ) -> Result<f64> {
        let per_site = self.weighted_site_terms(tree, transitions, patterns, sites)?;
        Ok(per_site.iter().sum())
    }

    /// Unweighted ln L of every pattern, in pattern order.
    pub fn site_log_likelihoods(
        &self,
        tree: &Tree,
        transitions: &TransitionSet,
        patterns: &SitePatterns,
    ) -> Result<Vec<f64>> {
        let unit: Vec<(usize, f64)> = (0..patterns.n_patterns()).map(|p| (p, 1.0)).collect();
        self.weighted_site_terms(tree, transitions, patterns, &unit)
    }

    fn weighted_site_terms(
        &self,
        tree: &Tree,
        transitions: &TransitionSet,
        patterns: &SitePatterns,
        sites: &[(usize, f64)],
    ) -> Result<Vec<f64>> {
        check_shapes(tree, transitions, patterns)?;
        if let Some(&(site, _)) = sites.iter().find(|(s, _)| *s >= patterns.n_patterns()) {
            return Err(SylvaError::InvalidInput(format!(
                "site {} out of range for {} patterns",
                site,
                patterns.n_patterns()
            )));
        }

        let _span = info_span!("evaluate", patterns = sites.len(), workers = self.n_workers())
            .entered();
        let accumulation = self.config.accumulation;
        let n_states = transitions.n_states();
        let terms = self.pool.install(|| {
            sites
                .par_iter()
                .map_init(
                    || PruningEngine::new(tree, n_states),
                    |engine, &(site, weight)| {
                        if weight == 0.0 {
                            return 0.0;
                        }
                        weight
                            * engine.site_log_likelihood(
                                tree,
                                transitions,
                                patterns,
                                site,
                                accumulation,
                            )
                    },
                )
                .collect::<Vec<f64>>()
        });
        Ok(terms)
    }
}

/// Warm the model for `tree`, evaluate every pattern and reject a
/// non-finite total.
pub fn log_likelihood(
    tree: &Tree,
    model: &mut SubstitutionModel,
    rates: &RateCategories,
    patterns: &SitePatterns,
    evaluator: &ParallelEvaluator,
) -> Result<f64> {
    let transitions = model.finalize(tree, rates)?;
    let total = evaluator.evaluate(tree, &transitions, patterns)?;
    if !total.is_finite() {
        return Err(SylvaError::Numerical(format!(
            "log-likelihood is not finite ({})",
            total
        )));
    }
    Ok(total)
}
