//! Per-edge Newton–Raphson branch-length optimization.
//!
//! For an edge above node `e`, the data split into the part below `e`
//! (`tipward[e]`) and everything else, seen from `e`'s parent (the
//! sibward complement). Neither depends on `len(e)`, so
//!
//! ```text
//! L_s(t) = Σₖ wₖ · complementᵀ · P(rₖ t) · tipward
//! ```
//!
//! and its derivatives need only P, P′ and P″ at each category's scaled
//! length. Both halves are gathered once per edge visit from the
//! [`ConditionalCache`]; after an accepted move only the path from `e` to
//! the root is recomputed.

use sylva_core::{Result, SylvaError};
use tracing::{debug, trace};

use crate::config::NewtonConfig;
use crate::linalg::Matrix;
use crate::model::{SubstitutionModel, TransitionSet};
use crate::partials::{rescale, ConditionalCache};
use crate::patterns::SitePatterns;
use crate::rates::RateCategories;
use crate::tree::{NodeId, Tree};

/// Step halvings tried before a Newton step is abandoned.
const MAX_HALVINGS: usize = 30;

/// Total log-likelihood and its first two derivatives with respect to one
/// branch length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeDerivatives {
    pub log_likelihood: f64,
    pub d1: f64,
    pub d2: f64,
}

/// What happened on one edge visit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeOutcome {
    pub edge: NodeId,
    pub old_length: f64,
    pub new_length: f64,
    pub iterations: usize,
    pub log_likelihood_before: f64,
    pub log_likelihood_after: f64,
    /// False when the visit ended below its starting log-likelihood and the
    /// edge was restored.
    pub accepted: bool,
}

/// Summary of a full [`BranchLengthOptimizer::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationReport {
    pub initial_log_likelihood: f64,
    pub final_log_likelihood: f64,
    /// Log-likelihood after each pass.
    pub pass_log_likelihoods: Vec<f64>,
    /// Edge visits that changed a length.
    pub edges_updated: usize,
    /// Edge visits that ended in a rollback.
    pub rollbacks: usize,
}

/// Data on both sides of one edge, per pattern and category.
struct EdgeContext {
    above: Vec<f64>,
    below: Vec<f64>,
    /// ln wₖ plus both scalers; -∞ for empty categories.
    log_factor: Vec<f64>,
}

/// Newton–Raphson over the edges of a tree, one edge at a time.
pub struct BranchLengthOptimizer<'a> {
    tree: &'a mut Tree,
    model: &'a mut SubstitutionModel,
    rates: &'a RateCategories,
    patterns: &'a SitePatterns,
    config: NewtonConfig,
    transitions: TransitionSet,
    cache: ConditionalCache,
}

impl<'a> BranchLengthOptimizer<'a> {
    /// Decompose the model if needed and build the conditional cache.
    pub fn new(
        tree: &'a mut Tree,
        model: &'a mut SubstitutionModel,
        rates: &'a RateCategories,
        patterns: &'a SitePatterns,
        config: NewtonConfig,
    ) -> Result<Self> {
        if !(config.min_branch_length > 0.0 && config.min_branch_length < config.max_branch_length) {
            return Err(SylvaError::InvalidInput(format!(
                "branch bounds must satisfy 0 < min < max, got [{}, {}]",
                config.min_branch_length, config.max_branch_length
            )));
        }
        if !model.is_decomposed() {
            model.decompose()?;
        }
        let transitions = model.finalize(&*tree, rates)?;
        let cache = ConditionalCache::build(&*tree, &transitions, patterns)?;
        Ok(Self {
            tree,
            model,
            rates,
            patterns,
            config,
            transitions,
            cache,
        })
    }

    pub fn tree(&self) -> &Tree {
        &*self.tree
    }

    pub fn config(&self) -> &NewtonConfig {
        &self.config
    }

    /// Rate categories the optimizer evaluates under.
    pub fn rates(&self) -> &RateCategories {
        self.rates
    }

    /// Current total log-likelihood.
    pub fn log_likelihood(&self) -> f64 {
        self.cache
            .log_likelihood(&*self.tree, &self.transitions, self.patterns)
    }

    /// Set one branch length and bring matrices and cached vectors up to
    /// date.
    pub fn set_branch_length(&mut self, edge: NodeId, length: f64) -> Result<()> {
        self.check_edge(edge)?;
        self.tree.set_branch_length(edge, length)?;
        self.transitions.refresh_edge(self.model, edge, length)?;
        self.cache
            .update_path(&*self.tree, &self.transitions, self.patterns, edge);
        Ok(())
    }

    /// lnL, ∂lnL/∂t and ∂²lnL/∂t² at the current length of `edge`.
    pub fn edge_derivatives(&self, edge: NodeId) -> Result<EdgeDerivatives> {
        self.check_edge(edge)?;
        let ctx = self.edge_context(edge);
        self.evaluate(&ctx, self.tree.branch_length(edge))
    }

    /// One Newton–Raphson visit of `edge`.
    ///
    /// Each step moves along the Newton direction and halves the step until
    /// the log-likelihood no longer drops, so every iterate is at least as
    /// good as the one before. The bounds only clamp proposals. The final
    /// length is kept only if it did not fall below the starting value.
    pub fn optimize_edge(&mut self, edge: NodeId) -> Result<EdgeOutcome> {
        self.check_edge(edge)?;
        let ctx = self.edge_context(edge);
        let old_length = self.tree.branch_length(edge);
        let baseline = self.evaluate(&ctx, old_length)?;

        let (min, max) = (self.config.min_branch_length, self.config.max_branch_length);
        let mut t = old_length;
        let mut current = baseline;
        let mut iterations = 0;
        while iterations < self.config.max_iterations {
            if !(current.d1.is_finite() && current.d2.is_finite())
                || current.d1.abs() < self.config.gradient_tolerance
            {
                break;
            }
            // Without negative curvature the Newton quotient points away
            // from a maximum; halve or double along the gradient instead.
            let proposal = if current.d2 < 0.0 {
                t - current.d1 / current.d2
            } else if current.d1 > 0.0 {
                t.max(min) * 2.0
            } else {
                t * 0.5
            };
            // An overshoot past zero backtracks to half the current length.
            let target = if proposal > 0.0 { proposal } else { t * 0.5 };
            iterations += 1;
            match self.line_search(&ctx, t, target.clamp(min, max), &current)? {
                Some((next_t, next)) => {
                    t = next_t;
                    current = next;
                }
                None => break,
            }
        }

        let accepted = current.log_likelihood >= baseline.log_likelihood;
        let (new_length, after) = if accepted {
            (t, current.log_likelihood)
        } else {
            (old_length, baseline.log_likelihood)
        };
        if new_length != old_length {
            self.set_branch_length(edge, new_length)?;
        }
        trace!(
            edge,
            old_length,
            new_length,
            iterations,
            accepted,
            "branch length visit"
        );
        Ok(EdgeOutcome {
            edge,
            old_length,
            new_length,
            iterations,
            log_likelihood_before: baseline.log_likelihood,
            log_likelihood_after: after,
            accepted,
        })
    }

    /// Visit every edge once per pass, alternating root-to-tip and
    /// tip-to-root order.
    pub fn run(&mut self) -> Result<OptimizationReport> {
        let initial = self.log_likelihood();
        let mut pass_log_likelihoods = Vec::with_capacity(self.config.passes);
        let mut edges_updated = 0;
        let mut rollbacks = 0;
        for pass in 0..self.config.passes {
            let order: Vec<NodeId> = if pass % 2 == 0 {
                self.tree.preorder().to_vec()
            } else {
                self.tree.postorder().to_vec()
            };
            let before = self.log_likelihood();
            for edge in order {
                if edge == self.tree.root() {
                    continue;
                }
                let outcome = self.optimize_edge(edge)?;
                if !outcome.accepted {
                    rollbacks += 1;
                } else if outcome.new_length != outcome.old_length {
                    edges_updated += 1;
                }
            }
            let after = self.log_likelihood();
            debug!(
                pass,
                direction = if pass % 2 == 0 { "preorder" } else { "postorder" },
                before,
                after,
                "branch length pass"
            );
            pass_log_likelihoods.push(after);
        }
        Ok(OptimizationReport {
            initial_log_likelihood: initial,
            final_log_likelihood: self.log_likelihood(),
            pass_log_likelihoods,
            edges_updated,
            rollbacks,
        })
    }

    fn check_edge(&self, edge: NodeId) -> Result<()> {
        if edge >= self.tree.node_count() || edge == self.tree.root() {
            return Err(SylvaError::InvalidInput(format!(
                "node {} does not identify an edge",
                edge
            )));
        }
        Ok(())
    }

    /// Collect `tipward[edge]` and the complement on the parent side by
    /// walking down from the root.
    fn edge_context(&self, edge: NodeId) -> EdgeContext {
        let n = self.cache.n_states();
        let n_patterns = self.cache.n_patterns();
        let n_categories = self.cache.n_categories();
        let mut path = self.tree.path_to_root(edge);
        path.reverse();

        let blocks = n_patterns * n_categories;
        let mut above = vec![0.0; blocks * n];
        let mut below = vec![0.0; blocks * n];
        let mut log_factor = vec![f64::NEG_INFINITY; blocks];
        let mut msg = vec![0.0; n];
        let mut next = vec![0.0; n];

        for pattern in 0..n_patterns {
            for category in 0..n_categories {
                let b = pattern * n_categories + category;
                let weight = self.transitions.category_weights()[category];
                msg.copy_from_slice(self.transitions.frequencies());
                let mut scale = 0.0;
                for (i, &node) in path.iter().enumerate().skip(1) {
                    for sib in self.tree.siblings(node) {
                        for (m, r) in msg.iter_mut().zip(self.cache.rootward(sib, pattern, category)) {
                            *m *= r;
                        }
                        scale += self.cache.log_scale(sib, pattern, category);
                    }
                    scale += rescale(&mut msg);
                    if i + 1 < path.len() {
                        self.transitions
                            .matrix(node, category)
                            .vec_mul_into(&msg, &mut next);
                        std::mem::swap(&mut msg, &mut next);
                        scale += rescale(&mut msg);
                    }
                }
                above[b * n..(b + 1) * n].copy_from_slice(&msg);
                below[b * n..(b + 1) * n].copy_from_slice(self.cache.tipward(edge, pattern, category));
                if weight > 0.0 {
                    log_factor[b] = weight.ln() + scale + self.cache.log_scale(edge, pattern, category);
                }
            }
        }
        EdgeContext {
            above,
            below,
            log_factor,
        }
    }

    /// Step from `t` toward `target`, halving the step until the
    /// log-likelihood is no lower than at `t`. `None` when no step helps.
    fn line_search(
        &self,
        ctx: &EdgeContext,
        t: f64,
        target: f64,
        current: &EdgeDerivatives,
    ) -> Result<Option<(f64, EdgeDerivatives)>> {
        let (min, max) = (self.config.min_branch_length, self.config.max_branch_length);
        let mut step = target - t;
        for _ in 0..MAX_HALVINGS {
            let next_t = (t + step).clamp(min, max);
            if next_t == t {
                return Ok(None);
            }
            let next = self.evaluate(ctx, next_t)?;
            if next.log_likelihood >= current.log_likelihood {
                return Ok(Some((next_t, next)));
            }
            step *= 0.5;
        }
        Ok(None)
    }

    /// Total lnL and derivatives with `edge`'s length set to `t`.
    fn evaluate(&self, ctx: &EdgeContext, t: f64) -> Result<EdgeDerivatives> {
        let n = self.cache.n_states();
        let n_categories = self.cache.n_categories();
        let category_rates = self.transitions.category_rates();
        let mut kernels: Vec<(Matrix, Matrix, Matrix)> = Vec::with_capacity(n_categories);
        for &r in category_rates {
            if r > 0.0 {
                let (p, d1, d2) = self.model.transition_with_derivatives(t * r)?;
                kernels.push((p, d1.scaled(r), d2.scaled(r * r)));
            } else {
                kernels.push((Matrix::identity(n), Matrix::zeros(n), Matrix::zeros(n)));
            }
        }

        let mut total = EdgeDerivatives {
            log_likelihood: 0.0,
            d1: 0.0,
            d2: 0.0,
        };
        for (pattern, &weight) in self.patterns.weights().iter().enumerate() {
            if weight == 0.0 {
                continue;
            }
            let factors = &ctx.log_factor[pattern * n_categories..(pattern + 1) * n_categories];
            let shift = factors.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if shift == f64::NEG_INFINITY {
                total.log_likelihood = f64::NEG_INFINITY;
                continue;
            }
            let (mut l, mut l1, mut l2) = (0.0, 0.0, 0.0);
            for (c, (p, p1, p2)) in kernels.iter().enumerate() {
                let f = (factors[c] - shift).exp();
                if f == 0.0 {
                    continue;
                }
                let b = pattern * n_categories + c;
                let above = &ctx.above[b * n..(b + 1) * n];
                let below = &ctx.below[b * n..(b + 1) * n];
                l += f * p.bilinear(above, below);
                l1 += f * p1.bilinear(above, below);
                l2 += f * p2.bilinear(above, below);
            }
            if l <= 0.0 {
                total.log_likelihood = f64::NEG_INFINITY;
                continue;
            }
            let g = l1 / l;
            total.log_likelihood += weight * (shift + l.ln());
            total.d1 += weight * g;
            total.d2 += weight * (l2 / l - g * g);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::StateCoding;
    use crate::tree::TreeBuilder;

    fn tree() -> Tree {
        // ((a,b),(c,d),e)
        let mut b = TreeBuilder::new();
        let ab = b.add_child(0, None, 0.3).unwrap();
        let cd = b.add_child(0, None, 0.02).unwrap();
        b.add_child(0, Some("e"), 0.5).unwrap();
        b.add_child(ab, Some("a"), 0.01).unwrap();
        b.add_child(ab, Some("b"), 0.9).unwrap();
        b.add_child(cd, Some("c"), 0.2).unwrap();
        b.add_child(cd, Some("d"), 0.2).unwrap();
        b.build().unwrap()
    }

    fn data(tree: &Tree) -> SitePatterns {
        SitePatterns::from_sequences(
            tree,
            &[
                ("a", b"ACGTACGTACGGTACCATGA"),
                ("b", b"ACGTACCTACGGTTCCATGA"),
                ("c", b"ACGAACGTTCGGTACGATCA"),
                ("d", b"ACGAACGTTCAGTACGATCR"),
                ("e", b"TCGAACGTTCAGTACGTTCA"),
            ],
            StateCoding::Nucleotide,
        )
        .unwrap()
    }

    fn hky() -> SubstitutionModel {
        SubstitutionModel::hky85(3.0, &[0.3, 0.2, 0.2, 0.3]).unwrap()
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let mut t = tree();
        let pats = data(&t);
        let mut m = hky();
        let rates = RateCategories::gamma_invariant(0.7, 4, 0.15).unwrap();
        let mut opt =
            BranchLengthOptimizer::new(&mut t, &mut m, &rates, &pats, NewtonConfig::default())
                .unwrap();
        let edge = 2; // cd
        let t0 = 0.3;
        let h = 1e-4;
        opt.set_branch_length(edge, t0 + h).unwrap();
        let up = opt.log_likelihood();
        opt.set_branch_length(edge, t0 - h).unwrap();
        let down = opt.log_likelihood();
        opt.set_branch_length(edge, t0).unwrap();
        let mid = opt.edge_derivatives(edge).unwrap();

        assert!((mid.log_likelihood - opt.log_likelihood()).abs() < 1e-9);
        let fd1 = (up - down) / (2.0 * h);
        let fd2 = (up - 2.0 * mid.log_likelihood + down) / (h * h);
        assert!((mid.d1 - fd1).abs() < 1e-5, "d1 {} vs {}", mid.d1, fd1);
        assert!((mid.d2 - fd2).abs() < 1e-2 * fd2.abs().max(1.0), "d2 {} vs {}", mid.d2, fd2);
    }

    #[test]
    fn edge_likelihood_matches_cache_everywhere() {
        let mut t = tree();
        let pats = data(&t);
        let mut m = hky();
        let rates = RateCategories::gamma(1.2, 3).unwrap();
        let opt =
            BranchLengthOptimizer::new(&mut t, &mut m, &rates, &pats, NewtonConfig::default())
                .unwrap();
        let total = opt.log_likelihood();
        for edge in 1..opt.tree().node_count() {
            let d = opt.edge_derivatives(edge).unwrap();
            assert!((d.log_likelihood - total).abs() < 1e-9, "edge {}", edge);
        }
    }

    #[test]
    fn single_edge_visit_never_regresses() {
        let mut t = tree();
        let pats = data(&t);
        let mut m = hky();
        let rates = RateCategories::single();
        let mut opt =
            BranchLengthOptimizer::new(&mut t, &mut m, &rates, &pats, NewtonConfig::default())
                .unwrap();
        for edge in 1..opt.tree().node_count() {
            let before = opt.log_likelihood();
            let outcome = opt.optimize_edge(edge).unwrap();
            let after = opt.log_likelihood();
            assert!(after >= before - 1e-9, "edge {}: {} -> {}", edge, before, after);
            assert!(outcome.log_likelihood_after >= outcome.log_likelihood_before);
            assert!(outcome.new_length >= 1e-8 && outcome.new_length <= 100.0);
        }
    }

    #[test]
    fn run_improves_and_reaches_stationary_point() {
        let mut t = tree();
        let pats = data(&t);
        let mut m = hky();
        let rates = RateCategories::single();
        let config = NewtonConfig::default().with_passes(20);
        let mut opt = BranchLengthOptimizer::new(&mut t, &mut m, &rates, &pats, config).unwrap();
        let report = opt.run().unwrap();
        assert!(report.final_log_likelihood > report.initial_log_likelihood);
        let mut previous = report.initial_log_likelihood;
        for &ll in &report.pass_log_likelihoods {
            assert!(ll >= previous - 1e-9);
            previous = ll;
        }
        // Interior optima have a vanishing gradient.
        for edge in 1..opt.tree().node_count() {
            let len = opt.tree().branch_length(edge);
            if len > 1e-6 && len < 99.0 {
                let d = opt.edge_derivatives(edge).unwrap();
                assert!(d.d1.abs() < 1e-3, "edge {} gradient {}", edge, d.d1);
            }
        }
    }

    #[test]
    fn cherry_matches_jc_closed_form_optimum() {
        // Two taxa under JC69: the MLE of the path length is
        // -3/4 ln(1 - 4/3 p) for p the proportion of differing sites.
        let mut b = TreeBuilder::new();
        b.add_child(0, Some("x"), 0.05).unwrap();
        b.add_child(0, Some("y"), 0.05).unwrap();
        let mut t = b.build().unwrap();
        let pats = SitePatterns::from_sequences(
            &t,
            &[("x", b"AAAAAAAAAA"), ("y", b"AAAAAAAACG")],
            StateCoding::Nucleotide,
        )
        .unwrap();
        let mut m = SubstitutionModel::jc69();
        let rates = RateCategories::single();
        // Keep y fixed and let x absorb the whole path.
        let mut opt = BranchLengthOptimizer::new(
            &mut t,
            &mut m,
            &rates,
            &pats,
            NewtonConfig::default().with_max_iterations(50),
        )
        .unwrap();
        for _ in 0..5 {
            opt.optimize_edge(1).unwrap();
        }
        let expected = -0.75 * (1.0 - 4.0 / 3.0 * 0.2f64).ln() - 0.05;
        let got = opt.tree().branch_length(1);
        assert!((got - expected).abs() < 1e-6, "{} vs {}", got, expected);
    }

    #[test]
    fn newton_overshoot_backtracks_instead_of_flooring() {
        // At a path length of 0.4 with one difference in ten sites the
        // Newton step lands near -2; the floor is far worse than 0.4.
        let mut b = TreeBuilder::new();
        b.add_child(0, Some("x"), 0.4).unwrap();
        b.add_child(0, Some("y"), 0.0).unwrap();
        let mut t = b.build().unwrap();
        let pats = SitePatterns::from_sequences(
            &t,
            &[("x", b"AAAAAAAAAA"), ("y", b"AAAAAAAAAC")],
            StateCoding::Nucleotide,
        )
        .unwrap();
        let mut m = SubstitutionModel::jc69();
        let rates = RateCategories::single();
        let mut opt =
            BranchLengthOptimizer::new(&mut t, &mut m, &rates, &pats, NewtonConfig::default())
                .unwrap();
        let d = opt.edge_derivatives(1).unwrap();
        assert!(d.d2 < 0.0 && 0.4 - d.d1 / d.d2 < 0.0);

        let first = opt.optimize_edge(1).unwrap();
        assert!(first.accepted);
        assert!(first.new_length < 0.4 && first.new_length > 1e-3);
        assert!(first.log_likelihood_after > first.log_likelihood_before);

        for _ in 0..4 {
            opt.optimize_edge(1).unwrap();
        }
        let expected = -0.75 * (1.0 - 4.0 / 3.0 * 0.1f64).ln();
        let got = opt.tree().branch_length(1);
        assert!((got - expected).abs() < 1e-6, "{} vs {}", got, expected);
    }

    #[test]
    fn identical_sequences_shrink_toward_floor() {
        let mut b = TreeBuilder::new();
        b.add_child(0, Some("x"), 0.4).unwrap();
        b.add_child(0, Some("y"), 0.0).unwrap();
        let mut t = b.build().unwrap();
        let pats = SitePatterns::from_sequences(
            &t,
            &[("x", b"ACGTACGT"), ("y", b"ACGTACGT")],
            StateCoding::Nucleotide,
        )
        .unwrap();
        let mut m = SubstitutionModel::jc69();
        let rates = RateCategories::single();
        let mut opt =
            BranchLengthOptimizer::new(&mut t, &mut m, &rates, &pats, NewtonConfig::default())
                .unwrap();
        let before = opt.log_likelihood();
        let report = opt.run().unwrap();
        assert!(report.final_log_likelihood >= before);
        assert!(opt.tree().branch_length(1) < 0.4);
    }

    #[test]
    fn root_and_bad_bounds_rejected() {
        let mut t = tree();
        let pats = data(&t);
        let mut m = hky();
        let rates = RateCategories::single();
        {
            let mut opt =
                BranchLengthOptimizer::new(&mut t, &mut m, &rates, &pats, NewtonConfig::default())
                    .unwrap();
            assert!(opt.optimize_edge(0).is_err());
            assert!(opt.edge_derivatives(99).is_err());
        }
        let bad = NewtonConfig::default().with_branch_bounds(1.0, 0.5);
        assert!(BranchLengthOptimizer::new(&mut t, &mut m, &rates, &pats, bad).is_err());
    }

    #[test]
    fn nonreversible_model_optimizes() {
        let mut b = TreeBuilder::new();
        let x = b.add_child(0, None, 0.3).unwrap();
        b.add_child(0, Some("c"), 0.4).unwrap();
        b.add_child(x, Some("a"), 0.2).unwrap();
        b.add_child(x, Some("b"), 0.6).unwrap();
        let mut t = b.build().unwrap();
        let tokens = [("a", "0120"), ("b", "0221"), ("c", "1?20")];
        let mut leaf_partials = Vec::new();
        for (name, seq) in tokens {
            let leaf = t.find_leaf(name).unwrap();
            let vectors = seq
                .chars()
                .map(|c| crate::states::discrete_partial(&c.to_string(), 3).unwrap())
                .collect();
            leaf_partials.push((leaf, vectors));
        }
        let pats = SitePatterns::from_partials(&t, 3, leaf_partials, vec![1.0; 4]).unwrap();
        let mut m = SubstitutionModel::mk(3, crate::model::RateLayout::Asymmetric).unwrap();
        m.set_rate_parameters(&[0.5, 1.0, 2.0, 0.1, 0.3, 0.7]).unwrap();
        let rates = RateCategories::single();
        let mut opt =
            BranchLengthOptimizer::new(&mut t, &mut m, &rates, &pats, NewtonConfig::default())
                .unwrap();
        let h = 1e-5;
        opt.set_branch_length(x, 0.3 + h).unwrap();
        let up = opt.log_likelihood();
        opt.set_branch_length(x, 0.3 - h).unwrap();
        let down = opt.log_likelihood();
        opt.set_branch_length(x, 0.3).unwrap();
        let d = opt.edge_derivatives(x).unwrap();
        assert!((d.d1 - (up - down) / (2.0 * h)).abs() < 1e-5);

        let report = opt.run().unwrap();
        assert!(report.final_log_likelihood >= report.initial_log_likelihood);
    }
}
