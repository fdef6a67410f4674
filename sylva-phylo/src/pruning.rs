//! Felsenstein pruning for one site pattern.
//!
//! A post-order pass computes, for every node, the probability of the data
//! below it conditional on each state at the node:
//!
//! ```text
//! L_n(i) = Π_children Σ_j P_child(i, j) · L_child(j)
//! ```
//!
//! and the site likelihood is Σᵢ πᵢ L_root(i), averaged over rate
//! categories. [`Accumulation::Linear`] multiplies raw probabilities;
//! [`Accumulation::Log`] keeps every conditional as a log and combines
//! children with log-sum-exp, which stays finite on deep trees.

use sylva_core::{log_sum_exp, LogProb};

use crate::config::Accumulation;
use crate::model::TransitionSet;
use crate::patterns::SitePatterns;
use crate::tree::{NodeId, Tree};

/// Reusable scratch space for single-pattern pruning passes.
///
/// One engine per worker; buffers are sized once per tree.
#[derive(Debug, Clone)]
pub struct PruningEngine {
    n_states: usize,
    /// `node * n_states + state`, from the most recent category pass.
    conditionals: Vec<f64>,
    message: Vec<f64>,
    category_terms: Vec<f64>,
}

impl PruningEngine {
    pub fn new(tree: &Tree, n_states: usize) -> Self {
        Self {
            n_states,
            conditionals: vec![0.0; tree.node_count() * n_states],
            message: vec![0.0; n_states],
            category_terms: Vec::new(),
        }
    }

    /// Log-likelihood of one pattern, unweighted.
    ///
    /// The same accumulation mode is used at every node. Non-finite results
    /// are returned as they are.
    pub fn site_log_likelihood(
        &mut self,
        tree: &Tree,
        transitions: &TransitionSet,
        patterns: &SitePatterns,
        pattern: usize,
        accumulation: Accumulation,
    ) -> f64 {
        let weights = transitions.category_weights();
        match accumulation {
            Accumulation::Linear => {
                let mut total = 0.0;
                for (category, &w) in weights.iter().enumerate() {
                    if w == 0.0 {
                        continue;
                    }
                    total += w * self.linear_pass(tree, transitions, patterns, pattern, category);
                }
                total.ln()
            }
            Accumulation::Log => {
                let mut terms = std::mem::take(&mut self.category_terms);
                terms.clear();
                for (category, &w) in weights.iter().enumerate() {
                    if w == 0.0 {
                        continue;
                    }
                    let ln_l = self.log_pass(tree, transitions, patterns, pattern, category);
                    terms.push(w.ln() + ln_l);
                }
                let result = log_sum_exp(&terms);
                self.category_terms = terms;
                result
            }
        }
    }

    /// Site likelihood for one rate category, in linear space.
    pub fn linear_pass(
        &mut self,
        tree: &Tree,
        transitions: &TransitionSet,
        patterns: &SitePatterns,
        pattern: usize,
        category: usize,
    ) -> f64 {
        let n = self.n_states;
        for &node in tree.postorder() {
            if tree.is_leaf(node) {
                self.conditionals[node * n..(node + 1) * n]
                    .copy_from_slice(patterns.tip(node, pattern));
                continue;
            }
            self.conditionals[node * n..(node + 1) * n].fill(1.0);
            for &child in tree.children(node) {
                let p = transitions.matrix(child, category);
                p.mul_vec_into(&self.conditionals[child * n..(child + 1) * n], &mut self.message);
                for (c, m) in self.conditionals[node * n..(node + 1) * n]
                    .iter_mut()
                    .zip(&self.message)
                {
                    *c *= m;
                }
            }
        }
        let root = tree.root();
        transitions
            .frequencies()
            .iter()
            .zip(&self.conditionals[root * n..(root + 1) * n])
            .map(|(pi, l)| pi * l)
            .sum()
    }

    /// Log site likelihood for one rate category; every conditional is a
    /// log and every child is combined with log-sum-exp.
    pub fn log_pass(
        &mut self,
        tree: &Tree,
        transitions: &TransitionSet,
        patterns: &SitePatterns,
        pattern: usize,
        category: usize,
    ) -> f64 {
        let n = self.n_states;
        for &node in tree.postorder() {
            if tree.is_leaf(node) {
                for (c, &x) in self.conditionals[node * n..(node + 1) * n]
                    .iter_mut()
                    .zip(patterns.tip(node, pattern))
                {
                    *c = LogProb::from_factor(x).0;
                }
                continue;
            }
            self.conditionals[node * n..(node + 1) * n].fill(LogProb::certain().0);
            for &child in tree.children(node) {
                let p = transitions.matrix(child, category);
                let child_start = child * n;
                let shift = self.conditionals[child_start..child_start + n]
                    .iter()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max);
                for i in 0..n {
                    let message = if LogProb(shift).is_impossible() {
                        LogProb::impossible()
                    } else {
                        // ln Σⱼ P(i,j)·e^{lⱼ} = m + ln Σⱼ P(i,j)·e^{lⱼ−m}
                        let scaled: f64 = p
                            .row(i)
                            .iter()
                            .zip(&self.conditionals[child_start..child_start + n])
                            .map(|(pij, &l)| pij * (l - shift).exp())
                            .sum();
                        LogProb::from_factor(scaled).ln_mul(LogProb(shift))
                    };
                    let slot = &mut self.conditionals[node * n + i];
                    *slot = LogProb(*slot).ln_mul(message).0;
                }
            }
        }
        let root = tree.root();
        let mut total = LogProb::impossible();
        for (i, &pi) in transitions.frequencies().iter().enumerate() {
            let term = LogProb::from_factor(pi).ln_mul(LogProb(self.conditionals[root * n + i]));
            total = total.ln_add(term);
        }
        total.0
    }

    /// Conditional vector of `node` from the most recent pass; logs after a
    /// log pass.
    pub fn conditional(&self, node: NodeId) -> &[f64] {
        &self.conditionals[node * self.n_states..(node + 1) * self.n_states]
    }
}
