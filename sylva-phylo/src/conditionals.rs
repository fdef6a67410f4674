//! Forward/backward conditional vectors, ancestral posteriors and
//! stochastic-mapping expectations.
//!
//! On top of the tipward/rootward vectors of [`ConditionalCache`], a
//! pre-order pass computes for every node `n` with parent `p`:
//!
//! ```text
//! sibward_complement[n]      = rootward_of_sibling_set[p] ⊙ Π_{siblings s} rootward[s]
//! rootward_of_sibling_set[n] = P(len(n))ᵀ · sibward_complement[n]
//! ```
//!
//! with `rootward_of_sibling_set[root] = π`. The first lives in the parent's
//! state space and carries everything outside the subtree of `n`; the
//! second is the same information moved down to `n`. The posterior at `n` is
//! then `normalize(tipward[n] ⊙ rootward_of_sibling_set[n])`.

use sylva_core::{log_sum_exp, Result, SylvaError};

use crate::model::{SubstitutionModel, TransitionSet};
use crate::partials::{rescale, ConditionalCache};
use crate::patterns::SitePatterns;
use crate::tree::{NodeId, Tree};

/// Posterior state distributions at every node and pattern.
#[derive(Debug, Clone)]
pub struct AncestralReconstruction {
    /// `posteriors[node][pattern]`, each summing to 1.
    pub posteriors: Vec<Vec<Vec<f64>>>,
    /// Most probable state per node and pattern.
    pub map_states: Vec<Vec<usize>>,
}

/// Posterior expectations for one labelled substitution along one edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeExpectations {
    /// Expected number of `from → to` substitutions, per pattern.
    pub counts: Vec<f64>,
    /// Expected time spent in `from`, per pattern, in branch-length units.
    pub dwell: Vec<f64>,
    /// Pattern-weighted sum of `counts`.
    pub total_counts: f64,
    /// Pattern-weighted sum of `dwell`.
    pub total_dwell: f64,
}

/// The four per-node, per-pattern conditional vectors.
#[derive(Debug, Clone)]
pub struct ForwardBackwardConditionals {
    cache: ConditionalCache,
    weights: Vec<f64>,
    n_states: usize,
    n_patterns: usize,
    n_categories: usize,
    sibling_set: Vec<f64>,
    sibling_scale: Vec<f64>,
    complement: Vec<f64>,
    complement_scale: Vec<f64>,
}

impl ForwardBackwardConditionals {
    /// Run the tipward pass and then the pre-order downward pass.
    pub fn compute(tree: &Tree, transitions: &TransitionSet, patterns: &SitePatterns) -> Result<Self> {
        let cache = ConditionalCache::build(tree, transitions, patterns)?;
        let n_states = cache.n_states();
        let n_patterns = cache.n_patterns();
        let n_categories = cache.n_categories();
        let blocks = tree.node_count() * n_patterns * n_categories;
        let mut fb = Self {
            cache,
            weights: patterns.weights().to_vec(),
            n_states,
            n_patterns,
            n_categories,
            sibling_set: vec![0.0; blocks * n_states],
            sibling_scale: vec![0.0; blocks],
            complement: vec![0.0; blocks * n_states],
            complement_scale: vec![0.0; blocks],
        };
        fb.downward(tree, transitions);
        Ok(fb)
    }

    #[inline]
    fn block(&self, node: NodeId, pattern: usize, category: usize) -> usize {
        (node * self.n_patterns + pattern) * self.n_categories + category
    }

    fn downward(&mut self, tree: &Tree, transitions: &TransitionSet) {
        let n = self.n_states;
        let root = tree.root();
        for pattern in 0..self.n_patterns {
            for category in 0..self.n_categories {
                let b = self.block(root, pattern, category);
                self.sibling_set[b * n..(b + 1) * n].copy_from_slice(transitions.frequencies());
                self.sibling_scale[b] = 0.0;
            }
        }

        let mut buf = vec![0.0; n];
        for &node in tree.preorder() {
            let Some(parent) = tree.parent(node) else {
                continue;
            };
            for pattern in 0..self.n_patterns {
                for category in 0..self.n_categories {
                    let b = self.block(node, pattern, category);
                    let pb = self.block(parent, pattern, category);

                    buf.copy_from_slice(&self.sibling_set[pb * n..(pb + 1) * n]);
                    let mut scale = self.sibling_scale[pb];
                    for sib in tree.siblings(node) {
                        for (x, r) in buf.iter_mut().zip(self.cache.rootward(sib, pattern, category)) {
                            *x *= r;
                        }
                        scale += self.cache.log_scale(sib, pattern, category);
                    }
                    scale += rescale(&mut buf);
                    self.complement[b * n..(b + 1) * n].copy_from_slice(&buf);
                    self.complement_scale[b] = scale;

                    let p = transitions.matrix(node, category);
                    p.vec_mul_into(&self.complement[b * n..(b + 1) * n], &mut buf);
                    scale += rescale(&mut buf);
                    self.sibling_set[b * n..(b + 1) * n].copy_from_slice(&buf);
                    self.sibling_scale[b] = scale;
                }
            }
        }
    }

    /// Probability of the data below `node` given its state (rescaled).
    pub fn tipward(&self, node: NodeId, pattern: usize, category: usize) -> &[f64] {
        self.cache.tipward(node, pattern, category)
    }

    /// `tipward` pushed through the edge above `node` (rescaled).
    pub fn rootward(&self, node: NodeId, pattern: usize, category: usize) -> &[f64] {
        self.cache.rootward(node, pattern, category)
    }

    /// Everything outside the subtree of `node`, expressed on `node`'s
    /// states (rescaled). The root holds π.
    pub fn rootward_of_sibling_set(&self, node: NodeId, pattern: usize, category: usize) -> &[f64] {
        let b = self.block(node, pattern, category);
        &self.sibling_set[b * self.n_states..(b + 1) * self.n_states]
    }

    /// Everything outside the subtree of `node`, expressed on the parent's
    /// states (rescaled). Zero at the root.
    pub fn sibward_complement(&self, node: NodeId, pattern: usize, category: usize) -> &[f64] {
        let b = self.block(node, pattern, category);
        &self.complement[b * self.n_states..(b + 1) * self.n_states]
    }

    /// Underlying tipward/rootward cache.
    pub fn cache(&self) -> &ConditionalCache {
        &self.cache
    }

    /// Per-category log weights of `tipward[node] ⊙ rootward_of_sibling_set[node]`.
    fn category_log_weights(&self, transitions: &TransitionSet, node: NodeId, pattern: usize) -> Vec<f64> {
        (0..self.n_categories)
            .map(|c| {
                let w = transitions.category_weights()[c];
                if w == 0.0 {
                    return f64::NEG_INFINITY;
                }
                let b = self.block(node, pattern, c);
                w.ln() + self.cache.log_scale(node, pattern, c) + self.sibling_scale[b]
            })
            .collect()
    }

    /// ln L of one pattern computed at `node`. Every node gives the same
    /// value up to rounding.
    pub fn site_log_likelihood_at(&self, transitions: &TransitionSet, node: NodeId, pattern: usize) -> f64 {
        let logs = self.category_log_weights(transitions, node, pattern);
        let terms: Vec<f64> = logs
            .iter()
            .enumerate()
            .map(|(c, &lw)| {
                let dot: f64 = self
                    .tipward(node, pattern, c)
                    .iter()
                    .zip(self.rootward_of_sibling_set(node, pattern, c))
                    .map(|(d, u)| d * u)
                    .sum();
                lw + dot.ln()
            })
            .collect();
        log_sum_exp(&terms)
    }

    /// Posterior distribution over states at `node` for one pattern.
    pub fn posterior(&self, transitions: &TransitionSet, node: NodeId, pattern: usize) -> Vec<f64> {
        let logs = self.category_log_weights(transitions, node, pattern);
        let shift = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut post = vec![0.0; self.n_states];
        if shift == f64::NEG_INFINITY {
            return post;
        }
        for (c, &lw) in logs.iter().enumerate() {
            let f = (lw - shift).exp();
            if f == 0.0 {
                continue;
            }
            for ((p, d), u) in post
                .iter_mut()
                .zip(self.tipward(node, pattern, c))
                .zip(self.rootward_of_sibling_set(node, pattern, c))
            {
                *p += f * d * u;
            }
        }
        let total: f64 = post.iter().sum();
        if total > 0.0 {
            for p in &mut post {
                *p /= total;
            }
        }
        post
    }

    /// Posteriors and MAP states at every node and pattern.
    pub fn ancestral_reconstruction(&self, tree: &Tree, transitions: &TransitionSet) -> AncestralReconstruction {
        let mut posteriors = Vec::with_capacity(tree.node_count());
        let mut map_states = Vec::with_capacity(tree.node_count());
        for node in 0..tree.node_count() {
            let node_posts: Vec<Vec<f64>> = (0..self.n_patterns)
                .map(|p| self.posterior(transitions, node, p))
                .collect();
            map_states.push(node_posts.iter().map(|v| argmax(v)).collect());
            posteriors.push(node_posts);
        }
        AncestralReconstruction {
            posteriors,
            map_states,
        }
    }

    /// Posterior expected `from → to` substitutions and dwell time in
    /// `from` along the edge above `edge`.
    pub fn expected_substitutions(
        &self,
        tree: &Tree,
        transitions: &TransitionSet,
        model: &SubstitutionModel,
        edge: NodeId,
        from: usize,
        to: usize,
    ) -> Result<EdgeExpectations> {
        if edge == tree.root() || edge >= tree.node_count() {
            return Err(SylvaError::InvalidInput(format!(
                "node {} does not identify an edge",
                edge
            )));
        }
        let length = tree.branch_length(edge);
        let rates = transitions.category_rates();
        let mut mappings = Vec::with_capacity(self.n_categories);
        for &r in rates {
            mappings.push(if r > 0.0 {
                Some(model.stochastic_mapping_matrices(length * r, from, to)?)
            } else {
                None
            });
        }

        let mut counts = Vec::with_capacity(self.n_patterns);
        let mut dwell = Vec::with_capacity(self.n_patterns);
        for pattern in 0..self.n_patterns {
            let logs: Vec<f64> = (0..self.n_categories)
                .map(|c| {
                    let w = transitions.category_weights()[c];
                    if w == 0.0 {
                        return f64::NEG_INFINITY;
                    }
                    let b = self.block(edge, pattern, c);
                    w.ln() + self.complement_scale[b] + self.cache.log_scale(edge, pattern, c)
                })
                .collect();
            let shift = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let (mut num_n, mut num_t, mut den) = (0.0, 0.0, 0.0);
            if shift > f64::NEG_INFINITY {
                for c in 0..self.n_categories {
                    let f = (logs[c] - shift).exp();
                    if f == 0.0 {
                        continue;
                    }
                    let above = self.sibward_complement(edge, pattern, c);
                    let below = self.tipward(edge, pattern, c);
                    den += f * transitions.matrix(edge, c).bilinear(above, below);
                    match &mappings[c] {
                        Some(m) => {
                            num_n += f * m.counts.bilinear(above, below);
                            num_t += f * m.dwell.bilinear(above, below) / rates[c];
                        }
                        None => num_t += f * length * above[from] * below[from],
                    }
                }
            }
            if den > 0.0 {
                counts.push(num_n / den);
                dwell.push(num_t / den);
            } else {
                counts.push(0.0);
                dwell.push(0.0);
            }
        }
        let total_counts = counts.iter().zip(&self.weights).map(|(c, w)| c * w).sum();
        let total_dwell = dwell.iter().zip(&self.weights).map(|(d, w)| d * w).sum();
        Ok(EdgeExpectations {
            counts,
            dwell,
            total_counts,
            total_dwell,
        })
    }
}

fn argmax(v: &[f64]) -> usize {
    v.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &x)| if x > bv { (i, x) } else { (bi, bv) })
        .0
}
