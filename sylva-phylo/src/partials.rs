//! Cached conditional likelihoods for every node, pattern and rate
//! category.
//!
//! Two vectors are kept per (node, pattern, category):
//!
//! - `tipward[n]`: probability of the data below `n` given each state at `n`;
//! - `rootward[n]`: `P(len(n)) · tipward[n]`, the same seen from `n`'s parent.
//!
//! Internal `tipward` vectors are rescaled so their largest entry is 1; the
//! log of everything divided out below a node is accumulated in its
//! scaler. `rootward[n]` shares the scaler of `tipward[n]`.
//!
//! After one edge changes, [`ConditionalCache::update_path`] recomputes only
//! that edge and its ancestors.

use sylva_core::{log_sum_exp, Result, SylvaError};

use crate::model::TransitionSet;
use crate::patterns::SitePatterns;
use crate::tree::{NodeId, Tree};

/// Rescaled conditional vectors with per-vector log scalers.
#[derive(Debug, Clone)]
pub struct ConditionalCache {
    n_states: usize,
    n_patterns: usize,
    n_categories: usize,
    tipward: Vec<f64>,
    rootward: Vec<f64>,
    scale: Vec<f64>,
}

impl ConditionalCache {
    /// Full post-order computation.
    pub fn build(tree: &Tree, transitions: &TransitionSet, patterns: &SitePatterns) -> Result<Self> {
        check_shapes(tree, transitions, patterns)?;
        let n_states = transitions.n_states();
        let n_patterns = patterns.n_patterns();
        let n_categories = transitions.n_categories();
        let blocks = tree.node_count() * n_patterns * n_categories;
        let mut cache = Self {
            n_states,
            n_patterns,
            n_categories,
            tipward: vec![0.0; blocks * n_states],
            rootward: vec![0.0; blocks * n_states],
            scale: vec![0.0; blocks],
        };
        for &node in tree.postorder() {
            cache.recompute_node(tree, transitions, patterns, node);
        }
        Ok(cache)
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_patterns(&self) -> usize {
        self.n_patterns
    }

    pub fn n_categories(&self) -> usize {
        self.n_categories
    }

    #[inline]
    fn block(&self, node: NodeId, pattern: usize, category: usize) -> usize {
        (node * self.n_patterns + pattern) * self.n_categories + category
    }

    /// Rescaled `tipward` vector.
    pub fn tipward(&self, node: NodeId, pattern: usize, category: usize) -> &[f64] {
        let start = self.block(node, pattern, category) * self.n_states;
        &self.tipward[start..start + self.n_states]
    }

    /// Rescaled `rootward` vector (in the parent's state space).
    pub fn rootward(&self, node: NodeId, pattern: usize, category: usize) -> &[f64] {
        let start = self.block(node, pattern, category) * self.n_states;
        &self.rootward[start..start + self.n_states]
    }

    /// Log of the factor divided out of `tipward`/`rootward` of `node`.
    pub fn log_scale(&self, node: NodeId, pattern: usize, category: usize) -> f64 {
        self.scale[self.block(node, pattern, category)]
    }

    /// Recompute `tipward` and `rootward` of one node from its children.
    pub fn recompute_node(
        &mut self,
        tree: &Tree,
        transitions: &TransitionSet,
        patterns: &SitePatterns,
        node: NodeId,
    ) {
        let n = self.n_states;
        let is_root = node == tree.root();
        for pattern in 0..self.n_patterns {
            for category in 0..self.n_categories {
                let b = self.block(node, pattern, category);
                let start = b * n;
                if tree.is_leaf(node) {
                    self.tipward[start..start + n].copy_from_slice(patterns.tip(node, pattern));
                    self.scale[b] = 0.0;
                } else {
                    self.tipward[start..start + n].fill(1.0);
                    let mut log_scale = 0.0;
                    for &child in tree.children(node) {
                        let cb = self.block(child, pattern, category);
                        log_scale += self.scale[cb];
                        let (dst, src) = (start, cb * n);
                        for i in 0..n {
                            self.tipward[dst + i] *= self.rootward[src + i];
                        }
                    }
                    log_scale += rescale(&mut self.tipward[start..start + n]);
                    self.scale[b] = log_scale;
                }
                if !is_root {
                    let p = transitions.matrix(node, category);
                    let (tipward, rootward) = (&self.tipward, &mut self.rootward);
                    p.mul_vec_into(&tipward[start..start + n], &mut rootward[start..start + n]);
                }
            }
        }
    }

    /// Recompute `edge` and then each ancestor up to the root, leaving every
    /// other cached vector untouched.
    pub fn update_path(
        &mut self,
        tree: &Tree,
        transitions: &TransitionSet,
        patterns: &SitePatterns,
        edge: NodeId,
    ) {
        for node in tree.path_to_root(edge) {
            self.recompute_node(tree, transitions, patterns, node);
        }
    }

    /// Unweighted log-likelihood of one pattern.
    pub fn site_log_likelihood(&self, tree: &Tree, transitions: &TransitionSet, pattern: usize) -> f64 {
        let root = tree.root();
        let terms: Vec<f64> = (0..self.n_categories)
            .filter(|&c| transitions.category_weights()[c] > 0.0)
            .map(|c| {
                let l: f64 = transitions
                    .frequencies()
                    .iter()
                    .zip(self.tipward(root, pattern, c))
                    .map(|(pi, x)| pi * x)
                    .sum();
                transitions.category_weights()[c].ln() + self.log_scale(root, pattern, c) + l.ln()
            })
            .collect();
        log_sum_exp(&terms)
    }

    /// Weighted log-likelihood over all patterns.
    pub fn log_likelihood(&self, tree: &Tree, transitions: &TransitionSet, patterns: &SitePatterns) -> f64 {
        patterns
            .weights()
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0.0)
            .map(|(p, &w)| w * self.site_log_likelihood(tree, transitions, p))
            .sum()
    }
}

/// Divide by the maximum and return its log; an all-zero vector yields -∞.
pub(crate) fn rescale(v: &mut [f64]) -> f64 {
    let max = v.iter().copied().fold(0.0, f64::max);
    if max > 0.0 {
        for x in v.iter_mut() {
            *x /= max;
        }
        max.ln()
    } else {
        f64::NEG_INFINITY
    }
}

pub(crate) fn check_shapes(
    tree: &Tree,
    transitions: &TransitionSet,
    patterns: &SitePatterns,
) -> Result<()> {
    patterns.check_tree(tree)?;
    if transitions.n_nodes() != tree.node_count() {
        return Err(SylvaError::InvalidInput(format!(
            "transition matrices cover {} nodes, tree has {}",
            transitions.n_nodes(),
            tree.node_count()
        )));
    }
    if transitions.n_states() != patterns.n_states() {
        return Err(SylvaError::InvalidInput(format!(
            "model has {} states but patterns have {}",
            transitions.n_states(),
            patterns.n_states()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Accumulation;
    use crate::model::SubstitutionModel;
    use crate::pruning::PruningEngine;
    use crate::rates::RateCategories;
    use crate::states::StateCoding;
    use crate::tree::TreeBuilder;

    fn five_taxon() -> Tree {
        // (((a,b),c),(d,e))
        let mut b = TreeBuilder::new();
        let left = b.add_child(0, None, 0.2).unwrap();
        let right = b.add_child(0, None, 0.15).unwrap();
        let ab = b.add_child(left, None, 0.05).unwrap();
        b.add_child(ab, Some("a"), 0.1).unwrap();
        b.add_child(ab, Some("b"), 0.12).unwrap();
        b.add_child(left, Some("c"), 0.3).unwrap();
        b.add_child(right, Some("d"), 0.07).unwrap();
        b.add_child(right, Some("e"), 0.4).unwrap();
        b.build().unwrap()
    }

    fn patterns(tree: &Tree) -> SitePatterns {
        SitePatterns::from_sequences(
            tree,
            &[
                ("a", b"ACGTAAGY"),
                ("b", b"ACGTCAG-"),
                ("c", b"ATGTAGGC"),
                ("d", b"GCGAAACC"),
                ("e", b"GCCTTAAC"),
            ],
            StateCoding::Nucleotide,
        )
        .unwrap()
    }

    fn model() -> SubstitutionModel {
        SubstitutionModel::gtr(&[1.2, 3.1, 0.7, 0.9, 2.8], &[0.3, 0.2, 0.25, 0.25]).unwrap()
    }

    #[test]
    fn matches_pruning_engine() {
        let tree = five_taxon();
        let pats = patterns(&tree);
        let rates = RateCategories::gamma(0.6, 4).unwrap();
        let mut m = model();
        let set = m.finalize(&tree, &rates).unwrap();
        let cache = ConditionalCache::build(&tree, &set, &pats).unwrap();
        let mut engine = PruningEngine::new(&tree, 4);
        for p in 0..pats.n_patterns() {
            let direct = engine.site_log_likelihood(&tree, &set, &pats, p, Accumulation::Log);
            let cached = cache.site_log_likelihood(&tree, &set, p);
            assert!((direct - cached).abs() < 1e-10, "pattern {}: {} vs {}", p, direct, cached);
        }
    }

    #[test]
    fn path_update_matches_full_rebuild() {
        let mut tree = five_taxon();
        let pats = patterns(&tree);
        let rates = RateCategories::gamma(1.3, 3).unwrap();
        let mut m = model();
        let mut set = m.finalize(&tree, &rates).unwrap();
        let mut cache = ConditionalCache::build(&tree, &set, &pats).unwrap();

        let edge = tree.find_leaf("a").unwrap();
        tree.set_branch_length(edge, 0.9).unwrap();
        set.refresh_edge(&mut m, edge, 0.9).unwrap();
        cache.update_path(&tree, &set, &pats, edge);

        let rebuilt = ConditionalCache::build(&tree, &set, &pats).unwrap();
        let a = cache.log_likelihood(&tree, &set, &pats);
        let b = rebuilt.log_likelihood(&tree, &set, &pats);
        assert!((a - b).abs() < 1e-10);
        // Off-path vectors were never touched and still agree.
        let d = tree.find_leaf("d").unwrap();
        assert_eq!(cache.rootward(d, 0, 0), rebuilt.rootward(d, 0, 0));
    }

    #[test]
    fn rescale_divides_by_max() {
        let mut v = vec![0.5, 2.0, 1.0];
        let s = rescale(&mut v);
        assert!((s - 2f64.ln()).abs() < 1e-15);
        assert_eq!(v, vec![0.25, 1.0, 0.5]);
        let mut zeros = vec![0.0; 3];
        assert_eq!(rescale(&mut zeros), f64::NEG_INFINITY);
    }

    #[test]
    fn internal_vectors_are_rescaled() {
        let tree = five_taxon();
        let pats = patterns(&tree);
        let mut m = model();
        let set = m.finalize(&tree, &RateCategories::single()).unwrap();
        let cache = ConditionalCache::build(&tree, &set, &pats).unwrap();
        for &node in tree.postorder() {
            if tree.is_leaf(node) {
                continue;
            }
            for p in 0..pats.n_patterns() {
                let max = cache.tipward(node, p, 0).iter().copied().fold(0.0, f64::max);
                assert!((max - 1.0).abs() < 1e-15);
                assert!(cache.log_scale(node, p, 0) <= 0.0);
            }
        }
    }

    #[test]
    fn mismatched_states_rejected() {
        let tree = five_taxon();
        let pats = patterns(&tree);
        let mut lg = SubstitutionModel::lg();
        let set = lg.finalize(&tree, &RateCategories::single()).unwrap();
        assert!(ConditionalCache::build(&tree, &set, &pats).is_err());
    }
}
