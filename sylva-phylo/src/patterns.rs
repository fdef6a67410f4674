//! Site patterns: per-leaf indicator vectors plus pattern weights.
//!
//! Patterns are built externally (compressed or not) and only validated
//! here against the tree they will be evaluated on.

use sylva_core::{Result, Summarizable, SylvaError};

use crate::states::StateCoding;
use crate::tree::{NodeId, Tree};

/// Leaf data for a set of alignment patterns.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SitePatterns {
    n_states: usize,
    n_patterns: usize,
    weights: Vec<f64>,
    /// Indexed by node id; leaves hold `n_patterns × n_states` values.
    tips: Vec<Option<Vec<f64>>>,
}

impl SitePatterns {
    /// Assemble patterns from per-leaf indicator vectors.
    ///
    /// `leaf_partials` holds one `(leaf, vectors)` entry per leaf of `tree`,
    /// with one vector of length `n_states` per pattern. `weights` holds the
    /// multiplicity of each pattern.
    pub fn from_partials(
        tree: &Tree,
        n_states: usize,
        leaf_partials: Vec<(NodeId, Vec<Vec<f64>>)>,
        weights: Vec<f64>,
    ) -> Result<Self> {
        let n_patterns = weights.len();
        if n_patterns == 0 {
            return Err(SylvaError::InvalidInput("no site patterns".into()));
        }
        if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(SylvaError::InvalidInput(format!(
                "pattern weights must be finite and non-negative, got {}",
                w
            )));
        }

        let mut tips: Vec<Option<Vec<f64>>> = vec![None; tree.node_count()];
        for (leaf, vectors) in leaf_partials {
            if !tree.is_leaf(leaf) {
                return Err(SylvaError::InvalidInput(format!(
                    "node {} is not a leaf",
                    leaf
                )));
            }
            if tips[leaf].is_some() {
                return Err(SylvaError::InvalidInput(format!(
                    "leaf {} given more than once",
                    leaf
                )));
            }
            if vectors.len() != n_patterns {
                return Err(SylvaError::InvalidInput(format!(
                    "leaf {} has {} patterns, expected {}",
                    leaf,
                    vectors.len(),
                    n_patterns
                )));
            }
            let mut flat = Vec::with_capacity(n_patterns * n_states);
            for (p, v) in vectors.iter().enumerate() {
                if v.len() != n_states {
                    return Err(SylvaError::InvalidInput(format!(
                        "leaf {} pattern {} has {} states, expected {}",
                        leaf,
                        p,
                        v.len(),
                        n_states
                    )));
                }
                if v.iter().any(|x| !x.is_finite() || *x < 0.0) || v.iter().all(|&x| x == 0.0)
                {
                    return Err(SylvaError::InvalidInput(format!(
                        "leaf {} pattern {} has no admissible state",
                        leaf, p
                    )));
                }
                flat.extend_from_slice(v);
            }
            tips[leaf] = Some(flat);
        }
        if let Some(&missing) = tree.leaves().iter().find(|&&l| tips[l].is_none()) {
            return Err(SylvaError::InvalidInput(format!(
                "no data for leaf {}",
                missing
            )));
        }

        Ok(Self {
            n_states,
            n_patterns,
            weights,
            tips,
        })
    }

    /// One pattern per alignment column, each with weight 1.
    ///
    /// `sequences` pairs leaf names with aligned sequences.
    pub fn from_sequences(
        tree: &Tree,
        sequences: &[(&str, &[u8])],
        coding: StateCoding,
    ) -> Result<Self> {
        let n_sites = sequences.first().map_or(0, |(_, s)| s.len());
        let mut leaf_partials = Vec::with_capacity(sequences.len());
        for &(name, seq) in sequences {
            let leaf = tree.find_leaf(name).ok_or_else(|| {
                SylvaError::InvalidInput(format!("no leaf named '{}'", name))
            })?;
            if seq.len() != n_sites {
                return Err(SylvaError::InvalidInput(format!(
                    "sequence '{}' has length {}, expected {}",
                    name,
                    seq.len(),
                    n_sites
                )));
            }
            let vectors = seq
                .iter()
                .map(|&b| coding.partial(b))
                .collect::<Result<Vec<_>>>()?;
            leaf_partials.push((leaf, vectors));
        }
        Self::from_partials(tree, coding.n_states(), leaf_partials, vec![1.0; n_sites])
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_patterns(&self) -> usize {
        self.n_patterns
    }

    /// Multiplicity of every pattern.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Sum of weights: the alignment length for integer multiplicities.
    pub fn total_weight(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// `(pattern, weight)` pairs covering every pattern.
    pub fn sites(&self) -> Vec<(usize, f64)> {
        self.weights.iter().copied().enumerate().collect()
    }

    /// Indicator vector of `leaf` at `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `leaf` carries no data; every leaf of the tree the
    /// patterns were validated against does.
    pub fn tip(&self, leaf: NodeId, pattern: usize) -> &[f64] {
        let flat = self.tips[leaf]
            .as_ref()
            .unwrap_or_else(|| panic!("node {} carries no leaf data", leaf));
        &flat[pattern * self.n_states..(pattern + 1) * self.n_states]
    }

    /// True if the patterns were built for a tree with `tree`'s shape.
    pub fn matches(&self, tree: &Tree) -> bool {
        self.tips.len() == tree.node_count()
            && tree.leaves().iter().all(|&l| self.tips[l].is_some())
    }

    pub(crate) fn check_tree(&self, tree: &Tree) -> Result<()> {
        if self.matches(tree) {
            Ok(())
        } else {
            Err(SylvaError::InvalidInput(
                "site patterns were built for a different tree".into(),
            ))
        }
    }
}

impl Summarizable for SitePatterns {
    fn summary(&self) -> String {
        format!(
            "SitePatterns: {} patterns over {} states, total weight {}",
            self.n_patterns,
            self.n_states,
            self.total_weight()
        )
    }
}
