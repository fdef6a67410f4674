//! Phylogenetic likelihood for the Sylva workspace.
//!
//! Computes the likelihood of aligned site patterns on a fixed tree under a
//! continuous-time Markov substitution model, and optimizes branch lengths
//! and model parameters against it.
//!
//! - **Substitution models** — equal-rates, GTR/HKY, unscaled Mk and the
//!   JTT/WAG/LG amino-acid matrices over 2 to 20 states
//! - **Pruning** — linear- or log-space Felsenstein passes per pattern
//! - **Parallel evaluation** — deterministic site-parallel sums on a worker pool
//! - **Branch lengths** — per-edge Newton–Raphson with analytic derivatives
//! - **Conditionals** — ancestral posteriors and stochastic-mapping expectations
//!
//! # Quick start
//!
//! ```
//! use sylva_phylo::{
//!     log_likelihood, EvaluatorConfig, ParallelEvaluator, RateCategories, SitePatterns,
//!     StateCoding, SubstitutionModel, TreeBuilder,
//! };
//!
//! let mut builder = TreeBuilder::new();
//! let root = builder.root();
//! builder.add_child(root, Some("a"), 0.1).unwrap();
//! builder.add_child(root, Some("b"), 0.2).unwrap();
//! let tree = builder.build().unwrap();
//!
//! let patterns = SitePatterns::from_sequences(
//!     &tree,
//!     &[("a", b"ACGT"), ("b", b"ACGA")],
//!     StateCoding::Nucleotide,
//! )
//! .unwrap();
//!
//! let mut model = SubstitutionModel::jc69();
//! let evaluator = ParallelEvaluator::new(EvaluatorConfig::default().with_workers(2)).unwrap();
//! let ll = log_likelihood(&tree, &mut model, &RateCategories::single(), &patterns, &evaluator)
//!     .unwrap();
//! assert!(ll < 0.0);
//! ```

pub mod branch_opt;
pub mod conditionals;
pub mod config;
pub mod empirical;
pub mod linalg;
pub mod model;
pub mod model_selection;
pub mod objective;
pub mod parallel;
pub mod partials;
pub mod patterns;
pub mod pruning;
pub mod rates;
pub mod states;
pub mod tree;

pub use branch_opt::{BranchLengthOptimizer, EdgeDerivatives, EdgeOutcome, OptimizationReport};
pub use conditionals::{AncestralReconstruction, EdgeExpectations, ForwardBackwardConditionals};
pub use config::{Accumulation, EvaluatorConfig, NewtonConfig, PenaltyConfig};
pub use empirical::EmpiricalMatrix;
pub use linalg::Matrix;
pub use model::{
    MappingMatrices, ModelFamily, RateLayout, SubstitutionModel, TransitionCache, TransitionSet,
};
pub use model_selection::{aic, aicc, bic, lrt, model_finder, LrtResult, ModelResult};
pub use objective::{ModelObjective, ParameterLayout};
pub use parallel::{log_likelihood, ParallelEvaluator};
pub use partials::ConditionalCache;
pub use patterns::SitePatterns;
pub use pruning::PruningEngine;
pub use rates::RateCategories;
pub use states::StateCoding;
pub use tree::{Node, NodeId, Tree, TreeBuilder};
