//! Shared primitives for the Sylva phylogenetic likelihood workspace.
//!
//! `sylva-core` provides the foundation the likelihood crates build on:
//!
//! - **Error types** — [`SylvaError`] and [`Result`] for structured error handling
//! - **Log-space probabilities** — [`LogProb`] and [`log_sum_exp`] for underflow-safe sums
//! - **Traits** — [`Summarizable`] for one-line descriptions of domain types

pub mod error;
pub mod prob;
pub mod traits;

pub use error::{Result, SylvaError};
pub use prob::{log_sum_exp, LogProb};
pub use traits::*;
