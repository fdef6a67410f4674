//! Log-space probability arithmetic for underflow-safe accumulation.
//!
//! [`LogProb`] stores a probability (or any non-negative likelihood factor)
//! as its natural logarithm. Products become sums and sums become
//! log-sum-exp, so long chains of small factors stay representable.

/// A probability stored as its natural logarithm: `ln(p)`.
///
/// Negative infinity represents impossibility (p = 0) and 0.0 certainty.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct LogProb(pub f64);

impl LogProb {
    /// Log of a non-negative factor; zero maps to [`LogProb::impossible`].
    ///
    /// Conditional likelihoods and indicator entries are non-negative but not
    /// necessarily probabilities, so no upper bound is enforced here.
    pub fn from_factor(x: f64) -> Self {
        if x > 0.0 {
            Self(x.ln())
        } else {
            Self::impossible()
        }
    }

    /// Log-sum-exp: `ln(exp(self) + exp(other))` without overflow.
    pub fn ln_add(self, other: Self) -> Self {
        if self.is_impossible() {
            return other;
        }
        if other.is_impossible() {
            return self;
        }
        let (max, min) = if self.0 >= other.0 {
            (self.0, other.0)
        } else {
            (other.0, self.0)
        };
        Self(max + (min - max).exp().ln_1p())
    }

    /// Multiply two probabilities in log-space.
    pub fn ln_mul(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }

    /// Certain event: `ln(1) = 0`.
    pub const fn certain() -> Self {
        Self(0.0)
    }

    /// Impossible event: `ln(0) = -∞`.
    pub const fn impossible() -> Self {
        Self(f64::NEG_INFINITY)
    }

    /// True if this represents probability zero.
    pub fn is_impossible(self) -> bool {
        self.0 == f64::NEG_INFINITY
    }
}

/// `ln(Σ exp(xᵢ))` over a slice, shifting by the maximum.
///
/// Returns negative infinity for an empty slice or when every term is -∞,
/// and NaN when any term is NaN.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    if values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max.is_infinite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}
