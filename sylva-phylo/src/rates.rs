//! Among-site rate heterogeneity.
//!
//! A site's likelihood is the weight-averaged likelihood over a small set of
//! rate multipliers. Multipliers always have weighted mean 1 so branch
//! lengths keep their substitutions-per-site meaning.

use sylva_core::{Result, Summarizable, SylvaError};

/// Discrete rate categories: multipliers and their prior weights.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateCategories {
    rates: Vec<f64>,
    weights: Vec<f64>,
    alpha: Option<f64>,
    invariant: f64,
}

impl RateCategories {
    /// Every site evolves at rate 1.
    pub fn single() -> Self {
        Self {
            rates: vec![1.0],
            weights: vec![1.0],
            alpha: None,
            invariant: 0.0,
        }
    }

    /// Discrete Γ(α) with `n_categories` equiprobable classes, each
    /// represented by its conditional mean (Yang 1994).
    pub fn gamma(alpha: f64, n_categories: usize) -> Result<Self> {
        if !alpha.is_finite() || alpha <= 0.0 {
            return Err(SylvaError::InvalidInput(format!(
                "gamma shape must be positive and finite, got {}",
                alpha
            )));
        }
        if n_categories == 0 {
            return Err(SylvaError::InvalidInput(
                "at least one rate category is required".into(),
            ));
        }
        Ok(Self {
            rates: gamma_category_means(alpha, n_categories),
            weights: vec![1.0 / n_categories as f64; n_categories],
            alpha: Some(alpha),
            invariant: 0.0,
        })
    }

    /// A proportion of invariable sites on top of a single rate.
    pub fn invariant(proportion: f64) -> Result<Self> {
        Self::single().add_invariant(proportion)
    }

    /// Discrete Γ plus a proportion of invariable sites.
    pub fn gamma_invariant(alpha: f64, n_categories: usize, proportion: f64) -> Result<Self> {
        Self::gamma(alpha, n_categories)?.add_invariant(proportion)
    }

    fn add_invariant(mut self, proportion: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&proportion) {
            return Err(SylvaError::InvalidInput(format!(
                "proportion of invariable sites must lie in [0, 1), got {}",
                proportion
            )));
        }
        if proportion == 0.0 {
            return Ok(self);
        }
        let keep = 1.0 - proportion;
        let mut rates = Vec::with_capacity(self.rates.len() + 1);
        let mut weights = Vec::with_capacity(self.weights.len() + 1);
        rates.push(0.0);
        weights.push(proportion);
        rates.extend(self.rates.iter().map(|&r| r / keep));
        weights.extend(self.weights.iter().map(|&w| w * keep));
        self.rates = rates;
        self.weights = weights;
        self.invariant = proportion;
        Ok(self)
    }

    /// Number of categories, including the invariable class if present.
    pub fn n_categories(&self) -> usize {
        self.rates.len()
    }

    /// Rate multipliers.
    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    /// Prior category weights; they sum to 1.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Gamma shape, if the categories are gamma-distributed.
    pub fn alpha(&self) -> Option<f64> {
        self.alpha
    }

    /// Proportion of invariable sites.
    pub fn proportion_invariant(&self) -> f64 {
        self.invariant
    }

    /// Number of free parameters (shape and invariable proportion).
    pub fn n_free_params(&self) -> usize {
        usize::from(self.alpha.is_some()) + usize::from(self.invariant > 0.0)
    }

    /// Weighted mean rate.
    pub fn mean_rate(&self) -> f64 {
        self.rates.iter().zip(&self.weights).map(|(r, w)| r * w).sum()
    }
}

impl Default for RateCategories {
    fn default() -> Self {
        Self::single()
    }
}

impl Summarizable for RateCategories {
    fn summary(&self) -> String {
        match (self.alpha, self.invariant > 0.0) {
            (None, false) => "single rate".to_string(),
            (None, true) => format!("+I (p={:.4})", self.invariant),
            (Some(a), false) => format!("+G{} (alpha={:.4})", self.n_categories(), a),
            (Some(a), true) => format!(
                "+G{}+I (alpha={:.4}, p={:.4})",
                self.n_categories() - 1,
                a,
                self.invariant
            ),
        }
    }
}

/// Conditional means of the `k` equiprobable classes of Γ(α, rate α).
fn gamma_category_means(alpha: f64, k: usize) -> Vec<f64> {
    if k == 1 {
        return vec![1.0];
    }
    // Cut points on the Γ(α, 1) scale; the mean of a class is
    // k · [P(α+1, upper) − P(α+1, lower)].
    let cuts: Vec<f64> = (1..k)
        .map(|i| gamma_quantile(alpha, i as f64 / k as f64))
        .collect();
    let mut means = Vec::with_capacity(k);
    let mut lower = 0.0;
    for i in 0..k {
        let upper = if i + 1 < k {
            regularized_gamma_p(alpha + 1.0, cuts[i])
        } else {
            1.0
        };
        means.push(k as f64 * (upper - lower));
        lower = upper;
    }
    let mean: f64 = means.iter().sum::<f64>() / k as f64;
    if mean > 0.0 {
        for m in &mut means {
            *m /= mean;
        }
    }
    means
}

/// `x` with P(α, x) = p, by bisection.
fn gamma_quantile(alpha: f64, p: f64) -> f64 {
    let mut lo = 0.0;
    let mut hi = alpha.max(1.0);
    while regularized_gamma_p(alpha, hi) < p {
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if regularized_gamma_p(alpha, mid) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-15 * hi {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Natural log of the gamma function via the Lanczos approximation (g=7).
pub(crate) fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    use std::f64::consts::PI;

    if x < 0.5 {
        (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = 0.99999999999980993_f64;
        for (i, &c) in COEFFS.iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5;
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

/// Regularized lower incomplete gamma function P(a, x) = γ(a, x) / Γ(a).
///
/// Series expansion when x < a + 1, otherwise the continued fraction for
/// the upper tail (modified Lentz).
pub(crate) fn regularized_gamma_p(a: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 1e-15;
    const TINY: f64 = 1e-300;

    if x <= 0.0 {
        return 0.0;
    }
    let ln_prefix = a * x.ln() - x - ln_gamma(a);

    if x < a + 1.0 {
        let mut term = 1.0 / a;
        let mut sum = term;
        for n in 1..=MAX_ITER {
            term *= x / (a + n as f64);
            sum += term;
            if term.abs() < sum.abs() * EPS {
                break;
            }
        }
        return (sum * ln_prefix.exp()).min(1.0);
    }

    let mut b = x + 1.0 - a;
    let mut c = 1.0 / TINY;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=MAX_ITER {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < TINY {
            d = TINY;
        }
        c = b + an / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    (1.0 - h * ln_prefix.exp()).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_rates(actual: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < tol, "rate {} vs expected {}", a, e);
        }
    }

    #[test]
    fn single_rate() {
        let r = RateCategories::single();
        assert_eq!(r.rates(), &[1.0]);
        assert_eq!(r.weights(), &[1.0]);
        assert_eq!(r.n_free_params(), 0);
    }

    #[test]
    fn gamma_half_four_categories() {
        let r = RateCategories::gamma(0.5, 4).unwrap();
        assert_rates(r.rates(), &[0.033388, 0.251916, 0.820268, 2.894428], 1e-5);
        assert!((r.mean_rate() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn gamma_one_four_categories() {
        // α = 1 is the exponential; the third class mean is exactly 1.
        let r = RateCategories::gamma(1.0, 4).unwrap();
        assert_rates(r.rates(), &[0.136954, 0.476752, 1.0, 2.386294], 1e-5);
    }

    #[test]
    fn gamma_large_alpha_is_nearly_uniform() {
        let r = RateCategories::gamma(500.0, 4).unwrap();
        for &rate in r.rates() {
            assert!((rate - 1.0).abs() < 0.1, "rate {}", rate);
        }
    }

    #[test]
    fn gamma_rates_increase() {
        let r = RateCategories::gamma(0.3, 8).unwrap();
        for w in r.rates().windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn invariant_keeps_mean_one() {
        let r = RateCategories::gamma_invariant(0.8, 4, 0.2).unwrap();
        assert_eq!(r.n_categories(), 5);
        assert_eq!(r.rates()[0], 0.0);
        assert!((r.weights()[0] - 0.2).abs() < 1e-15);
        assert!((r.weights().iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((r.mean_rate() - 1.0).abs() < 1e-12);
        assert_eq!(r.n_free_params(), 2);
    }

    #[test]
    fn invariant_zero_is_identity() {
        let r = RateCategories::invariant(0.0).unwrap();
        assert_eq!(r, RateCategories::single());
    }

    #[test]
    fn invalid_parameters() {
        assert!(RateCategories::gamma(0.0, 4).is_err());
        assert!(RateCategories::gamma(f64::NAN, 4).is_err());
        assert!(RateCategories::gamma(1.0, 0).is_err());
        assert!(RateCategories::invariant(1.0).is_err());
        assert!(RateCategories::invariant(-0.1).is_err());
    }

    #[test]
    fn regularized_gamma_exponential() {
        // P(1, x) = 1 − e^{−x}
        for &x in &[0.1f64, 1.0, 3.0, 10.0] {
            let expected: f64 = 1.0 - (-x).exp();
            assert!((regularized_gamma_p(1.0, x) - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn ln_gamma_integers() {
        assert!(ln_gamma(1.0).abs() < 1e-12);
        assert!((ln_gamma(5.0) - 24f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn summary_mentions_shape() {
        let r = RateCategories::gamma(0.5, 4).unwrap();
        assert!(r.summary().contains("+G4"));
    }
}
