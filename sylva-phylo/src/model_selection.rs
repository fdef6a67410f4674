//! Information-theoretic model selection: AIC, BIC, AICc, LRT and a small
//! candidate ranking.

use sylva_core::Result;

use crate::model::SubstitutionModel;
use crate::parallel::{log_likelihood, ParallelEvaluator};
use crate::patterns::SitePatterns;
use crate::rates::{regularized_gamma_p, RateCategories};
use crate::tree::Tree;

/// Results for a single model evaluation.
#[derive(Debug, Clone)]
pub struct ModelResult {
    pub name: String,
    pub log_likelihood: f64,
    pub n_params: usize,
    pub n_sites: usize,
    pub aic: f64,
    pub bic: f64,
    pub aicc: f64,
}

/// Candidates ranked by AIC.
#[derive(Debug, Clone)]
pub struct ModelSelectionResult {
    pub models: Vec<ModelResult>,
    pub best_aic: String,
    pub best_bic: String,
}

/// Result of a likelihood ratio test.
#[derive(Debug, Clone)]
pub struct LrtResult {
    pub stat: f64,
    pub df: usize,
    pub p_value: f64,
    pub reject: bool,
}

/// AIC = -2 ln(L) + 2k
pub fn aic(log_likelihood: f64, n_params: usize) -> f64 {
    -2.0 * log_likelihood + 2.0 * n_params as f64
}

/// BIC = -2 ln(L) + k ln(n)
pub fn bic(log_likelihood: f64, n_params: usize, n_sites: usize) -> f64 {
    -2.0 * log_likelihood + n_params as f64 * (n_sites as f64).ln()
}

/// AICc = AIC + 2k(k+1)/(n-k-1), infinite when n ≤ k + 1.
pub fn aicc(log_likelihood: f64, n_params: usize, n_sites: usize) -> f64 {
    let k = n_params as f64;
    let n = n_sites as f64;
    let base = aic(log_likelihood, n_params);
    if n > k + 1.0 {
        base + 2.0 * k * (k + 1.0) / (n - k - 1.0)
    } else {
        f64::INFINITY
    }
}

/// Likelihood ratio test between nested models at the 5% level.
///
/// `df` is the difference in free parameters.
pub fn lrt(ll_null: f64, ll_alt: f64, df: usize) -> LrtResult {
    let stat = (2.0 * (ll_alt - ll_null)).max(0.0);
    let p_value = 1.0 - chi2_cdf(stat, df);
    LrtResult {
        stat,
        df,
        p_value,
        reject: p_value < 0.05,
    }
}

/// Free parameters of a fitted model on `tree`: model and rate-category
/// parameters plus one per unrooted branch.
pub fn free_parameters(tree: &Tree, model: &SubstitutionModel, rates: &RateCategories) -> usize {
    let n_taxa = tree.leaf_count();
    let n_branches = if n_taxa > 2 { 2 * n_taxa - 3 } else { 1 };
    model.n_free_params() + rates.n_free_params() + n_branches
}

/// Evaluate every candidate on the same tree and patterns and rank them.
pub fn model_finder(
    tree: &Tree,
    patterns: &SitePatterns,
    candidates: &mut [(&str, SubstitutionModel)],
    rates: &RateCategories,
    evaluator: &ParallelEvaluator,
) -> Result<ModelSelectionResult> {
    let n_sites = patterns.total_weight().round() as usize;
    let mut results = Vec::with_capacity(candidates.len());
    for (name, model) in candidates.iter_mut() {
        let ll = log_likelihood(tree, model, rates, patterns, evaluator)?;
        let k = free_parameters(tree, model, rates);
        results.push(ModelResult {
            name: name.to_string(),
            log_likelihood: ll,
            n_params: k,
            n_sites,
            aic: aic(ll, k),
            bic: bic(ll, k, n_sites),
            aicc: aicc(ll, k, n_sites),
        });
    }

    results.sort_by(|a, b| a.aic.partial_cmp(&b.aic).unwrap_or(std::cmp::Ordering::Equal));
    let best_aic = results
        .first()
        .map(|r| r.name.clone())
        .unwrap_or_default();
    let best_bic = results
        .iter()
        .min_by(|a, b| a.bic.partial_cmp(&b.bic).unwrap_or(std::cmp::Ordering::Equal))
        .map(|r| r.name.clone())
        .unwrap_or_default();

    Ok(ModelSelectionResult {
        models: results,
        best_aic,
        best_bic,
    })
}

/// P(X ≤ x) for X ~ χ²(df).
fn chi2_cdf(x: f64, df: usize) -> f64 {
    if df == 0 || x <= 0.0 {
        return 0.0;
    }
    regularized_gamma_p(df as f64 / 2.0, x / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvaluatorConfig;
    use crate::states::StateCoding;
    use crate::tree::TreeBuilder;

    #[test]
    fn aic_known_values() {
        assert!((aic(-100.0, 5) - 210.0).abs() < 1e-10);
        assert!((aic(-50.0, 2) - 104.0).abs() < 1e-10);
    }

    #[test]
    fn bic_known_values() {
        // 200 + 5 ln(100)
        let val = bic(-100.0, 5, 100);
        assert!((val - 223.0259).abs() < 0.01);
    }

    #[test]
    fn aicc_converges_to_aic_for_large_n() {
        let aic_val = aic(-100.0, 3);
        let aicc_val = aicc(-100.0, 3, 10000);
        assert!((aic_val - aicc_val).abs() < 0.01, "{} vs {}", aicc_val, aic_val);
        assert_eq!(aicc(-100.0, 5, 6), f64::INFINITY);
    }

    #[test]
    fn lrt_one_degree_critical_value() {
        // χ²(1) at 3.841 has upper tail 0.05.
        let result = lrt(-100.0, -100.0 + 3.841_458_8 / 2.0, 1);
        assert!((result.p_value - 0.05).abs() < 1e-4, "p = {}", result.p_value);
    }

    #[test]
    fn lrt_bounds_and_significance() {
        let same = lrt(-100.0, -100.0, 1);
        assert!(same.p_value > 0.9);
        assert!(!same.reject);
        let big = lrt(-200.0, -100.0, 1);
        assert!(big.reject);
        assert!(big.p_value < 0.001);
    }

    #[test]
    fn model_finder_prefers_jc69_on_uniform_data() {
        let mut b = TreeBuilder::new();
        let ab = b.add_child(0, None, 0.1).unwrap();
        let cd = b.add_child(0, None, 0.1).unwrap();
        b.add_child(ab, Some("A"), 0.1).unwrap();
        b.add_child(ab, Some("B"), 0.1).unwrap();
        b.add_child(cd, Some("C"), 0.1).unwrap();
        b.add_child(cd, Some("D"), 0.1).unwrap();
        let tree = b.build().unwrap();
        let pats = SitePatterns::from_sequences(
            &tree,
            &[
                ("A", b"ACGTACGTACGT"),
                ("B", b"ACGTACGTACGT"),
                ("C", b"TGCATGCATGCA"),
                ("D", b"TGCATGCATGCA"),
            ],
            StateCoding::Nucleotide,
        )
        .unwrap();
        let eval = ParallelEvaluator::new(EvaluatorConfig::default().with_workers(1)).unwrap();
        let mut candidates = vec![
            ("JC69", SubstitutionModel::jc69()),
            ("HKY85", SubstitutionModel::hky85(2.0, &[0.25; 4]).unwrap()),
        ];
        let result =
            model_finder(&tree, &pats, &mut candidates, &RateCategories::single(), &eval).unwrap();
        assert_eq!(result.models.len(), 2);
        assert_eq!(result.best_bic, "JC69");
        for m in &result.models {
            assert!(m.log_likelihood.is_finite());
            assert_eq!(m.n_sites, 12);
        }
        // Five branches; HKY85 adds κ and three frequencies.
        let k = |name: &str| result.models.iter().find(|m| m.name == name).unwrap().n_params;
        assert_eq!(k("JC69"), 5);
        assert_eq!(k("HKY85"), 9);
    }
}
