//! End-to-end checks across the model, evaluator, cache and optimizer.

use sylva_core::SylvaError;
use sylva_phylo::{
    log_likelihood, Accumulation, BranchLengthOptimizer, ConditionalCache, EvaluatorConfig,
    ForwardBackwardConditionals, NewtonConfig, ParallelEvaluator, RateCategories, SitePatterns,
    StateCoding, SubstitutionModel, Tree, TreeBuilder,
};

fn next(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
    *state >> 33
}

/// ((((t0,t1),t2),t3),...) with `depth` internal levels below the root.
fn caterpillar(depth: usize, seed: u64) -> Tree {
    let mut state = seed;
    let mut b = TreeBuilder::new();
    let mut spine = b.root();
    for i in 0..depth {
        let len = 0.01 + (next(&mut state) % 100) as f64 / 400.0;
        b.add_child(spine, Some(&format!("t{}", i)), len).unwrap();
        spine = b.add_child(spine, None, 0.05).unwrap();
    }
    b.add_child(spine, Some(&format!("t{}", depth)), 0.1).unwrap();
    b.add_child(spine, Some(&format!("t{}", depth + 1)), 0.2).unwrap();
    b.build().unwrap()
}

/// Mutated copies of a random ancestor for every named leaf.
fn alignment(tree: &Tree, len: usize, seed: u64) -> SitePatterns {
    let bases = [b'A', b'C', b'G', b'T'];
    let mut state = seed;
    let ancestor: Vec<u8> = (0..len).map(|_| bases[(next(&mut state) % 4) as usize]).collect();
    let mut owned = Vec::new();
    for &leaf in tree.leaves() {
        let name = tree.node(leaf).unwrap().name.clone().unwrap();
        let seq: Vec<u8> = ancestor
            .iter()
            .map(|&b| match next(&mut state) % 20 {
                0..=2 => bases[(next(&mut state) % 4) as usize],
                3 => b'N',
                _ => b,
            })
            .collect();
        owned.push((name, seq));
    }
    let refs: Vec<(&str, &[u8])> = owned.iter().map(|(n, s)| (n.as_str(), s.as_slice())).collect();
    SitePatterns::from_sequences(tree, &refs, StateCoding::Nucleotide).unwrap()
}

fn gtr() -> SubstitutionModel {
    SubstitutionModel::gtr(&[1.3, 4.1, 0.7, 1.2, 3.6], &[0.31, 0.19, 0.22, 0.28]).unwrap()
}

#[test]
fn worker_count_does_not_change_the_total() {
    let tree = caterpillar(12, 3);
    let patterns = alignment(&tree, 400, 11);
    let rates = RateCategories::gamma_invariant(0.6, 4, 0.1).unwrap();
    let mut model = gtr();
    let set = model.finalize(&tree, &rates).unwrap();

    let reference = ParallelEvaluator::new(EvaluatorConfig::default().with_workers(1))
        .unwrap()
        .evaluate(&tree, &set, &patterns)
        .unwrap();
    for workers in [2, 3, 8] {
        let eval = ParallelEvaluator::new(EvaluatorConfig::default().with_workers(workers)).unwrap();
        for _ in 0..3 {
            let total = eval.evaluate(&tree, &set, &patterns).unwrap();
            assert_eq!(total.to_bits(), reference.to_bits(), "{} workers", workers);
        }
    }
}

#[test]
fn linear_and_log_agree_on_depth_twenty_caterpillar() {
    let tree = caterpillar(20, 5);
    assert!(tree.depth() >= 20);
    let patterns = alignment(&tree, 200, 17);
    let rates = RateCategories::gamma(0.9, 4).unwrap();
    let mut model = gtr();
    let set = model.finalize(&tree, &rates).unwrap();

    let linear = ParallelEvaluator::new(
        EvaluatorConfig::default()
            .with_workers(2)
            .with_accumulation(Accumulation::Linear),
    )
    .unwrap();
    let log = ParallelEvaluator::new(
        EvaluatorConfig::default()
            .with_workers(2)
            .with_accumulation(Accumulation::Log),
    )
    .unwrap();
    let a = linear.site_log_likelihoods(&tree, &set, &patterns).unwrap();
    let b = log.site_log_likelihoods(&tree, &set, &patterns).unwrap();
    for (site, (x, y)) in a.iter().zip(&b).enumerate() {
        assert!(((x - y) / y).abs() <= 1e-6, "site {}: {} vs {}", site, x, y);
    }
}

#[test]
fn independent_paths_agree() {
    let tree = caterpillar(8, 9);
    let patterns = alignment(&tree, 150, 23);
    let rates = RateCategories::gamma(0.4, 4).unwrap();
    let mut model = gtr();
    let eval = ParallelEvaluator::new(EvaluatorConfig::default().with_workers(4)).unwrap();

    let top = log_likelihood(&tree, &mut model, &rates, &patterns, &eval).unwrap();
    let set = model.finalize(&tree, &rates).unwrap();
    let cached = ConditionalCache::build(&tree, &set, &patterns)
        .unwrap()
        .log_likelihood(&tree, &set, &patterns);
    let fb = ForwardBackwardConditionals::compute(&tree, &set, &patterns).unwrap();
    let leaf = tree.leaves()[0];
    let at_leaf: f64 = (0..patterns.n_patterns())
        .map(|p| patterns.weights()[p] * fb.site_log_likelihood_at(&set, leaf, p))
        .sum();

    assert!((top - cached).abs() < 1e-7, "{} vs {}", top, cached);
    assert!((top - at_leaf).abs() < 1e-7, "{} vs {}", top, at_leaf);
}

#[test]
fn newton_raphson_never_decreases_the_likelihood() {
    let mut tree = caterpillar(10, 21);
    let patterns = alignment(&tree, 300, 29);
    let rates = RateCategories::gamma(0.7, 4).unwrap();
    let mut model = gtr();
    let eval = ParallelEvaluator::new(EvaluatorConfig::default().with_workers(2)).unwrap();

    let before = log_likelihood(&tree, &mut model, &rates, &patterns, &eval).unwrap();
    let report = {
        let mut opt = BranchLengthOptimizer::new(
            &mut tree,
            &mut model,
            &rates,
            &patterns,
            NewtonConfig::default(),
        )
        .unwrap();
        opt.run().unwrap()
    };
    let after = log_likelihood(&tree, &mut model, &rates, &patterns, &eval).unwrap();

    assert!((report.initial_log_likelihood - before).abs() < 1e-7);
    assert!((report.final_log_likelihood - after).abs() < 1e-7);
    assert!(after >= before - 1e-9);
    let mut previous = report.initial_log_likelihood;
    for &ll in &report.pass_log_likelihoods {
        assert!(ll >= previous - 1e-9);
        previous = ll;
    }
    for edge in tree.edges() {
        let len = tree.branch_length(edge);
        assert!((1e-8..=100.0).contains(&len), "edge {} length {}", edge, len);
    }
}

#[test]
fn wrong_parameter_count_leaves_model_untouched() {
    let tree = caterpillar(4, 1);
    let mut model = gtr();
    model.decompose().unwrap();
    let rates = RateCategories::single();
    model.finalize(&tree, &rates).unwrap();

    let q = model.rate_matrix().clone();
    let params = model.rate_parameters().to_vec();
    let freqs = model.frequencies().to_vec();
    let memo = model.cache().len();

    let err = model.set_rate_parameters(&[1.0, 2.0, 3.0]);
    assert!(matches!(
        err,
        Err(SylvaError::InvalidParameterCount { expected: 5, got: 3, .. })
    ));
    let err = model.set_base_frequencies(&[0.5, 0.5]);
    assert!(matches!(err, Err(SylvaError::InvalidParameterCount { .. })));

    assert_eq!(model.rate_matrix(), &q);
    assert_eq!(model.rate_parameters(), params.as_slice());
    assert_eq!(model.frequencies(), freqs.as_slice());
    assert_eq!(model.cache().len(), memo);
    assert!(model.is_decomposed());
}

#[test]
fn posteriors_and_mapping_on_a_larger_tree() {
    let tree = caterpillar(6, 13);
    let patterns = alignment(&tree, 60, 31);
    let rates = RateCategories::gamma(1.5, 3).unwrap();
    let mut model = gtr();
    model.decompose().unwrap();
    let set = model.finalize(&tree, &rates).unwrap();
    let fb = ForwardBackwardConditionals::compute(&tree, &set, &patterns).unwrap();

    let rec = fb.ancestral_reconstruction(&tree, &set);
    for node in 0..tree.node_count() {
        for p in 0..patterns.n_patterns() {
            let sum: f64 = rec.posteriors[node][p].iter().sum();
            assert!((sum - 1.0).abs() < 1e-10);
            assert!(rec.map_states[node][p] < 4);
        }
    }

    let edge = tree.edges().next().unwrap();
    let mut dwell = 0.0;
    for from in 0..4 {
        let e = fb
            .expected_substitutions(&tree, &set, &model, edge, from, (from + 2) % 4)
            .unwrap();
        dwell += e.total_dwell;
        assert!(e.total_counts >= 0.0);
    }
    let expected = tree.branch_length(edge) * patterns.total_weight();
    assert!((dwell - expected).abs() < 1e-8 * expected.max(1.0));
}
