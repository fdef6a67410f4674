use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sylva_phylo::{
    BranchLengthOptimizer, EvaluatorConfig, ForwardBackwardConditionals, NewtonConfig,
    ParallelEvaluator, RateCategories, SitePatterns, StateCoding, SubstitutionModel, Tree,
    TreeBuilder,
};

fn next(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
    *state >> 33
}

/// Balanced tree over `n_taxa` leaves named t0, t1, ...
fn balanced_tree(n_taxa: usize) -> Tree {
    let mut b = TreeBuilder::new();
    let mut state: u64 = 7;
    let mut next_leaf = 0;
    let mut stack = vec![(b.root(), n_taxa)];
    while let Some((parent, size)) = stack.pop() {
        for part in [size / 2, size - size / 2] {
            let len = 0.02 + (next(&mut state) % 100) as f64 / 500.0;
            if part == 1 {
                let name = format!("t{}", next_leaf);
                next_leaf += 1;
                b.add_child(parent, Some(&name), len).unwrap();
            } else {
                let child = b.add_child(parent, None, len).unwrap();
                stack.push((child, part));
            }
        }
    }
    b.build().unwrap()
}

fn random_alignment(n_taxa: usize, len: usize) -> Vec<(String, Vec<u8>)> {
    let bases = [b'A', b'C', b'G', b'T'];
    let mut state: u64 = 42;
    let ancestor: Vec<u8> = (0..len).map(|_| bases[(next(&mut state) % 4) as usize]).collect();
    (0..n_taxa)
        .map(|i| {
            let seq = ancestor
                .iter()
                .map(|&b| {
                    if next(&mut state) % 10 == 0 {
                        bases[(next(&mut state) % 4) as usize]
                    } else {
                        b
                    }
                })
                .collect();
            (format!("t{}", i), seq)
        })
        .collect()
}

fn fixture(n_taxa: usize, len: usize) -> (Tree, SitePatterns) {
    let tree = balanced_tree(n_taxa);
    let alignment = random_alignment(n_taxa, len);
    let refs: Vec<(&str, &[u8])> = alignment
        .iter()
        .map(|(n, s)| (n.as_str(), s.as_slice()))
        .collect();
    let patterns = SitePatterns::from_sequences(&tree, &refs, StateCoding::Nucleotide).unwrap();
    (tree, patterns)
}

fn bench_evaluate(c: &mut Criterion) {
    let (tree, patterns) = fixture(32, 1000);
    let rates = RateCategories::gamma(0.5, 4).unwrap();
    let mut model =
        SubstitutionModel::gtr(&[1.2, 3.4, 0.8, 1.1, 4.0], &[0.3, 0.2, 0.2, 0.3]).unwrap();
    let set = model.finalize(&tree, &rates).unwrap();

    let mut group = c.benchmark_group("evaluate");
    for &workers in &[1, 4] {
        let eval = ParallelEvaluator::new(EvaluatorConfig::default().with_workers(workers)).unwrap();
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, _| {
            b.iter(|| eval.evaluate(black_box(&tree), &set, &patterns).unwrap())
        });
    }
    group.finish();
}

fn bench_transition(c: &mut Criterion) {
    let mut group = c.benchmark_group("transition");
    group.bench_function("gtr_expm", |b| {
        let model =
            SubstitutionModel::gtr(&[1.2, 3.4, 0.8, 1.1, 4.0], &[0.3, 0.2, 0.2, 0.3]).unwrap();
        b.iter(|| model.compute_transition(black_box(0.137)).unwrap())
    });
    group.bench_function("lg_expm", |b| {
        let model = SubstitutionModel::lg();
        b.iter(|| model.compute_transition(black_box(0.137)).unwrap())
    });
    group.finish();
}

fn bench_conditionals(c: &mut Criterion) {
    let (tree, patterns) = fixture(32, 300);
    let rates = RateCategories::gamma(0.5, 4).unwrap();
    let mut model = SubstitutionModel::hky85(2.0, &[0.25; 4]).unwrap();
    let set = model.finalize(&tree, &rates).unwrap();
    c.bench_function("forward_backward", |b| {
        b.iter(|| ForwardBackwardConditionals::compute(black_box(&tree), &set, &patterns).unwrap())
    });
}

fn bench_branch_lengths(c: &mut Criterion) {
    let (tree, patterns) = fixture(16, 300);
    let rates = RateCategories::single();
    c.bench_function("newton_one_pass", |b| {
        b.iter(|| {
            let mut tree = tree.clone();
            let mut model = SubstitutionModel::hky85(2.0, &[0.25; 4]).unwrap();
            let mut opt = BranchLengthOptimizer::new(
                &mut tree,
                &mut model,
                &rates,
                &patterns,
                NewtonConfig::default().with_passes(1),
            )
            .unwrap();
            opt.run().unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_evaluate,
    bench_transition,
    bench_conditionals,
    bench_branch_lengths
);
criterion_main!(benches);
