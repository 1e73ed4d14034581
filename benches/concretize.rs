use std::hint::black_box;
use std::sync::Arc;

use concretize_resolvo::{AbstractSpec, Concretizer, InMemoryRepository, RepositoryIndex, SolverConfig};
use criterion::{Criterion, criterion_group, criterion_main};

/// A layered repository: every package depends on the package below it
/// and caps the next column of that layer, each with a few versions.
fn layered_repo(layers: usize, width: usize) -> String {
    let mut packages = Vec::new();
    for layer in 0..layers {
        for i in 0..width {
            let mut deps: Vec<String> = Vec::new();
            if layer + 1 < layers {
                deps.push(format!("\"p{}_{}\"", layer + 1, i));
                if i + 1 < width {
                    deps.push(format!("\"p{}_{}@:2\"", layer + 1, i + 1));
                }
            }
            packages.push(format!(
                r#"{{"name": "p{layer}_{i}", "versions": ["1.0", "2.0", "3.0"], "dependencies": [{}]}}"#,
                deps.join(", ")
            ));
        }
    }
    format!("[{}]", packages.join(",\n"))
}

fn bench_concretize(c: &mut Criterion) {
    let repo = InMemoryRepository::from_json(&layered_repo(8, 8)).unwrap();
    let index = Arc::new(RepositoryIndex::from_repository(&repo).unwrap());
    let concretizer = Concretizer::new(index, SolverConfig::default());
    let request = AbstractSpec::parse("p0_0").unwrap();

    c.bench_function("concretize layered 8x8", |b| {
        b.iter(|| concretizer.concretize(black_box(&request)).unwrap())
    });

    let requests: Vec<AbstractSpec> = (0..4)
        .map(|i| AbstractSpec::parse(&format!("p0_{i}")).unwrap())
        .collect();
    c.bench_function("concretize_all layered 8x8", |b| {
        b.iter(|| concretizer.concretize_all(black_box(&requests)))
    });
}

criterion_group!(benches, bench_concretize);
criterion_main!(benches);
