//! Example: concretization failures and their explanations.
//!
//! Each scenario builds a tiny repository from JSON, attempts to
//! concretize, and prints the error. Unsatisfiable requests carry a
//! minimal set of conflicting constraints.

use std::sync::Arc;

use concretize_resolvo::{Concretizer, InMemoryRepository, RepositoryIndex, SolverConfig};
use tracing_subscriber::EnvFilter;

fn run(title: &str, repo: &str, request: &str) {
    println!("=== {title} ===");
    println!("request: {request}");
    let repo = InMemoryRepository::from_json(repo).unwrap();
    let index = RepositoryIndex::from_repository(&repo).unwrap();
    let concretizer = Concretizer::new(Arc::new(index), SolverConfig::default());
    match concretizer.concretize_str(request) {
        Ok(graph) => println!("solved:\n{graph}"),
        Err(err) => println!("{err}"),
    }
    println!();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    run(
        "conditional conflict",
        r#"[
            {"name": "a", "versions": ["1.0", "2.0"],
             "variants": [{"name": "feature", "default": ["false"], "values": ["true", "false"]}],
             "dependencies": ["b"],
             "conflicts": [{"spec": "^b@3:", "when": "+feature", "message": "b 3 removed the old API"}]},
            {"name": "b", "versions": ["1.5", "2.0", "3.0"]}
        ]"#,
        "a+feature ^b@3.0",
    );

    run(
        "incompatible version ranges",
        r#"[
            {"name": "app", "versions": ["1.0"], "dependencies": ["left", "right"]},
            {"name": "left", "versions": ["1.0"], "dependencies": ["zlib@1.3:"]},
            {"name": "right", "versions": ["1.0"], "dependencies": ["zlib@:1.2"]},
            {"name": "zlib", "versions": ["1.2.13", "1.3.1"]}
        ]"#,
        "app",
    );

    run(
        "static contradiction",
        r#"[{"name": "zlib", "versions": ["1.2.13", "1.3.1"]}]"#,
        "zlib@2:",
    );

    run(
        "unknown dependency",
        r#"[{"name": "app", "versions": ["1.0"], "dependencies": ["libnowhere"]}]"#,
        "app",
    );
}
