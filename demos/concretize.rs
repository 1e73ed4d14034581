//! Example: concretize a small HPC stack.
//!
//! Models hdf5 with an optional MPI dependency, two MPI providers, and a
//! shared zlib, then concretizes the same request with and without `+mpi`
//! to show how a variant pulls in a virtual and its provider.
//!
//! Run with `RUST_LOG=concretize_resolvo=debug` to follow the solver phases.

use std::sync::Arc;

use concretize_resolvo::{
    AbstractSpec, CompilerEntry, CompilerSpec, Concretizer, DependencyDeclaration,
    InMemoryRepository, PackageDefinition, ProvidesDeclaration, RepositoryIndex, SolverConfig,
    VariantDeclaration, Version, VersionDeclaration,
};
use tracing_subscriber::EnvFilter;

fn spec(s: &str) -> AbstractSpec {
    AbstractSpec::parse(s).unwrap()
}

/// Shorthand for a package with plain versions.
fn pkg(name: &str, versions: &[&str]) -> PackageDefinition {
    versions.iter().fold(PackageDefinition::new(name), |p, v| {
        p.with_version(VersionDeclaration::new(Version::parse(v).unwrap()))
    })
}

fn build_repo() -> InMemoryRepository {
    let mut repo = InMemoryRepository::new();

    repo.add(pkg("zlib", &["1.2.13", "1.3.1"]));

    repo.add(
        pkg("hdf5", &["1.12.2", "1.14.3"])
            .with_variant(VariantDeclaration::boolean("mpi", false))
            .with_variant(VariantDeclaration::single("api", "default", &["default", "v18", "v110"]))
            .with_dependency(DependencyDeclaration::new(spec("zlib@1.2:")))
            .with_dependency(DependencyDeclaration::new(spec("mpi")).when(spec("+mpi"))),
    );

    repo.add(
        pkg("openmpi", &["4.1.6", "5.0.3"])
            .with_provides(ProvidesDeclaration::new("mpi").priority(10))
            .with_dependency(DependencyDeclaration::new(spec("zlib"))),
    );
    repo.add(pkg("mpich", &["4.1.2", "4.2.1"]).with_provides(ProvidesDeclaration::new("mpi")));

    repo
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let index = RepositoryIndex::from_repository(&build_repo()).unwrap();
    let config = SolverConfig::default()
        .with_compiler(CompilerEntry::new(CompilerSpec::parse("gcc@12.3.0").unwrap()))
        .with_target("x86_64");
    let concretizer = Concretizer::new(Arc::new(index), config);

    for request in ["hdf5", "hdf5+mpi", "hdf5+mpi ^mpich"] {
        println!("=== {request} ===");
        match concretizer.solve(&spec(request)) {
            Ok(solution) => {
                println!("{}", solution.graph);
                println!(
                    "cost {} after {} decisions",
                    solution.cost, solution.stats.search.nodes
                );
                println!("install order:");
                for id in solution.graph.install_order() {
                    let node = solution.graph.node(id);
                    println!("  {} /{}", node, node.short_hash());
                }
            }
            Err(err) => println!("error: {err}"),
        }
        println!();
    }
}
