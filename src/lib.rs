//! Dependency concretization for source-built package graphs, on top of the
//! [`resolvo`] solver.
//!
//! An abstract request such as `hdf5@1.12: +mpi %gcc ^zlib@1.3:` is turned
//! into a fully concrete, hashed spec graph: one version, variant
//! assignment, compiler and target per package, with every virtual bound
//! to a single provider. resolvo decides satisfiability and supplies the
//! first model; a branch-and-bound search then picks the best model under
//! the configured criteria. When no model exists the error carries a
//! minimal set of conflicting constraints.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use concretize_resolvo::{Concretizer, InMemoryRepository, RepositoryIndex, SolverConfig};
//!
//! let repo = InMemoryRepository::from_json(
//!     r#"[{"name": "zlib", "versions": ["1.2.13", "1.3.1"]}]"#,
//! )?;
//! let index = Arc::new(RepositoryIndex::from_repository(&repo)?);
//! let graph = Concretizer::new(index, SolverConfig::default()).concretize_str("zlib")?;
//! println!("{graph}");
//! # Ok::<(), concretize_resolvo::ConcretizeError>(())
//! ```

mod config;
mod criteria;
mod error;
mod explain;
mod facts;
mod graph;
mod model;
mod package;
mod pool;
mod provider;
mod repository;
mod search;
mod solver;
mod spec;
mod version;

pub use config::{
    CompilerEntry, DeprecatedPolicy, ExplainConfig, ExternalEntry, PackagePreferences, SolverConfig,
};
pub use criteria::{Cost, Criterion};
pub use error::{ConcretizeError, SpecParseError, VersionParseError};
pub use explain::Explanation;
pub use graph::{ConcreteSpec, Dependency, NodeId, SpecGraph};
pub use pool::Origin;
pub use package::{
    ConflictDeclaration, DepType, DepTypes, DependencyDeclaration, PackageDefinition,
    ProvidesDeclaration, VariantDeclaration, VersionDeclaration,
};
pub use repository::{InMemoryRepository, Lookup, PackageRepository, RepositoryIndex};
pub use search::SearchStats;
pub use solver::{Concretizer, Phase, SolveStats, Solution};
pub use spec::{AbstractSpec, CompilerConstraint, CompilerSpec};
pub use version::{Version, VersionList, VersionRange, compare, intersect, satisfies};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn concretizer(json: &str, config: SolverConfig) -> Concretizer {
        let repo = InMemoryRepository::from_json(json).unwrap();
        let index = RepositoryIndex::from_repository(&repo).unwrap();
        Concretizer::new(Arc::new(index), config)
    }

    fn version_of(graph: &SpecGraph, name: &str) -> String {
        graph.find(name).unwrap().version.to_string()
    }

    const BASIC: &str = r#"[
        {"name": "a", "versions": ["1.0", "2.0"],
         "variants": [{"name": "feature", "default": ["false"], "values": ["true", "false"]}],
         "dependencies": ["b"],
         "conflicts": [{"spec": "^b@3:", "when": "+feature", "message": "b 3 removed the old API"}]},
        {"name": "b", "versions": ["1.0", "1.5", "2.0", "3.0"]}
    ]"#;

    const MPI: &str = r#"[
        {"name": "app", "versions": ["1.0"], "dependencies": ["mpi", "zlib"]},
        {"name": "mpich", "versions": ["4.1", "4.2"], "provides": ["mpi"]},
        {"name": "openmpi", "versions": ["5.0"], "provides": [{"virtual": "mpi", "priority": 10}],
         "dependencies": ["zlib"]},
        {"name": "zlib", "versions": ["1.2.13", "1.3.1"]}
    ]"#;

    const DIAMOND: &str = r#"[
        {"name": "app", "versions": ["1.0"], "dependencies": ["left", "right"]},
        {"name": "left", "versions": ["1.0"], "dependencies": ["zlib@1.2:"]},
        {"name": "right", "versions": ["1.0"], "dependencies": ["zlib@:1.2"]},
        {"name": "zlib", "versions": ["1.1", "1.2.11", "1.2.13", "1.3.1"]}
    ]"#;

    #[test]
    fn picks_newest_satisfying_versions() {
        let c = concretizer(BASIC, SolverConfig::default());
        let graph = c.concretize_str("a@2.0 ^b@1.5").unwrap();
        assert_eq!(version_of(&graph, "a"), "2.0");
        assert_eq!(version_of(&graph, "b"), "1.5");

        let graph = c.concretize_str("a").unwrap();
        assert_eq!(version_of(&graph, "a"), "2.0");
        assert_eq!(version_of(&graph, "b"), "3.0");
        assert_eq!(graph.root_spec().variants["feature"].len(), 1);
        assert!(graph.root_spec().variants["feature"].contains("false"));
    }

    #[test]
    fn enabling_a_variant_steers_dependencies() {
        let c = concretizer(BASIC, SolverConfig::default());
        let graph = c.concretize_str("a+feature").unwrap();
        assert_eq!(version_of(&graph, "b"), "2.0");
    }

    #[test]
    fn conflict_is_explained() {
        let c = concretizer(BASIC, SolverConfig::default());
        let err = c.concretize_str("a+feature ^b@3.0").unwrap_err();
        let explanation = err.explanation().unwrap();
        assert!(explanation.minimal);
        assert!(
            explanation
                .core
                .iter()
                .any(|clause| clause.contains("a conflicts with '^b@3:'")),
            "{explanation}"
        );
        assert!(err.to_string().contains("b 3 removed the old API"));
    }

    #[test]
    fn unknown_package_names_the_depender() {
        let c = concretizer(
            r#"[{"name": "a", "versions": ["1.0"], "dependencies": ["missing"]}]"#,
            SolverConfig::default(),
        );
        match c.concretize_str("a") {
            Err(ConcretizeError::UnknownPackage { name, needed_by }) => {
                assert_eq!(name, "missing");
                assert_eq!(needed_by.as_deref(), Some("a"));
            }
            other => panic!("expected an unknown package, got {other:?}"),
        }
    }

    #[test]
    fn virtual_resolves_to_highest_priority_provider() {
        let c = concretizer(MPI, SolverConfig::default());
        let graph = c.concretize_str("app").unwrap();
        assert!(graph.find("openmpi").is_some());
        assert!(graph.find("mpich").is_none());
        let app = graph.root_spec();
        let edge = app
            .dependencies
            .iter()
            .find(|d| graph.node(d.node).name == "openmpi")
            .unwrap();
        assert_eq!(edge.virtuals, vec!["mpi".to_string()]);
    }

    #[test]
    fn configured_provider_overrides_priority() {
        let config = SolverConfig::default().with_provider_preference("mpi", &["mpich"]);
        let c = concretizer(MPI, config);
        let graph = c.concretize_str("app").unwrap();
        assert_eq!(version_of(&graph, "mpich"), "4.2");
        assert!(graph.find("openmpi").is_none());
    }

    #[test]
    fn requested_provider_is_used() {
        let c = concretizer(MPI, SolverConfig::default());
        let graph = c.concretize_str("app ^mpich@4.1").unwrap();
        assert_eq!(version_of(&graph, "mpich"), "4.1");
    }

    #[test]
    fn diamond_shares_one_node() {
        let c = concretizer(DIAMOND, SolverConfig::default());
        let graph = c.concretize_str("app").unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(version_of(&graph, "zlib"), "1.2.13");
    }

    #[test]
    fn compilers_follow_the_root() {
        let config = SolverConfig::from_toml_str(
            r#"
            targets = ["x86_64_v3", "x86_64"]

            [[compilers]]
            spec = "gcc@12.3.0"

            [[compilers]]
            spec = "clang@17.0.6"
            "#,
        )
        .unwrap();
        let c = concretizer(MPI, config);

        let graph = c.concretize_str("app").unwrap();
        for (_, node) in graph.nodes() {
            assert_eq!(node.compiler.as_ref().unwrap().name, "gcc");
            assert_eq!(node.target.as_deref(), Some("x86_64_v3"));
        }

        let graph = c.concretize_str("app %clang").unwrap();
        for (_, node) in graph.nodes() {
            assert_eq!(node.compiler.as_ref().unwrap().name, "clang", "{}", node.name);
        }
    }

    #[test]
    fn concretization_is_idempotent() {
        let c = concretizer(MPI, SolverConfig::default());
        let graph = c.concretize_str("app").unwrap();
        let again = c.concretize(&graph.to_request()).unwrap();
        assert_eq!(graph, again);
        assert_eq!(graph.root_spec().hash(), again.root_spec().hash());
    }

    #[test]
    fn result_satisfies_the_request() {
        let c = concretizer(BASIC, SolverConfig::default());
        let request = AbstractSpec::parse("a+feature ^b@1:").unwrap();
        let graph = c.concretize(&request).unwrap();
        assert!(graph.satisfies(&request));
        assert!(!graph.satisfies(&AbstractSpec::parse("a~feature").unwrap()));
    }

    #[test]
    fn hashes_are_deterministic() {
        let first = concretizer(DIAMOND, SolverConfig::default())
            .concretize_str("app")
            .unwrap();
        let second = concretizer(DIAMOND, SolverConfig::default())
            .concretize_str("app")
            .unwrap();
        let hashes = |g: &SpecGraph| -> Vec<String> {
            g.nodes().map(|(_, n)| n.hash().to_string()).collect()
        };
        assert_eq!(hashes(&first), hashes(&second));
        assert_eq!(first.root_spec().hash().len(), 32);
    }

    #[test]
    fn zero_timeout_times_out() {
        let config = SolverConfig::default().with_timeout(Some(Duration::ZERO));
        let c = concretizer(BASIC, config);
        match c.concretize_str("a") {
            Err(ConcretizeError::SolveTimeout { request, .. }) => assert_eq!(request, "a"),
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[test]
    fn requests_concretize_in_parallel() {
        let c = concretizer(MPI, SolverConfig::default());
        let requests: Vec<AbstractSpec> = ["app", "zlib@1.2", "mpich", "nope"]
            .iter()
            .map(|s| AbstractSpec::parse(s).unwrap())
            .collect();
        let results = c.concretize_all(&requests);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().root_spec().name, "app");
        assert_eq!(version_of(results[1].as_ref().unwrap(), "zlib"), "1.2.13");
        assert_eq!(version_of(results[2].as_ref().unwrap(), "mpich"), "4.2");
        assert!(matches!(
            results[3],
            Err(ConcretizeError::UnknownPackage { .. })
        ));
    }

    #[test]
    fn deprecated_versions_are_avoided() {
        let c = concretizer(
            r#"[{"name": "a", "versions": [{"version": "2.0", "deprecated": true}, "1.0"]}]"#,
            SolverConfig::default(),
        );
        let graph = c.concretize_str("a").unwrap();
        assert_eq!(version_of(&graph, "a"), "1.0");
        let graph = c.concretize_str("a@2.0").unwrap();
        assert_eq!(version_of(&graph, "a"), "2.0");
    }

    #[test]
    fn capped_dependency_takes_newest_allowed_version() {
        let c = concretizer(
            r#"[
                {"name": "a", "versions": ["1.0", "2.0"], "dependencies": ["b@:1.5"]},
                {"name": "b", "versions": ["1.0", "1.5", "2.0"]}
            ]"#,
            SolverConfig::default(),
        );
        let graph = c.concretize_str("a").unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(version_of(&graph, "a"), "2.0");
        assert_eq!(version_of(&graph, "b"), "1.5");
        assert!(graph.satisfies(&AbstractSpec::parse("a@2.0 ^b@1.5").unwrap()));
    }

    #[test]
    fn layered_graphs_concretize_quickly() {
        // Eight layers of eight packages; p{l}_{i} needs p{l+1}_{i} and
        // caps p{l+1}_{i+1} at 2.
        let mut packages = Vec::new();
        for l in 0..8 {
            for i in 0..8 {
                let mut deps = Vec::new();
                if l < 7 {
                    deps.push(format!("\"p{}_{i}\"", l + 1));
                    if i < 7 {
                        deps.push(format!("\"p{}_{}@:2\"", l + 1, i + 1));
                    }
                }
                packages.push(format!(
                    r#"{{"name": "p{l}_{i}", "versions": ["1.0", "2.0", "3.0"], "dependencies": [{}]}}"#,
                    deps.join(", ")
                ));
            }
        }
        let config = SolverConfig::default().with_timeout(Some(Duration::from_secs(10)));
        let c = concretizer(&format!("[{}]", packages.join(",")), config);
        let solution = c.solve(&AbstractSpec::parse("p0_0").unwrap()).unwrap();
        assert_eq!(solution.graph.len(), 36);
        assert_eq!(version_of(&solution.graph, "p7_0"), "3.0");
        assert_eq!(version_of(&solution.graph, "p7_7"), "2.0");
        assert!(solution.stats.search.nodes < 500, "{:?}", solution.stats);
    }

    #[test]
    fn version_helpers_work_from_the_crate_root() {
        let v = |s: &str| Version::parse(s).unwrap();
        let l = |s: &str| VersionList::parse(s).unwrap();
        assert_eq!(compare(&v("1.10"), &v("1.9")), std::cmp::Ordering::Greater);
        assert!(satisfies(&v("1.2.13"), &l("1.2")));
        let window = intersect(&l("1:"), &l(":1.5"));
        assert!(satisfies(&v("1.4"), &window));
        assert!(!satisfies(&v("2.0"), &window));
    }

    const OPENSSL: &str = r#"[
        {"name": "app", "versions": ["1.0"], "dependencies": ["openssl"]},
        {"name": "openssl", "versions": ["3.0.2", "3.1.0"],
         "variants": [{"name": "shared", "default": ["true"], "values": ["true", "false"]}],
         "dependencies": ["zlib"]},
        {"name": "zlib", "versions": ["1.3.1"]}
    ]"#;

    #[test]
    fn externals_are_used_as_configured() {
        let external = AbstractSpec::parse("openssl@3.0.2~shared").unwrap();
        let config = SolverConfig::default().with_external(external, "/usr");
        let c = concretizer(OPENSSL, config);
        let graph = c.concretize_str("app").unwrap();
        let openssl = graph.find("openssl").unwrap();
        assert_eq!(openssl.version.to_string(), "3.0.2");
        assert_eq!(
            openssl.origin,
            Origin::External {
                prefix: "/usr".into()
            }
        );
        assert!(openssl.variants["shared"].contains("false"));
        // An external brings no dependencies of its own.
        assert!(graph.find("zlib").is_none());
        assert_eq!(graph.root_spec().origin, Origin::Build);

        // A newer version can still be built when asked for.
        let graph = c.concretize_str("app ^openssl@3.1.0").unwrap();
        assert_eq!(version_of(&graph, "openssl"), "3.1.0");
        assert!(graph.find("openssl").unwrap().origin.is_build());
        assert!(graph.find("zlib").is_some());
    }

    #[test]
    fn non_buildable_packages_must_use_an_external() {
        let config = SolverConfig::from_toml_str(
            r#"
            [packages.openssl]
            buildable = false
            externals = [{ spec = "openssl@3.0.2+shared", prefix = "/opt/openssl" }]
            "#,
        )
        .unwrap();
        let c = concretizer(OPENSSL, config);
        let graph = c.concretize_str("app").unwrap();
        assert_eq!(version_of(&graph, "openssl"), "3.0.2");
        assert!(matches!(
            c.concretize_str("app ^openssl@3.1.0"),
            Err(ConcretizeError::UnsatisfiableSpec(_))
        ));
    }

    #[test]
    fn package_requirements_are_enforced() {
        let config = SolverConfig::from_toml_str(
            r#"
            [packages.b]
            require = ["@:1.5"]
            "#,
        )
        .unwrap();
        let c = concretizer(BASIC, config);
        let graph = c.concretize_str("a").unwrap();
        assert_eq!(version_of(&graph, "b"), "1.5");

        let err = c.concretize_str("a ^b@2.0").unwrap_err();
        let explanation = err.explanation().unwrap();
        assert!(
            explanation
                .core
                .iter()
                .any(|clause| clause.starts_with("the configuration requires b to satisfy")),
            "{explanation}"
        );
    }

    #[test]
    fn installed_specs_are_reused() {
        let old = concretizer(
            r#"[
                {"name": "app", "versions": ["1.0"], "dependencies": ["zlib"]},
                {"name": "zlib", "versions": ["1.2.13"]}
            ]"#,
            SolverConfig::default(),
        );
        let installed = old.concretize_str("app").unwrap();

        let repo = r#"[
            {"name": "app", "versions": ["1.0"], "dependencies": ["zlib"]},
            {"name": "zlib", "versions": ["1.2.13", "1.3.1"]}
        ]"#;
        let fresh = concretizer(repo, SolverConfig::default()).with_installed(vec![installed.clone()]);
        assert_eq!(version_of(&fresh.concretize_str("app").unwrap(), "zlib"), "1.3.1");

        let reusing = concretizer(repo, SolverConfig::default().with_reuse(true))
            .with_installed(vec![installed.clone()]);
        let graph = reusing.concretize_str("app").unwrap();
        assert_eq!(version_of(&graph, "zlib"), "1.2.13");
        assert_eq!(graph.root_spec().hash(), installed.root_spec().hash());
        let zlib = graph.find("zlib").unwrap();
        assert_eq!(
            zlib.origin,
            Origin::Installed {
                hash: installed.find("zlib").unwrap().hash().to_string()
            }
        );

        // Asking for something the installed node lacks builds it.
        let graph = reusing.concretize_str("app ^zlib@1.3.1").unwrap();
        assert!(graph.find("zlib").unwrap().origin.is_build());
        assert!(graph.root_spec().origin.is_build());
    }
}

