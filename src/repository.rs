//! Package repositories and the read-only index built from them.
//!
//! [`PackageRepository`] provides read-only access to package definitions.
//! [`InMemoryRepository`] is a simple implementation for tests and for
//! definitions loaded from JSON. [`RepositoryIndex`] merges one or more
//! repositories into an immutable snapshot that concurrent solves share
//! through an `Arc`.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::debug;

use crate::error::ConcretizeError;
use crate::package::{PackageDefinition, ProvidesDeclaration};

/// Read-only package database.
pub trait PackageRepository: Send + Sync {
    /// Return the names of every package in the repository.
    fn all_packages(&self) -> Vec<String>;

    /// Return the definition of one package.
    fn get(&self, name: &str) -> Option<PackageDefinition>;
}

/// In-memory repository backed by a `BTreeMap`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    packages: BTreeMap<String, PackageDefinition>,
}

impl InMemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a package definition.
    pub fn add(&mut self, definition: PackageDefinition) {
        self.packages.insert(definition.name.clone(), definition);
    }

    /// Load a JSON array of package definitions.
    pub fn from_json(json: &str) -> Result<Self, ConcretizeError> {
        let definitions: Vec<PackageDefinition> = serde_json::from_str(json)?;
        let mut repo = Self::new();
        for definition in definitions {
            repo.add(definition);
        }
        Ok(repo)
    }
}

impl PackageRepository for InMemoryRepository {
    fn all_packages(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    fn get(&self, name: &str) -> Option<PackageDefinition> {
        self.packages.get(name).cloned()
    }
}

/// Result of [`RepositoryIndex::lookup`].
#[derive(Debug)]
pub enum Lookup<'a> {
    Package(&'a PackageDefinition),
    /// A virtual package and its providers, best first.
    Virtual {
        name: &'a str,
        providers: Vec<&'a PackageDefinition>,
    },
}

#[derive(Debug, Clone)]
struct ProviderEntry {
    package: usize,
    declaration: usize,
}

/// Immutable merged view over registered repositories.
///
/// Earlier repositories shadow later ones. Definitions are validated when
/// the index is built and never change afterwards.
#[derive(Debug)]
pub struct RepositoryIndex {
    packages: Vec<PackageDefinition>,
    by_name: HashMap<String, usize>,
    providers: HashMap<String, Vec<ProviderEntry>>,
}

impl RepositoryIndex {
    /// Build an index from repositories in precedence order.
    pub fn build(repositories: &[&dyn PackageRepository]) -> Result<Self, ConcretizeError> {
        let mut packages = Vec::new();
        let mut by_name = HashMap::new();

        for repo in repositories {
            let mut names = repo.all_packages();
            names.sort();
            for name in names {
                if by_name.contains_key(&name) {
                    continue;
                }
                let Some(definition) = repo.get(&name) else {
                    continue;
                };
                definition.validate()?;
                by_name.insert(name, packages.len());
                packages.push(definition);
            }
        }

        let mut providers: HashMap<String, Vec<ProviderEntry>> = HashMap::new();
        for (package, definition) in packages.iter().enumerate() {
            for (declaration, provided) in definition.provides.iter().enumerate() {
                if by_name.contains_key(&provided.virtual_name) {
                    return Err(ConcretizeError::InvalidPackage {
                        package: definition.name.clone(),
                        reason: format!(
                            "provides `{}`, which is also a concrete package",
                            provided.virtual_name
                        ),
                    });
                }
                providers
                    .entry(provided.virtual_name.clone())
                    .or_default()
                    .push(ProviderEntry {
                        package,
                        declaration,
                    });
            }
        }
        for entries in providers.values_mut() {
            entries.sort_by(|a, b| {
                let pa = &packages[a.package];
                let pb = &packages[b.package];
                pb.provides[b.declaration]
                    .priority
                    .cmp(&pa.provides[a.declaration].priority)
                    .then_with(|| pa.name.cmp(&pb.name))
                    .then_with(|| a.declaration.cmp(&b.declaration))
            });
        }

        debug!(
            packages = packages.len(),
            virtuals = providers.len(),
            "repository index built"
        );

        Ok(Self {
            packages,
            by_name,
            providers,
        })
    }

    /// Build an index over a single repository.
    pub fn from_repository(repository: &dyn PackageRepository) -> Result<Self, ConcretizeError> {
        Self::build(&[repository])
    }

    /// Resolve a name to a package or, failing that, to a virtual's providers.
    pub fn lookup(&self, name: &str) -> Result<Lookup<'_>, ConcretizeError> {
        if let Some(package) = self.package(name) {
            return Ok(Lookup::Package(package));
        }
        if let Some((name, _)) = self.providers.get_key_value(name) {
            return Ok(Lookup::Virtual {
                name,
                providers: self.providers_of(name),
            });
        }
        Err(ConcretizeError::UnknownPackage {
            name: name.to_string(),
            needed_by: None,
        })
    }

    pub fn package(&self, name: &str) -> Option<&PackageDefinition> {
        self.by_name.get(name).map(|&i| &self.packages[i])
    }

    pub fn is_virtual(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Packages providing `virtual_name`, by declared priority then name.
    pub fn providers_of(&self, virtual_name: &str) -> Vec<&PackageDefinition> {
        let mut seen = BTreeSet::new();
        self.provider_declarations(virtual_name)
            .into_iter()
            .filter(|(package, _)| seen.insert(package.name.as_str()))
            .map(|(package, _)| package)
            .collect()
    }

    /// Every `provides` declaration for `virtual_name`, in provider order.
    pub fn provider_declarations(
        &self,
        virtual_name: &str,
    ) -> Vec<(&PackageDefinition, &ProvidesDeclaration)> {
        self.providers
            .get(virtual_name)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| {
                        let package = &self.packages[e.package];
                        (package, &package.provides[e.declaration])
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every name reachable from `roots` through any dependency declaration,
    /// whatever its condition, and through virtual providers. Names that are
    /// neither packages nor virtuals are included so callers can report them.
    pub fn possible_dependencies<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<String> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for root in roots {
            if seen.insert(root.to_string()) {
                queue.push_back(root.to_string());
            }
        }

        while let Some(name) = queue.pop_front() {
            let next: Vec<&str> = if let Some(package) = self.package(&name) {
                package.dependencies.iter().map(|d| d.name()).collect()
            } else {
                self.providers_of(&name)
                    .into_iter()
                    .map(|p| p.name.as_str())
                    .collect()
            };
            for n in next {
                if seen.insert(n.to_string()) {
                    queue.push_back(n.to_string());
                }
            }
        }
        seen
    }

    /// Number of indexed packages.
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(json: &str) -> InMemoryRepository {
        InMemoryRepository::from_json(json).unwrap()
    }

    #[test]
    fn in_memory_add_and_query() {
        let repo = repo(r#"[{"name": "zlib", "versions": ["1.2.13", "1.3"]}]"#);
        assert_eq!(repo.all_packages(), vec!["zlib".to_string()]);
        assert_eq!(repo.get("zlib").unwrap().versions.len(), 2);
        assert!(repo.get("openssl").is_none());
    }

    #[test]
    fn earlier_repository_shadows_later() {
        let site = repo(r#"[{"name": "zlib", "versions": ["1.3"]}]"#);
        let builtin = repo(
            r#"[{"name": "zlib", "versions": ["1.2"]}, {"name": "cmake", "versions": ["3.27"]}]"#,
        );
        let index = RepositoryIndex::build(&[&site, &builtin]).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.package("zlib").unwrap().versions[0].version.to_string(), "1.3");
    }

    #[test]
    fn lookup_falls_back_to_virtuals() {
        let index = RepositoryIndex::from_repository(&repo(
            r#"[
                {"name": "mpich", "versions": ["4.1"], "provides": ["mpi"]},
                {"name": "openmpi", "versions": ["5.0"], "provides": [{"virtual": "mpi", "priority": 10}]}
            ]"#,
        ))
        .unwrap();

        assert!(matches!(index.lookup("mpich"), Ok(Lookup::Package(_))));
        match index.lookup("mpi").unwrap() {
            Lookup::Virtual { name, providers } => {
                assert_eq!(name, "mpi");
                let names: Vec<&str> = providers.iter().map(|p| p.name.as_str()).collect();
                assert_eq!(names, vec!["openmpi", "mpich"]);
            }
            other => panic!("expected virtual, got {other:?}"),
        }
        assert!(index.is_virtual("mpi"));
        assert!(matches!(
            index.lookup("nope"),
            Err(ConcretizeError::UnknownPackage { .. })
        ));
    }

    #[test]
    fn provider_ties_break_by_name() {
        let index = RepositoryIndex::from_repository(&repo(
            r#"[
                {"name": "openblas", "versions": ["0.3"], "provides": ["blas"]},
                {"name": "atlas", "versions": ["3.10"], "provides": ["blas"]}
            ]"#,
        ))
        .unwrap();
        let names: Vec<&str> = index
            .providers_of("blas")
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["atlas", "openblas"]);
    }

    #[test]
    fn virtual_named_like_package_is_rejected() {
        let err = RepositoryIndex::from_repository(&repo(
            r#"[
                {"name": "mpi", "versions": ["1"]},
                {"name": "mpich", "versions": ["4.1"], "provides": ["mpi"]}
            ]"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("also a concrete package"));
    }

    #[test]
    fn possible_dependencies_follow_every_edge() {
        let index = RepositoryIndex::from_repository(&repo(
            r#"[
                {"name": "app", "versions": ["1"], "dependencies": ["mpi", {"spec": "hdf5", "when": "+io"}]},
                {"name": "hdf5", "versions": ["1.14"], "dependencies": ["zlib", "missing"]},
                {"name": "zlib", "versions": ["1.3"]},
                {"name": "mpich", "versions": ["4.1"], "provides": ["mpi"]},
                {"name": "unrelated", "versions": ["1"]}
            ]"#,
        ))
        .unwrap();
        let names = index.possible_dependencies(["app"]);
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["app", "hdf5", "missing", "mpi", "mpich", "zlib"]);
    }

    #[test]
    fn invalid_json_is_a_repository_error() {
        assert!(matches!(
            InMemoryRepository::from_json("{not json"),
            Err(ConcretizeError::Repository(_))
        ));
    }
}
