//! Optimization criteria and the cost of a (partial) assignment.
//!
//! Every criterion is a sum over the selected candidates. Once the root
//! package is selected, adding candidates to an assignment can only raise
//! its cost, so a partial assignment plus the cheapest choice on each axis
//! it still has to decide bounds every completion from below.
//!
//! Prebuilt nodes (externals and reused installs) are taken as they are:
//! their version and attributes cost nothing, and only the number of
//! packages built from source tells them apart from a build.

use std::cmp::Ordering;
use std::fmt;

use resolvo::SolvableId;
use serde::{Deserialize, Serialize};

use crate::facts::Facts;
use crate::model::Assignment;
use crate::pool::{Axis, Candidate};
use crate::spec::CompilerSpec;

/// One term of the model ranking. Lower is better for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Criterion {
    /// Number of deprecated versions selected.
    DeprecatedVersions,
    /// Preference rank of the root package's version.
    RootVersionAge,
    /// Number of variant values differing from their default.
    NonDefaultVariants,
    /// Sum of provider preference ranks.
    NonPreferredProviders,
    /// Sum of version preference ranks of non-root packages.
    VersionAge,
    /// Number of nodes not built with the root's compiler.
    CompilerMismatches,
    /// Sum of compiler preference ranks.
    NonPreferredCompilers,
    /// Sum of target preference ranks.
    NonPreferredTargets,
    /// Number of packages built from source.
    Builds,
    /// Number of packages in the graph.
    PackageCount,
}

impl Criterion {
    pub const DEFAULT_ORDER: [Criterion; 10] = [
        Criterion::DeprecatedVersions,
        Criterion::RootVersionAge,
        Criterion::NonDefaultVariants,
        Criterion::NonPreferredProviders,
        Criterion::VersionAge,
        Criterion::CompilerMismatches,
        Criterion::NonPreferredCompilers,
        Criterion::NonPreferredTargets,
        Criterion::Builds,
        Criterion::PackageCount,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Criterion::DeprecatedVersions => "deprecated-versions",
            Criterion::RootVersionAge => "root-version-age",
            Criterion::NonDefaultVariants => "non-default-variants",
            Criterion::NonPreferredProviders => "non-preferred-providers",
            Criterion::VersionAge => "version-age",
            Criterion::CompilerMismatches => "compiler-mismatches",
            Criterion::NonPreferredCompilers => "non-preferred-compilers",
            Criterion::NonPreferredTargets => "non-preferred-targets",
            Criterion::Builds => "builds",
            Criterion::PackageCount => "package-count",
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cost of a model, one entry per configured criterion.
///
/// Compared lexicographically; lower wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Cost(pub Vec<u64>);

impl Cost {
    pub fn values(&self) -> &[u64] {
        &self.0
    }

    /// `criterion=value` pairs, for logging.
    pub fn describe(&self, criteria: &[Criterion]) -> String {
        criteria
            .iter()
            .zip(&self.0)
            .map(|(c, v)| format!("{c}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "({})", values.join(", "))
    }
}

/// Per-criterion totals of a set of candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    deprecated: u64,
    root_age: u64,
    non_default: u64,
    providers: u64,
    version_age: u64,
    mismatches: u64,
    compilers: u64,
    targets: u64,
    builds: u64,
    packages: u64,
}

impl Tally {
    /// What selecting `candidate` adds. Attributes of a prebuilt node are
    /// not `charged`.
    fn of(
        candidate: &Candidate,
        is_root: bool,
        charged: bool,
        root_compiler: Option<&CompilerSpec>,
    ) -> Self {
        let mut tally = Tally::default();
        match candidate {
            Candidate::Package {
                deprecated,
                rank,
                origin,
                ..
            } => {
                tally.packages = 1;
                if origin.is_build() {
                    tally.builds = 1;
                    tally.deprecated = u64::from(*deprecated);
                    if is_root {
                        tally.root_age = *rank as u64;
                    } else {
                        tally.version_age = *rank as u64;
                    }
                }
            }
            _ if !charged => {}
            Candidate::VariantValue { default, .. } => tally.non_default = u64::from(!default),
            Candidate::Provider { rank, .. } => tally.providers = *rank as u64,
            Candidate::Compiler { compiler, rank, .. } => {
                tally.compilers = *rank as u64;
                tally.mismatches = u64::from(root_compiler.is_some_and(|r| r != compiler));
            }
            Candidate::Target { rank, .. } => tally.targets = *rank as u64,
            Candidate::Forbidden { .. } | Candidate::Request => {}
        }
        tally
    }

    fn add(&mut self, other: Tally) {
        self.deprecated += other.deprecated;
        self.root_age += other.root_age;
        self.non_default += other.non_default;
        self.providers += other.providers;
        self.version_age += other.version_age;
        self.mismatches += other.mismatches;
        self.compilers += other.compilers;
        self.targets += other.targets;
        self.builds += other.builds;
        self.packages += other.packages;
    }

    /// Component-wise minimum.
    fn meet(self, other: Tally) -> Tally {
        Tally {
            deprecated: self.deprecated.min(other.deprecated),
            root_age: self.root_age.min(other.root_age),
            non_default: self.non_default.min(other.non_default),
            providers: self.providers.min(other.providers),
            version_age: self.version_age.min(other.version_age),
            mismatches: self.mismatches.min(other.mismatches),
            compilers: self.compilers.min(other.compilers),
            targets: self.targets.min(other.targets),
            builds: self.builds.min(other.builds),
            packages: self.packages.min(other.packages),
        }
    }

    fn cost(&self, criteria: &[Criterion]) -> Cost {
        Cost(
            criteria
                .iter()
                .map(|c| match c {
                    Criterion::DeprecatedVersions => self.deprecated,
                    Criterion::RootVersionAge => self.root_age,
                    Criterion::NonDefaultVariants => self.non_default,
                    Criterion::NonPreferredProviders => self.providers,
                    Criterion::VersionAge => self.version_age,
                    Criterion::CompilerMismatches => self.mismatches,
                    Criterion::NonPreferredCompilers => self.compilers,
                    Criterion::NonPreferredTargets => self.targets,
                    Criterion::Builds => self.builds,
                    Criterion::PackageCount => self.packages,
                })
                .collect(),
        )
    }
}

/// The compiler selected for the root package, once both are known.
fn root_compiler<'f>(facts: &'f Facts, assignment: &Assignment) -> Option<&'f CompilerSpec> {
    let pool = facts.pool();
    let root = assignment.root_package(facts)?;
    let Candidate::Package { name, .. } = pool.resolve_solvable(root) else {
        return None;
    };
    let axis = pool.lookup_name(&Axis::Compiler(name.clone()))?;
    match pool.resolve_solvable(assignment.get(axis)?) {
        Candidate::Compiler { compiler, .. } => Some(compiler),
        _ => None,
    }
}

/// Whether the attribute `candidate` counts: its package is built from
/// source, or is undecided and can only be built.
fn charged(facts: &Facts, assignment: &Assignment, candidate: SolvableId) -> bool {
    let pool = facts.pool();
    let Some(package) = pool.resolve_name(pool.solvable_name(candidate)).package() else {
        return true;
    };
    let Some(axis) = facts.package_axis(package) else {
        return true;
    };
    match assignment.get(axis) {
        Some(selected) => match pool.resolve_solvable(selected) {
            Candidate::Package { origin, .. } => origin.is_build(),
            _ => true,
        },
        None => !facts.has_prebuilt(axis),
    }
}

fn selected_tally(facts: &Facts, assignment: &Assignment) -> Tally {
    let pool = facts.pool();
    let root = assignment.root_package(facts);
    let compiler = root_compiler(facts, assignment);
    let mut tally = Tally::default();
    for s in assignment.solvables() {
        tally.add(Tally::of(
            pool.resolve_solvable(s),
            Some(s) == root,
            charged(facts, assignment, s),
            compiler,
        ));
    }
    tally
}

/// Cost of `assignment` under `criteria`.
pub fn evaluate(facts: &Facts, assignment: &Assignment, criteria: &[Criterion]) -> Cost {
    selected_tally(facts, assignment).cost(criteria)
}

/// A cost no completion of `assignment` can go below.
///
/// `open` lists, for each unselected axis every completion must select,
/// the candidates still allowed there. Each such axis adds the smallest
/// value any of its candidates could add, per criterion. Only valid once
/// the root package is selected.
pub fn lower_bound<'s>(
    facts: &Facts,
    assignment: &Assignment,
    open: impl IntoIterator<Item = &'s [SolvableId]>,
    criteria: &[Criterion],
) -> Cost {
    let pool = facts.pool();
    let compiler = root_compiler(facts, assignment);
    let mut tally = selected_tally(facts, assignment);
    for allowed in open {
        let cheapest = allowed
            .iter()
            .map(|&s| {
                let charged = charged(facts, assignment, s);
                Tally::of(pool.resolve_solvable(s), false, charged, compiler)
            })
            .reduce(Tally::meet);
        if let Some(cheapest) = cheapest {
            tally.add(cheapest);
        }
    }
    tally.cost(criteria)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn costs_compare_lexicographically() {
        assert!(Cost(vec![0, 5, 9]) < Cost(vec![1, 0, 0]));
        assert!(Cost(vec![0, 1, 0]) < Cost(vec![0, 1, 1]));
        assert_eq!(Cost(vec![2, 2]).cmp(&Cost(vec![2, 2])), Ordering::Equal);
    }

    #[test]
    fn names_match_serde() {
        for c in Criterion::DEFAULT_ORDER {
            let json = serde_json::to_string(&c).unwrap();
            assert_eq!(json, format!("\"{}\"", c.name()));
        }
    }

    #[test]
    fn describe_pairs_names_and_values() {
        let cost = Cost(vec![0, 3]);
        let text = cost.describe(&[Criterion::DeprecatedVersions, Criterion::VersionAge]);
        assert_eq!(text, "deprecated-versions=0 version-age=3");
        assert_eq!(cost.to_string(), "(0, 3)");
    }
}
