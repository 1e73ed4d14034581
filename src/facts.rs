//! Fact builder: compiles a request, the repository index and the solver
//! configuration into guarded solver facts.
//!
//! Every package in the request's dependency closure becomes a
//! [`Axis::Package`] whose candidates are its versions in preference order.
//! Node attributes (variants, compiler, target) become further axes, and
//! virtual packages become an axis whose candidates are the providers.
//!
//! Declarations with a `when` condition are compiled into conditional
//! requirements: the depender's own version is checked per candidate
//! version, everything else becomes a solver predicate. Conflicts and
//! other prohibitions are requirements on a [`Axis::Guard`] whose only
//! candidate is excluded, so the condition guarding them can never hold.
//!
//! Prebuilt nodes join the build candidates of their package: externals
//! from the configuration and, with reuse enabled, installed nodes from
//! earlier concretizations. They pin their own attributes, and an installed
//! node pins its dependencies by hash.
//!
//! Each requirement carries a [`FactId`] naming where it came from. The
//! explanation reporter disables facts by id to minimize unsat cores.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use resolvo::{ArenaId, ConditionId, NameId, SolvableId, StringId, VersionSetId, VersionSetUnionId};
use tracing::{debug, warn};

use crate::config::{DeprecatedPolicy, SolverConfig};
use crate::error::ConcretizeError;
use crate::graph::{ConcreteSpec, NodeId, SpecGraph};
use crate::package::{DepTypes, PackageDefinition, VariantDeclaration};
use crate::pool::{Axis, Candidate, Constraint, ConstraintKind, FactPool, Origin};
use crate::repository::{Lookup, RepositoryIndex};
use crate::spec::{AbstractSpec, FALSE, TRUE};
use crate::version::{Version, VersionList};

/// Identifies a group of requirements that share one origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactId(pub(crate) usize);

/// Where a fact came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactOrigin {
    /// Wiring between axes. Never disabled while explaining.
    Structural,
    /// One atom of the user's request.
    Request { atom: String },
    /// A `depends_on` declaration of a package.
    Dependency {
        package: String,
        /// Name of the dependency (a package or a virtual).
        dependency: String,
        spec: String,
        when: String,
        types: DepTypes,
    },
    /// A `conflicts` declaration of a package.
    Conflict {
        package: String,
        spec: String,
        when: String,
        message: Option<String>,
    },
    /// A compiler that only supports some targets.
    CompilerTargets { compiler: String, targets: Vec<String> },
    /// A `require` entry of the package configuration.
    Requirement { package: String, spec: String },
}

impl FactOrigin {
    /// Whether the explanation reporter may disable this fact.
    pub fn is_maskable(&self) -> bool {
        !matches!(self, FactOrigin::Structural)
    }
}

impl fmt::Display for FactOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactOrigin::Structural => write!(f, "internal constraint"),
            FactOrigin::Request { atom } => write!(f, "the request asks for '{atom}'"),
            FactOrigin::Dependency {
                package,
                spec,
                when,
                ..
            } => {
                write!(f, "{package} depends on '{spec}'")?;
                if !when.is_empty() {
                    write!(f, " when '{when}'")?;
                }
                Ok(())
            }
            FactOrigin::Conflict {
                package,
                spec,
                when,
                message,
            } => {
                write!(f, "{package} conflicts with '{spec}'")?;
                if !when.is_empty() {
                    write!(f, " when '{when}'")?;
                }
                if let Some(message) = message {
                    write!(f, " ({message})")?;
                }
                Ok(())
            }
            FactOrigin::CompilerTargets { compiler, targets } => {
                write!(f, "{compiler} only supports targets {}", targets.join(", "))
            }
            FactOrigin::Requirement { package, spec } => {
                write!(f, "the configuration requires {package} to satisfy '{spec}'")
            }
        }
    }
}

/// A requirement of one candidate: if the condition holds, one of the
/// alternatives must be selected.
#[derive(Debug, Clone)]
pub struct FactRequirement {
    pub fact: FactId,
    pub condition: Option<ConditionId>,
    pub alternatives: Vec<VersionSetId>,
    /// Interned union when there is more than one alternative.
    pub union: Option<VersionSetUnionId>,
}

/// If the axis of `version_set` is assigned, the assignment must match it.
#[derive(Debug, Clone, Copy)]
pub struct FactConstraint {
    pub fact: FactId,
    pub version_set: VersionSetId,
}

/// Requirements and constraints attached to one candidate.
#[derive(Debug, Clone, Default)]
pub struct SolvableFacts {
    pub requirements: Vec<FactRequirement>,
    pub constrains: Vec<FactConstraint>,
}

/// The compiled fact base for one request. Read-only after construction.
#[derive(Debug)]
pub struct Facts {
    pub(crate) pool: FactPool,
    /// Candidates per axis, best first.
    candidates: HashMap<NameId, Vec<SolvableId>>,
    /// Candidates that may never be selected, with the reason.
    excluded: HashMap<NameId, Vec<(SolvableId, StringId)>>,
    excluded_set: HashSet<SolvableId>,
    /// Position of each solvable in its axis' candidate list.
    preference: Vec<usize>,
    dependencies: HashMap<SolvableId, SolvableFacts>,
    origins: Vec<FactOrigin>,
    /// Package axes with external or installed candidates.
    prebuilt: HashSet<NameId>,
    root: SolvableId,
    root_requirement: VersionSetId,
    root_axis: NameId,
    request: AbstractSpec,
}

impl Facts {
    /// Compile `request` against `index` under `config`.
    pub fn build(
        index: &RepositoryIndex,
        config: &SolverConfig,
        request: &AbstractSpec,
    ) -> Result<Self, ConcretizeError> {
        Self::build_reusing(index, config, &[], request)
    }

    /// Like [`build`](Self::build), offering the nodes of `installed` for
    /// reuse when the configuration enables it.
    pub fn build_reusing(
        index: &RepositoryIndex,
        config: &SolverConfig,
        installed: &[SpecGraph],
        request: &AbstractSpec,
    ) -> Result<Self, ConcretizeError> {
        FactBuilder::new(index, config).build(installed, request)
    }

    pub fn pool(&self) -> &FactPool {
        &self.pool
    }

    /// Candidates of an axis, best first. `None` when the axis has none.
    pub fn candidates(&self, name: NameId) -> Option<&[SolvableId]> {
        self.candidates.get(&name).map(Vec::as_slice)
    }

    pub fn excluded(&self, name: NameId) -> &[(SolvableId, StringId)] {
        self.excluded.get(&name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_excluded(&self, solvable: SolvableId) -> bool {
        self.excluded_set.contains(&solvable)
    }

    /// Whether the package axis offers an external or installed node.
    pub fn has_prebuilt(&self, axis: NameId) -> bool {
        self.prebuilt.contains(&axis)
    }

    pub fn preference(&self, solvable: SolvableId) -> usize {
        self.preference[solvable.to_usize()]
    }

    pub fn facts_of(&self, solvable: SolvableId) -> Option<&SolvableFacts> {
        self.dependencies.get(&solvable)
    }

    pub fn origin(&self, fact: FactId) -> &FactOrigin {
        &self.origins[fact.0]
    }

    /// Every fact the explanation reporter may disable, in creation order.
    pub fn maskable_facts(&self) -> Vec<FactId> {
        (0..self.origins.len())
            .map(FactId)
            .filter(|&f| self.origins[f.0].is_maskable())
            .collect()
    }

    /// The synthetic candidate carrying the request.
    pub fn root(&self) -> SolvableId {
        self.root
    }

    /// The version set selecting [`root`](Self::root).
    pub fn root_requirement(&self) -> VersionSetId {
        self.root_requirement
    }

    /// The package or virtual axis of the requested name.
    pub fn root_axis(&self) -> NameId {
        self.root_axis
    }

    pub fn request(&self) -> &AbstractSpec {
        &self.request
    }

    pub fn package_axis(&self, package: &str) -> Option<NameId> {
        self.pool.lookup_name(&Axis::Package(package.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DeclarationKind {
    Dependency,
    Conflict,
    Requirement,
}

/// A compiled constraint with a human label.
struct Atom {
    label: String,
    version_set: VersionSetId,
}

/// An installed node whose dependencies can all be reused too.
struct Reusable {
    spec: ConcreteSpec,
    dependencies: Vec<InstalledEdge>,
}

#[derive(Clone)]
struct InstalledEdge {
    name: String,
    hash: String,
    types: DepTypes,
    virtuals: Vec<String>,
}

/// A package candidate before interning.
struct Offer {
    version: Version,
    deprecated: bool,
    origin: Origin,
    rank: usize,
}

struct FactBuilder<'a> {
    index: &'a RepositoryIndex,
    config: &'a SolverConfig,
    /// Reusable installed nodes per package, newest first.
    reusable: HashMap<String, Vec<Reusable>>,
    prebuilt: HashSet<NameId>,
    pool: FactPool,
    candidates: HashMap<NameId, Vec<SolvableId>>,
    excluded: HashMap<NameId, Vec<(SolvableId, StringId)>>,
    dependencies: HashMap<SolvableId, SolvableFacts>,
    origins: Vec<FactOrigin>,
    declaration_facts: HashMap<(String, DeclarationKind, usize), FactId>,
    compiler_facts: HashMap<usize, FactId>,
}

const STRUCTURAL: FactId = FactId(0);

impl<'a> FactBuilder<'a> {
    fn new(index: &'a RepositoryIndex, config: &'a SolverConfig) -> Self {
        Self {
            index,
            config,
            reusable: HashMap::new(),
            prebuilt: HashSet::new(),
            pool: FactPool::new(),
            candidates: HashMap::new(),
            excluded: HashMap::new(),
            dependencies: HashMap::new(),
            origins: vec![FactOrigin::Structural],
            declaration_facts: HashMap::new(),
            compiler_facts: HashMap::new(),
        }
    }

    fn build(
        mut self,
        installed: &[SpecGraph],
        request: &AbstractSpec,
    ) -> Result<Facts, ConcretizeError> {
        let index = self.index;
        let root_name = request.name.as_deref().ok_or_else(|| {
            ConcretizeError::UnsatisfiableRequest {
                request: request.to_string(),
                reason: "the request does not name a package".into(),
            }
        })?;

        index.lookup(root_name)?;
        for dep in &request.dependencies {
            let name = dep.name.as_deref().unwrap_or_default();
            index.lookup(name).map_err(|_| ConcretizeError::UnknownPackage {
                name: name.to_string(),
                needed_by: Some(root_name.to_string()),
            })?;
        }

        let closure = index.possible_dependencies(
            std::iter::once(root_name)
                .chain(request.dependencies.iter().filter_map(|d| d.name.as_deref())),
        );
        if let Some(missing) = closure.iter().find(|n| index.lookup(n).is_err()) {
            let needed_by = closure
                .iter()
                .filter_map(|n| index.package(n))
                .find(|p| p.dependencies.iter().any(|d| d.name() == missing.as_str()))
                .map(|p| p.name.clone());
            return Err(ConcretizeError::UnknownPackage {
                name: missing.clone(),
                needed_by,
            });
        }

        if self.config.reuse {
            self.collect_reusable(installed, &closure);
        }
        self.check_request(request)?;

        // Phase 1: axes and candidates.
        let mut packages: Vec<&PackageDefinition> = Vec::new();
        for name in &closure {
            if let Some(definition) = index.package(name) {
                self.add_package_candidates(definition);
                packages.push(definition);
            }
        }
        for name in &closure {
            if index.package(name).is_none() && index.is_virtual(name) {
                self.add_virtual_candidates(name);
            }
        }

        // Phase 2: rules attached to candidates.
        for definition in &packages {
            self.add_attribute_rules(definition);
            self.add_package_rules(definition);
        }
        for name in &closure {
            if index.package(name).is_none() && index.is_virtual(name) {
                self.add_provider_rules(name);
            }
        }

        // Phase 3: the request itself.
        let (root, root_requirement, root_axis) = self.add_request(request)?;

        let mut excluded_set = HashSet::new();
        for list in self.excluded.values() {
            excluded_set.extend(list.iter().map(|(s, _)| *s));
        }
        let mut preference = vec![0; self.pool.solvable_count()];
        for list in self.candidates.values() {
            for (i, s) in list.iter().enumerate() {
                preference[s.to_usize()] = i;
            }
        }

        debug!(
            request = %request,
            packages = packages.len(),
            axes = self.pool.name_count(),
            candidates = self.pool.solvable_count(),
            facts = self.origins.len(),
            "fact base built"
        );

        Ok(Facts {
            pool: self.pool,
            candidates: self.candidates,
            excluded: self.excluded,
            excluded_set,
            preference,
            dependencies: self.dependencies,
            origins: self.origins,
            prebuilt: self.prebuilt,
            root,
            root_requirement,
            root_axis,
            request: request.clone(),
        })
    }

    // --- static checks ---

    /// Reject requests that contradict the repository or the configuration
    /// without any search.
    fn check_request(&self, request: &AbstractSpec) -> Result<(), ConcretizeError> {
        let unsatisfiable = |reason: String| ConcretizeError::UnsatisfiableRequest {
            request: request.to_string(),
            reason,
        };
        let root = AbstractSpec {
            dependencies: Vec::new(),
            ..request.clone()
        };
        for node in std::iter::once(&root).chain(&request.dependencies) {
            self.check_node(node).map_err(unsatisfiable)?;
        }
        Ok(())
    }

    fn check_node(&self, node: &AbstractSpec) -> Result<(), String> {
        let name = node.name.as_deref().unwrap_or_default();
        match self.index.lookup(name).map_err(|e| e.to_string())? {
            Lookup::Package(definition) => {
                let prebuilt = self
                    .prebuilt_versions(name)
                    .any(|v| node.versions.contains(&v));
                let mut matching = definition.versions_in(&node.versions).peekable();
                if matching.peek().is_none() && !prebuilt {
                    let available: Vec<String> = definition
                        .versions
                        .iter()
                        .map(|v| v.version.to_string())
                        .collect();
                    return Err(format!(
                        "no version of {name} satisfies @{} (available: {})",
                        node.versions,
                        available.join(", ")
                    ));
                }
                if self.config.deprecated == DeprecatedPolicy::Forbid
                    && !prebuilt
                    && matching.all(|v| v.deprecated)
                {
                    return Err(format!(
                        "every version of {name} matching @{} is deprecated",
                        node.versions
                    ));
                }
                for (variant, values) in &node.variants {
                    let declaration = definition
                        .variant(variant)
                        .ok_or_else(|| format!("{name} has no variant '{variant}'"))?;
                    if let Some(bad) = values.iter().find(|v| !declaration.allows(v)) {
                        return Err(format!(
                            "'{bad}' is not a valid value of {name} variant '{variant}'"
                        ));
                    }
                    if !declaration.multi && values.len() > 1 {
                        return Err(format!("{name} variant '{variant}' takes a single value"));
                    }
                }
            }
            Lookup::Virtual { providers, .. } => {
                if !node.variants.is_empty() || node.compiler.is_some() || node.target.is_some()
                {
                    return Err(format!(
                        "{name} is a virtual package and cannot carry variants, compilers or targets"
                    ));
                }
                let implemented = self
                    .index
                    .provider_declarations(name)
                    .iter()
                    .any(|(_, p)| p.versions.overlaps(&node.versions));
                if !implemented {
                    let names: Vec<&str> = providers.iter().map(|p| p.name.as_str()).collect();
                    return Err(format!(
                        "no provider of {name} implements @{} (providers: {})",
                        node.versions,
                        names.join(", ")
                    ));
                }
            }
        }
        if let Some(compiler) = &node.compiler {
            if self.config.compilers.is_empty() {
                return Err(format!("{compiler} was requested but no compilers are configured"));
            }
            if !self.config.compilers.iter().any(|c| compiler.matches(&c.spec)) {
                return Err(format!("{compiler} is not an available compiler"));
            }
        }
        if let Some(target) = &node.target {
            if !self.config.targets.iter().any(|t| t == target) {
                return Err(format!("target {target} is not available"));
            }
        }
        Ok(())
    }

    /// Versions offered by externals and, with reuse, installed nodes.
    fn prebuilt_versions<'s>(&'s self, name: &str) -> impl Iterator<Item = Version> + 's {
        let externals = self
            .config
            .externals(name)
            .iter()
            .filter_map(|e| e.spec.versions.point().cloned());
        let installed = self
            .reusable
            .get(name)
            .into_iter()
            .flatten()
            .map(|r| r.spec.version.clone());
        externals.chain(installed)
    }

    /// Record the installed nodes that can be selected again unchanged:
    /// their package is in the closure, their attributes are still valid
    /// and every dependency is reusable as well.
    fn collect_reusable(&mut self, installed: &[SpecGraph], closure: &BTreeSet<String>) {
        let mut seen: HashSet<String> = HashSet::new();
        for graph in installed {
            for id in graph.install_order() {
                let node = graph.node(id);
                if seen.contains(node.hash()) || !closure.contains(&node.name) {
                    continue;
                }
                if let Err(reason) = self.check_reusable(graph, id) {
                    debug!(node = %node, hash = node.short_hash(), %reason, "installed node not reusable");
                    continue;
                }
                let dependencies = node
                    .dependencies
                    .iter()
                    .map(|d| {
                        let target = graph.node(d.node);
                        InstalledEdge {
                            name: target.name.clone(),
                            hash: target.hash().to_string(),
                            types: d.types,
                            virtuals: d.virtuals.clone(),
                        }
                    })
                    .collect();
                seen.insert(node.hash().to_string());
                self.reusable
                    .entry(node.name.clone())
                    .or_default()
                    .push(Reusable {
                        spec: node.clone(),
                        dependencies,
                    });
            }
        }
        for nodes in self.reusable.values_mut() {
            nodes.sort_by(|a, b| {
                b.spec
                    .version
                    .cmp(&a.spec.version)
                    .then_with(|| a.spec.hash().cmp(b.spec.hash()))
            });
        }
    }

    fn check_reusable(&self, graph: &SpecGraph, id: NodeId) -> Result<(), String> {
        let node = graph.node(id);
        let definition = self
            .index
            .package(&node.name)
            .ok_or_else(|| format!("{} is no longer a package", node.name))?;
        for variant in &definition.variants {
            let active = graph.node_matches(id, &variant.when);
            match node.variants.get(&variant.name) {
                Some(values) if active => {
                    if let Some(bad) = values.iter().find(|v| !variant.allows(v)) {
                        return Err(format!("'{bad}' is no longer a value of '{}'", variant.name));
                    }
                }
                None if !active => {}
                _ => return Err(format!("variant '{}' changed", variant.name)),
            }
        }
        if let Some(undeclared) = node.variants.keys().find(|v| definition.variant(v).is_none()) {
            return Err(format!("variant '{undeclared}' is no longer declared"));
        }
        let compilers = &self.config.compilers;
        match &node.compiler {
            Some(compiler) if !compilers.iter().any(|c| &c.spec == compiler) => {
                return Err(format!("{compiler} is not configured"));
            }
            None if !compilers.is_empty() => return Err("built without a compiler".into()),
            _ => {}
        }
        let targets = &self.config.targets;
        match &node.target {
            Some(target) if !targets.contains(target) => {
                return Err(format!("target {target} is not configured"));
            }
            None if !targets.is_empty() => return Err("built without a target".into()),
            _ => {}
        }
        for dep in &node.dependencies {
            let target = graph.node(dep.node);
            let reusable = self
                .reusable
                .get(&target.name)
                .is_some_and(|nodes| nodes.iter().any(|r| r.spec.hash() == target.hash()));
            if !reusable {
                return Err(format!("dependency {} is not reusable", target.name));
            }
        }
        Ok(())
    }

    // --- pool helpers ---

    fn fact(&mut self, origin: FactOrigin) -> FactId {
        self.origins.push(origin);
        FactId(self.origins.len() - 1)
    }

    fn declaration_fact(
        &mut self,
        package: &str,
        kind: DeclarationKind,
        index: usize,
        origin: impl FnOnce() -> FactOrigin,
    ) -> FactId {
        let key = (package.to_string(), kind, index);
        if let Some(&fact) = self.declaration_facts.get(&key) {
            return fact;
        }
        let fact = self.fact(origin());
        self.declaration_facts.insert(key, fact);
        fact
    }

    fn version_set(&mut self, axis: Axis, constraint: Constraint) -> VersionSetId {
        let name = self.pool.intern_name(axis);
        self.pool.intern_version_set(name, constraint)
    }

    /// An axis that has candidates registered (packages outside the closure do not).
    fn live_axis(&self, axis: &Axis) -> bool {
        self.pool
            .lookup_name(axis)
            .is_some_and(|id| self.candidates.contains_key(&id))
    }

    fn add_candidates(&mut self, axis: Axis, candidates: Vec<Candidate>) -> Vec<SolvableId> {
        let name = self.pool.intern_name(axis);
        let ids: Vec<SolvableId> = candidates
            .into_iter()
            .map(|c| self.pool.intern_solvable(name, c))
            .collect();
        self.candidates.insert(name, ids.clone());
        ids
    }

    fn exclude(&mut self, solvable: SolvableId, reason: String) {
        let name = self.pool.solvable_name(solvable);
        let reason = self.pool.intern_string(reason);
        self.excluded.entry(name).or_default().push((solvable, reason));
    }

    fn require(
        &mut self,
        facts: &mut SolvableFacts,
        fact: FactId,
        condition: Option<ConditionId>,
        alternatives: Vec<VersionSetId>,
    ) {
        let union = (alternatives.len() > 1)
            .then(|| self.pool.intern_version_set_union(alternatives.clone()));
        facts.requirements.push(FactRequirement {
            fact,
            condition,
            alternatives,
            union,
        });
    }

    /// Forbid `atoms` from holding together while the owner is selected.
    fn forbid(
        &mut self,
        facts: &mut SolvableFacts,
        fact: FactId,
        reason: String,
        atoms: &[VersionSetId],
    ) {
        let guard = self.pool.intern_name(Axis::Guard(reason.clone()));
        if !self.candidates.contains_key(&guard) {
            let forbidden = self.pool.intern_solvable(
                guard,
                Candidate::Forbidden {
                    reason: reason.clone(),
                },
            );
            self.candidates.insert(guard, vec![forbidden]);
            self.exclude(forbidden, reason);
        }
        let any = self.pool.intern_version_set(guard, Constraint::any());
        let condition = self.pool.intern_conjunction(atoms);
        self.require(facts, fact, condition, vec![any]);
    }

    // --- phase 1 ---

    fn add_package_candidates(&mut self, definition: &PackageDefinition) {
        let config = self.config;
        let name = definition.name.as_str();

        let mut versions: Vec<_> = definition.versions.iter().collect();
        versions.sort_by_key(|v| {
            (
                config
                    .version_preference(name, &v.version)
                    .unwrap_or(usize::MAX),
                !v.preferred,
                v.deprecated,
                v.version.is_develop(),
                Reverse(v.version.clone()),
            )
        });
        let builds = versions.iter().enumerate().map(|(rank, v)| Offer {
            version: v.version.clone(),
            deprecated: v.deprecated,
            origin: Origin::Build,
            rank,
        });

        // Prebuilt nodes come first: installed, then external.
        let mut offers: Vec<Offer> = self
            .reusable
            .get(name)
            .into_iter()
            .flatten()
            .enumerate()
            .map(|(rank, r)| Offer {
                version: r.spec.version.clone(),
                deprecated: definition.version(&r.spec.version).is_some_and(|v| v.deprecated),
                origin: Origin::Installed {
                    hash: r.spec.hash().to_string(),
                },
                rank,
            })
            .collect();
        let mut externals: Vec<(Version, &str)> = Vec::new();
        for external in config.externals(name) {
            match external.spec.versions.point() {
                Some(version) => externals.push((version.clone(), external.prefix.as_str())),
                None => warn!(
                    package = name,
                    spec = %external.spec,
                    "external does not name a single version, ignoring it"
                ),
            }
        }
        externals.sort_by(|a, b| b.0.cmp(&a.0));
        offers.extend(externals.into_iter().enumerate().map(|(rank, (version, prefix))| Offer {
            deprecated: definition.version(&version).is_some_and(|v| v.deprecated),
            version,
            origin: Origin::External {
                prefix: prefix.to_string(),
            },
            rank,
        }));
        offers.extend(builds);

        let candidates = offers
            .iter()
            .map(|offer| Candidate::Package {
                name: name.to_string(),
                version: offer.version.clone(),
                deprecated: offer.deprecated,
                rank: offer.rank,
                origin: offer.origin.clone(),
            })
            .collect();
        let ids = self.add_candidates(Axis::Package(name.to_string()), candidates);
        if offers.iter().any(|o| !o.origin.is_build()) {
            let axis = self.pool.intern_name(Axis::Package(name.to_string()));
            self.prebuilt.insert(axis);
        }
        let buildable = config.is_buildable(name);
        for (id, offer) in ids.into_iter().zip(&offers) {
            if !offer.origin.is_build() {
                continue;
            }
            if !buildable {
                self.exclude(id, format!("{name} is not buildable"));
            } else if offer.deprecated && config.deprecated == DeprecatedPolicy::Forbid {
                self.exclude(id, format!("{name}@{} is deprecated", offer.version));
            }
        }

        for variant in &definition.variants {
            self.add_variant_candidates(name, variant);
        }

        if !config.compilers.is_empty() {
            let candidates = config
                .compilers
                .iter()
                .enumerate()
                .map(|(rank, c)| Candidate::Compiler {
                    package: name.to_string(),
                    compiler: c.spec.clone(),
                    rank,
                })
                .collect();
            self.add_candidates(Axis::Compiler(name.to_string()), candidates);
        }

        if !config.targets.is_empty() {
            let candidates = config
                .targets
                .iter()
                .enumerate()
                .map(|(rank, t)| Candidate::Target {
                    package: name.to_string(),
                    target: t.clone(),
                    rank,
                })
                .collect();
            self.add_candidates(Axis::Target(name.to_string()), candidates);
        }
    }

    fn add_variant_candidates(&mut self, package: &str, variant: &VariantDeclaration) {
        let preferred = self
            .config
            .variant_preference(package, &variant.name)
            .filter(|values| values.iter().all(|v| variant.allows(v)));

        if variant.multi {
            let defaults: BTreeSet<&str> = match preferred {
                Some(values) => values.iter().map(String::as_str).collect(),
                None => variant.default.iter().map(String::as_str).collect(),
            };
            for value in &variant.values {
                let on_by_default = defaults.contains(value.as_str());
                let order = if on_by_default {
                    [TRUE, FALSE]
                } else {
                    [FALSE, TRUE]
                };
                let candidates = order
                    .iter()
                    .map(|state| Candidate::VariantValue {
                        package: package.to_string(),
                        variant: variant.name.clone(),
                        value: state.to_string(),
                        default: (*state == TRUE) == on_by_default,
                    })
                    .collect();
                self.add_candidates(
                    Axis::VariantValue {
                        package: package.to_string(),
                        variant: variant.name.clone(),
                        value: value.clone(),
                    },
                    candidates,
                );
            }
        } else {
            let default = match preferred {
                Some(values) if values.len() == 1 => values.iter().next().cloned(),
                _ => variant.default.first().cloned(),
            }
            .unwrap_or_default();
            let mut values: Vec<&String> = variant.values.iter().collect();
            values.sort_by_key(|v| **v != default);
            let candidates = values
                .into_iter()
                .map(|value| Candidate::VariantValue {
                    package: package.to_string(),
                    variant: variant.name.clone(),
                    value: value.clone(),
                    default: *value == default,
                })
                .collect();
            self.add_candidates(
                Axis::Variant {
                    package: package.to_string(),
                    variant: variant.name.clone(),
                },
                candidates,
            );
        }
    }

    fn add_virtual_candidates(&mut self, virtual_name: &str) {
        let config = self.config;
        let mut declarations = self.index.provider_declarations(virtual_name);
        // Stable: the index order (priority, name) breaks ties.
        declarations.sort_by_key(|(package, _)| {
            config
                .provider_preference(virtual_name, &package.name)
                .unwrap_or(usize::MAX)
        });
        let candidates = declarations
            .iter()
            .enumerate()
            .map(|(rank, (package, provides))| Candidate::Provider {
                virtual_name: virtual_name.to_string(),
                provider: package.name.clone(),
                versions: provides.versions.clone(),
                rank,
            })
            .collect();
        self.add_candidates(Axis::Virtual(virtual_name.to_string()), candidates);
    }

    // --- atoms ---

    /// Compile the constraints `spec` places on node `name`.
    ///
    /// With `presence` an atom for the node being in the graph is always
    /// produced; with `versions` the spec's version constraint is included.
    /// Fails with a reason when the constraint can never be met.
    fn node_atoms(
        &mut self,
        name: &str,
        spec: &AbstractSpec,
        presence: bool,
        versions: bool,
    ) -> Result<Vec<Atom>, String> {
        let index = self.index;
        let mut atoms = Vec::new();

        if let Some(definition) = index.package(name) {
            let axis = Axis::Package(name.to_string());
            if !self.live_axis(&axis) {
                return Err(format!("{name} cannot be part of this graph"));
            }
            let list = if versions {
                spec.versions.clone()
            } else {
                VersionList::any()
            };
            if presence || !list.is_any() {
                let label = if list.is_any() {
                    name.to_string()
                } else {
                    format!("{name}@{list}")
                };
                let version_set =
                    self.version_set(axis, Constraint::new(ConstraintKind::Versions(list)));
                atoms.push(Atom { label, version_set });
            }

            for (variant, values) in &spec.variants {
                let declaration = definition
                    .variant(variant)
                    .ok_or_else(|| format!("{name} has no variant '{variant}'"))?;
                if let Some(bad) = values.iter().find(|v| !declaration.allows(v)) {
                    return Err(format!(
                        "'{bad}' is not a valid value of {name} variant '{variant}'"
                    ));
                }
                if declaration.multi {
                    for value in values {
                        let version_set = self.version_set(
                            Axis::VariantValue {
                                package: name.to_string(),
                                variant: variant.clone(),
                                value: value.clone(),
                            },
                            Constraint::new(ConstraintKind::Values(BTreeSet::from([
                                TRUE.to_string()
                            ]))),
                        );
                        atoms.push(Atom {
                            label: format!("{name} {variant}={value}"),
                            version_set,
                        });
                    }
                } else {
                    if values.len() > 1 {
                        return Err(format!("{name} variant '{variant}' takes a single value"));
                    }
                    let version_set = self.version_set(
                        Axis::Variant {
                            package: name.to_string(),
                            variant: variant.clone(),
                        },
                        Constraint::new(ConstraintKind::Values(values.clone())),
                    );
                    atoms.push(Atom {
                        label: variant_label(name, variant, values),
                        version_set,
                    });
                }
            }

            if let Some(compiler) = &spec.compiler {
                let axis = Axis::Compiler(name.to_string());
                if !self.live_axis(&axis) {
                    return Err(format!("{compiler} is not available, no compilers are configured"));
                }
                let version_set = self.version_set(
                    axis,
                    Constraint::new(ConstraintKind::Compiler(compiler.clone())),
                );
                atoms.push(Atom {
                    label: format!("{name}{compiler}"),
                    version_set,
                });
            }

            if let Some(target) = &spec.target {
                let axis = Axis::Target(name.to_string());
                if !self.live_axis(&axis) {
                    return Err(format!("target {target} is not available"));
                }
                let version_set = self.version_set(
                    axis,
                    Constraint::new(ConstraintKind::Values(BTreeSet::from([target.clone()]))),
                );
                atoms.push(Atom {
                    label: format!("{name} target={target}"),
                    version_set,
                });
            }
        } else if index.is_virtual(name) && self.live_axis(&Axis::Virtual(name.to_string())) {
            if !spec.variants.is_empty() || spec.compiler.is_some() || spec.target.is_some() {
                return Err(format!(
                    "{name} is a virtual package and cannot carry variants, compilers or targets"
                ));
            }
            let list = if versions {
                spec.versions.clone()
            } else {
                VersionList::any()
            };
            if presence || !list.is_any() {
                let label = if list.is_any() {
                    name.to_string()
                } else {
                    format!("{name}@{list}")
                };
                let version_set = self.version_set(
                    Axis::Virtual(name.to_string()),
                    Constraint::new(ConstraintKind::Virtual {
                        versions: list,
                        providers: None,
                    }),
                );
                atoms.push(Atom { label, version_set });
            }
        } else {
            return Err(format!("unknown package '{name}'"));
        }

        for dep in &spec.dependencies {
            let dep_name = dep.name.as_deref().unwrap_or_default();
            let nested = self.node_atoms(dep_name, dep, true, true)?;
            atoms.extend(nested.into_iter().map(|a| Atom {
                label: format!("^{}", a.label),
                version_set: a.version_set,
            }));
        }
        Ok(atoms)
    }

    /// Atoms of a `when` condition attached to `package@version`.
    ///
    /// `None` when the condition can never hold for this version.
    fn when_atoms(
        &mut self,
        package: &str,
        version: &Version,
        when: &AbstractSpec,
    ) -> Option<Vec<VersionSetId>> {
        if !when.versions.contains(version) {
            return None;
        }
        let own = AbstractSpec {
            name: None,
            versions: VersionList::any(),
            dependencies: Vec::new(),
            ..when.clone()
        };
        let mut atoms: Vec<VersionSetId> = self
            .node_atoms(package, &own, false, false)
            .ok()?
            .into_iter()
            .map(|a| a.version_set)
            .collect();
        for dep in &when.dependencies {
            let dep_name = dep.name.as_deref().unwrap_or_default();
            let dep_atoms = self.node_atoms(dep_name, dep, true, true).ok()?;
            atoms.extend(dep_atoms.into_iter().map(|a| a.version_set));
        }
        Some(atoms)
    }

    // --- phase 2 ---

    /// Candidates of node attribute axes exist only together with their package.
    fn add_attribute_rules(&mut self, definition: &PackageDefinition) {
        let name = definition.name.as_str();
        let package_any = self.version_set(
            Axis::Package(name.to_string()),
            Constraint::new(ConstraintKind::Versions(VersionList::any())),
        );

        for variant in &definition.variants {
            let package_versions = self.version_set(
                Axis::Package(name.to_string()),
                Constraint::new(ConstraintKind::Versions(variant.when.versions.clone())),
            );
            let own = AbstractSpec {
                name: None,
                versions: VersionList::any(),
                dependencies: Vec::new(),
                ..variant.when.clone()
            };
            let mut requirements = vec![package_versions];
            match self.node_atoms(name, &own, false, false) {
                Ok(atoms) => requirements.extend(atoms.into_iter().map(|a| a.version_set)),
                Err(_) => continue,
            }
            let mut unsatisfiable_when = false;
            for dep in &variant.when.dependencies {
                let dep_name = dep.name.as_deref().unwrap_or_default();
                match self.node_atoms(dep_name, dep, true, true) {
                    Ok(atoms) => requirements.extend(atoms.into_iter().map(|a| a.version_set)),
                    Err(_) => unsatisfiable_when = true,
                }
            }

            let axes: Vec<Axis> = if variant.multi {
                variant
                    .values
                    .iter()
                    .map(|value| Axis::VariantValue {
                        package: name.to_string(),
                        variant: variant.name.clone(),
                        value: value.clone(),
                    })
                    .collect()
            } else {
                vec![Axis::Variant {
                    package: name.to_string(),
                    variant: variant.name.clone(),
                }]
            };
            for axis in axes {
                let Some(axis_id) = self.pool.lookup_name(&axis) else {
                    continue;
                };
                let ids = self.candidates.get(&axis_id).cloned().unwrap_or_default();
                for id in ids {
                    if unsatisfiable_when {
                        let reason = format!("{name} variant '{}' can never be active", variant.name);
                        self.exclude(id, reason);
                        continue;
                    }
                    let mut facts = SolvableFacts::default();
                    for &vs in &requirements {
                        self.require(&mut facts, STRUCTURAL, None, vec![vs]);
                    }
                    self.dependencies.insert(id, facts);
                }
            }
        }

        for axis in [Axis::Compiler(name.to_string()), Axis::Target(name.to_string())] {
            let Some(axis_id) = self.pool.lookup_name(&axis) else {
                continue;
            };
            let ids = self.candidates.get(&axis_id).cloned().unwrap_or_default();
            for id in ids {
                let mut facts = SolvableFacts::default();
                self.require(&mut facts, STRUCTURAL, None, vec![package_any]);
                if let Axis::Compiler(_) = axis {
                    self.add_compiler_target_support(name, id, &mut facts);
                }
                self.dependencies.insert(id, facts);
            }
        }
    }

    fn add_compiler_target_support(
        &mut self,
        package: &str,
        compiler_candidate: SolvableId,
        facts: &mut SolvableFacts,
    ) {
        let config = self.config;
        let target_axis = Axis::Target(package.to_string());
        if !self.live_axis(&target_axis) {
            return;
        }
        let Candidate::Compiler { rank, .. } = self.pool.resolve_solvable(compiler_candidate)
        else {
            return;
        };
        let rank = *rank;
        let entry = &config.compilers[rank];
        if entry.targets.is_empty() {
            return;
        }
        let fact = match self.compiler_facts.get(&rank) {
            Some(&fact) => fact,
            None => {
                let fact = self.fact(FactOrigin::CompilerTargets {
                    compiler: entry.spec.to_string(),
                    targets: entry.targets.clone(),
                });
                self.compiler_facts.insert(rank, fact);
                fact
            }
        };
        let supported: BTreeSet<String> = entry.targets.iter().cloned().collect();
        let version_set =
            self.version_set(target_axis, Constraint::new(ConstraintKind::Values(supported)));
        facts.constrains.push(FactConstraint { fact, version_set });
    }

    fn add_package_rules(&mut self, definition: &PackageDefinition) {
        let name = definition.name.as_str();
        let Some(axis) = self.pool.lookup_name(&Axis::Package(name.to_string())) else {
            return;
        };
        let ids = self.candidates.get(&axis).cloned().unwrap_or_default();

        for id in ids {
            let Candidate::Package {
                version, origin, ..
            } = self.pool.resolve_solvable(id).clone()
            else {
                continue;
            };
            let mut facts = SolvableFacts::default();

            // Every node has a compiler and a target when those are configured.
            for attribute in [Axis::Compiler(name.to_string()), Axis::Target(name.to_string())] {
                if self.live_axis(&attribute) {
                    let any = self.version_set(attribute, Constraint::any());
                    self.require(&mut facts, STRUCTURAL, None, vec![any]);
                }
            }

            self.add_variant_rules(definition, &version, &mut facts);
            let pinned = match &origin {
                Origin::Build => {
                    self.add_dependency_rules(definition, &version, &mut facts);
                    Ok(())
                }
                Origin::External { prefix } => {
                    self.add_external_rules(name, &version, prefix, &mut facts)
                }
                Origin::Installed { hash } => self.add_installed_rules(name, hash, &mut facts),
            };
            if let Err(reason) = pinned {
                self.exclude(id, reason);
                continue;
            }
            self.add_conflict_rules(definition, &version, &mut facts);
            self.add_provider_exclusivity(definition, &version, &mut facts);
            self.add_requirement_rules(name, &version, &mut facts);

            self.dependencies.insert(id, facts);
        }
    }

    /// An external pins the attributes its configuration entry names and
    /// brings no dependencies.
    fn add_external_rules(
        &mut self,
        name: &str,
        version: &Version,
        prefix: &str,
        facts: &mut SolvableFacts,
    ) -> Result<(), String> {
        let config = self.config;
        let Some(entry) = config.externals(name).iter().find(|e| {
            e.prefix == prefix && e.spec.versions.point() == Some(version)
        }) else {
            return Ok(());
        };
        let own = AbstractSpec {
            name: None,
            versions: VersionList::any(),
            dependencies: Vec::new(),
            ..entry.spec.clone()
        };
        let atoms = self
            .node_atoms(name, &own, false, false)
            .map_err(|reason| format!("external {name}@{version} in {prefix}: {reason}"))?;
        for atom in atoms {
            self.require(facts, STRUCTURAL, None, vec![atom.version_set]);
        }
        Ok(())
    }

    /// An installed node pins all of its attributes, and its dependencies
    /// to the installed nodes it was built against.
    fn add_installed_rules(
        &mut self,
        name: &str,
        hash: &str,
        facts: &mut SolvableFacts,
    ) -> Result<(), String> {
        let Some(node) = self
            .reusable
            .get(name)
            .and_then(|nodes| nodes.iter().find(|r| r.spec.hash() == hash))
        else {
            return Ok(());
        };
        let pinned = AbstractSpec {
            name: None,
            versions: VersionList::any(),
            ..node.spec.to_abstract()
        };
        let edges = node.dependencies.clone();

        let mut atoms: Vec<VersionSetId> = self
            .node_atoms(name, &pinned, false, false)?
            .into_iter()
            .map(|a| a.version_set)
            .collect();
        // Values of a multi-valued variant the node was built without.
        let index = self.index;
        if let Some(definition) = index.package(name) {
            for variant in definition.variants.iter().filter(|v| v.multi) {
                let Some(enabled) = pinned.variants.get(&variant.name) else {
                    continue;
                };
                for value in variant.values.iter().filter(|v| !enabled.contains(*v)) {
                    atoms.push(self.version_set(
                        Axis::VariantValue {
                            package: name.to_string(),
                            variant: variant.name.clone(),
                            value: value.clone(),
                        },
                        Constraint::new(ConstraintKind::Values(BTreeSet::from([
                            FALSE.to_string()
                        ]))),
                    ));
                }
            }
        }
        for atom in atoms {
            self.require(facts, STRUCTURAL, None, vec![atom]);
        }

        for edge in edges {
            let axis = Axis::Package(edge.name.clone());
            if !self.live_axis(&axis) {
                return Err(format!("{} cannot be part of this graph", edge.name));
            }
            let fact = self.fact(FactOrigin::Dependency {
                package: name.to_string(),
                dependency: edge.name.clone(),
                spec: format!("{}/{}", edge.name, &edge.hash[..7.min(edge.hash.len())]),
                when: String::new(),
                types: edge.types,
            });
            let installed =
                self.version_set(axis, Constraint::new(ConstraintKind::Installed(edge.hash)));
            self.require(facts, fact, None, vec![installed]);

            for virtual_name in edge.virtuals {
                let axis = Axis::Virtual(virtual_name.clone());
                if !self.live_axis(&axis) {
                    continue;
                }
                let fact = self.fact(FactOrigin::Dependency {
                    package: name.to_string(),
                    dependency: virtual_name.clone(),
                    spec: virtual_name,
                    when: String::new(),
                    types: edge.types,
                });
                let provided = self.version_set(
                    axis,
                    Constraint::new(ConstraintKind::Virtual {
                        versions: VersionList::any(),
                        providers: Some(BTreeSet::from([edge.name.clone()])),
                    }),
                );
                self.require(facts, fact, None, vec![provided]);
            }
        }
        Ok(())
    }

    /// Each `require` entry of the package configuration must hold on the
    /// node, whatever its origin.
    fn add_requirement_rules(&mut self, name: &str, version: &Version, facts: &mut SolvableFacts) {
        let config = self.config;
        for (i, required) in config.requirements(name).iter().enumerate() {
            let fact = self.declaration_fact(name, DeclarationKind::Requirement, i, || {
                FactOrigin::Requirement {
                    package: name.to_string(),
                    spec: required.to_string(),
                }
            });
            if !required.versions.contains(version) {
                let reason = format!("{name}@{version} does not satisfy '{required}'");
                self.forbid(facts, fact, reason, &[]);
                continue;
            }
            let own = AbstractSpec {
                name: None,
                versions: VersionList::any(),
                ..required.clone()
            };
            match self.node_atoms(name, &own, false, false) {
                Ok(atoms) => {
                    for atom in atoms {
                        self.require(facts, fact, None, vec![atom.version_set]);
                    }
                }
                Err(reason) => self.forbid(facts, fact, reason, &[]),
            }
        }
    }

    fn add_variant_rules(
        &mut self,
        definition: &PackageDefinition,
        version: &Version,
        facts: &mut SolvableFacts,
    ) {
        let name = definition.name.as_str();
        for variant in &definition.variants {
            let Some(atoms) = self.when_atoms(name, version, &variant.when) else {
                continue;
            };
            let condition = self.pool.intern_conjunction(&atoms);
            if variant.multi {
                let mut enabled = Vec::new();
                for value in &variant.values {
                    let axis = Axis::VariantValue {
                        package: name.to_string(),
                        variant: variant.name.clone(),
                        value: value.clone(),
                    };
                    let any = self.version_set(axis.clone(), Constraint::any());
                    self.require(facts, STRUCTURAL, condition, vec![any]);
                    enabled.push(self.version_set(
                        axis,
                        Constraint::new(ConstraintKind::Values(BTreeSet::from([
                            TRUE.to_string()
                        ]))),
                    ));
                }
                // A multi-valued variant holds at least one value.
                self.require(facts, STRUCTURAL, condition, enabled);
            } else {
                let any = self.version_set(
                    Axis::Variant {
                        package: name.to_string(),
                        variant: variant.name.clone(),
                    },
                    Constraint::any(),
                );
                self.require(facts, STRUCTURAL, condition, vec![any]);
            }
        }
    }

    fn add_dependency_rules(
        &mut self,
        definition: &PackageDefinition,
        version: &Version,
        facts: &mut SolvableFacts,
    ) {
        let name = definition.name.as_str();
        for (i, dependency) in definition.dependencies.iter().enumerate() {
            let Some(atoms) = self.when_atoms(name, version, &dependency.when) else {
                continue;
            };
            let fact = self.declaration_fact(name, DeclarationKind::Dependency, i, || {
                FactOrigin::Dependency {
                    package: name.to_string(),
                    dependency: dependency.name().to_string(),
                    spec: dependency.spec.to_string(),
                    when: dependency.when.to_string(),
                    types: dependency.types,
                }
            });
            let condition = self.pool.intern_conjunction(&atoms);
            match self.node_atoms(dependency.name(), &dependency.spec, true, true) {
                Ok(required) => {
                    for atom in required {
                        self.require(facts, fact, condition, vec![atom.version_set]);
                    }
                }
                Err(reason) => self.forbid(facts, fact, reason, &atoms),
            }
        }
    }

    fn add_conflict_rules(
        &mut self,
        definition: &PackageDefinition,
        version: &Version,
        facts: &mut SolvableFacts,
    ) {
        let name = definition.name.as_str();
        for (i, conflict) in definition.conflicts.iter().enumerate() {
            let Some(mut atoms) = self.when_atoms(name, version, &conflict.when) else {
                continue;
            };

            // The conflicting spec: anonymous or naming the package itself
            // constrains this node, any other name is a dependency.
            let targets_self = conflict.spec.name.as_deref().is_none_or(|n| n == name);
            let constraint_atoms = if targets_self {
                self.when_atoms(name, version, &conflict.spec)
            } else {
                let other = conflict.spec.name.as_deref().unwrap_or_default();
                self.node_atoms(other, &conflict.spec, true, true)
                    .ok()
                    .map(|a| a.into_iter().map(|a| a.version_set).collect())
            };
            let Some(constraint_atoms) = constraint_atoms else {
                continue;
            };
            atoms.extend(constraint_atoms);

            let fact = self.declaration_fact(name, DeclarationKind::Conflict, i, || {
                FactOrigin::Conflict {
                    package: name.to_string(),
                    spec: conflict.spec.to_string(),
                    when: conflict.when.to_string(),
                    message: conflict.message.clone(),
                }
            });
            let reason = self.origins[fact.0].to_string();
            self.forbid(facts, fact, reason, &atoms);
        }
    }

    /// A package providing a virtual in the graph must be the provider
    /// selected for that virtual.
    fn add_provider_exclusivity(
        &mut self,
        definition: &PackageDefinition,
        version: &Version,
        facts: &mut SolvableFacts,
    ) {
        let name = definition.name.as_str();
        for provides in &definition.provides {
            let virtual_axis = Axis::Virtual(provides.virtual_name.clone());
            if !self.live_axis(&virtual_axis) {
                continue;
            }
            let Some(mut atoms) = self.when_atoms(name, version, &provides.when) else {
                continue;
            };
            let others: BTreeSet<String> = self
                .index
                .providers_of(&provides.virtual_name)
                .iter()
                .map(|p| p.name.clone())
                .filter(|p| p != name)
                .collect();
            if others.is_empty() {
                continue;
            }
            atoms.push(self.version_set(
                virtual_axis,
                Constraint::new(ConstraintKind::Virtual {
                    versions: VersionList::any(),
                    providers: Some(others),
                }),
            ));
            let reason = format!(
                "{name} provides {} in this graph, so no other provider may be used",
                provides.virtual_name
            );
            self.forbid(facts, STRUCTURAL, reason, &atoms);
        }
    }

    /// A provider candidate selects its package under the `provides` condition.
    fn add_provider_rules(&mut self, virtual_name: &str) {
        let Some(axis) = self.pool.lookup_name(&Axis::Virtual(virtual_name.to_string())) else {
            return;
        };
        let index = self.index;
        let ids = self.candidates.get(&axis).cloned().unwrap_or_default();
        let declarations = index.provider_declarations(virtual_name);

        for id in ids {
            let Candidate::Provider {
                provider, versions, ..
            } = self.pool.resolve_solvable(id).clone()
            else {
                continue;
            };
            let Some((_, provides)) = declarations
                .iter()
                .find(|(p, d)| p.name == provider && d.versions == versions)
            else {
                continue;
            };
            let mut facts = SolvableFacts::default();
            let mut requirements = vec![self.version_set(
                Axis::Package(provider.clone()),
                Constraint::new(ConstraintKind::Versions(provides.when.versions.clone())),
            )];
            let own = AbstractSpec {
                name: None,
                versions: VersionList::any(),
                ..provides.when.clone()
            };
            match self.node_atoms(&provider, &own, false, false) {
                Ok(atoms) => requirements.extend(atoms.into_iter().map(|a| a.version_set)),
                Err(reason) => {
                    self.exclude(id, reason);
                    continue;
                }
            }
            for vs in requirements {
                self.require(&mut facts, STRUCTURAL, None, vec![vs]);
            }
            self.dependencies.insert(id, facts);
        }
    }

    // --- phase 3 ---

    fn add_request(
        &mut self,
        request: &AbstractSpec,
    ) -> Result<(SolvableId, VersionSetId, NameId), ConcretizeError> {
        let root_name = request.name.clone().unwrap_or_default();
        let root = self.add_candidates(Axis::Request, vec![Candidate::Request])[0];
        let root_requirement = self.version_set(Axis::Request, Constraint::any());
        let mut facts = SolvableFacts::default();

        let node = AbstractSpec {
            dependencies: Vec::new(),
            ..request.clone()
        };
        let unsatisfiable = |reason: String| ConcretizeError::UnsatisfiableRequest {
            request: request.to_string(),
            reason,
        };
        let mut atoms = self
            .node_atoms(&root_name, &node, true, true)
            .map_err(unsatisfiable)?;
        for dep in &request.dependencies {
            let dep_name = dep.name.as_deref().unwrap_or_default();
            let dep_atoms = self
                .node_atoms(dep_name, dep, true, true)
                .map_err(unsatisfiable)?;
            atoms.extend(dep_atoms.into_iter().map(|a| Atom {
                label: format!("^{}", a.label),
                version_set: a.version_set,
            }));
        }
        for atom in atoms {
            let fact = self.fact(FactOrigin::Request { atom: atom.label });
            self.require(&mut facts, fact, None, vec![atom.version_set]);
        }
        self.dependencies.insert(root, facts);

        let root_axis = if self.index.package(&root_name).is_some() {
            Axis::Package(root_name)
        } else {
            Axis::Virtual(root_name)
        };
        let root_axis = self.pool.intern_name(root_axis);
        Ok((root, root_requirement, root_axis))
    }
}

fn variant_label(package: &str, variant: &str, values: &BTreeSet<String>) -> String {
    if values.len() == 1 && values.contains(TRUE) {
        format!("{package}+{variant}")
    } else if values.len() == 1 && values.contains(FALSE) {
        format!("{package}~{variant}")
    } else {
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        format!("{package} {variant}={}", values.join(","))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::solver::Concretizer;

    fn index(json: &str) -> RepositoryIndex {
        RepositoryIndex::from_repository(&InMemoryRepository::from_json(json).unwrap()).unwrap()
    }

    fn spec(s: &str) -> AbstractSpec {
        AbstractSpec::parse(s).unwrap()
    }

    fn names_of(facts: &Facts, axis: &Axis) -> Vec<String> {
        let id = facts.pool().lookup_name(axis).unwrap();
        facts
            .candidates(id)
            .unwrap()
            .iter()
            .map(|&s| facts.pool().resolve_solvable(s).to_string())
            .collect()
    }

    #[test]
    fn versions_are_ordered_by_preference() {
        let idx = index(
            r#"[{"name": "a", "versions": [
                "1.0", "2.0", "develop", {"version": "1.5", "preferred": true},
                {"version": "3.0", "deprecated": true}
            ]}]"#,
        );
        let facts = Facts::build(&idx, &SolverConfig::default(), &spec("a")).unwrap();
        assert_eq!(
            names_of(&facts, &Axis::Package("a".into())),
            vec!["a@1.5", "a@2.0", "a@1.0", "a@develop", "a@3.0"]
        );
    }

    #[test]
    fn config_version_preference_wins() {
        let idx = index(r#"[{"name": "a", "versions": ["1.0", "2.0"]}]"#);
        let config = SolverConfig::from_toml_str("[packages.a]\nversions = [\"1\"]").unwrap();
        let facts = Facts::build(&idx, &config, &spec("a")).unwrap();
        assert_eq!(
            names_of(&facts, &Axis::Package("a".into())),
            vec!["a@1.0", "a@2.0"]
        );
    }

    #[test]
    fn deprecated_versions_can_be_excluded() {
        let idx = index(
            r#"[{"name": "a", "versions": ["1.0", {"version": "2.0", "deprecated": true}]}]"#,
        );
        let config = SolverConfig::from_toml_str("deprecated = \"forbid\"").unwrap();
        let facts = Facts::build(&idx, &config, &spec("a")).unwrap();
        let axis = facts.package_axis("a").unwrap();
        assert_eq!(facts.excluded(axis).len(), 1);
        let err = Facts::build(&idx, &config, &spec("a@2.0")).unwrap_err();
        assert!(err.to_string().contains("deprecated"));
    }

    #[test]
    fn variant_default_comes_first() {
        let idx = index(
            r#"[{"name": "a", "versions": ["1.0"], "variants": [
                {"name": "shared", "default": ["true"], "values": ["false", "true"]},
                {"name": "api", "default": ["v18"], "values": ["v16", "v18", "v110"]}
            ]}]"#,
        );
        let facts = Facts::build(&idx, &SolverConfig::default(), &spec("a")).unwrap();
        let shared = Axis::Variant {
            package: "a".into(),
            variant: "shared".into(),
        };
        assert_eq!(names_of(&facts, &shared), vec!["a+shared", "a~shared"]);
        let api = Axis::Variant {
            package: "a".into(),
            variant: "api".into(),
        };
        assert_eq!(names_of(&facts, &api), vec!["a api=v18", "a api=v16", "a api=v110"]);
    }

    #[test]
    fn providers_follow_priority_and_config() {
        let json = r#"[
            {"name": "app", "versions": ["1"], "dependencies": ["mpi"]},
            {"name": "mpich", "versions": ["4.1"], "provides": ["mpi"]},
            {"name": "openmpi", "versions": ["5.0"], "provides": [{"virtual": "mpi", "priority": 1}]}
        ]"#;
        let idx = index(json);
        let facts = Facts::build(&idx, &SolverConfig::default(), &spec("app")).unwrap();
        assert_eq!(
            names_of(&facts, &Axis::Virtual("mpi".into())),
            vec!["openmpi (as mpi)", "mpich (as mpi)"]
        );

        let config = SolverConfig::default().with_provider_preference("mpi", &["mpich"]);
        let facts = Facts::build(&idx, &config, &spec("app")).unwrap();
        assert_eq!(
            names_of(&facts, &Axis::Virtual("mpi".into())),
            vec!["mpich (as mpi)", "openmpi (as mpi)"]
        );
    }

    #[test]
    fn request_atoms_are_separate_facts() {
        let idx = index(
            r#"[
                {"name": "a", "versions": ["1.0"], "variants": [{"name": "x", "default": ["false"], "values": ["true", "false"]}]},
                {"name": "b", "versions": ["3.0"]}
            ]"#,
        );
        let facts = Facts::build(&idx, &SolverConfig::default(), &spec("a+x ^b@3.0")).unwrap();
        let atoms: Vec<String> = facts
            .maskable_facts()
            .into_iter()
            .filter_map(|f| match facts.origin(f) {
                FactOrigin::Request { atom } => Some(atom.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(atoms, vec!["a", "a+x", "^b@3.0"]);
    }

    #[test]
    fn conditional_dependency_carries_condition() {
        let idx = index(
            r#"[
                {"name": "a", "versions": ["1.0", "2.0"],
                 "variants": [{"name": "io", "default": ["false"], "values": ["true", "false"]}],
                 "dependencies": [{"spec": "hdf5", "when": "@2: +io"}]},
                {"name": "hdf5", "versions": ["1.14"]}
            ]"#,
        );
        let facts = Facts::build(&idx, &SolverConfig::default(), &spec("a")).unwrap();
        let axis = facts.package_axis("a").unwrap();
        for &s in facts.candidates(axis).unwrap() {
            let label = facts.pool().resolve_solvable(s).to_string();
            let deps: Vec<&FactRequirement> = facts
                .facts_of(s)
                .unwrap()
                .requirements
                .iter()
                .filter(|r| matches!(facts.origin(r.fact), FactOrigin::Dependency { .. }))
                .collect();
            if label == "a@2.0" {
                assert_eq!(deps.len(), 1);
                assert!(deps[0].condition.is_some());
            } else {
                assert!(deps.is_empty(), "{label} should not depend on hdf5");
            }
        }
    }

    #[test]
    fn static_contradictions_fail_early() {
        let idx = index(
            r#"[
                {"name": "a", "versions": ["1.0", "2.0"],
                 "variants": [{"name": "api", "default": ["v1"], "values": ["v1", "v2"]}]},
                {"name": "mpich", "versions": ["4.1"], "provides": [{"virtual": "mpi", "versions": ":3.1"}]}
            ]"#,
        );
        let config = SolverConfig::default();
        for request in ["a@3:", "a+nothere", "a api=v3", "a api=v1,v2", "a%gcc", "a target=zen4", "mpi@4:", "mpi+x"] {
            let err = Facts::build(&idx, &config, &spec(request)).unwrap_err();
            assert!(
                matches!(err, ConcretizeError::UnsatisfiableRequest { .. }),
                "{request}: {err}"
            );
        }
        assert!(matches!(
            Facts::build(&idx, &config, &spec("zzz")),
            Err(ConcretizeError::UnknownPackage { .. })
        ));
        assert!(matches!(
            Facts::build(&idx, &config, &spec("a ^zzz")),
            Err(ConcretizeError::UnknownPackage { needed_by: Some(_), .. })
        ));
    }

    #[test]
    fn conflicts_become_guards() {
        let idx = index(
            r#"[
                {"name": "a", "versions": ["1.0"],
                 "variants": [{"name": "feature", "default": ["false"], "values": ["true", "false"]}],
                 "conflicts": [{"spec": "^b@3:", "when": "+feature"}]},
                {"name": "b", "versions": ["3.0"]}
            ]"#,
        );
        let facts = Facts::build(&idx, &SolverConfig::default(), &spec("a ^b")).unwrap();
        let axis = facts.package_axis("a").unwrap();
        let a = facts.candidates(axis).unwrap()[0];
        let conflict = facts
            .facts_of(a)
            .unwrap()
            .requirements
            .iter()
            .find(|r| matches!(facts.origin(r.fact), FactOrigin::Conflict { .. }))
            .unwrap();
        let guard = facts.pool().version_set_name(conflict.alternatives[0]);
        assert_eq!(facts.excluded(guard).len(), 1);
        let atoms = facts.pool().condition_atoms(conflict.condition.unwrap());
        assert_eq!(atoms.len(), 2);
    }

    #[test]
    fn prebuilt_candidates_come_first() {
        let idx = index(r#"[{"name": "a", "versions": ["1.0", "2.0"]}]"#);
        let config = SolverConfig::default()
            .with_external(spec("a@1.5"), "/opt/a")
            .with_buildable("a", false);
        let facts = Facts::build(&idx, &config, &spec("a")).unwrap();
        assert_eq!(
            names_of(&facts, &Axis::Package("a".into())),
            vec!["a@1.5 (external)", "a@2.0", "a@1.0"]
        );
        let axis = facts.package_axis("a").unwrap();
        assert!(facts.has_prebuilt(axis));
        let reasons: Vec<&str> = facts
            .excluded(axis)
            .iter()
            .map(|&(_, r)| facts.pool().resolve_string(r))
            .collect();
        assert_eq!(reasons, vec!["a is not buildable"; 2]);
        // Only the external offers 1.5.
        assert!(Facts::build(&idx, &config, &spec("a@1.5")).is_ok());
    }

    #[test]
    fn requirements_guard_every_candidate() {
        let idx = index(
            r#"[{"name": "a", "versions": ["1.0", "2.0"],
                 "variants": [{"name": "x", "default": ["false"], "values": ["true", "false"]}]}]"#,
        );
        let config = SolverConfig::default().with_requirement("a", spec("@2: +x"));
        let facts = Facts::build(&idx, &config, &spec("a")).unwrap();
        let pool = facts.pool();
        let axis = facts.package_axis("a").unwrap();
        for &s in facts.candidates(axis).unwrap() {
            let label = pool.resolve_solvable(s).to_string();
            let required: Vec<&FactRequirement> = facts
                .facts_of(s)
                .unwrap()
                .requirements
                .iter()
                .filter(|r| matches!(facts.origin(r.fact), FactOrigin::Requirement { .. }))
                .collect();
            assert_eq!(required.len(), 1, "{label}");
            assert!(required[0].condition.is_none());
            let target = pool.resolve_name(pool.version_set_name(required[0].alternatives[0]));
            if label == "a@2.0" {
                assert!(matches!(target, Axis::Variant { .. }), "{target}");
            } else {
                assert!(matches!(target, Axis::Guard(_)), "{target}");
            }
        }
    }

    #[test]
    fn installed_nodes_need_reusable_dependencies() {
        let json = r#"[
            {"name": "a", "versions": ["1.0"], "dependencies": ["b"]},
            {"name": "b", "versions": ["1.0"],
             "variants": [{"name": "x", "default": ["false"], "values": ["true", "false"]}]}
        ]"#;
        let installed = Concretizer::new(Arc::new(index(json)), SolverConfig::default())
            .concretize_str("a")
            .unwrap();
        let config = SolverConfig::default().with_reuse(true);

        let unchanged =
            Facts::build_reusing(&index(json), &config, &[installed.clone()], &spec("a")).unwrap();
        assert_eq!(names_of(&unchanged, &Axis::Package("a".into())).len(), 2);
        assert!(unchanged.has_prebuilt(unchanged.package_axis("b").unwrap()));

        // b has since lost its variant, so neither node can be reused.
        let changed = index(
            r#"[
                {"name": "a", "versions": ["1.0"], "dependencies": ["b"]},
                {"name": "b", "versions": ["1.0"]}
            ]"#,
        );
        let facts = Facts::build_reusing(&changed, &config, &[installed], &spec("a")).unwrap();
        assert_eq!(names_of(&facts, &Axis::Package("a".into())), vec!["a@1.0"]);
        assert_eq!(names_of(&facts, &Axis::Package("b".into())), vec!["b@1.0"]);
    }
}

