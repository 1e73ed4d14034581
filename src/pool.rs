//! Arena-based pool mapping resolvo IDs to concretization facts.
//!
//! [`FactPool`] provides the storage that backs every resolvo identifier
//! ([`NameId`], [`SolvableId`], [`VersionSetId`], etc.) with a concrete
//! value: names are solver [`Axis`] values, solvables are [`Candidate`]s
//! and version sets are [`Constraint`]s on one axis. The fact builder fills
//! the pool; the resolvo provider and the optimizing search read it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use resolvo::{ArenaId, ConditionId, NameId, SolvableId, StringId, VersionSetId, VersionSetUnionId};
use serde::Serialize;

use crate::spec::{CompilerConstraint, CompilerSpec, FALSE, TRUE};
use crate::version::{Version, VersionList};

/// A decision axis. At most one candidate per axis is selected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Which version of a package.
    Package(String),
    /// Which provider implements a virtual.
    Virtual(String),
    /// The value of a single-valued (or boolean) variant.
    Variant { package: String, variant: String },
    /// Whether one value of a multi-valued variant is enabled.
    VariantValue {
        package: String,
        variant: String,
        value: String,
    },
    /// The compiler building a package.
    Compiler(String),
    /// The target a package is built for.
    Target(String),
    /// An axis whose only candidate is forbidden. Requiring it under a
    /// condition forbids the condition.
    Guard(String),
    /// The synthetic root holding the request's requirements.
    Request,
}

impl Axis {
    /// The package this axis belongs to, if any.
    pub fn package(&self) -> Option<&str> {
        match self {
            Axis::Package(p)
            | Axis::Variant { package: p, .. }
            | Axis::VariantValue { package: p, .. }
            | Axis::Compiler(p)
            | Axis::Target(p) => Some(p),
            Axis::Virtual(_) | Axis::Guard(_) | Axis::Request => None,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Package(p) => write!(f, "{p}"),
            Axis::Virtual(v) => write!(f, "{v}"),
            Axis::Variant { package, variant } => write!(f, "{package} variant '{variant}'"),
            Axis::VariantValue {
                package,
                variant,
                value,
            } => write!(f, "{package} variant '{variant}={value}'"),
            Axis::Compiler(p) => write!(f, "compiler for {p}"),
            Axis::Target(p) => write!(f, "target for {p}"),
            Axis::Guard(description) => write!(f, "{description}"),
            Axis::Request => write!(f, "request"),
        }
    }
}

/// Where the bits of a package node come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum Origin {
    /// Built from source.
    #[default]
    Build,
    /// Provided by the system at `prefix`, never built.
    External { prefix: String },
    /// An installed node reused as is.
    Installed { hash: String },
}

impl Origin {
    pub fn is_build(&self) -> bool {
        matches!(self, Origin::Build)
    }
}

/// One selectable value of an [`Axis`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Package {
        name: String,
        version: Version,
        deprecated: bool,
        /// Position in the package's preference order, 0 is best.
        rank: usize,
        origin: Origin,
    },
    Provider {
        virtual_name: String,
        provider: String,
        /// Versions of the virtual interface this provider implements.
        versions: VersionList,
        rank: usize,
    },
    VariantValue {
        package: String,
        variant: String,
        value: String,
        /// Whether this is the (possibly configured) default.
        default: bool,
    },
    Compiler {
        package: String,
        compiler: CompilerSpec,
        rank: usize,
    },
    Target {
        package: String,
        target: String,
        rank: usize,
    },
    /// The sole, excluded candidate of a [`Axis::Guard`].
    Forbidden { reason: String },
    Request,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::Package {
                name,
                version,
                origin,
                ..
            } => {
                write!(f, "{name}@{version}")?;
                match origin {
                    Origin::Build => Ok(()),
                    Origin::External { .. } => write!(f, " (external)"),
                    Origin::Installed { hash } => write!(f, "/{}", &hash[..7.min(hash.len())]),
                }
            }
            Candidate::Provider {
                virtual_name,
                provider,
                ..
            } => write!(f, "{provider} (as {virtual_name})"),
            Candidate::VariantValue {
                package,
                variant,
                value,
                ..
            } => match value.as_str() {
                TRUE => write!(f, "{package}+{variant}"),
                FALSE => write!(f, "{package}~{variant}"),
                _ => write!(f, "{package} {variant}={value}"),
            },
            Candidate::Compiler {
                package, compiler, ..
            } => write!(f, "{package}%{compiler}"),
            Candidate::Target {
                package, target, ..
            } => write!(f, "{package} target={target}"),
            Candidate::Forbidden { reason } => write!(f, "{reason}"),
            Candidate::Request => write!(f, "request"),
        }
    }
}

/// What a [`Constraint`] accepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    Versions(VersionList),
    /// Provider candidates implementing these versions of the virtual,
    /// optionally restricted to the named providers.
    Virtual {
        versions: VersionList,
        providers: Option<BTreeSet<String>>,
    },
    /// Variant or target candidates with one of these values.
    Values(BTreeSet<String>),
    Compiler(CompilerConstraint),
    /// The installed package node with this hash.
    Installed(String),
    Any,
}

/// A set of candidates on one axis (a resolvo version set).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub kind: ConstraintKind,
}

impl Constraint {
    pub fn new(kind: ConstraintKind) -> Self {
        Self { kind }
    }

    pub fn any() -> Self {
        Self::new(ConstraintKind::Any)
    }

    /// Whether `candidate` belongs to this set.
    pub fn matches(&self, candidate: &Candidate) -> bool {
        match (&self.kind, candidate) {
            (ConstraintKind::Any, _) => true,
            (ConstraintKind::Versions(list), Candidate::Package { version, .. }) => {
                list.contains(version)
            }
            (
                ConstraintKind::Virtual {
                    versions,
                    providers,
                },
                Candidate::Provider {
                    provider,
                    versions: provided,
                    ..
                },
            ) => {
                versions.overlaps(provided)
                    && providers.as_ref().is_none_or(|allowed| allowed.contains(provider))
            }
            (ConstraintKind::Values(values), Candidate::VariantValue { value, .. }) => {
                values.contains(value)
            }
            (ConstraintKind::Values(values), Candidate::Target { target, .. }) => {
                values.contains(target)
            }
            (ConstraintKind::Compiler(constraint), Candidate::Compiler { compiler, .. }) => {
                constraint.matches(compiler)
            }
            (
                ConstraintKind::Installed(hash),
                Candidate::Package {
                    origin: Origin::Installed { hash: have },
                    ..
                },
            ) => hash == have,
            _ => false,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConstraintKind::Any => write!(f, "*"),
            ConstraintKind::Versions(list) => write!(f, "@{list}"),
            ConstraintKind::Virtual {
                versions,
                providers,
            } => {
                write!(f, "@{versions}")?;
                if let Some(providers) = providers {
                    let names: Vec<&str> = providers.iter().map(String::as_str).collect();
                    write!(f, " from {}", names.join("|"))?;
                }
                Ok(())
            }
            ConstraintKind::Values(values) => {
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                write!(f, "={}", values.join("|"))
            }
            ConstraintKind::Compiler(c) => write!(f, "{c}"),
            ConstraintKind::Installed(hash) => write!(f, "/{hash}"),
        }
    }
}

/// A solver predicate used as the condition of a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Predicate {
    /// True when the axis of the version set is assigned a matching candidate.
    Holds(VersionSetId),
    /// Both conditions hold.
    All(ConditionId, ConditionId),
}

/// Storage behind every id handed to resolvo for one request.
///
/// Ids index plain vectors. Axes, constraints and predicates are
/// deduplicated through reverse maps; candidates, unions and strings are not.
#[derive(Debug, Default)]
pub struct FactPool {
    // axes
    pub(crate) names: Vec<Axis>,
    pub(crate) names_rev: HashMap<Axis, NameId>,

    // candidates
    pub(crate) solvables: Vec<Candidate>,
    pub(crate) solvable_names: Vec<NameId>,

    // constraints
    pub(crate) version_sets: Vec<Constraint>,
    pub(crate) version_set_names: Vec<NameId>,
    pub(crate) version_sets_rev: HashMap<(NameId, Constraint), VersionSetId>,

    pub(crate) version_set_unions: Vec<Vec<VersionSetId>>,

    // predicates
    pub(crate) conditions: Vec<Predicate>,
    pub(crate) conditions_rev: HashMap<Predicate, ConditionId>,

    pub(crate) strings: Vec<String>,
}

impl FactPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an axis, returning the existing ID if already interned.
    pub fn intern_name(&mut self, axis: Axis) -> NameId {
        if let Some(&id) = self.names_rev.get(&axis) {
            return id;
        }
        let id = NameId::from_usize(self.names.len());
        self.names_rev.insert(axis.clone(), id);
        self.names.push(axis);
        id
    }

    /// Look up an already interned axis.
    pub fn lookup_name(&self, axis: &Axis) -> Option<NameId> {
        self.names_rev.get(axis).copied()
    }

    /// Look up the [`Axis`] for a [`NameId`].
    pub fn resolve_name(&self, id: NameId) -> &Axis {
        &self.names[id.to_usize()]
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    /// Add a candidate to the pool.
    pub fn intern_solvable(&mut self, name_id: NameId, candidate: Candidate) -> SolvableId {
        let id = SolvableId::from_usize(self.solvables.len());
        self.solvables.push(candidate);
        self.solvable_names.push(name_id);
        id
    }

    /// Look up the candidate for a [`SolvableId`].
    pub fn resolve_solvable(&self, id: SolvableId) -> &Candidate {
        &self.solvables[id.to_usize()]
    }

    /// The axis a candidate belongs to.
    pub fn solvable_name(&self, id: SolvableId) -> NameId {
        self.solvable_names[id.to_usize()]
    }

    pub fn solvable_count(&self) -> usize {
        self.solvables.len()
    }

    /// Intern a constraint on an axis, deduplicating by value.
    pub fn intern_version_set(&mut self, name_id: NameId, constraint: Constraint) -> VersionSetId {
        let key = (name_id, constraint);
        if let Some(&id) = self.version_sets_rev.get(&key) {
            return id;
        }
        let id = VersionSetId::from_usize(self.version_sets.len());
        self.version_sets.push(key.1.clone());
        self.version_set_names.push(name_id);
        self.version_sets_rev.insert(key, id);
        id
    }

    pub fn resolve_version_set(&self, id: VersionSetId) -> &Constraint {
        &self.version_sets[id.to_usize()]
    }

    /// The axis a constraint restricts.
    pub fn version_set_name(&self, id: VersionSetId) -> NameId {
        self.version_set_names[id.to_usize()]
    }

    /// Whether `solvable` belongs to `version_set`.
    pub fn version_set_contains(&self, version_set: VersionSetId, solvable: SolvableId) -> bool {
        self.solvable_name(solvable) == self.version_set_name(version_set)
            && self
                .resolve_version_set(version_set)
                .matches(self.resolve_solvable(solvable))
    }

    /// Alternatives of a requirement; any one of them fulfils it.
    pub fn intern_version_set_union(&mut self, sets: Vec<VersionSetId>) -> VersionSetUnionId {
        let id = VersionSetUnionId::from_usize(self.version_set_unions.len());
        self.version_set_unions.push(sets);
        id
    }

    pub fn resolve_version_set_union(&self, id: VersionSetUnionId) -> &[VersionSetId] {
        &self.version_set_unions[id.to_usize()]
    }

    /// Intern a predicate, deduplicating by value.
    pub fn intern_condition(&mut self, predicate: Predicate) -> ConditionId {
        if let Some(&id) = self.conditions_rev.get(&predicate) {
            return id;
        }
        let id = ConditionId::from_usize(self.conditions.len());
        self.conditions.push(predicate);
        self.conditions_rev.insert(predicate, id);
        id
    }

    /// Intern the conjunction of `atoms`. `None` when there are no atoms.
    pub fn intern_conjunction(&mut self, atoms: &[VersionSetId]) -> Option<ConditionId> {
        let mut iter = atoms.iter();
        let first = *iter.next()?;
        let mut acc = self.intern_condition(Predicate::Holds(first));
        for &atom in iter {
            let next = self.intern_condition(Predicate::Holds(atom));
            acc = self.intern_condition(Predicate::All(acc, next));
        }
        Some(acc)
    }

    /// Look up a predicate.
    pub fn resolve_condition(&self, id: ConditionId) -> Predicate {
        self.conditions[id.to_usize()]
    }

    /// The version sets a condition is a conjunction of.
    pub fn condition_atoms(&self, id: ConditionId) -> Vec<VersionSetId> {
        let mut atoms = Vec::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            match self.resolve_condition(id) {
                Predicate::Holds(vs) => atoms.push(vs),
                Predicate::All(a, b) => {
                    stack.push(b);
                    stack.push(a);
                }
            }
        }
        atoms
    }

    /// Exclusion reasons reported through resolvo.
    pub fn intern_string(&mut self, s: String) -> StringId {
        let id = StringId::from_usize(self.strings.len());
        self.strings.push(s);
        id
    }

    pub fn resolve_string(&self, id: StringId) -> &str {
        &self.strings[id.to_usize()]
    }
}
