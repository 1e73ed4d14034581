//! Package definitions as seen by the concretizer.
//!
//! A [`PackageDefinition`] is the declarative content of a package recipe:
//! the versions it can build, its variants, dependencies, conflicts and
//! the virtual packages it provides. Recipes are executed elsewhere; the
//! concretizer only consumes this data, usually deserialized from JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConcretizeError;
use crate::spec::{AbstractSpec, FALSE, TRUE};
use crate::version::{Version, VersionList};

/// Dependency type: when the dependency is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepType {
    Build,
    Link,
    Run,
    Test,
}

impl DepType {
    const ALL: [DepType; 4] = [DepType::Build, DepType::Link, DepType::Run, DepType::Test];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for DepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepType::Build => write!(f, "build"),
            DepType::Link => write!(f, "link"),
            DepType::Run => write!(f, "run"),
            DepType::Test => write!(f, "test"),
        }
    }
}

/// A set of [`DepType`]s. Defaults to `build,link`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<DepType>", into = "Vec<DepType>")]
pub struct DepTypes(u8);

impl DepTypes {
    pub const NONE: DepTypes = DepTypes(0);

    pub fn contains(self, ty: DepType) -> bool {
        self.0 & ty.bit() != 0
    }

    pub fn union(self, other: DepTypes) -> DepTypes {
        DepTypes(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = DepType> {
        DepType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl Default for DepTypes {
    fn default() -> Self {
        DepTypes::from(vec![DepType::Build, DepType::Link])
    }
}

impl From<Vec<DepType>> for DepTypes {
    fn from(types: Vec<DepType>) -> Self {
        DepTypes(types.into_iter().fold(0, |acc, t| acc | t.bit()))
    }
}

impl From<DepTypes> for Vec<DepType> {
    fn from(types: DepTypes) -> Self {
        types.iter().collect()
    }
}

impl fmt::Display for DepTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|t| t.to_string()).collect();
        write!(f, "{}", names.join(","))
    }
}

/// One buildable version of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "VersionDeclarationRepr")]
pub struct VersionDeclaration {
    pub version: Version,
    /// Picked over newer versions unless constraints rule it out.
    pub preferred: bool,
    /// Still buildable, but penalized by the optimizer.
    pub deprecated: bool,
}

impl VersionDeclaration {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            preferred: false,
            deprecated: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionDeclarationRepr {
    Plain(Version),
    Full {
        version: Version,
        #[serde(default)]
        preferred: bool,
        #[serde(default)]
        deprecated: bool,
    },
}

impl From<VersionDeclarationRepr> for VersionDeclaration {
    fn from(repr: VersionDeclarationRepr) -> Self {
        match repr {
            VersionDeclarationRepr::Plain(version) => VersionDeclaration::new(version),
            VersionDeclarationRepr::Full {
                version,
                preferred,
                deprecated,
            } => VersionDeclaration {
                version,
                preferred,
                deprecated,
            },
        }
    }
}

/// A build option of a package.
///
/// Boolean variants have the values [`TRUE`] and [`FALSE`]. Single-valued
/// variants take exactly one of `values`; multi-valued variants take any
/// subset of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantDeclaration {
    pub name: String,
    pub default: Vec<String>,
    pub values: Vec<String>,
    #[serde(default)]
    pub multi: bool,
    /// The variant only exists on nodes matching this condition.
    #[serde(default)]
    pub when: AbstractSpec,
}

impl VariantDeclaration {
    pub fn boolean(name: &str, default: bool) -> Self {
        Self {
            name: name.to_string(),
            default: vec![if default { TRUE } else { FALSE }.to_string()],
            values: vec![TRUE.to_string(), FALSE.to_string()],
            multi: false,
            when: AbstractSpec::default(),
        }
    }

    pub fn single(name: &str, default: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            default: vec![default.to_string()],
            values: values.iter().map(|v| v.to_string()).collect(),
            multi: false,
            when: AbstractSpec::default(),
        }
    }

    pub fn multi(name: &str, defaults: &[&str], values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            default: defaults.iter().map(|v| v.to_string()).collect(),
            values: values.iter().map(|v| v.to_string()).collect(),
            multi: true,
            when: AbstractSpec::default(),
        }
    }

    pub fn when(mut self, condition: AbstractSpec) -> Self {
        self.when = condition;
        self
    }

    pub fn is_boolean(&self) -> bool {
        self.values.len() == 2
            && self.values.iter().any(|v| v == TRUE)
            && self.values.iter().any(|v| v == FALSE)
    }

    pub fn allows(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    pub fn is_default(&self, value: &str) -> bool {
        self.default.iter().any(|v| v == value)
    }
}

/// An edge the package may need, possibly only under a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DependencyDeclarationRepr")]
pub struct DependencyDeclaration {
    /// The dependency (package or virtual) and the constraints it must meet.
    pub spec: AbstractSpec,
    pub types: DepTypes,
    pub when: AbstractSpec,
}

impl DependencyDeclaration {
    pub fn new(spec: AbstractSpec) -> Self {
        Self {
            spec,
            types: DepTypes::default(),
            when: AbstractSpec::default(),
        }
    }

    pub fn when(mut self, condition: AbstractSpec) -> Self {
        self.when = condition;
        self
    }

    pub fn types(mut self, types: DepTypes) -> Self {
        self.types = types;
        self
    }

    /// Name of the dependency. Validated to be present when indexed.
    pub fn name(&self) -> &str {
        self.spec.name.as_deref().unwrap_or_default()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyDeclarationRepr {
    Plain(AbstractSpec),
    Full {
        spec: AbstractSpec,
        #[serde(default)]
        types: DepTypes,
        #[serde(default)]
        when: AbstractSpec,
    },
}

impl From<DependencyDeclarationRepr> for DependencyDeclaration {
    fn from(repr: DependencyDeclarationRepr) -> Self {
        match repr {
            DependencyDeclarationRepr::Plain(spec) => DependencyDeclaration::new(spec),
            DependencyDeclarationRepr::Full { spec, types, when } => {
                DependencyDeclaration { spec, types, when }
            }
        }
    }
}

/// A combination that must never be concretized: whenever the package
/// matches `when` it must not also match `spec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDeclaration {
    /// Constraint on the package itself (anonymous) and/or its dependencies.
    pub spec: AbstractSpec,
    #[serde(default)]
    pub when: AbstractSpec,
    #[serde(default)]
    pub message: Option<String>,
}

impl ConflictDeclaration {
    pub fn new(spec: AbstractSpec) -> Self {
        Self {
            spec,
            when: AbstractSpec::default(),
            message: None,
        }
    }

    pub fn when(mut self, condition: AbstractSpec) -> Self {
        self.when = condition;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// The package implements a virtual interface, e.g. `mpi@:3.1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ProvidesDeclarationRepr")]
pub struct ProvidesDeclaration {
    #[serde(rename = "virtual")]
    pub virtual_name: String,
    /// Versions of the virtual interface provided.
    pub versions: VersionList,
    pub when: AbstractSpec,
    /// Higher wins when several packages provide the same virtual.
    pub priority: i32,
}

impl ProvidesDeclaration {
    pub fn new(virtual_name: &str) -> Self {
        Self {
            virtual_name: virtual_name.to_string(),
            versions: VersionList::any(),
            when: AbstractSpec::default(),
            priority: 0,
        }
    }

    pub fn versions(mut self, versions: VersionList) -> Self {
        self.versions = versions;
        self
    }

    pub fn when(mut self, condition: AbstractSpec) -> Self {
        self.when = condition;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProvidesDeclarationRepr {
    Plain(String),
    Full {
        #[serde(rename = "virtual")]
        virtual_name: String,
        #[serde(default)]
        versions: VersionList,
        #[serde(default)]
        when: AbstractSpec,
        #[serde(default)]
        priority: i32,
    },
}

impl From<ProvidesDeclarationRepr> for ProvidesDeclaration {
    fn from(repr: ProvidesDeclarationRepr) -> Self {
        match repr {
            ProvidesDeclarationRepr::Plain(name) => ProvidesDeclaration::new(&name),
            ProvidesDeclarationRepr::Full {
                virtual_name,
                versions,
                when,
                priority,
            } => ProvidesDeclaration {
                virtual_name,
                versions,
                when,
                priority,
            },
        }
    }
}

/// Everything the concretizer knows about one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDefinition {
    pub name: String,
    pub versions: Vec<VersionDeclaration>,
    #[serde(default)]
    pub variants: Vec<VariantDeclaration>,
    #[serde(default)]
    pub dependencies: Vec<DependencyDeclaration>,
    #[serde(default)]
    pub conflicts: Vec<ConflictDeclaration>,
    #[serde(default)]
    pub provides: Vec<ProvidesDeclaration>,
}

impl PackageDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            versions: Vec::new(),
            variants: Vec::new(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            provides: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: VersionDeclaration) -> Self {
        self.versions.push(version);
        self
    }

    pub fn with_variant(mut self, variant: VariantDeclaration) -> Self {
        self.variants.push(variant);
        self
    }

    pub fn with_dependency(mut self, dependency: DependencyDeclaration) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictDeclaration) -> Self {
        self.conflicts.push(conflict);
        self
    }

    pub fn with_provides(mut self, provides: ProvidesDeclaration) -> Self {
        self.provides.push(provides);
        self
    }

    pub fn variant(&self, name: &str) -> Option<&VariantDeclaration> {
        self.variants.iter().find(|v| v.name == name)
    }

    pub fn version(&self, version: &Version) -> Option<&VersionDeclaration> {
        self.versions.iter().find(|v| &v.version == version)
    }

    /// Declared versions admitted by `constraint`.
    pub fn versions_in<'a>(
        &'a self,
        constraint: &'a VersionList,
    ) -> impl Iterator<Item = &'a VersionDeclaration> + 'a {
        self.versions
            .iter()
            .filter(move |v| constraint.contains(&v.version))
    }

    /// Check the declaration for internal consistency.
    pub fn validate(&self) -> Result<(), ConcretizeError> {
        let invalid = |reason: String| ConcretizeError::InvalidPackage {
            package: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("package name is empty".into()));
        }
        for (i, v) in self.versions.iter().enumerate() {
            if self.versions[..i].iter().any(|w| w.version == v.version) {
                return Err(invalid(format!("version {} declared twice", v.version)));
            }
        }
        for variant in &self.variants {
            if variant.values.is_empty() {
                return Err(invalid(format!("variant `{}` has no values", variant.name)));
            }
            if !variant.multi && variant.default.len() != 1 {
                return Err(invalid(format!(
                    "single-valued variant `{}` needs exactly one default",
                    variant.name
                )));
            }
            if let Some(bad) = variant.default.iter().find(|d| !variant.allows(d)) {
                return Err(invalid(format!(
                    "default `{bad}` of variant `{}` is not an allowed value",
                    variant.name
                )));
            }
        }
        for dep in &self.dependencies {
            if dep.spec.name.is_none() {
                return Err(invalid(format!("dependency `{}` has no name", dep.spec)));
            }
            if dep.spec.name.as_deref() == Some(self.name.as_str()) {
                return Err(invalid("package depends on itself".into()));
            }
        }
        for provided in &self.provides {
            if provided.virtual_name.is_empty() {
                return Err(invalid("provides an unnamed virtual".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_compact_form() {
        let def: PackageDefinition = serde_json::from_str(
            r#"{
                "name": "a",
                "versions": ["1.0", {"version": "2.0", "deprecated": true}],
                "variants": [{"name": "feature", "default": ["false"], "values": ["true", "false"]}],
                "dependencies": ["b@:1.5", {"spec": "c", "types": ["run"], "when": "+feature"}],
                "conflicts": [{"spec": "^b@3:", "when": "+feature", "message": "b 3 broke it"}],
                "provides": ["blas", {"virtual": "lapack", "versions": "3:", "priority": 2}]
            }"#,
        )
        .unwrap();

        assert_eq!(def.versions.len(), 2);
        assert!(def.versions[1].deprecated);
        assert!(def.variant("feature").unwrap().is_boolean());
        assert_eq!(def.dependencies[0].name(), "b");
        assert_eq!(def.dependencies[0].types, DepTypes::default());
        assert!(def.dependencies[1].types.contains(DepType::Run));
        assert!(!def.dependencies[1].types.contains(DepType::Link));
        assert_eq!(def.dependencies[1].when.to_string(), "+feature");
        assert_eq!(def.conflicts[0].message.as_deref(), Some("b 3 broke it"));
        assert_eq!(def.provides[0].virtual_name, "blas");
        assert_eq!(def.provides[1].priority, 2);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_defaults() {
        let def = PackageDefinition::new("x")
            .with_variant(VariantDeclaration::single("api", "v20", &["v16", "v18"]));
        assert!(matches!(
            def.validate(),
            Err(ConcretizeError::InvalidPackage { .. })
        ));
    }

    #[test]
    fn validate_rejects_duplicate_versions() {
        let v = Version::parse("1.0").unwrap();
        let def = PackageDefinition::new("x")
            .with_version(VersionDeclaration::new(v.clone()))
            .with_version(VersionDeclaration::new(v));
        assert!(def.validate().is_err());
    }

    #[test]
    fn dep_types_display() {
        assert_eq!(DepTypes::default().to_string(), "build,link");
        let all = DepTypes::from(vec![DepType::Test, DepType::Run]);
        assert_eq!(all.to_string(), "run,test");
        assert!(DepTypes::NONE.is_empty());
    }

    #[test]
    fn versions_in_constraint() {
        let def = PackageDefinition::new("x")
            .with_version(VersionDeclaration::new(Version::parse("1.0").unwrap()))
            .with_version(VersionDeclaration::new(Version::parse("2.0").unwrap()));
        let c = VersionList::parse("1.5:").unwrap();
        let found: Vec<String> = def.versions_in(&c).map(|v| v.version.to_string()).collect();
        assert_eq!(found, vec!["2.0"]);
    }
}
