//! Solver configuration and site preferences.
//!
//! Configuration is plain data deserialized from TOML:
//!
//! ```toml
//! timeout_secs = 30
//! reuse = true
//! criteria = ["deprecated-versions", "root-version-age", "non-default-variants"]
//! targets = ["x86_64_v3", "x86_64"]
//! deprecated = "forbid"
//!
//! [[compilers]]
//! spec = "gcc@12.3.0"
//!
//! [[compilers]]
//! spec = "oneapi@2024.1"
//! targets = ["x86_64_v3"]
//!
//! [providers]
//! mpi = ["mpich", "openmpi"]
//!
//! [packages.hdf5]
//! versions = ["1.12"]
//! variants = "+mpi~cxx"
//! require = ["+hl", "%gcc"]
//!
//! [packages.openssl]
//! buildable = false
//! externals = [{ spec = "openssl@3.0.2+shared", prefix = "/usr" }]
//!
//! [explain]
//! max_checks = 100
//! ```
//!
//! `timeout_secs` must be a finite, non-negative number; zero fails every
//! solve at once. The limit can only be lifted programmatically, with
//! [`SolverConfig::with_timeout`]`(None)`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::criteria::Criterion;
use crate::error::ConcretizeError;
use crate::spec::{AbstractSpec, CompilerSpec};
use crate::version::{Version, VersionList};

/// A compiler available to build packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerEntry {
    pub spec: CompilerSpec,
    /// Targets this compiler can generate code for. Empty means all.
    #[serde(default)]
    pub targets: Vec<String>,
}

impl CompilerEntry {
    pub fn new(spec: CompilerSpec) -> Self {
        Self {
            spec,
            targets: Vec::new(),
        }
    }

    pub fn supports(&self, target: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t == target)
    }
}

/// Whether deprecated versions may be selected at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeprecatedPolicy {
    /// Allowed, but penalized by [`Criterion::DeprecatedVersions`].
    #[default]
    Allow,
    Forbid,
}

/// An installation of a package that exists outside the solver's control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalEntry {
    /// What is installed. The version must be a single concrete version.
    pub spec: AbstractSpec,
    pub prefix: String,
}

/// Per-package preferences and policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackagePreferences {
    /// Version ranges in order of preference.
    pub versions: Vec<VersionList>,
    /// Preferred variant values, as an anonymous spec (`+mpi~cxx api=v18`).
    pub variants: AbstractSpec,
    /// Anonymous specs the package must satisfy whenever it is in a graph.
    pub require: Vec<AbstractSpec>,
    /// When false only externals and reused installations may be selected.
    pub buildable: bool,
    pub externals: Vec<ExternalEntry>,
}

impl Default for PackagePreferences {
    fn default() -> Self {
        Self {
            versions: Vec::new(),
            variants: AbstractSpec::default(),
            require: Vec::new(),
            buildable: true,
            externals: Vec::new(),
        }
    }
}

/// Limits for unsat core minimization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExplainConfig {
    /// Maximum number of solver calls spent minimizing one core.
    pub max_checks: usize,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self { max_checks: 256 }
    }
}

/// Everything that tunes a solve besides the request and the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    /// Wall-clock budget per solve, in seconds. `None` disables the limit.
    #[serde(deserialize_with = "timeout_secs")]
    pub timeout_secs: Option<f64>,
    /// Prefer reusing installed nodes handed to the concretizer over
    /// building.
    pub reuse: bool,
    /// Optimization criteria, most important first.
    pub criteria: Vec<Criterion>,
    /// Compilers in order of preference. Empty disables compiler selection.
    pub compilers: Vec<CompilerEntry>,
    /// Targets in order of preference. Empty disables target selection.
    pub targets: Vec<String>,
    pub deprecated: DeprecatedPolicy,
    /// Preferred providers per virtual, best first.
    pub providers: BTreeMap<String, Vec<String>>,
    pub packages: BTreeMap<String, PackagePreferences>,
    pub explain: ExplainConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Some(60.0),
            reuse: false,
            criteria: Criterion::DEFAULT_ORDER.to_vec(),
            compilers: Vec::new(),
            targets: Vec::new(),
            deprecated: DeprecatedPolicy::Allow,
            providers: BTreeMap::new(),
            packages: BTreeMap::new(),
            explain: ExplainConfig::default(),
        }
    }
}

impl SolverConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConcretizeError> {
        Ok(toml::from_str(text)?)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_secs = timeout.map(|t| t.as_secs_f64());
        self
    }

    pub fn with_compiler(mut self, compiler: CompilerEntry) -> Self {
        self.compilers.push(compiler);
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.targets.push(target.to_string());
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<Criterion>) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_provider_preference(mut self, virtual_name: &str, providers: &[&str]) -> Self {
        self.providers.insert(
            virtual_name.to_string(),
            providers.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    pub fn with_package_preferences(mut self, package: &str, prefs: PackagePreferences) -> Self {
        self.packages.insert(package.to_string(), prefs);
        self
    }

    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn with_requirement(mut self, package: &str, spec: AbstractSpec) -> Self {
        self.packages
            .entry(package.to_string())
            .or_default()
            .require
            .push(spec);
        self
    }

    pub fn with_external(mut self, spec: AbstractSpec, prefix: &str) -> Self {
        let package = spec.name.clone().unwrap_or_default();
        self.packages
            .entry(package)
            .or_default()
            .externals
            .push(ExternalEntry {
                spec,
                prefix: prefix.to_string(),
            });
        self
    }

    pub fn with_buildable(mut self, package: &str, buildable: bool) -> Self {
        self.packages.entry(package.to_string()).or_default().buildable = buildable;
        self
    }

    /// Position of the first preferred range containing `version`, if any.
    pub fn version_preference(&self, package: &str, version: &Version) -> Option<usize> {
        self.packages
            .get(package)?
            .versions
            .iter()
            .position(|range| range.contains(version))
    }

    /// Preferred values for a variant, overriding the package default.
    pub fn variant_preference(&self, package: &str, variant: &str) -> Option<&BTreeSet<String>> {
        self.packages.get(package)?.variants.variants.get(variant)
    }

    pub fn requirements(&self, package: &str) -> &[AbstractSpec] {
        self.packages
            .get(package)
            .map(|p| p.require.as_slice())
            .unwrap_or_default()
    }

    pub fn externals(&self, package: &str) -> &[ExternalEntry] {
        self.packages
            .get(package)
            .map(|p| p.externals.as_slice())
            .unwrap_or_default()
    }

    pub fn is_buildable(&self, package: &str) -> bool {
        self.packages.get(package).is_none_or(|p| p.buildable)
    }

    /// Position of `provider` in the preferred provider list for `virtual_name`.
    pub fn provider_preference(&self, virtual_name: &str, provider: &str) -> Option<usize> {
        self.providers
            .get(virtual_name)?
            .iter()
            .position(|p| p == provider)
    }
}

fn timeout_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    if secs.is_finite() && secs >= 0.0 {
        Ok(Some(secs))
    } else {
        Err(D::Error::custom(format!(
            "timeout_secs must be a non-negative number of seconds, got {secs}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = SolverConfig::default();
        assert_eq!(config.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.criteria, Criterion::DEFAULT_ORDER.to_vec());
        assert!(config.compilers.is_empty());
    }

    #[test]
    fn parse_full_document() {
        let config = SolverConfig::from_toml_str(
            r#"
            timeout_secs = 2.5
            criteria = ["non-default-variants", "version-age"]
            targets = ["x86_64_v3", "x86_64"]
            deprecated = "forbid"

            [[compilers]]
            spec = "gcc@12.3.0"

            [[compilers]]
            spec = "oneapi@2024.1"
            targets = ["x86_64_v3"]

            [providers]
            mpi = ["mpich", "openmpi"]

            [packages.hdf5]
            versions = ["1.12", "1.10"]
            variants = "+mpi api=v18"

            [explain]
            max_checks = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(
            config.criteria,
            vec![Criterion::NonDefaultVariants, Criterion::VersionAge]
        );
        assert_eq!(config.deprecated, DeprecatedPolicy::Forbid);
        assert_eq!(config.compilers[0].spec.to_string(), "gcc@12.3.0");
        assert!(config.compilers[0].supports("x86_64"));
        assert!(!config.compilers[1].supports("x86_64"));
        assert_eq!(config.provider_preference("mpi", "openmpi"), Some(1));
        assert_eq!(config.provider_preference("mpi", "mvapich"), None);

        let v = Version::parse("1.10.9").unwrap();
        assert_eq!(config.version_preference("hdf5", &v), Some(1));
        assert!(config.variant_preference("hdf5", "mpi").unwrap().contains("true"));
        assert!(config.variant_preference("hdf5", "api").unwrap().contains("v18"));
        assert_eq!(config.explain.max_checks, 10);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SolverConfig::from_toml_str("timeout = 3").unwrap_err();
        assert!(matches!(err, ConcretizeError::Config(_)));
    }

    #[test]
    fn unknown_criterion_is_rejected() {
        assert!(SolverConfig::from_toml_str(r#"criteria = ["fastest"]"#).is_err());
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let err = SolverConfig::from_toml_str("timeout_secs = -1.0").unwrap_err();
        assert!(err.to_string().contains("non-negative"), "{err}");
        assert!(SolverConfig::from_toml_str("timeout_secs = nan").is_err());
        let config = SolverConfig::from_toml_str("timeout_secs = 0").unwrap();
        assert_eq!(config.timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn externals_and_requirements_parse() {
        let config = SolverConfig::from_toml_str(
            r#"
            reuse = true

            [packages.openssl]
            buildable = false
            require = ["+shared"]
            externals = [{ spec = "openssl@3.0.2+shared", prefix = "/usr" }]
            "#,
        )
        .unwrap();
        assert!(config.reuse);
        assert!(!config.is_buildable("openssl"));
        assert!(config.is_buildable("zlib"));
        assert_eq!(config.requirements("openssl").len(), 1);
        let external = &config.externals("openssl")[0];
        assert_eq!(external.prefix, "/usr");
        assert_eq!(external.spec.to_string(), "openssl@3.0.2+shared");
        assert!(config.externals("zlib").is_empty());
    }
}
