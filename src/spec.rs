//! Abstract specs: the constraint language for requests, `when` conditions,
//! dependency declarations and conflicts.
//!
//! ```text
//! hdf5@1.10: +mpi ~cxx api=v18 %gcc@12: target=x86_64 ^zlib@1.2:
//! ```
//!
//! The name is optional; anonymous specs (`+mpi ^zlib@1.3:`) constrain the
//! package they are attached to. Dependency constraints introduced with `^`
//! are kept flat.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SpecParseError, VersionParseError};
use crate::version::{Version, VersionList};

/// Value text used for the "on" state of boolean variants.
pub const TRUE: &str = "true";
/// Value text used for the "off" state of boolean variants.
pub const FALSE: &str = "false";

/// A concrete compiler: name and exact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CompilerSpec {
    pub name: String,
    pub version: Version,
}

impl CompilerSpec {
    /// Parse `gcc@12.3.0` (an `=` after `@` is accepted).
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let (name, version) = input
            .trim()
            .split_once('@')
            .ok_or_else(|| VersionParseError::new(input, "compiler needs `name@version`"))?;
        let version = version.strip_prefix('=').unwrap_or(version);
        Ok(Self {
            name: name.to_string(),
            version: Version::parse(version)?,
        })
    }
}

impl fmt::Display for CompilerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl TryFrom<String> for CompilerSpec {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CompilerSpec::parse(&value)
    }
}

impl From<CompilerSpec> for String {
    fn from(value: CompilerSpec) -> Self {
        value.to_string()
    }
}

/// A compiler requirement: `%gcc` or `%gcc@12:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompilerConstraint {
    pub name: String,
    pub versions: VersionList,
}

impl CompilerConstraint {
    pub fn matches(&self, compiler: &CompilerSpec) -> bool {
        self.name == compiler.name && self.versions.contains(&compiler.version)
    }
}

impl fmt::Display for CompilerConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name)?;
        if !self.versions.is_any() {
            write!(f, "@{}", self.versions)?;
        }
        Ok(())
    }
}

/// A partially specified package node plus flat `^dependency` constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AbstractSpec {
    pub name: Option<String>,
    pub versions: VersionList,
    /// Required values per variant. Boolean variants use [`TRUE`] / [`FALSE`].
    pub variants: BTreeMap<String, BTreeSet<String>>,
    pub compiler: Option<CompilerConstraint>,
    pub target: Option<String>,
    pub dependencies: Vec<AbstractSpec>,
}

impl AbstractSpec {
    /// An unconstrained spec for `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Parse the spec syntax.
    pub fn parse(input: &str) -> Result<Self, SpecParseError> {
        let mut nodes = Vec::new();
        let mut offset = 0;
        for segment in input.split('^') {
            nodes.push((offset, segment));
            offset += segment.len() + 1;
        }

        let (root_offset, root_text) = nodes[0];
        let mut root = parse_node(input, root_text, root_offset)?;
        for &(offset, text) in &nodes[1..] {
            let dep = parse_node(input, text, offset)?;
            if dep.name.is_none() {
                return Err(spec_error(input, offset, "dependency after `^` needs a name"));
            }
            root.constrain_dependency(&dep)
                .map_err(|reason| spec_error(input, offset, reason))?;
        }
        Ok(root)
    }

    /// Whether this spec places no constraint at all.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.versions.is_any()
            && self.variants.is_empty()
            && self.compiler.is_none()
            && self.target.is_none()
            && self.dependencies.is_empty()
    }

    /// Whether only the node itself (not its dependencies) is constrained.
    pub fn is_node_only(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Add a boolean variant constraint.
    pub fn with_flag(mut self, variant: &str, on: bool) -> Self {
        self.variants
            .entry(variant.to_string())
            .or_default()
            .insert(if on { TRUE } else { FALSE }.to_string());
        self
    }

    /// The constraint on dependency `name`, if any.
    pub fn dependency(&self, name: &str) -> Option<&AbstractSpec> {
        self.dependencies
            .iter()
            .find(|d| d.name.as_deref() == Some(name))
    }

    /// Merge `other` into `self`, failing on contradictions that can be
    /// detected without package metadata.
    pub fn constrain(&mut self, other: &AbstractSpec) -> Result<(), String> {
        if let (Some(a), Some(b)) = (&self.name, &other.name) {
            if a != b {
                return Err(format!("`{a}` and `{b}` name different packages"));
            }
        }
        if self.name.is_none() {
            self.name = other.name.clone();
        }
        self.constrain_node(other)?;
        for dep in &other.dependencies {
            self.constrain_dependency(dep)?;
        }
        Ok(())
    }

    /// Merge a `^dep` constraint into this spec's dependency constraints.
    pub fn constrain_dependency(&mut self, dep: &AbstractSpec) -> Result<(), String> {
        let mut node = dep.clone();
        let nested = std::mem::take(&mut node.dependencies);
        match self.dependencies.iter_mut().find(|d| d.name == node.name) {
            Some(existing) => existing.constrain_node(&node)?,
            None => self.dependencies.push(node),
        }
        for n in &nested {
            self.constrain_dependency(n)?;
        }
        Ok(())
    }

    fn constrain_node(&mut self, other: &AbstractSpec) -> Result<(), String> {
        let label = self.name.clone().unwrap_or_default();
        let versions = self.versions.intersect(&other.versions);
        if versions.is_empty() {
            return Err(format!(
                "{label}@{} and {label}@{} have no version in common",
                self.versions, other.versions
            ));
        }
        self.versions = versions;

        for (variant, values) in &other.variants {
            self.variants
                .entry(variant.clone())
                .or_default()
                .extend(values.iter().cloned());
        }

        match (&mut self.compiler, &other.compiler) {
            (Some(mine), Some(theirs)) => {
                if mine.name != theirs.name {
                    return Err(format!("{label} cannot be built with both {mine} and {theirs}"));
                }
                let versions = mine.versions.intersect(&theirs.versions);
                if versions.is_empty() {
                    return Err(format!("{label}: {mine} and {theirs} have no version in common"));
                }
                mine.versions = versions;
            }
            (None, Some(theirs)) => self.compiler = Some(theirs.clone()),
            _ => {}
        }

        match (&self.target, &other.target) {
            (Some(mine), Some(theirs)) if mine != theirs => {
                return Err(format!("{label} cannot target both {mine} and {theirs}"));
            }
            (None, Some(theirs)) => self.target = Some(theirs.clone()),
            _ => {}
        }
        Ok(())
    }

    /// Render the constraints on the node itself, without `^dependencies`.
    pub fn node_string(&self) -> String {
        let mut out = String::new();
        if let Some(name) = &self.name {
            out.push_str(name);
        }
        if !self.versions.is_any() {
            out.push('@');
            out.push_str(&self.versions.to_string());
        }
        let mut keyed = Vec::new();
        for (variant, values) in &self.variants {
            if values.len() == 1 && values.contains(TRUE) {
                out.push('+');
                out.push_str(variant);
            } else if values.len() == 1 && values.contains(FALSE) {
                out.push('~');
                out.push_str(variant);
            } else {
                let joined: Vec<&str> = values.iter().map(String::as_str).collect();
                keyed.push(format!("{variant}={}", joined.join(",")));
            }
        }
        for kv in keyed {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&kv);
        }
        if let Some(compiler) = &self.compiler {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&compiler.to_string());
        }
        if let Some(target) = &self.target {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str("target=");
            out.push_str(target);
        }
        out
    }
}

impl fmt::Display for AbstractSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node_string();
        f.write_str(&node)?;
        for (i, dep) in self.dependencies.iter().enumerate() {
            if i > 0 || !node.is_empty() {
                f.write_str(" ")?;
            }
            write!(f, "^{dep}")?;
        }
        Ok(())
    }
}

impl FromStr for AbstractSpec {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AbstractSpec::parse(s)
    }
}

impl TryFrom<String> for AbstractSpec {
    type Error = SpecParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AbstractSpec::parse(&value)
    }
}

impl From<AbstractSpec> for String {
    fn from(value: AbstractSpec) -> Self {
        value.to_string()
    }
}

fn spec_error(input: &str, offset: usize, reason: impl Into<String>) -> SpecParseError {
    SpecParseError {
        input: input.to_string(),
        offset,
        reason: reason.into(),
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.')
}

fn is_value_end(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b'%' | b'+' | b'~')
}

fn parse_node(input: &str, text: &str, base: usize) -> Result<AbstractSpec, SpecParseError> {
    let bytes = text.as_bytes();
    let mut spec = AbstractSpec::default();
    let mut saw_modifier = false;
    let mut i = 0;

    let word_end = |from: usize| {
        let mut j = from;
        while j < bytes.len() && is_word_byte(bytes[j]) {
            j += 1;
        }
        j
    };

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let at = base + i;
        match b {
            b'@' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && !is_value_end(bytes[end]) {
                    end += 1;
                }
                let versions = VersionList::parse(&text[start..end])
                    .map_err(|e| spec_error(input, at, e.to_string()))?;
                let merged = spec.versions.intersect(&versions);
                if merged.is_empty() {
                    return Err(spec_error(input, at, "version constraints have nothing in common"));
                }
                spec.versions = merged;
                saw_modifier = true;
                i = end;
            }
            b'+' | b'~' => {
                let end = word_end(i + 1);
                if end == i + 1 {
                    return Err(spec_error(input, at, "expected a variant name"));
                }
                let name = &text[i + 1..end];
                let value = if b == b'+' { TRUE } else { FALSE };
                let values = spec.variants.entry(name.to_string()).or_default();
                if !values.is_empty() && !values.contains(value) {
                    return Err(spec_error(input, at, format!("variant `{name}` set twice")));
                }
                values.insert(value.to_string());
                saw_modifier = true;
                i = end;
            }
            b'%' => {
                let end = word_end(i + 1);
                if end == i + 1 {
                    return Err(spec_error(input, at, "expected a compiler name"));
                }
                let name = text[i + 1..end].to_string();
                let mut versions = VersionList::any();
                i = end;
                if i < bytes.len() && bytes[i] == b'@' {
                    let start = i + 1;
                    let mut stop = start;
                    while stop < bytes.len() && !is_value_end(bytes[stop]) {
                        stop += 1;
                    }
                    versions = VersionList::parse(&text[start..stop])
                        .map_err(|e| spec_error(input, base + i, e.to_string()))?;
                    i = stop;
                }
                if spec.compiler.is_some() {
                    return Err(spec_error(input, at, "compiler given twice"));
                }
                spec.compiler = Some(CompilerConstraint { name, versions });
                saw_modifier = true;
            }
            _ if is_word_byte(b) => {
                let end = word_end(i);
                let word = &text[i..end];
                if end < bytes.len() && bytes[end] == b'=' {
                    let start = end + 1;
                    let mut stop = start;
                    while stop < bytes.len() && !is_value_end(bytes[stop]) {
                        stop += 1;
                    }
                    let value = &text[start..stop];
                    if value.is_empty() {
                        return Err(spec_error(input, at, format!("`{word}=` needs a value")));
                    }
                    if word == "target" {
                        spec.target = Some(value.to_string());
                    } else {
                        let values = spec.variants.entry(word.to_string()).or_default();
                        values.extend(value.split(',').filter(|v| !v.is_empty()).map(String::from));
                    }
                    saw_modifier = true;
                    i = stop;
                } else if spec.name.is_none() && !saw_modifier {
                    spec.name = Some(word.to_string());
                    i = end;
                } else {
                    return Err(spec_error(input, at, format!("unexpected `{word}`")));
                }
            }
            _ => {
                return Err(spec_error(
                    input,
                    at,
                    format!("unexpected character `{}`", b as char),
                ));
            }
        }
    }
    Ok(spec)
}
