//! Version parsing, ordering, ranges and normalized version lists.
//!
//! A [`Version`] is a sequence of numeric and alphabetic components; the
//! separators `.`, `-` and `_` are not significant when comparing. Numbers
//! compare above words, except for the "infinity" words in
//! [`INFINITY_VERSIONS`] which compare above everything.
//!
//! A [`VersionRange`] is a closed interval whose upper bound may be a
//! *prefix bound*: `:1.3` contains `1.3.7` because `1.3.7` starts with
//! `1.3`. A bare version used as a constraint (`@1.2`) is the prefix range
//! `1.2:1.2`; `@=1.2` means exactly `1.2`.
//!
//! [`VersionList`] is a union of ranges kept in normalized form (sorted,
//! overlapping ranges merged), so equal sets compare equal and
//! intersection is commutative and associative.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VersionParseError;

/// Development branch names that sort above every release, greatest first.
pub const INFINITY_VERSIONS: [&str; 5] = ["develop", "main", "master", "head", "trunk"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Component {
    Number(u64),
    Word(String),
}

impl Component {
    fn infinity_rank(&self) -> Option<usize> {
        match self {
            Component::Word(w) => INFINITY_VERSIONS.iter().position(|inf| inf == w),
            Component::Number(_) => None,
        }
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.infinity_rank(), other.infinity_rank()) {
            // A lower index in INFINITY_VERSIONS is a greater version.
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => match (self, other) {
                (Component::Number(a), Component::Number(b)) => a.cmp(b),
                (Component::Number(_), Component::Word(_)) => Ordering::Greater,
                (Component::Word(_), Component::Number(_)) => Ordering::Less,
                (Component::Word(a), Component::Word(b)) => a.cmp(b),
            },
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A concrete package version such as `1.12.2`, `2.0rc1` or `develop`.
///
/// Equality, hashing and ordering only look at the components, so `1.2-3`
/// and `1.2.3` are the same version. [`Display`](fmt::Display) prints the
/// text the version was parsed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    text: String,
    components: Vec<Component>,
}

impl Version {
    /// Parse a version string.
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(VersionParseError::new(input, "empty version"));
        }
        if let Some(bad) = text
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
        {
            return Err(VersionParseError::new(
                input,
                format!("invalid character `{bad}`"),
            ));
        }

        let bytes = text.as_bytes();
        let mut components = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            let start = i;
            if bytes[i].is_ascii_digit() {
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let number = text[start..i].parse::<u64>().map_err(|_| {
                    VersionParseError::new(input, format!("component `{}` is too large", &text[start..i]))
                })?;
                components.push(Component::Number(number));
            } else if bytes[i].is_ascii_alphabetic() {
                while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                    i += 1;
                }
                components.push(Component::Word(text[start..i].to_string()));
            } else {
                i += 1;
            }
        }

        if components.is_empty() {
            return Err(VersionParseError::new(input, "no version components"));
        }

        Ok(Self {
            text: text.to_string(),
            components,
        })
    }

    /// The text this version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of components (`1.2.3` has three).
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Versions always have at least one component.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Whether any component is a development branch name (`develop`, `main`, ...).
    ///
    /// Such versions are the newest by ordering but are only picked by the
    /// concretizer when nothing else fits or they are explicitly preferred.
    pub fn is_develop(&self) -> bool {
        self.components.iter().any(|c| c.infinity_rank().is_some())
    }

    /// Whether `self` starts with every component of `prefix`.
    pub fn starts_with(&self, prefix: &Version) -> bool {
        prefix.components.len() <= self.components.len()
            && self.components.iter().zip(&prefix.components).all(|(a, b)| a == b)
    }

    /// Compare `self` with `prefix` followed by an infinitely large component.
    fn cmp_prefix_bound(&self, prefix: &Version) -> Ordering {
        for (i, p) in prefix.components.iter().enumerate() {
            let Some(c) = self.components.get(i) else {
                return Ordering::Less;
            };
            match c.cmp(p) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Less
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.components.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Version::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.text
    }
}

/// Total order over versions.
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

/// A point of the extended version line used as a range endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Bound {
    Min,
    At(Version),
    /// Just above every version that starts with the given prefix.
    Above(Version),
    Max,
}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        use Bound::*;
        match (self, other) {
            (Min, Min) | (Max, Max) => Ordering::Equal,
            (Min, _) | (_, Max) => Ordering::Less,
            (_, Min) | (Max, _) => Ordering::Greater,
            (At(a), At(b)) => a.cmp(b),
            (At(a), Above(p)) => a.cmp_prefix_bound(p),
            (Above(p), At(a)) => a.cmp_prefix_bound(p).reverse(),
            (Above(a), Above(b)) => {
                for (x, y) in a.components.iter().zip(&b.components) {
                    match x.cmp(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                // The shorter prefix covers more versions, so it sits higher.
                b.components.len().cmp(&a.components.len())
            }
        }
    }
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A contiguous, non-empty interval of versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRange {
    lo: Bound,
    hi: Bound,
}

impl VersionRange {
    /// Every version (`:`).
    pub fn any() -> Self {
        Self {
            lo: Bound::Min,
            hi: Bound::Max,
        }
    }

    /// Exactly one version (`=1.2`).
    pub fn exact(version: Version) -> Self {
        Self {
            lo: Bound::At(version.clone()),
            hi: Bound::At(version),
        }
    }

    /// Every version starting with `version` (`1.2` means `1.2:1.2`).
    pub fn prefix(version: Version) -> Self {
        Self {
            lo: Bound::At(version.clone()),
            hi: Bound::Above(version),
        }
    }

    /// `lo:hi`, with either side open. Returns `None` for an empty range.
    pub fn between(lo: Option<Version>, hi: Option<Version>) -> Option<Self> {
        let range = Self {
            lo: lo.map_or(Bound::Min, Bound::At),
            hi: hi.map_or(Bound::Max, Bound::Above),
        };
        (range.lo <= range.hi).then_some(range)
    }

    /// Parse one range: `=1.2`, `1.2`, `1.2:1.4`, `1.2:`, `:1.4` or `:`.
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let text = input.trim();
        if let Some(exact) = text.strip_prefix('=') {
            return Ok(Self::exact(Version::parse(exact)?));
        }
        match text.split_once(':') {
            None => Ok(Self::prefix(Version::parse(text)?)),
            Some((lo, hi)) => {
                if hi.contains(':') {
                    return Err(VersionParseError::new(input, "more than one `:` in range"));
                }
                let lo = (!lo.trim().is_empty()).then(|| Version::parse(lo)).transpose()?;
                let hi = (!hi.trim().is_empty()).then(|| Version::parse(hi)).transpose()?;
                Self::between(lo, hi)
                    .ok_or_else(|| VersionParseError::new(input, "lower bound is above upper bound"))
            }
        }
    }

    /// Whether `version` lies in this range.
    pub fn contains(&self, version: &Version) -> bool {
        let point = Bound::At(version.clone());
        self.lo <= point && point <= self.hi
    }

    /// The overlap of two ranges, if any.
    pub fn intersect(&self, other: &VersionRange) -> Option<VersionRange> {
        let lo = std::cmp::max(&self.lo, &other.lo).clone();
        let hi = std::cmp::min(&self.hi, &other.hi).clone();
        (lo <= hi).then_some(VersionRange { lo, hi })
    }

    /// The single version this range admits, for `=x` ranges.
    pub fn concrete(&self) -> Option<&Version> {
        match (&self.lo, &self.hi) {
            (Bound::At(a), Bound::At(b)) if a == b => Some(a),
            _ => None,
        }
    }

    /// The version a range was written as, for `x` and `=x`.
    pub fn point(&self) -> Option<&Version> {
        match (&self.lo, &self.hi) {
            (Bound::At(a), Bound::At(b) | Bound::Above(b)) if a == b => Some(a),
            _ => None,
        }
    }

    fn is_any(&self) -> bool {
        self.lo == Bound::Min && self.hi == Bound::Max
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Bound::*;
        match (&self.lo, &self.hi) {
            (At(a), At(b)) if a == b => write!(f, "={a}"),
            (At(a), Above(b)) if a == b => write!(f, "{a}"),
            (At(a), At(b) | Above(b)) => write!(f, "{a}:{b}"),
            (At(a), Max) => write!(f, "{a}:"),
            (Min, At(b) | Above(b)) => write!(f, ":{b}"),
            _ => write!(f, ":"),
        }
    }
}

/// A normalized union of [`VersionRange`]s.
///
/// The empty list admits no version; [`VersionList::any`] admits all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionList {
    ranges: Vec<VersionRange>,
}

impl VersionList {
    /// The unconstrained list.
    pub fn any() -> Self {
        Self {
            ranges: vec![VersionRange::any()],
        }
    }

    /// The list admitting no version at all.
    pub fn none() -> Self {
        Self { ranges: Vec::new() }
    }

    /// A list with a single exact version.
    pub fn exact(version: Version) -> Self {
        Self {
            ranges: vec![VersionRange::exact(version)],
        }
    }

    /// Build a normalized list from arbitrary ranges.
    pub fn from_ranges(ranges: impl IntoIterator<Item = VersionRange>) -> Self {
        let mut ranges: Vec<VersionRange> = ranges.into_iter().collect();
        ranges.sort_by(|a, b| a.lo.cmp(&b.lo).then_with(|| a.hi.cmp(&b.hi)));

        let mut merged: Vec<VersionRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.lo <= last.hi => {
                    if range.hi > last.hi {
                        last.hi = range.hi;
                    }
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    /// Parse a comma-separated list of ranges (`1.2,1.4:1.6`). An empty
    /// string means "any version".
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        if input.trim().is_empty() {
            return Ok(Self::any());
        }
        let ranges = input
            .split(',')
            .map(VersionRange::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_ranges(ranges))
    }

    /// The versions admitted by both lists.
    pub fn intersect(&self, other: &VersionList) -> VersionList {
        let mut out = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                if let Some(range) = a.intersect(b) {
                    out.push(range);
                }
            }
        }
        Self::from_ranges(out)
    }

    /// The versions admitted by either list.
    pub fn union(&self, other: &VersionList) -> VersionList {
        Self::from_ranges(self.ranges.iter().chain(&other.ranges).cloned())
    }

    pub fn contains(&self, version: &Version) -> bool {
        self.ranges.iter().any(|r| r.contains(version))
    }

    pub fn overlaps(&self, other: &VersionList) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Whether every version admitted by `self` is admitted by `other`.
    pub fn is_subset_of(&self, other: &VersionList) -> bool {
        &self.intersect(other) == self
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn is_any(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].is_any()
    }

    /// The single version admitted, if the list is one `=x` range.
    pub fn concrete(&self) -> Option<&Version> {
        match self.ranges.as_slice() {
            [only] => only.concrete(),
            _ => None,
        }
    }

    /// The version named by a list written as one `x` or `=x`.
    pub fn point(&self) -> Option<&Version> {
        match self.ranges.as_slice() {
            [only] => only.point(),
            _ => None,
        }
    }

    pub fn ranges(&self) -> &[VersionRange] {
        &self.ranges
    }
}

impl Default for VersionList {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return f.write_str("<none>");
        }
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

impl FromStr for VersionList {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionList::parse(s)
    }
}

impl TryFrom<String> for VersionList {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        VersionList::parse(&value)
    }
}

impl From<VersionList> for String {
    fn from(value: VersionList) -> Self {
        value.to_string()
    }
}

impl From<Version> for VersionList {
    fn from(version: Version) -> Self {
        VersionList::exact(version)
    }
}

/// Intersection of two version lists.
pub fn intersect(a: &VersionList, b: &VersionList) -> VersionList {
    a.intersect(b)
}

/// Whether `version` satisfies `constraint`.
pub fn satisfies(version: &Version, constraint: &VersionList) -> bool {
    constraint.contains(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn list(s: &str) -> VersionList {
        VersionList::parse(s).unwrap()
    }

    #[test]
    fn numeric_ordering() {
        assert!(v("1.2") < v("1.10"));
        assert!(v("1.2") < v("1.2.0"));
        assert!(v("2") > v("1.99.99"));
        assert_eq!(v("1.2.3"), v("1-2_3"));
    }

    #[test]
    fn words_sort_below_numbers() {
        assert!(v("1.2a") < v("1.2.0"));
        assert!(v("1.2rc1") > v("1.2"));
        assert!(v("1.0b") > v("1.0a"));
    }

    #[test]
    fn infinity_versions_sort_above_releases() {
        assert!(v("develop") > v("999.0"));
        assert!(v("develop") > v("main"));
        assert!(v("main") > v("master"));
        assert!(v("head") > v("trunk"));
        assert!(v("1.develop") > v("1.99"));
        assert!(v("develop").is_develop());
        assert!(!v("1.2").is_develop());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("1.2+3").is_err());
        assert!(Version::parse("...").is_err());
        assert!(Version::parse("1 2").is_err());
        let err = Version::parse("1.2$").unwrap_err();
        assert!(err.to_string().contains("1.2$"));
    }

    #[test]
    fn display_keeps_original_text() {
        assert_eq!(v("1.2-rc1").to_string(), "1.2-rc1");
    }

    #[test]
    fn prefix_upper_bound() {
        let r = VersionRange::parse(":1.3").unwrap();
        assert!(r.contains(&v("1.3")));
        assert!(r.contains(&v("1.3.5")));
        assert!(r.contains(&v("1.2.9")));
        assert!(!r.contains(&v("1.4")));
    }

    #[test]
    fn bare_version_is_prefix_range() {
        let r = VersionRange::parse("1.2").unwrap();
        assert!(r.contains(&v("1.2")));
        assert!(r.contains(&v("1.2.11")));
        assert!(!r.contains(&v("1.3")));
        assert!(!r.contains(&v("1.1")));
    }

    #[test]
    fn exact_range() {
        let r = VersionRange::parse("=1.2").unwrap();
        assert!(r.contains(&v("1.2")));
        assert!(!r.contains(&v("1.2.1")));
        assert_eq!(r.concrete(), Some(&v("1.2")));
    }

    #[test]
    fn point_names_single_versions() {
        assert_eq!(list("3.0.2").point(), Some(&v("3.0.2")));
        assert_eq!(list("=3.0.2").point(), Some(&v("3.0.2")));
        assert_eq!(list("3.0.2").concrete(), None);
        assert_eq!(list("3:").point(), None);
        assert_eq!(list("1.2,1.4").point(), None);
    }

    #[test]
    fn open_ranges() {
        assert!(VersionRange::parse("1.5:").unwrap().contains(&v("10")));
        assert!(!VersionRange::parse("1.5:").unwrap().contains(&v("1.4.9")));
        assert!(VersionRange::parse(":").unwrap().contains(&v("develop")));
    }

    #[test]
    fn inverted_range_is_an_error() {
        assert!(VersionRange::parse("2.0:1.0").is_err());
        assert!(VersionRange::parse("1:2:3").is_err());
    }

    #[test]
    fn list_normalizes_overlaps() {
        let l = list("1.4:1.8,1.0:1.5,3.0");
        assert_eq!(l.ranges().len(), 2);
        assert_eq!(l.to_string(), "1.0:1.8,3.0");
    }

    #[test]
    fn list_intersection() {
        let a = list("1.2:");
        let b = list(":1.3");
        let i = a.intersect(&b);
        assert_eq!(i.to_string(), "1.2:1.3");
        assert!(i.contains(&v("1.3.9")));
        assert!(!i.contains(&v("1.1")));

        assert!(list("1.0:1.5").intersect(&list("2.0:")).is_empty());
        assert!(!list("1.0:1.5").overlaps(&list("2.0:")));
    }

    #[test]
    fn exact_inside_prefix() {
        let i = list("1.2").intersect(&list("=1.2.4"));
        assert_eq!(i.concrete(), Some(&v("1.2.4")));
    }

    #[test]
    fn subset() {
        assert!(list("=1.2.4").is_subset_of(&list("1.2")));
        assert!(list("1.2").is_subset_of(&list("1:")));
        assert!(!list("1:").is_subset_of(&list("1.2")));
    }

    #[test]
    fn empty_string_is_any() {
        assert!(list("").is_any());
        assert!(list(":").is_any());
    }

    #[test]
    fn satisfies_free_function() {
        assert!(satisfies(&v("1.5"), &list(":1.5")));
        assert!(!satisfies(&v("2.0"), &list(":1.5")));
        assert_eq!(compare(&v("1.0"), &v("1.0.0")), Ordering::Less);
    }

    #[test]
    fn serde_as_strings() {
        let l: VersionList = serde_json::from_str("\"1.2:1.4,2\"").unwrap();
        assert_eq!(serde_json::to_string(&l).unwrap(), "\"1.2:1.4,2\"");
        let ver: Version = serde_json::from_str("\"3.1.4\"").unwrap();
        assert_eq!(ver, v("3.1.4"));
        assert!(serde_json::from_str::<Version>("\"bad version\"").is_err());
    }

    fn version_strategy() -> impl Strategy<Value = Version> {
        let component = prop_oneof![
            4 => (0u64..4).prop_map(|n| n.to_string()),
            1 => Just("a".to_string()),
            1 => Just("develop".to_string()),
        ];
        prop::collection::vec(component, 1..4).prop_map(|parts| v(&parts.join(".")))
    }

    fn range_strategy() -> impl Strategy<Value = VersionRange> {
        (
            0u8..4,
            prop::option::of(version_strategy()),
            prop::option::of(version_strategy()),
        )
            .prop_map(|(kind, a, b)| match (kind, a, b) {
                (0, Some(a), _) => VersionRange::exact(a),
                (1, Some(a), _) => VersionRange::prefix(a),
                (_, a, b) => VersionRange::between(a.clone(), b.clone())
                    .or_else(|| VersionRange::between(b, a))
                    .unwrap_or_else(VersionRange::any),
            })
    }

    fn list_strategy() -> impl Strategy<Value = VersionList> {
        prop::collection::vec(range_strategy(), 0..3).prop_map(VersionList::from_ranges)
    }

    proptest! {
        #[test]
        fn prop_order_is_antisymmetric(a in version_strategy(), b in version_strategy()) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }

        #[test]
        fn prop_order_is_transitive(
            a in version_strategy(),
            b in version_strategy(),
            c in version_strategy(),
        ) {
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn prop_intersection_commutes(a in list_strategy(), b in list_strategy()) {
            prop_assert_eq!(a.intersect(&b), b.intersect(&a));
        }

        #[test]
        fn prop_intersection_associates(
            a in list_strategy(),
            b in list_strategy(),
            c in list_strategy(),
        ) {
            prop_assert_eq!(a.intersect(&b).intersect(&c), a.intersect(&b.intersect(&c)));
        }

        #[test]
        fn prop_intersection_is_conjunction(
            a in list_strategy(),
            b in list_strategy(),
            x in version_strategy(),
        ) {
            prop_assert_eq!(
                a.intersect(&b).contains(&x),
                a.contains(&x) && b.contains(&x)
            );
        }
    }
}
