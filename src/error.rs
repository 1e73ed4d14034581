//! Error types returned by the concretizer.

use std::time::Duration;

use crate::explain::Explanation;

/// A version string or range could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version `{input}`: {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

impl VersionParseError {
    pub(crate) fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// An abstract spec string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid spec `{input}` at offset {offset}: {reason}")]
pub struct SpecParseError {
    pub input: String,
    pub offset: usize,
    pub reason: String,
}

/// Everything that can go wrong while concretizing a request.
#[derive(Debug, thiserror::Error)]
pub enum ConcretizeError {
    #[error(transparent)]
    VersionParse(#[from] VersionParseError),

    #[error(transparent)]
    SpecParse(#[from] SpecParseError),

    /// The name is neither a package nor a virtual with providers.
    #[error("unknown package `{name}`{}", needed_by.as_ref().map(|n| format!(" (needed by `{n}`)")).unwrap_or_default())]
    UnknownPackage {
        name: String,
        needed_by: Option<String>,
    },

    /// The request contradicts the repository before any search happens.
    #[error("cannot satisfy request `{request}`: {reason}")]
    UnsatisfiableRequest { request: String, reason: String },

    /// The search proved that no assignment satisfies the request.
    #[error("{0}")]
    UnsatisfiableSpec(Box<Explanation>),

    /// The wall-clock budget ran out before the search finished.
    #[error("concretizing `{request}` timed out after {elapsed:?} while {phase}")]
    SolveTimeout {
        request: String,
        elapsed: Duration,
        phase: String,
    },

    /// A model was produced that breaks a graph invariant. This is a bug in
    /// the fact encoding, never a property of the request.
    #[error("internal concretization error: {0}")]
    InternalConcretization(String),

    /// A package definition is internally inconsistent.
    #[error("invalid package `{package}`: {reason}")]
    InvalidPackage { package: String, reason: String },

    #[error("invalid solver configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid package repository data: {0}")]
    Repository(#[from] serde_json::Error),
}

impl ConcretizeError {
    /// The minimal conflicting constraints, when the failure is an unsatisfiable spec.
    pub fn explanation(&self) -> Option<&Explanation> {
        match self {
            ConcretizeError::UnsatisfiableSpec(explanation) => Some(explanation),
            _ => None,
        }
    }
}
