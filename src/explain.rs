//! Explanations for unsatisfiable requests.
//!
//! Once resolvo has proven a request unsatisfiable, the reporter shrinks
//! the set of facts responsible by deletion: each maskable fact is dropped
//! in turn and kept out if the rest is still unsatisfiable. What remains
//! is a subset-minimal core, rendered as numbered clauses.

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use tracing::debug;

use crate::facts::{FactId, Facts};
use crate::provider::{Feasibility, check};

/// Why a request cannot be concretized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Explanation {
    pub request: String,
    pub summary: String,
    /// Conflicting constraints, one clause each.
    pub core: Vec<String>,
    /// resolvo's own account of the conflict.
    pub solver_detail: Option<String>,
    /// Whether dropping any clause of `core` makes the request satisfiable.
    pub minimal: bool,
}

impl Explanation {
    /// Request whose every model has a dependency cycle.
    pub(crate) fn cyclic(request: String, cycle: String) -> Self {
        Self {
            request,
            summary: "every configuration satisfying the request has a dependency cycle".into(),
            core: vec![cycle],
            solver_detail: None,
            minimal: false,
        }
    }
}

impl fmt::Display for Explanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot concretize `{}`: {}", self.request, self.summary)?;
        for (i, clause) in self.core.iter().enumerate() {
            write!(f, "\n  {}. {clause}", i + 1)?;
        }
        if let Some(detail) = &self.solver_detail {
            write!(f, "\n\nsolver detail:\n{}", detail.trim_end())?;
        }
        Ok(())
    }
}

/// Minimize the unsatisfiable core of `facts`.
///
/// Stops early when `max_checks` solver calls have been spent or the
/// deadline passes; the explanation is then not claimed to be minimal.
pub fn explain(
    facts: &Facts,
    solver_detail: String,
    max_checks: usize,
    deadline: Option<Instant>,
) -> Explanation {
    let request = facts.request().to_string();
    let maskable = facts.maskable_facts();
    let mut core: Vec<FactId> = maskable.clone();
    let mut checks = 0;
    let mut exhausted = false;

    let mut i = 0;
    while i < core.len() {
        if checks >= max_checks || deadline.is_some_and(|d| Instant::now() >= d) {
            exhausted = true;
            break;
        }
        checks += 1;
        let candidate = core[i];
        let keep: HashSet<FactId> = core.iter().copied().filter(|&f| f != candidate).collect();
        let mask: HashSet<FactId> = maskable
            .iter()
            .copied()
            .filter(|f| !keep.contains(f))
            .collect();
        match check(facts, mask, deadline) {
            Feasibility::Unsatisfiable(_) => {
                core.remove(i);
            }
            Feasibility::Model(_) => i += 1,
            Feasibility::Cancelled => {
                exhausted = true;
                break;
            }
        }
    }

    debug!(
        request = %request,
        facts = maskable.len(),
        core = core.len(),
        checks,
        exhausted,
        "unsat core"
    );

    if exhausted {
        return Explanation {
            request,
            summary: format!(
                "request is unsatisfiable for an unspecified combination of {} constraints",
                core.len()
            ),
            core: Vec::new(),
            solver_detail: Some(solver_detail),
            minimal: false,
        };
    }

    let mut clauses: Vec<String> = Vec::new();
    for fact in core {
        let clause = facts.origin(fact).to_string();
        if !clauses.contains(&clause) {
            clauses.push(clause);
        }
    }
    Explanation {
        request,
        summary: "these constraints cannot all hold".into(),
        core: clauses,
        solver_detail: Some(solver_detail),
        minimal: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverConfig;
    use crate::repository::{InMemoryRepository, RepositoryIndex};
    use crate::spec::AbstractSpec;

    const REPO: &str = r#"[
        {"name": "a", "versions": ["1.0"],
         "variants": [{"name": "feature", "default": ["false"], "values": ["true", "false"]}],
         "dependencies": ["b", "c"],
         "conflicts": [{"spec": "^b@3:", "when": "+feature", "message": "needs the old b API"}]},
        {"name": "b", "versions": ["2.0", "3.0"]},
        {"name": "c", "versions": ["1.0"]}
    ]"#;

    fn facts(request: &str) -> Facts {
        let repo = InMemoryRepository::from_json(REPO).unwrap();
        let index = RepositoryIndex::from_repository(&repo).unwrap();
        Facts::build(&index, &SolverConfig::default(), &AbstractSpec::parse(request).unwrap())
            .unwrap()
    }

    #[test]
    fn core_names_the_conflict() {
        let facts = facts("a+feature ^b@3.0");
        let explanation = explain(&facts, "detail".into(), 256, None);
        assert!(explanation.minimal);
        let mut core = explanation.core.clone();
        core.sort();
        assert_eq!(
            core,
            vec![
                "a conflicts with '^b@3:' when '+feature' (needs the old b API)".to_string(),
                "the request asks for '^b@3.0'".to_string(),
                "the request asks for 'a+feature'".to_string(),
            ]
        );
        let text = explanation.to_string();
        assert!(text.starts_with("cannot concretize `a+feature ^b@3.0`"));
        assert!(text.contains("  3. "));
        assert!(!text.contains("  4. "));
    }

    #[test]
    fn check_budget_falls_back() {
        let facts = facts("a+feature ^b@3.0");
        let explanation = explain(&facts, "detail".into(), 1, None);
        assert!(!explanation.minimal);
        assert!(explanation.core.is_empty());
        assert!(explanation
            .summary
            .starts_with("request is unsatisfiable for an unspecified combination of"));
    }
}
