//! Bridge between the fact base and resolvo's [`DependencyProvider`] trait.
//!
//! [`ConcretizerProvider`] exposes a [`Facts`] base to [`resolvo::Solver`].
//! Facts can be masked so the explanation reporter can ask whether a
//! subset of them is still unsatisfiable, and an optional deadline cancels
//! the solve when the wall-clock budget runs out.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use resolvo::{
    Candidates, Condition, ConditionId, ConditionalRequirement, Dependencies,
    HintDependenciesAvailable, KnownDependencies, LogicalOperator, NameId, Problem, Requirement,
    SolvableId, Solver, SolverCache, StringId, UnsolvableOrCancelled, VersionSetId,
    VersionSetUnionId,
};

use crate::facts::{FactId, Facts};
use crate::pool::{FactPool, Predicate};

/// Marker value returned through resolvo when the deadline passes.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineExceeded;

/// Dependency provider over a compiled fact base.
pub struct ConcretizerProvider<'a> {
    facts: &'a Facts,
    /// Facts left out of this solve.
    mask: HashSet<FactId>,
    deadline: Option<Instant>,
}

/// Result of a feasibility check.
#[derive(Debug)]
pub enum Feasibility {
    /// A model, as the selected candidates.
    Model(Vec<SolvableId>),
    /// No model exists. Carries resolvo's explanation.
    Unsatisfiable(String),
    Cancelled,
}

impl<'a> ConcretizerProvider<'a> {
    pub fn new(facts: &'a Facts) -> Self {
        Self {
            facts,
            mask: HashSet::new(),
            deadline: None,
        }
    }

    pub fn with_mask(mut self, mask: HashSet<FactId>) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    fn pool(&self) -> &FactPool {
        self.facts.pool()
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The requirement handed to resolvo: select the request's root.
    fn root_requirement(&self) -> ConditionalRequirement {
        ConditionalRequirement {
            condition: None,
            requirement: Requirement::Single(self.facts.root_requirement()),
        }
    }
}

/// Run resolvo over `facts` with the given mask and deadline.
pub fn check(facts: &Facts, mask: HashSet<FactId>, deadline: Option<Instant>) -> Feasibility {
    let provider = ConcretizerProvider::new(facts)
        .with_mask(mask)
        .with_deadline(deadline);
    let requirement = provider.root_requirement();
    let mut solver = Solver::new(provider);
    let problem = Problem::new().requirements(vec![requirement]);
    match solver.solve(problem) {
        Ok(solution) => Feasibility::Model(solution),
        Err(UnsolvableOrCancelled::Unsolvable(conflict)) => {
            Feasibility::Unsatisfiable(conflict.display_user_friendly(&solver).to_string())
        }
        Err(UnsolvableOrCancelled::Cancelled(_)) => Feasibility::Cancelled,
    }
}

// --- Display wrappers ---

struct DisplaySolvable<'a>(&'a FactPool, SolvableId);

impl fmt::Display for DisplaySolvable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_solvable(self.1))
    }
}

struct DisplayName<'a>(&'a FactPool, NameId);

impl fmt::Display for DisplayName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_name(self.1))
    }
}

struct DisplayVersionSet<'a>(&'a FactPool, VersionSetId);

impl fmt::Display for DisplayVersionSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_version_set(self.1))
    }
}

struct DisplayString<'a>(&'a FactPool, StringId);

impl fmt::Display for DisplayString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_string(self.1))
    }
}

// --- Interner ---

impl resolvo::Interner for ConcretizerProvider<'_> {
    fn display_solvable(&self, solvable: SolvableId) -> impl fmt::Display + '_ {
        DisplaySolvable(self.pool(), solvable)
    }

    fn display_name(&self, name: NameId) -> impl fmt::Display + '_ {
        DisplayName(self.pool(), name)
    }

    fn display_version_set(&self, version_set: VersionSetId) -> impl fmt::Display + '_ {
        DisplayVersionSet(self.pool(), version_set)
    }

    fn display_string(&self, string_id: StringId) -> impl fmt::Display + '_ {
        DisplayString(self.pool(), string_id)
    }

    fn version_set_name(&self, version_set: VersionSetId) -> NameId {
        self.pool().version_set_name(version_set)
    }

    fn solvable_name(&self, solvable: SolvableId) -> NameId {
        self.pool().solvable_name(solvable)
    }

    fn version_sets_in_union(
        &self,
        version_set_union: VersionSetUnionId,
    ) -> impl Iterator<Item = VersionSetId> {
        self.pool()
            .resolve_version_set_union(version_set_union)
            .iter()
            .copied()
    }

    fn resolve_condition(&self, condition: ConditionId) -> Condition {
        match self.pool().resolve_condition(condition) {
            Predicate::Holds(version_set) => Condition::Requirement(version_set),
            Predicate::All(a, b) => Condition::Binary(LogicalOperator::And, a, b),
        }
    }
}

// --- DependencyProvider ---

impl resolvo::DependencyProvider for ConcretizerProvider<'_> {
    async fn get_candidates(&self, name: NameId) -> Option<Candidates> {
        let solvables = self.facts.candidates(name)?;
        Some(Candidates {
            candidates: solvables.to_vec(),
            favored: None,
            locked: None,
            hint_dependencies_available: HintDependenciesAvailable::All,
            excluded: self.facts.excluded(name).to_vec(),
        })
    }

    async fn sort_candidates(&self, _solver: &SolverCache<Self>, solvables: &mut [SolvableId]) {
        // Candidate lists are built best first.
        solvables.sort_by_key(|&s| self.facts.preference(s));
    }

    async fn filter_candidates(
        &self,
        candidates: &[SolvableId],
        version_set: VersionSetId,
        inverse: bool,
    ) -> Vec<SolvableId> {
        let constraint = self.pool().resolve_version_set(version_set);
        candidates
            .iter()
            .copied()
            .filter(|&s| constraint.matches(self.pool().resolve_solvable(s)) != inverse)
            .collect()
    }

    async fn get_dependencies(&self, solvable: SolvableId) -> Dependencies {
        let Some(facts) = self.facts.facts_of(solvable) else {
            return Dependencies::Known(KnownDependencies::default());
        };
        let requirements = facts
            .requirements
            .iter()
            .filter(|r| !self.mask.contains(&r.fact))
            .map(|r| ConditionalRequirement {
                condition: r.condition,
                requirement: match r.union {
                    Some(union) => Requirement::Union(union),
                    None => Requirement::Single(r.alternatives[0]),
                },
            })
            .collect();
        let constrains = facts
            .constrains
            .iter()
            .filter(|c| !self.mask.contains(&c.fact))
            .map(|c| c.version_set)
            .collect();
        Dependencies::Known(KnownDependencies {
            requirements,
            constrains,
        })
    }

    fn should_cancel_with_value(&self) -> Option<Box<dyn Any>> {
        self.expired()
            .then(|| Box::new(DeadlineExceeded) as Box<dyn Any>)
    }
}
