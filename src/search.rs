//! Branch-and-bound optimization over the fact base.
//!
//! The search keeps an explicit choice stack. Each frame holds the
//! candidates that can satisfy one open requirement, best first, and the
//! trail length to restore before trying the next one. Backtracking pops
//! assignments off the trail, so no state outlives the search.
//!
//! Before branching, the axes the partial assignment forces are narrowed to
//! a fixpoint: an axis every remaining candidate of a forced axis demands is
//! forced too. The open requirement with the fewest remaining candidates is
//! decided first. A branch is cut as soon as its lower bound (the selected
//! candidates plus the cheapest choice on every forced axis) reaches the
//! best model found so far, so ties keep the first model found.

use std::collections::BTreeMap;
use std::time::Instant;

use resolvo::{ArenaId, NameId, SolvableId, VersionSetId};
use tracing::trace;

use crate::criteria::{Cost, Criterion, evaluate, lower_bound};
use crate::facts::Facts;
use crate::model::{Assignment, active_requirements, dependency_edges, has_cycle};

/// Nodes between two deadline checks.
const DEADLINE_INTERVAL: u64 = 256;

/// Counters reported after a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    /// Decisions taken.
    pub nodes: u64,
    /// Complete models reached, including rejected ones.
    pub models: u64,
    /// Models rejected because their dependency edges form a cycle.
    pub cyclic_models: u64,
    /// Branches cut by the cost bound.
    pub pruned: u64,
}

/// The search ran out of time.
#[derive(Debug, Clone, Copy)]
pub struct Interrupted {
    pub stats: SearchStats,
}

/// Outcome of a completed search.
#[derive(Debug)]
pub struct SearchResult {
    /// The optimal model and its cost, if any model exists.
    pub best: Option<(Assignment, Cost)>,
    pub stats: SearchStats,
}

struct Frame {
    /// Trail length before any of this frame's choices was assigned.
    trail_len: usize,
    choices: Vec<SolvableId>,
    next: usize,
}

enum Expansion {
    /// Every active requirement is fulfilled.
    Model,
    /// The branch cannot lead to a (better) model.
    Dead,
    /// Candidates for the most constrained open requirement.
    Branch(Vec<SolvableId>),
}

/// Optimal model search over one fact base.
pub struct BranchAndBound<'a> {
    facts: &'a Facts,
    criteria: &'a [Criterion],
    deadline: Option<Instant>,
    assignment: Assignment,
    trail: Vec<NameId>,
    stack: Vec<Frame>,
    best: Option<(Assignment, Cost)>,
    stats: SearchStats,
}

impl<'a> BranchAndBound<'a> {
    pub fn new(facts: &'a Facts, criteria: &'a [Criterion]) -> Self {
        Self {
            facts,
            criteria,
            deadline: None,
            assignment: Assignment::new(facts.pool().name_count()),
            trail: Vec::new(),
            stack: Vec::new(),
            best: None,
            stats: SearchStats::default(),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Seed the bound with a known model. Models with a dependency cycle
    /// are ignored.
    pub fn with_incumbent(mut self, incumbent: Assignment) -> Self {
        if !has_cycle(&dependency_edges(self.facts, &incumbent)) {
            let cost = evaluate(self.facts, &incumbent, self.criteria);
            self.best = Some((incumbent, cost));
        }
        self
    }

    /// Run to completion or until the deadline passes.
    pub fn run(mut self) -> Result<SearchResult, Interrupted> {
        self.assign(self.facts.root());
        self.expand_and_push();

        while let Some(frame) = self.stack.last_mut() {
            if frame.next == frame.choices.len() {
                let trail_len = frame.trail_len;
                self.stack.pop();
                self.undo_to(trail_len);
                continue;
            }
            let choice = frame.choices[frame.next];
            frame.next += 1;
            let trail_len = frame.trail_len;

            self.undo_to(trail_len);
            self.tick()?;
            trace!(
                depth = self.stack.len(),
                choice = %self.facts.pool().resolve_solvable(choice),
                "decide"
            );
            self.assign(choice);
            self.expand_and_push();
        }

        Ok(SearchResult {
            best: self.best,
            stats: self.stats,
        })
    }

    fn tick(&mut self) -> Result<(), Interrupted> {
        self.stats.nodes += 1;
        if self.stats.nodes % DEADLINE_INTERVAL == 0
            && self.deadline.is_some_and(|d| Instant::now() >= d)
        {
            return Err(Interrupted { stats: self.stats });
        }
        Ok(())
    }

    fn assign(&mut self, solvable: SolvableId) {
        let axis = self.facts.pool().solvable_name(solvable);
        self.assignment.set(axis, Some(solvable));
        self.trail.push(axis);
    }

    fn undo_to(&mut self, len: usize) {
        while self.trail.len() > len {
            if let Some(axis) = self.trail.pop() {
                self.assignment.set(axis, None);
            }
        }
    }

    fn expand_and_push(&mut self) {
        match self.expand() {
            Expansion::Model => self.record(),
            Expansion::Dead => {}
            Expansion::Branch(choices) => self.stack.push(Frame {
                trail_len: self.trail.len(),
                choices,
                next: 0,
            }),
        }
    }

    fn expand(&mut self) -> Expansion {
        let facts = self.facts;
        let pool = facts.pool();
        let assignment = &self.assignment;

        // Constraints of selected candidates, which also restrict open axes.
        let mut constrains: Vec<VersionSetId> = Vec::new();
        for s in assignment.solvables() {
            let Some(f) = facts.facts_of(s) else {
                continue;
            };
            for c in &f.constrains {
                let axis = pool.version_set_name(c.version_set);
                if assignment
                    .get(axis)
                    .is_some_and(|chosen| !pool.version_set_contains(c.version_set, chosen))
                {
                    return Expansion::Dead;
                }
                constrains.push(c.version_set);
            }
        }
        let admissible = |candidate: SolvableId| {
            let axis = pool.solvable_name(candidate);
            !facts.is_excluded(candidate)
                && constrains.iter().all(|&c| {
                    pool.version_set_name(c) != axis || pool.version_set_contains(c, candidate)
                })
        };

        // Unselected axes some completion must select, with the candidates
        // still allowed on them.
        let mut open: BTreeMap<usize, Vec<SolvableId>> = BTreeMap::new();
        // Axes named by an unfulfilled requirement, in requirement order.
        let mut required: Vec<usize> = Vec::new();
        // Requirements with several alternatives, as their viable candidates.
        let mut disjunctions: Vec<Vec<SolvableId>> = Vec::new();

        for active in active_requirements(facts, assignment) {
            let requirement = active.requirement;
            if assignment.fulfills(pool, requirement) {
                continue;
            }
            if let &[vs] = requirement.alternatives.as_slice() {
                let axis = pool.version_set_name(vs);
                if assignment.get(axis).is_some() {
                    return Expansion::Dead;
                }
                let key = axis.to_usize();
                let allowed = open
                    .entry(key)
                    .or_insert_with(|| admissible_candidates(facts, axis, &admissible));
                allowed.retain(|&c| pool.version_set_contains(vs, c));
                if allowed.is_empty() {
                    return Expansion::Dead;
                }
                if !required.contains(&key) {
                    required.push(key);
                }
                continue;
            }

            let mut viable: Vec<SolvableId> = Vec::new();
            for &vs in &requirement.alternatives {
                let axis = pool.version_set_name(vs);
                if assignment.get(axis).is_some() {
                    continue;
                }
                for &candidate in facts.candidates(axis).unwrap_or_default() {
                    if pool.version_set_contains(vs, candidate)
                        && admissible(candidate)
                        && !viable.contains(&candidate)
                    {
                        viable.push(candidate);
                    }
                }
            }
            if viable.is_empty() {
                return Expansion::Dead;
            }
            disjunctions.push(viable);
        }

        if !propagate(facts, assignment, &mut open, &admissible) {
            return Expansion::Dead;
        }

        if let (Some((_, best)), Some(_)) = (&self.best, assignment.root_package(facts)) {
            let bound = lower_bound(
                facts,
                assignment,
                open.values().map(Vec::as_slice),
                self.criteria,
            );
            if bound >= *best {
                self.stats.pruned += 1;
                return Expansion::Dead;
            }
        }

        let mut branch: Option<&Vec<SolvableId>> = None;
        for choices in required.iter().filter_map(|key| open.get(key)).chain(&disjunctions) {
            if branch.is_none_or(|best| choices.len() < best.len()) {
                branch = Some(choices);
            }
        }
        match branch {
            Some(choices) => Expansion::Branch(choices.clone()),
            None => Expansion::Model,
        }
    }

    fn record(&mut self) {
        self.stats.models += 1;
        if has_cycle(&dependency_edges(self.facts, &self.assignment)) {
            self.stats.cyclic_models += 1;
            trace!("model rejected: dependency cycle");
            return;
        }
        let cost = evaluate(self.facts, &self.assignment, self.criteria);
        if self.best.as_ref().is_none_or(|(_, best)| cost < *best) {
            trace!(cost = %cost, "improved model");
            self.best = Some((self.assignment.clone(), cost));
        }
    }
}

/// Candidates of `axis` in preference order that `admissible` accepts.
fn admissible_candidates(
    facts: &Facts,
    axis: NameId,
    admissible: &impl Fn(SolvableId) -> bool,
) -> Vec<SolvableId> {
    facts
        .candidates(axis)
        .unwrap_or_default()
        .iter()
        .copied()
        .filter(|&c| admissible(c))
        .collect()
}

/// What selecting `candidate` would demand of the unselected axes: per
/// axis, the candidates every applicable requirement there accepts.
///
/// `None` when the candidate cannot be selected in this assignment.
fn demands(
    facts: &Facts,
    assignment: &Assignment,
    candidate: SolvableId,
    admissible: &impl Fn(SolvableId) -> bool,
) -> Option<BTreeMap<usize, Vec<SolvableId>>> {
    let pool = facts.pool();
    let mut needs: BTreeMap<usize, Vec<SolvableId>> = BTreeMap::new();
    let Some(own) = facts.facts_of(candidate) else {
        return Some(needs);
    };
    for c in &own.constrains {
        if let Some(chosen) = assignment.get(pool.version_set_name(c.version_set)) {
            if !pool.version_set_contains(c.version_set, chosen) {
                return None;
            }
        }
    }
    for requirement in &own.requirements {
        let &[vs] = requirement.alternatives.as_slice() else {
            continue;
        };
        if !assignment.is_active(pool, requirement) {
            continue;
        }
        let axis = pool.version_set_name(vs);
        if let Some(chosen) = assignment.get(axis) {
            if !pool.version_set_contains(vs, chosen) {
                return None;
            }
            continue;
        }
        let allowed = needs
            .entry(axis.to_usize())
            .or_insert_with(|| admissible_candidates(facts, axis, admissible));
        allowed.retain(|&c| pool.version_set_contains(vs, c));
        if allowed.is_empty() {
            return None;
        }
    }
    Some(needs)
}

/// Narrow `open` to a fixpoint.
///
/// Candidates whose own demands cannot be met are dropped. An axis that
/// every remaining candidate of an open axis demands is open as well,
/// restricted to the union of what those candidates accept there. Returns
/// false when an open axis runs out of candidates.
fn propagate(
    facts: &Facts,
    assignment: &Assignment,
    open: &mut BTreeMap<usize, Vec<SolvableId>>,
    admissible: &impl Fn(SolvableId) -> bool,
) -> bool {
    let mut queue: Vec<usize> = open.keys().rev().copied().collect();
    while let Some(key) = queue.pop() {
        let Some(allowed) = open.get(&key) else {
            continue;
        };
        let before = allowed.len();
        let feasible: Vec<(SolvableId, BTreeMap<usize, Vec<SolvableId>>)> = allowed
            .iter()
            .filter_map(|&c| Some((c, demands(facts, assignment, c, admissible)?)))
            .collect();
        let Some((_, first)) = feasible.first() else {
            return false;
        };
        if feasible.len() < before {
            open.insert(key, feasible.iter().map(|(c, _)| *c).collect());
        }

        for &axis in first.keys() {
            if feasible.iter().any(|(_, needs)| !needs.contains_key(&axis)) {
                continue;
            }
            let accepted = |c: &SolvableId| {
                feasible
                    .iter()
                    .any(|(_, needs)| needs.get(&axis).is_some_and(|n| n.contains(c)))
            };
            match open.get_mut(&axis) {
                Some(existing) => {
                    let len = existing.len();
                    existing.retain(accepted);
                    if existing.is_empty() {
                        return false;
                    }
                    if existing.len() < len {
                        queue.push(axis);
                    }
                }
                None => {
                    let narrowed: Vec<SolvableId> =
                        admissible_candidates(facts, NameId::from_usize(axis), admissible)
                            .into_iter()
                            .filter(accepted)
                            .collect();
                    if narrowed.is_empty() {
                        return false;
                    }
                    open.insert(axis, narrowed);
                    queue.push(axis);
                }
            }
        }
    }
    true
}
