//! Assignments of candidates to axes, and what they imply.

use std::collections::{BTreeMap, HashSet};

use resolvo::{ArenaId, ConditionId, NameId, SolvableId, VersionSetId};

use crate::facts::{FactOrigin, FactRequirement, Facts};
use crate::package::DepTypes;
use crate::pool::{Axis, Candidate, FactPool};

/// At most one selected candidate per axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    selected: Vec<Option<SolvableId>>,
}

impl Assignment {
    pub fn new(axes: usize) -> Self {
        Self {
            selected: vec![None; axes],
        }
    }

    /// Build an assignment from a flat list of solvables, such as a resolvo
    /// solution.
    pub fn from_solvables(pool: &FactPool, solvables: &[SolvableId]) -> Self {
        let mut assignment = Self::new(pool.name_count());
        for &s in solvables {
            assignment.set(pool.solvable_name(s), Some(s));
        }
        assignment
    }

    pub fn get(&self, axis: NameId) -> Option<SolvableId> {
        self.selected.get(axis.to_usize()).copied().flatten()
    }

    /// Assign an axis, returning its previous value.
    pub fn set(&mut self, axis: NameId, value: Option<SolvableId>) -> Option<SolvableId> {
        let i = axis.to_usize();
        if i >= self.selected.len() {
            self.selected.resize(i + 1, None);
        }
        std::mem::replace(&mut self.selected[i], value)
    }

    /// Selected candidates, in axis order.
    pub fn solvables(&self) -> impl Iterator<Item = SolvableId> + '_ {
        self.selected.iter().filter_map(|s| *s)
    }

    pub fn len(&self) -> usize {
        self.selected.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The axis of `version_set` is assigned a matching candidate.
    pub fn satisfies(&self, pool: &FactPool, version_set: VersionSetId) -> bool {
        self.get(pool.version_set_name(version_set))
            .is_some_and(|s| pool.version_set_contains(version_set, s))
    }

    pub fn condition_holds(&self, pool: &FactPool, condition: ConditionId) -> bool {
        pool.condition_atoms(condition)
            .into_iter()
            .all(|vs| self.satisfies(pool, vs))
    }

    /// A requirement applies when its condition holds.
    pub fn is_active(&self, pool: &FactPool, requirement: &FactRequirement) -> bool {
        requirement
            .condition
            .is_none_or(|c| self.condition_holds(pool, c))
    }

    /// One of the requirement's alternatives is assigned a matching candidate.
    pub fn fulfills(&self, pool: &FactPool, requirement: &FactRequirement) -> bool {
        requirement
            .alternatives
            .iter()
            .any(|&vs| self.satisfies(pool, vs))
    }

    /// The package candidate selected for `package`, if any.
    pub fn package(&self, facts: &Facts, package: &str) -> Option<SolvableId> {
        self.get(facts.package_axis(package)?)
    }

    /// The package selected for the request's root. A virtual root resolves
    /// to its selected provider.
    pub fn root_package(&self, facts: &Facts) -> Option<SolvableId> {
        let pool = facts.pool();
        let selected = self.get(facts.root_axis())?;
        match pool.resolve_solvable(selected) {
            Candidate::Package { .. } => Some(selected),
            Candidate::Provider { provider, .. } => self.package(facts, provider),
            _ => None,
        }
    }
}

/// A requirement that applies in an assignment.
#[derive(Debug, Clone, Copy)]
pub struct ActiveRequirement<'a> {
    pub owner: SolvableId,
    pub requirement: &'a FactRequirement,
}

/// Every active requirement of every selected candidate, in axis order.
pub fn active_requirements<'a>(
    facts: &'a Facts,
    assignment: &'a Assignment,
) -> impl Iterator<Item = ActiveRequirement<'a>> + 'a {
    let pool = facts.pool();
    assignment.solvables().flat_map(move |owner| {
        facts
            .facts_of(owner)
            .map(|f| f.requirements.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(move |r| assignment.is_active(pool, r))
            .map(move |requirement| ActiveRequirement { owner, requirement })
    })
}

/// A dependency edge between two selected packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: SolvableId,
    pub to: SolvableId,
    pub types: DepTypes,
    /// Virtuals this edge satisfies.
    pub virtuals: Vec<String>,
}

/// Dependency edges implied by the active dependency declarations.
///
/// An edge to a virtual is redirected to the package of the selected
/// provider. Several declarations between the same packages merge into one
/// edge. Edges are ordered by source then target axis.
pub fn dependency_edges(facts: &Facts, assignment: &Assignment) -> Vec<DependencyEdge> {
    let pool = facts.pool();
    let mut edges: BTreeMap<(usize, usize), DependencyEdge> = BTreeMap::new();

    for active in active_requirements(facts, assignment) {
        let FactOrigin::Dependency {
            dependency, types, ..
        } = facts.origin(active.requirement.fact)
        else {
            continue;
        };
        if !matches!(pool.resolve_solvable(active.owner), Candidate::Package { .. }) {
            continue;
        }
        for &vs in &active.requirement.alternatives {
            let axis = pool.version_set_name(vs);
            let (to, virtual_name) = match pool.resolve_name(axis) {
                Axis::Package(name) if name == dependency => (assignment.get(axis), None),
                Axis::Virtual(name) if name == dependency => {
                    let provider = assignment.get(axis).and_then(|p| {
                        match pool.resolve_solvable(p) {
                            Candidate::Provider { provider, .. } => {
                                assignment.package(facts, provider)
                            }
                            _ => None,
                        }
                    });
                    (provider, Some(name.clone()))
                }
                _ => continue,
            };
            let Some(to) = to else {
                continue;
            };
            let key = (active.owner.to_usize(), to.to_usize());
            let edge = edges.entry(key).or_insert_with(|| DependencyEdge {
                from: active.owner,
                to,
                types: DepTypes::NONE,
                virtuals: Vec::new(),
            });
            edge.types = edge.types.union(*types);
            if let Some(v) = virtual_name {
                if !edge.virtuals.contains(&v) {
                    edge.virtuals.push(v);
                }
            }
        }
    }
    edges.into_values().collect()
}

/// Whether the edges contain a cycle, including self loops.
pub fn has_cycle(edges: &[DependencyEdge]) -> bool {
    find_cycle(edges).is_some()
}

/// A node on some cycle, found by iterative depth-first search.
pub fn find_cycle(edges: &[DependencyEdge]) -> Option<SolvableId> {
    let mut adjacency: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for edge in edges {
        adjacency
            .entry(edge.from.to_usize())
            .or_default()
            .push(edge.to.to_usize());
        adjacency.entry(edge.to.to_usize()).or_default();
    }

    let mut done: HashSet<usize> = HashSet::new();
    let mut on_stack: HashSet<usize> = HashSet::new();
    for &start in adjacency.keys() {
        if done.contains(&start) {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        on_stack.insert(start);
        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let successors = &adjacency[&node];
            if top.1 < successors.len() {
                let succ = successors[top.1];
                top.1 += 1;
                if on_stack.contains(&succ) {
                    return Some(SolvableId::from_usize(succ));
                }
                if !done.contains(&succ) {
                    on_stack.insert(succ);
                    stack.push((succ, 0));
                }
            } else {
                on_stack.remove(&node);
                done.insert(node);
                stack.pop();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(from: usize, to: usize) -> DependencyEdge {
        DependencyEdge {
            from: SolvableId::from_usize(from),
            to: SolvableId::from_usize(to),
            types: DepTypes::default(),
            virtuals: Vec::new(),
        }
    }

    #[test]
    fn acyclic_diamond() {
        let edges = vec![edge(0, 1), edge(0, 2), edge(1, 3), edge(2, 3)];
        assert!(!has_cycle(&edges));
    }

    #[test]
    fn detects_cycles() {
        assert!(has_cycle(&[edge(0, 1), edge(1, 2), edge(2, 0)]));
        assert!(has_cycle(&[edge(4, 4)]));
    }

    #[test]
    fn assignment_set_and_replace() {
        let mut assignment = Assignment::new(2);
        let axis = NameId::from_usize(1);
        let s = SolvableId::from_usize(7);
        assert_eq!(assignment.set(axis, Some(s)), None);
        assert_eq!(assignment.get(axis), Some(s));
        assert_eq!(assignment.len(), 1);
        assert_eq!(assignment.set(axis, None), Some(s));
        assert!(assignment.is_empty());
        // Axes beyond the initial size grow the assignment.
        assignment.set(NameId::from_usize(5), Some(s));
        assert_eq!(assignment.get(NameId::from_usize(5)), Some(s));
    }
}
