//! The solver driver: compiles a request into facts, finds a model with
//! resolvo, optimizes it, and instantiates the spec graph.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::SolverConfig;
use crate::criteria::Cost;
use crate::error::ConcretizeError;
use crate::explain::{Explanation, explain};
use crate::facts::Facts;
use crate::graph::SpecGraph;
use crate::model::{Assignment, dependency_edges, find_cycle};
use crate::provider::{Feasibility, check};
use crate::repository::RepositoryIndex;
use crate::search::{BranchAndBound, SearchStats};
use crate::spec::AbstractSpec;

/// Where a solve currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Searching,
    ModelFound,
    Optimizing,
    NoModel,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Init => "building facts",
            Phase::Searching => "searching for a model",
            Phase::ModelFound => "preparing the optimization",
            Phase::Optimizing => "optimizing",
            Phase::NoModel => "explaining the conflict",
        })
    }
}

/// Counters for one solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolveStats {
    pub facts: usize,
    pub candidates: usize,
    pub search: SearchStats,
    pub elapsed: Duration,
}

/// A concretized request with the cost of the chosen model.
#[derive(Debug, Clone)]
pub struct Solution {
    pub graph: SpecGraph,
    pub cost: Cost,
    pub stats: SolveStats,
}

/// Concretizes abstract specs against one repository index.
///
/// Each solve builds its own fact base, so a `Concretizer` can serve
/// several requests at once.
#[derive(Debug, Clone)]
pub struct Concretizer {
    index: Arc<RepositoryIndex>,
    config: SolverConfig,
    installed: Arc<Vec<SpecGraph>>,
}

impl Concretizer {
    pub fn new(index: Arc<RepositoryIndex>, config: SolverConfig) -> Self {
        Self {
            index,
            config,
            installed: Arc::default(),
        }
    }

    /// Offer the nodes of earlier concretizations for reuse. They are only
    /// considered when the configuration sets `reuse`.
    pub fn with_installed(mut self, installed: Vec<SpecGraph>) -> Self {
        self.installed = Arc::new(installed);
        self
    }

    pub fn installed(&self) -> &[SpecGraph] {
        &self.installed
    }

    pub fn index(&self) -> &RepositoryIndex {
        &self.index
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Concretize `request` into a spec graph.
    pub fn concretize(&self, request: &AbstractSpec) -> Result<SpecGraph, ConcretizeError> {
        self.solve(request).map(|solution| solution.graph)
    }

    /// Parse and concretize a spec string.
    pub fn concretize_str(&self, request: &str) -> Result<SpecGraph, ConcretizeError> {
        self.concretize(&AbstractSpec::parse(request)?)
    }

    /// Concretize independent requests in parallel. Results keep the
    /// order of `requests`.
    pub fn concretize_all(
        &self,
        requests: &[AbstractSpec],
    ) -> Vec<Result<SpecGraph, ConcretizeError>> {
        requests.par_iter().map(|r| self.concretize(r)).collect()
    }

    /// Concretize `request` and report the cost and counters of the model.
    pub fn solve(&self, request: &AbstractSpec) -> Result<Solution, ConcretizeError> {
        let start = Instant::now();
        let deadline = self.config.timeout().and_then(|t| start.checked_add(t));
        let label = request.to_string();
        info!(request = %label, "concretizing");

        let timeout = |phase: Phase| {
            warn!(request = %label, %phase, "solve timed out");
            ConcretizeError::SolveTimeout {
                request: label.clone(),
                elapsed: start.elapsed(),
                phase: phase.to_string(),
            }
        };

        let facts = Facts::build_reusing(&self.index, &self.config, &self.installed, request)?;
        let pool = facts.pool();
        debug!(
            phase = %Phase::Init,
            axes = pool.name_count(),
            candidates = pool.solvable_count(),
            facts = facts.maskable_facts().len(),
            "facts built"
        );
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(timeout(Phase::Init));
        }

        let incumbent = match check(&facts, Default::default(), deadline) {
            Feasibility::Model(model) => Assignment::from_solvables(pool, &model),
            Feasibility::Cancelled => return Err(timeout(Phase::Searching)),
            Feasibility::Unsatisfiable(detail) => {
                debug!(phase = %Phase::NoModel, "no model, minimizing the conflict");
                let explanation =
                    explain(&facts, detail, self.config.explain.max_checks, deadline);
                info!(request = %label, elapsed = ?start.elapsed(), "unsatisfiable");
                return Err(ConcretizeError::UnsatisfiableSpec(Box::new(explanation)));
            }
        };
        debug!(phase = %Phase::ModelFound, selected = incumbent.len(), "first model");

        let result = BranchAndBound::new(&facts, &self.config.criteria)
            .with_deadline(deadline)
            .with_incumbent(incumbent.clone())
            .run()
            .map_err(|interrupted| {
                debug!(nodes = interrupted.stats.nodes, "search interrupted");
                timeout(Phase::Optimizing)
            })?;
        debug!(
            phase = %Phase::Optimizing,
            nodes = result.stats.nodes,
            models = result.stats.models,
            pruned = result.stats.pruned,
            "search finished"
        );

        let Some((best, cost)) = result.best else {
            let edges = dependency_edges(&facts, &incumbent);
            return Err(match find_cycle(&edges) {
                Some(node) => ConcretizeError::UnsatisfiableSpec(Box::new(Explanation::cyclic(
                    label.clone(),
                    format!(
                        "{} is part of a dependency cycle",
                        pool.resolve_solvable(node)
                    ),
                ))),
                None => ConcretizeError::InternalConcretization(format!(
                    "the search found no model for `{label}` although resolvo did"
                )),
            });
        };

        let graph = SpecGraph::from_model(&self.index, &facts, &best)?;
        let stats = SolveStats {
            facts: facts.maskable_facts().len(),
            candidates: pool.solvable_count(),
            search: result.stats,
            elapsed: start.elapsed(),
        };
        info!(
            request = %label,
            root = %graph.root_spec(),
            nodes = graph.len(),
            cost = %cost.describe(&self.config.criteria),
            elapsed = ?stats.elapsed,
            "concretized"
        );
        Ok(Solution { graph, cost, stats })
    }
}
