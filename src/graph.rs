//! Concrete spec DAGs built from solver models.
//!
//! A [`SpecGraph`] is an arena of frozen [`ConcreteSpec`] nodes addressed by
//! [`NodeId`]. Every selected package becomes exactly one node, shared by
//! all of its dependers. Graphs are checked against the package
//! declarations before they are returned; a violation means the fact
//! encoding is wrong and is reported as
//! [`ConcretizeError::InternalConcretization`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use resolvo::SolvableId;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ConcretizeError;
use crate::facts::Facts;
use crate::model::{Assignment, DependencyEdge, active_requirements, dependency_edges, find_cycle};
use crate::package::DepTypes;
use crate::pool::{Axis, Candidate, Origin};
use crate::repository::RepositoryIndex;
use crate::spec::{AbstractSpec, CompilerConstraint, CompilerSpec, FALSE, TRUE};
use crate::version::{Version, VersionList};

/// Number of hex digits kept from the SHA-256 digest.
pub const HASH_LENGTH: usize = 32;

/// Index of a node in a [`SpecGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// An outgoing dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub node: NodeId,
    pub types: DepTypes,
    /// Virtuals this dependency provides to the depender.
    pub virtuals: Vec<String>,
}

/// A fully concrete package node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcreteSpec {
    pub name: String,
    pub version: Version,
    /// Active variants and their values.
    pub variants: BTreeMap<String, BTreeSet<String>>,
    pub compiler: Option<CompilerSpec>,
    pub target: Option<String>,
    /// Built from source, or a prebuilt external or installed node.
    pub origin: Origin,
    /// Outgoing edges, ordered by dependency name.
    pub dependencies: Vec<Dependency>,
    hash: String,
}

impl ConcreteSpec {
    /// Content hash over the node and, transitively, its dependencies.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn short_hash(&self) -> &str {
        &self.hash[..7.min(self.hash.len())]
    }

    /// Whether this node meets the node-level constraints of `spec`. The
    /// spec's name and dependencies are not considered.
    pub fn satisfies_node(&self, spec: &AbstractSpec) -> bool {
        spec.versions.contains(&self.version)
            && spec.variants.iter().all(|(variant, values)| {
                self.variants
                    .get(variant)
                    .is_some_and(|have| values.is_subset(have))
            })
            && spec.compiler.as_ref().is_none_or(|c| {
                self.compiler.as_ref().is_some_and(|have| c.matches(have))
            })
            && spec
                .target
                .as_ref()
                .is_none_or(|t| self.target.as_ref() == Some(t))
    }

    /// This node pinned as an abstract spec.
    pub fn to_abstract(&self) -> AbstractSpec {
        AbstractSpec {
            name: Some(self.name.clone()),
            versions: VersionList::exact(self.version.clone()),
            variants: self.variants.clone(),
            compiler: self.compiler.as_ref().map(|c| CompilerConstraint {
                name: c.name.clone(),
                versions: VersionList::exact(c.version.clone()),
            }),
            target: self.target.clone(),
            dependencies: Vec::new(),
        }
    }

    fn hash_input(&self, dependency_hashes: &[(String, DepTypes)]) -> String {
        let mut input = format!("{}@{}", self.name, self.version);
        for (variant, values) in &self.variants {
            let values: Vec<&str> = values.iter().map(String::as_str).collect();
            input.push_str(&format!(";{variant}={}", values.join(",")));
        }
        if let Some(compiler) = &self.compiler {
            input.push_str(&format!(";%{compiler}"));
        }
        if let Some(target) = &self.target {
            input.push_str(&format!(";target={target}"));
        }
        if let Origin::External { prefix } = &self.origin {
            input.push_str(&format!(";external={prefix}"));
        }
        for (hash, types) in dependency_hashes {
            input.push_str(&format!(";^{hash}:{types}"));
        }
        input
    }
}

impl fmt::Display for ConcreteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)?;
        let mut keyed = Vec::new();
        for (variant, values) in &self.variants {
            if values.len() == 1 && values.contains(TRUE) {
                write!(f, "+{variant}")?;
            } else if values.len() == 1 && values.contains(FALSE) {
                write!(f, "~{variant}")?;
            } else if !values.is_empty() {
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                keyed.push(format!("{variant}={}", values.join(",")));
            }
        }
        for kv in keyed {
            write!(f, " {kv}")?;
        }
        if let Some(compiler) = &self.compiler {
            write!(f, " %{compiler}")?;
        }
        if let Some(target) = &self.target {
            write!(f, " target={target}")?;
        }
        if let Origin::External { .. } = self.origin {
            write!(f, " [external]")?;
        }
        Ok(())
    }
}

/// A concretized DAG with a distinguished root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecGraph {
    nodes: Vec<ConcreteSpec>,
    root: NodeId,
}

impl SpecGraph {
    /// Instantiate the graph for a solver model and verify it.
    pub fn from_model(
        index: &RepositoryIndex,
        facts: &Facts,
        assignment: &Assignment,
    ) -> Result<Self, ConcretizeError> {
        let pool = facts.pool();
        check_model(facts, assignment)?;

        // Nodes, ordered by package name.
        let mut packages: Vec<(SolvableId, &str, &Version, &Origin)> = assignment
            .solvables()
            .filter_map(|s| match pool.resolve_solvable(s) {
                Candidate::Package {
                    name,
                    version,
                    origin,
                    ..
                } => Some((s, name.as_str(), version, origin)),
                _ => None,
            })
            .collect();
        packages.sort_by(|a, b| a.1.cmp(b.1));

        let mut by_solvable: HashMap<SolvableId, NodeId> = HashMap::new();
        let mut by_name: HashMap<String, NodeId> = HashMap::new();
        let mut nodes: Vec<ConcreteSpec> = Vec::with_capacity(packages.len());
        for (s, name, version, origin) in packages {
            let id = NodeId(nodes.len());
            by_solvable.insert(s, id);
            by_name.insert(name.to_string(), id);
            nodes.push(ConcreteSpec {
                name: name.to_string(),
                version: version.clone(),
                variants: BTreeMap::new(),
                compiler: None,
                target: None,
                origin: origin.clone(),
                dependencies: Vec::new(),
                hash: String::new(),
            });
        }

        let node_of = |s: SolvableId| {
            by_solvable.get(&s).copied().ok_or_else(|| {
                ConcretizeError::InternalConcretization(format!(
                    "{} is not a package node",
                    pool.resolve_solvable(s)
                ))
            })
        };
        let root = assignment
            .root_package(facts)
            .ok_or_else(|| {
                ConcretizeError::InternalConcretization("the model selects no root package".into())
            })
            .and_then(node_of)?;

        // Node attributes.
        for s in assignment.solvables() {
            let axis = pool.resolve_name(pool.solvable_name(s));
            let Some(package) = axis.package() else {
                continue;
            };
            let node = by_name.get(package).copied().ok_or_else(|| {
                ConcretizeError::InternalConcretization(format!(
                    "{axis} is decided but {package} is not in the graph"
                ))
            })?;
            let node = &mut nodes[node.0];
            match (axis, pool.resolve_solvable(s)) {
                (Axis::Variant { variant, .. }, Candidate::VariantValue { value, .. }) => {
                    node.variants
                        .entry(variant.clone())
                        .or_default()
                        .insert(value.clone());
                }
                (Axis::VariantValue { variant, value, .. }, Candidate::VariantValue { value: state, .. }) => {
                    let values = node.variants.entry(variant.clone()).or_default();
                    if state == TRUE {
                        values.insert(value.clone());
                    }
                }
                (Axis::Compiler(_), Candidate::Compiler { compiler, .. }) => {
                    node.compiler = Some(compiler.clone());
                }
                (Axis::Target(_), Candidate::Target { target, .. }) => {
                    node.target = Some(target.clone());
                }
                _ => {}
            }
        }

        // Edges.
        let edges = dependency_edges(facts, assignment);
        if let Some(on_cycle) = find_cycle(&edges) {
            return Err(ConcretizeError::InternalConcretization(format!(
                "dependency cycle through {}",
                pool.resolve_solvable(on_cycle)
            )));
        }
        for DependencyEdge {
            from,
            to,
            types,
            virtuals,
        } in edges
        {
            let (from, to) = (node_of(from)?, node_of(to)?);
            nodes[from.0].dependencies.push(Dependency {
                node: to,
                types,
                virtuals,
            });
        }
        for i in 0..nodes.len() {
            let mut deps = std::mem::take(&mut nodes[i].dependencies);
            deps.sort_by(|a, b| nodes[a.node.0].name.cmp(&nodes[b.node.0].name));
            nodes[i].dependencies = deps;
        }

        let mut graph = SpecGraph { nodes, root };
        graph.verify(index)?;
        graph.compute_hashes();
        debug!(
            root = %graph.root_spec(),
            nodes = graph.len(),
            hash = graph.root_spec().short_hash(),
            "spec graph built"
        );
        Ok(graph)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_spec(&self) -> &ConcreteSpec {
        &self.nodes[self.root.0]
    }

    pub fn node(&self, id: NodeId) -> &ConcreteSpec {
        &self.nodes[id.0]
    }

    /// Every node, ordered by package name.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ConcreteSpec)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&ConcreteSpec> {
        self.find_id(name).map(|id| self.node(id))
    }

    fn find_id(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(NodeId)
    }

    /// Nodes so that every dependency comes before its dependers. Ties are
    /// broken by package name.
    pub fn install_order(&self) -> Vec<NodeId> {
        let mut pending: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut dependers: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.dependencies {
                dependers[dep.node.0].push(NodeId(i));
            }
        }

        let mut ready: BTreeSet<NodeId> = (0..self.nodes.len())
            .filter(|&i| pending[i] == 0)
            .map(NodeId)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &depender in &dependers[node.0] {
                pending[depender.0] -= 1;
                if pending[depender.0] == 0 {
                    ready.insert(depender);
                }
            }
        }
        order
    }

    /// Depth-first preorder from the root, visiting each node once, with
    /// the depth at which it was first reached.
    pub fn traverse(&self) -> Vec<(NodeId, usize)> {
        let mut seen = vec![false; self.nodes.len()];
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, 0)];
        while let Some((id, depth)) = stack.pop() {
            if std::mem::replace(&mut seen[id.0], true) {
                continue;
            }
            out.push((id, depth));
            for dep in self.nodes[id.0].dependencies.iter().rev() {
                if !seen[dep.node.0] {
                    stack.push((dep.node, depth + 1));
                }
            }
        }
        out
    }

    /// The whole graph pinned as an abstract request. Concretizing it again
    /// yields the same graph.
    pub fn to_request(&self) -> AbstractSpec {
        let mut request = self.root_spec().to_abstract();
        for (id, node) in self.nodes() {
            if id != self.root {
                request.dependencies.push(node.to_abstract());
            }
        }
        request
    }

    /// Whether the root satisfies `spec`, including its `^dependency`
    /// constraints.
    pub fn satisfies(&self, spec: &AbstractSpec) -> bool {
        spec.name
            .as_deref()
            .is_none_or(|n| self.root_spec().name == n)
            && self.matches(self.root, spec)
    }

    /// Node-level match on `node`; `^dependencies` may match any node of
    /// the graph, or for a virtual any provider edge.
    fn matches(&self, node: NodeId, spec: &AbstractSpec) -> bool {
        self.node(node).satisfies_node(spec)
            && spec.dependencies.iter().all(|dep| {
                let name = dep.name.as_deref().unwrap_or_default();
                match self.find(name) {
                    Some(found) => found.satisfies_node(dep),
                    None => self.provides(name),
                }
            })
    }

    pub(crate) fn node_matches(&self, node: NodeId, spec: &AbstractSpec) -> bool {
        self.matches(node, spec)
    }

    fn provides(&self, virtual_name: &str) -> bool {
        self.nodes
            .iter()
            .flat_map(|n| &n.dependencies)
            .any(|d| d.virtuals.iter().any(|v| v == virtual_name))
    }

    /// Check the graph against the package declarations.
    fn verify(&self, index: &RepositoryIndex) -> Result<(), ConcretizeError> {
        let internal = |reason: String| Err(ConcretizeError::InternalConcretization(reason));
        let mut providers: HashMap<&str, NodeId> = HashMap::new();

        for (id, node) in self.nodes() {
            let Some(definition) = index.package(&node.name) else {
                return internal(format!("{} is not a known package", node.name));
            };

            for (variant, values) in &node.variants {
                let Some(declaration) = definition.variant(variant) else {
                    return internal(format!("{node} sets undeclared variant '{variant}'"));
                };
                if !declaration.multi && values.len() != 1 {
                    return internal(format!("{node} has {} values for '{variant}'", values.len()));
                }
                if let Some(bad) = values.iter().find(|v| !declaration.allows(v)) {
                    return internal(format!("{node} sets '{variant}' to disallowed '{bad}'"));
                }
            }

            for dep in &node.dependencies {
                for v in &dep.virtuals {
                    if *providers.entry(v.as_str()).or_insert(dep.node) != dep.node {
                        return internal(format!("{v} has more than one provider"));
                    }
                }
            }

            for conflict in &definition.conflicts {
                if self.matches(id, &conflict.when) && self.conflict_matches(id, &conflict.spec) {
                    return internal(format!(
                        "{node} violates its conflict with '{}'",
                        conflict.spec
                    ));
                }
            }

            // Prebuilt nodes keep the dependencies they were built with.
            if !node.origin.is_build() {
                continue;
            }
            for declaration in &definition.dependencies {
                if !self.matches(id, &declaration.when) {
                    continue;
                }
                let name = declaration.name();
                let met = node.dependencies.iter().any(|d| {
                    let target = self.node(d.node);
                    if d.virtuals.iter().any(|v| v == name) {
                        return true;
                    }
                    target.name == name && self.matches(d.node, &declaration.spec)
                });
                if !met {
                    return internal(format!(
                        "{node} lacks its dependency '{}'",
                        declaration.spec
                    ));
                }
            }
        }
        Ok(())
    }

    fn conflict_matches(&self, node: NodeId, spec: &AbstractSpec) -> bool {
        match spec.name.as_deref() {
            Some(name) if name != self.node(node).name => {
                self.find_id(name).is_some_and(|other| self.matches(other, spec))
            }
            _ => self.matches(node, spec),
        }
    }

    fn compute_hashes(&mut self) {
        for id in self.install_order() {
            let mut dependency_hashes: Vec<(String, DepTypes)> = self.nodes[id.0]
                .dependencies
                .iter()
                .map(|d| (self.nodes[d.node.0].hash.clone(), d.types))
                .collect();
            dependency_hashes.sort_by(|a, b| a.0.cmp(&b.0));
            let input = self.nodes[id.0].hash_input(&dependency_hashes);
            let digest = hex::encode(Sha256::digest(input.as_bytes()));
            self.nodes[id.0].hash = digest[..HASH_LENGTH].to_string();
        }
    }
}

impl fmt::Display for SpecGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (id, depth)) in self.traverse().into_iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let node = self.node(id);
            let indent = "    ".repeat(depth);
            let caret = if depth > 0 { "^" } else { "" };
            write!(f, "{} {indent}{caret}{node}", node.short_hash())?;
        }
        Ok(())
    }
}

/// Every active requirement is fulfilled, every constraint respected and no
/// excluded candidate selected.
fn check_model(facts: &Facts, assignment: &Assignment) -> Result<(), ConcretizeError> {
    let pool = facts.pool();
    for active in active_requirements(facts, assignment) {
        if !assignment.fulfills(pool, active.requirement) {
            return Err(ConcretizeError::InternalConcretization(format!(
                "{} of {} is not fulfilled",
                facts.origin(active.requirement.fact),
                pool.resolve_solvable(active.owner)
            )));
        }
    }
    for s in assignment.solvables() {
        if facts.is_excluded(s) {
            return Err(ConcretizeError::InternalConcretization(format!(
                "{} is selected but excluded",
                pool.resolve_solvable(s)
            )));
        }
        for c in facts.facts_of(s).map(|f| f.constrains.as_slice()).unwrap_or_default() {
            let axis = pool.version_set_name(c.version_set);
            if assignment
                .get(axis)
                .is_some_and(|chosen| !pool.version_set_contains(c.version_set, chosen))
            {
                return Err(ConcretizeError::InternalConcretization(format!(
                    "{} is violated by {}",
                    facts.origin(c.fact),
                    pool.resolve_solvable(s)
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverConfig;
    use crate::criteria::Criterion;
    use crate::repository::InMemoryRepository;
    use crate::search::BranchAndBound;

    fn build(json: &str, request: &str) -> SpecGraph {
        let repo = InMemoryRepository::from_json(json).unwrap();
        let index = RepositoryIndex::from_repository(&repo).unwrap();
        let config = SolverConfig::default()
            .with_compiler(crate::config::CompilerEntry::new(
                CompilerSpec::parse("gcc@12.3.0").unwrap(),
            ))
            .with_target("x86_64");
        let facts =
            Facts::build(&index, &config, &AbstractSpec::parse(request).unwrap()).unwrap();
        let (model, _) = BranchAndBound::new(&facts, &Criterion::DEFAULT_ORDER)
            .run()
            .unwrap()
            .best
            .unwrap();
        SpecGraph::from_model(&index, &facts, &model).unwrap()
    }

    const DIAMOND: &str = r#"[
        {"name": "app", "versions": ["1.0"], "dependencies": ["left", {"spec": "right", "types": ["build"]}]},
        {"name": "left", "versions": ["1.0"], "dependencies": ["zlib@1.2:"]},
        {"name": "right", "versions": ["1.0"], "dependencies": ["zlib@:1.3"]},
        {"name": "zlib", "versions": ["1.1", "1.2.13", "1.3", "1.3.1"]}
    ]"#;

    #[test]
    fn diamond_shares_one_node() {
        let graph = build(DIAMOND, "app");
        assert_eq!(graph.len(), 4);
        let zlib = graph.find("zlib").unwrap();
        assert_eq!(zlib.version.to_string(), "1.3.1");
        let left = graph.find("left").unwrap();
        let right = graph.find("right").unwrap();
        assert_eq!(left.dependencies[0].node, right.dependencies[0].node);
    }

    #[test]
    fn install_order_puts_dependencies_first() {
        let graph = build(DIAMOND, "app");
        let names: Vec<&str> = graph
            .install_order()
            .into_iter()
            .map(|id| graph.node(id).name.as_str())
            .collect();
        assert_eq!(names, vec!["zlib", "left", "right", "app"]);
    }

    #[test]
    fn traverse_visits_each_node_once() {
        let graph = build(DIAMOND, "app");
        let visited: Vec<(&str, usize)> = graph
            .traverse()
            .into_iter()
            .map(|(id, depth)| (graph.node(id).name.as_str(), depth))
            .collect();
        assert_eq!(
            visited,
            vec![("app", 0), ("left", 1), ("zlib", 2), ("right", 1)]
        );
    }

    #[test]
    fn dependency_types_are_kept() {
        let graph = build(DIAMOND, "app");
        let app = graph.root_spec();
        assert_eq!(app.dependencies[1].types.to_string(), "build");
        assert_eq!(app.dependencies[0].types.to_string(), "build,link");
    }

    #[test]
    fn hashes_are_stable_and_distinct() {
        let a = build(DIAMOND, "app");
        let b = build(DIAMOND, "app");
        assert_eq!(a.root_spec().hash(), b.root_spec().hash());
        assert_eq!(a.root_spec().hash().len(), HASH_LENGTH);

        let pinned = build(DIAMOND, "app ^zlib@1.2.13");
        assert_ne!(a.root_spec().hash(), pinned.root_spec().hash());
        assert_ne!(a.find("left").unwrap().hash(), pinned.find("left").unwrap().hash());
    }

    #[test]
    fn nodes_carry_attributes() {
        let graph = build(
            r#"[{"name": "a", "versions": ["1.0"], "variants": [
                {"name": "shared", "default": ["true"], "values": ["true", "false"]}
            ]}]"#,
            "a",
        );
        let a = graph.root_spec();
        assert_eq!(a.to_string(), "a@1.0+shared %gcc@12.3.0 target=x86_64");
        assert!(graph.satisfies(&AbstractSpec::parse("a@1+shared%gcc target=x86_64").unwrap()));
        assert!(!graph.satisfies(&AbstractSpec::parse("a~shared").unwrap()));
    }

    #[test]
    fn to_request_pins_every_node() {
        let graph = build(DIAMOND, "app");
        let request = graph.to_request();
        assert_eq!(request.name.as_deref(), Some("app"));
        assert_eq!(request.dependencies.len(), 3);
        assert!(request.to_string().contains("^zlib@=1.3.1"));
        assert!(graph.satisfies(&request));
    }
}
