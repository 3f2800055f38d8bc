//! DAG builder for constructing dependency graphs from worker declarations.
//!
//! The builder validates a list of `WorkerSpec`s and constructs a directed
//! acyclic graph that the scheduler peels into execution waves.

use crate::errors::{ConfigError, CycleError, ResolveError};
use crate::worker::WorkerSpec;
use std::collections::{HashMap, HashSet};

/// Index into the worker list (declaration order).
pub type WorkerIndex = usize;

/// A validated, acyclic graph of workers. Never mutated after `build`.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Specs indexed by declaration position
    specs: Vec<WorkerSpec>,
    /// Map from worker id to index
    index_map: HashMap<String, WorkerIndex>,
    /// Forward edges: index -> workers that depend on it
    forward_edges: Vec<Vec<WorkerIndex>>,
    /// Reverse edges: index -> workers it depends on
    reverse_edges: Vec<Vec<WorkerIndex>>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn spec(&self, index: WorkerIndex) -> Option<&WorkerSpec> {
        self.specs.get(index)
    }

    pub fn spec_by_id(&self, id: &str) -> Option<&WorkerSpec> {
        self.index_of(id).and_then(|i| self.specs.get(i))
    }

    pub fn index_of(&self, id: &str) -> Option<WorkerIndex> {
        self.index_map.get(id).copied()
    }

    /// All specs in declaration order, with duplicate dependency entries collapsed.
    pub fn specs(&self) -> &[WorkerSpec] {
        &self.specs
    }

    /// Workers that depend on the given worker.
    pub fn dependents(&self, index: WorkerIndex) -> &[WorkerIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Workers the given worker depends on.
    pub fn dependencies(&self, index: WorkerIndex) -> &[WorkerIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Ids of the workers that depend on `id`.
    pub fn dependent_ids(&self, id: &str) -> Vec<String> {
        self.index_of(id)
            .map(|i| self.ids(self.dependents(i)))
            .unwrap_or_default()
    }

    /// Ids of the workers `id` depends on.
    pub fn dependency_ids(&self, id: &str) -> Vec<String> {
        self.index_of(id)
            .map(|i| self.ids(self.dependencies(i)))
            .unwrap_or_default()
    }

    /// Every worker downstream of `id`, breadth-first, without duplicates.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let Some(start) = self.index_of(id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = std::collections::VecDeque::from(self.dependents(start).to_vec());
        let mut result = Vec::new();
        while let Some(index) = queue.pop_front() {
            if !seen.insert(index) {
                continue;
            }
            result.push(self.specs[index].id.clone());
            queue.extend(self.dependents(index).iter().copied());
        }
        result
    }

    /// Workers with no dependencies (entry points).
    pub fn roots(&self) -> Vec<WorkerIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Workers nothing else depends on (exit points).
    pub fn leaves(&self) -> Vec<WorkerIndex> {
        self.forward_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    fn ids(&self, indices: &[WorkerIndex]) -> Vec<String> {
        indices.iter().map(|&i| self.specs[i].id.clone()).collect()
    }
}

/// Builder for constructing dependency graphs.
pub struct DagBuilder {
    specs: Vec<WorkerSpec>,
}

impl DagBuilder {
    pub fn new(specs: Vec<WorkerSpec>) -> Self {
        Self { specs }
    }

    /// Build the dependency graph.
    ///
    /// Validation order:
    /// - duplicate ids (checked before anything else)
    /// - empty ids, token budgets, owned path patterns
    /// - unknown dependencies
    /// - cycles, including self-references
    pub fn build(mut self) -> Result<DependencyGraph, ResolveError> {
        let mut index_map = HashMap::new();
        for (i, spec) in self.specs.iter().enumerate() {
            if index_map.insert(spec.id.clone(), i).is_some() {
                return Err(ConfigError::DuplicateWorker {
                    id: spec.id.clone(),
                }
                .into());
            }
        }

        for (index, spec) in self.specs.iter().enumerate() {
            validate_spec(index, spec)?;
        }

        for spec in &mut self.specs {
            let mut seen = HashSet::new();
            spec.dependencies.retain(|dep| seen.insert(dep.clone()));
        }

        let mut forward_edges: Vec<Vec<WorkerIndex>> = vec![Vec::new(); self.specs.len()];
        let mut reverse_edges: Vec<Vec<WorkerIndex>> = vec![Vec::new(); self.specs.len()];

        for (to_idx, spec) in self.specs.iter().enumerate() {
            for dep in &spec.dependencies {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| ConfigError::UnknownDependency {
                            worker: spec.id.clone(),
                            dependency: dep.clone(),
                        })?;

                // from must complete before to
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = DependencyGraph {
            specs: self.specs,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm, then
    /// extract one concrete cycle path for the error if it does.
    fn validate_no_cycles(graph: &DependencyGraph) -> Result<(), CycleError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<WorkerIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed == graph.len() {
            return Ok(());
        }

        let path = find_cycle(graph)
            .map(|indices| graph.ids(&indices))
            .unwrap_or_else(|| {
                // Kahn left nodes unprocessed, so a cycle exists; fall back to the stuck set.
                in_degree
                    .iter()
                    .enumerate()
                    .filter(|&(_, deg)| *deg > 0)
                    .map(|(i, _)| graph.specs[i].id.clone())
                    .collect()
            });

        Err(CycleError { path })
    }
}

fn validate_spec(index: usize, spec: &WorkerSpec) -> Result<(), ConfigError> {
    if spec.id.trim().is_empty() {
        return Err(ConfigError::EmptyId { index });
    }

    let budget = spec.token_budget;
    if budget.low > budget.high {
        return Err(ConfigError::InvalidBudget {
            worker: spec.id.clone(),
            low: budget.low,
            high: budget.high,
        });
    }

    for pattern in &spec.owned_paths {
        if let Err(source) = glob::Pattern::new(pattern) {
            return Err(ConfigError::InvalidOwnedPath {
                worker: spec.id.clone(),
                pattern: pattern.clone(),
                source,
            });
        }
    }

    Ok(())
}

const UNVISITED: u8 = 0;
const ON_STACK: u8 = 1;
const DONE: u8 = 2;

/// Depth-first search along dependency edges. Returns the first cycle found,
/// closed (first and last element equal).
fn find_cycle(graph: &DependencyGraph) -> Option<Vec<WorkerIndex>> {
    let mut marks = vec![UNVISITED; graph.len()];
    let mut stack = Vec::new();

    for start in 0..graph.len() {
        if marks[start] == UNVISITED
            && let Some(cycle) = visit(graph, start, &mut marks, &mut stack)
        {
            return Some(cycle);
        }
    }
    None
}

fn visit(
    graph: &DependencyGraph,
    node: WorkerIndex,
    marks: &mut [u8],
    stack: &mut Vec<WorkerIndex>,
) -> Option<Vec<WorkerIndex>> {
    marks[node] = ON_STACK;
    stack.push(node);

    for &dep in graph.dependencies(node) {
        match marks[dep] {
            ON_STACK => {
                let pos = stack.iter().position(|&n| n == dep)?;
                let mut cycle = stack[pos..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
            UNVISITED => {
                if let Some(cycle) = visit(graph, dep, marks, stack) {
                    return Some(cycle);
                }
            }
            _ => {}
        }
    }

    stack.pop();
    marks[node] = DONE;
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, deps: Vec<&str>) -> WorkerSpec {
        WorkerSpec::new(
            id,
            &format!("{} role", id),
            deps.into_iter().map(String::from).collect(),
        )
    }

    #[test]
    fn test_build_simple_graph() {
        let specs = vec![
            worker("db", vec![]),
            worker("api", vec!["db"]),
            worker("ui", vec!["db"]),
            worker("e2e", vec!["api", "ui"]),
        ];

        let graph = DagBuilder::new(specs).build().unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.roots(), vec![0]);
        assert_eq!(graph.leaves(), vec![3]);
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let specs = vec![
            worker("db", vec![]),
            worker("api", vec!["db"]),
            worker("ui", vec!["db"]),
        ];

        let graph = DagBuilder::new(specs).build().unwrap();

        assert!(graph.dependencies(0).is_empty());
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependency_ids("ui"), vec!["db"]);
        let dependents = graph.dependent_ids("db");
        assert!(dependents.contains(&"api".to_string()));
        assert!(dependents.contains(&"ui".to_string()));
    }

    #[test]
    fn test_transitive_dependents() {
        let specs = vec![
            worker("a", vec![]),
            worker("b", vec!["a"]),
            worker("c", vec!["b"]),
            worker("d", vec!["b", "c"]),
            worker("x", vec![]),
        ];
        let graph = DagBuilder::new(specs).build().unwrap();

        assert_eq!(graph.transitive_dependents("a"), vec!["b", "c", "d"]);
        assert!(graph.transitive_dependents("x").is_empty());
        assert!(graph.transitive_dependents("missing").is_empty());
    }

    #[test]
    fn test_cycle_detection_reports_path() {
        let specs = vec![
            worker("a", vec!["c"]),
            worker("b", vec!["a"]),
            worker("c", vec!["b"]),
        ];

        let err = DagBuilder::new(specs).build().unwrap_err();
        match err {
            ResolveError::Cycle(cycle) => {
                assert_eq!(cycle.path.len(), 4);
                assert_eq!(cycle.path.first(), cycle.path.last());
                assert_eq!(cycle.path, vec!["a", "c", "b", "a"]);
            }
            other => panic!("Expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = DagBuilder::new(vec![worker("solo", vec!["solo"])])
            .build()
            .unwrap_err();
        match err {
            ResolveError::Cycle(cycle) => assert_eq!(cycle.path, vec!["solo", "solo"]),
            other => panic!("Expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let specs = vec![
            worker("root", vec![]),
            worker("p", vec!["root", "q"]),
            worker("q", vec!["p"]),
        ];
        let err = DagBuilder::new(specs).build().unwrap_err();
        assert!(err.to_string().contains("p -> q -> p"));
    }

    #[test]
    fn test_missing_dependency() {
        let err = DagBuilder::new(vec![worker("db", vec!["nonexistent"])])
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Config(ConfigError::UnknownDependency { .. })
        ));
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_duplicate_checked_before_other_errors() {
        // The unknown dependency would also fail, but duplicates come first.
        let specs = vec![worker("db", vec!["ghost"]), worker("db", vec![])];

        let err = DagBuilder::new(specs).build().unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Config(ConfigError::DuplicateWorker { ref id }) if id == "db"
        ));
    }

    #[test]
    fn test_empty_id_rejected() {
        let err = DagBuilder::new(vec![worker("", vec![])]).build().unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Config(ConfigError::EmptyId { index: 0 })
        ));
    }

    #[test]
    fn test_inverted_budget_rejected() {
        let spec = worker("db", vec![]).with_token_budget(500, 100);
        let err = DagBuilder::new(vec![spec]).build().unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Config(ConfigError::InvalidBudget { low: 500, high: 100, .. })
        ));
    }

    #[test]
    fn test_invalid_owned_path_rejected() {
        let spec = worker("db", vec![]).with_owned_paths(&["src/[unclosed"]);
        let err = DagBuilder::new(vec![spec]).build().unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Config(ConfigError::InvalidOwnedPath { .. })
        ));
    }

    #[test]
    fn test_duplicate_dependency_entries_collapse() {
        let specs = vec![worker("db", vec![]), worker("api", vec!["db", "db"])];
        let graph = DagBuilder::new(specs).build().unwrap();

        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.spec_by_id("api").unwrap().dependencies, vec!["db"]);
    }

    #[test]
    fn test_empty_graph() {
        let graph = DagBuilder::new(vec![]).build().unwrap();
        assert!(graph.is_empty());
        assert!(graph.roots().is_empty());
    }
}
