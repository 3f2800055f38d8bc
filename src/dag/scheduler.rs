//! Wave computation.
//!
//! A wave is the set of workers whose dependencies all sit in earlier waves.
//! Waves are produced by iterative in-degree peeling over a validated graph.

use crate::dag::builder::{DagBuilder, DependencyGraph, WorkerIndex};
use crate::errors::ResolveError;
use crate::worker::WorkerSpec;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// A group of workers that may run in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionWave {
    /// Zero-based wave position
    pub index: usize,
    /// Worker ids, in declaration order
    pub workers: Vec<String>,
}

impl ExecutionWave {
    pub fn contains(&self, id: &str) -> bool {
        self.workers.iter().any(|w| w == id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// A validated graph together with its wave decomposition.
#[derive(Debug, Clone)]
pub struct Schedule {
    graph: DependencyGraph,
    waves: Vec<ExecutionWave>,
}

impl Schedule {
    /// Validate `specs` and compute their waves.
    ///
    /// Fails with a `ConfigError` or a `CycleError`; a cyclic input never
    /// yields a partial schedule.
    pub fn resolve(specs: Vec<WorkerSpec>) -> Result<Self, ResolveError> {
        let graph = DagBuilder::new(specs).build()?;
        let waves = compute_waves(&graph);
        Ok(Self { graph, waves })
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn waves(&self) -> &[ExecutionWave] {
        &self.waves
    }

    pub fn worker_count(&self) -> usize {
        self.graph.len()
    }

    /// Index of the wave containing `id`.
    pub fn wave_of(&self, id: &str) -> Option<usize> {
        self.waves.iter().position(|w| w.contains(id))
    }

    /// Human-readable summary used by the `validate` and `waves` commands.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} worker(s) in {} wave(s)",
            self.graph.len(),
            self.waves.len()
        );
        for wave in &self.waves {
            let _ = writeln!(out, "Wave {}:", wave.index + 1);
            for id in &wave.workers {
                let Some(spec) = self.graph.spec_by_id(id) else {
                    continue;
                };
                let deps = if spec.dependencies.is_empty() {
                    String::new()
                } else {
                    format!(" (after {})", spec.dependencies.join(", "))
                };
                let _ = writeln!(out, "  - {} [{}]{}", spec.id, spec.role, deps);
            }
        }
        out
    }
}

/// Peel the graph into waves using in-degree counting (Kahn's algorithm).
///
/// The graph is acyclic by construction, so every node lands in exactly one
/// wave.
pub fn compute_waves(graph: &DependencyGraph) -> Vec<ExecutionWave> {
    let mut in_degree: Vec<usize> = (0..graph.len())
        .map(|i| graph.dependencies(i).len())
        .collect();
    let mut current: Vec<WorkerIndex> = (0..graph.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut waves = Vec::new();

    while !current.is_empty() {
        current.sort_unstable();

        let mut next = Vec::new();
        for &node in &current {
            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }

        waves.push(ExecutionWave {
            index: waves.len(),
            workers: current
                .iter()
                .filter_map(|&i| graph.spec(i).map(|s| s.id.clone()))
                .collect(),
        });
        current = next;
    }

    waves
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, deps: Vec<&str>) -> WorkerSpec {
        WorkerSpec::new(id, "test", deps.into_iter().map(String::from).collect())
    }

    fn ids(waves: &[ExecutionWave]) -> Vec<Vec<&str>> {
        waves
            .iter()
            .map(|w| w.workers.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_wave_computation_linear() {
        let schedule = Schedule::resolve(vec![
            worker("a", vec![]),
            worker("b", vec!["a"]),
            worker("c", vec!["b"]),
        ])
        .unwrap();

        assert_eq!(ids(schedule.waves()), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_wave_computation_diamond() {
        let schedule = Schedule::resolve(vec![
            worker("db", vec![]),
            worker("api", vec!["db"]),
            worker("ui", vec!["db"]),
            worker("e2e", vec!["api", "ui"]),
        ])
        .unwrap();

        assert_eq!(
            ids(schedule.waves()),
            vec![vec!["db"], vec!["api", "ui"], vec!["e2e"]]
        );
        assert_eq!(schedule.wave_of("e2e"), Some(2));
    }

    #[test]
    fn test_wave_computation_multiple_roots() {
        let schedule = Schedule::resolve(vec![
            worker("a", vec![]),
            worker("b", vec![]),
            worker("c", vec!["a", "b"]),
        ])
        .unwrap();

        assert_eq!(ids(schedule.waves()), vec![vec!["a", "b"], vec!["c"]]);
    }

    #[test]
    fn test_declaration_order_within_wave() {
        let schedule = Schedule::resolve(vec![
            worker("root", vec![]),
            worker("zeta", vec!["root"]),
            worker("alpha", vec!["root"]),
            worker("mid", vec!["root"]),
        ])
        .unwrap();

        assert_eq!(schedule.waves()[1].workers, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_uneven_depths() {
        // `late` depends on a root and on a third-level node
        let schedule = Schedule::resolve(vec![
            worker("late", vec!["r", "l2"]),
            worker("r", vec![]),
            worker("l1", vec!["r"]),
            worker("l2", vec!["l1"]),
        ])
        .unwrap();

        assert_eq!(
            ids(schedule.waves()),
            vec![vec!["r"], vec!["l1"], vec!["l2"], vec!["late"]]
        );
    }

    #[test]
    fn test_empty_input_yields_no_waves() {
        let schedule = Schedule::resolve(vec![]).unwrap();
        assert!(schedule.waves().is_empty());
        assert_eq!(schedule.worker_count(), 0);
    }

    #[test]
    fn test_cycle_yields_no_schedule() {
        let result = Schedule::resolve(vec![
            worker("ok", vec![]),
            worker("x", vec!["y"]),
            worker("y", vec!["x"]),
        ]);
        assert!(matches!(result, Err(ResolveError::Cycle(_))));
    }

    #[test]
    fn test_summary_lists_waves() {
        let schedule =
            Schedule::resolve(vec![worker("db", vec![]), worker("api", vec!["db"])]).unwrap();

        let summary = schedule.summary();
        assert!(summary.contains("2 worker(s) in 2 wave(s)"));
        assert!(summary.contains("Wave 2:"));
        assert!(summary.contains("api [test] (after db)"));
    }
}
