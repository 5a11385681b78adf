//! Static plan analysis: parallel waves and the critical path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::TaskGraph;
use crate::domain::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Waves of tasks that can run in parallel; wave `n` only depends on
    /// earlier waves.
    pub levels: Vec<Vec<TaskId>>,

    /// Longest dependency chain, first task first.
    pub critical_path: Vec<TaskId>,
}

impl ExecutionPlan {
    pub fn of(graph: &TaskGraph) -> Self {
        Self {
            levels: execution_levels(graph),
            critical_path: critical_path(graph),
        }
    }
}

/// Depth of every task in topological order: 0 for roots, otherwise one more
/// than its deepest dependency.
fn depths(graph: &TaskGraph) -> Vec<(TaskId, usize, Option<TaskId>)> {
    let mut depth: HashMap<TaskId, (usize, Option<TaskId>)> = HashMap::with_capacity(graph.len());

    for id in graph.topological_order() {
        let Some(task) = graph.get(id) else { continue };
        let mut best: (usize, Option<TaskId>) = (0, None);
        for &dep in task.depends_on() {
            let d = depth.get(&dep).map(|&(d, _)| d + 1).unwrap_or(0);
            if best.1.is_none() || d > best.0 {
                best = (d, Some(dep));
            }
        }
        depth.insert(id, best);
    }

    graph
        .task_ids()
        .into_iter()
        .map(|id| {
            let (d, pred) = depth.get(&id).copied().unwrap_or((0, None));
            (id, d, pred)
        })
        .collect()
}

pub fn execution_levels(graph: &TaskGraph) -> Vec<Vec<TaskId>> {
    let mut levels: Vec<Vec<TaskId>> = Vec::new();
    for (id, depth, _) in depths(graph) {
        if levels.len() <= depth {
            levels.resize_with(depth + 1, Vec::new);
        }
        levels[depth].push(id);
    }
    levels
}

/// Ties go to the task defined first.
pub fn critical_path(graph: &TaskGraph) -> Vec<TaskId> {
    let depths = depths(graph);
    let Some(&(tail, _, _)) = depths
        .iter()
        .fold(None, |best: Option<&(TaskId, usize, Option<TaskId>)>, entry| {
            match best {
                Some(b) if b.1 >= entry.1 => Some(b),
                _ => Some(entry),
            }
        })
    else {
        return Vec::new();
    };

    let preds: HashMap<TaskId, Option<TaskId>> = depths.iter().map(|&(id, _, pred)| (id, pred)).collect();

    let mut path = vec![tail];
    let mut current = tail;
    while let Some(&Some(pred)) = preds.get(&current) {
        path.push(pred);
        current = pred;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Decomposition, Edge, TaskSpec};
    use crate::ports::{SystemClock, UlidGenerator};

    fn graph(n: usize, edges: &[(usize, usize)]) -> TaskGraph {
        let specs = (0..n).map(|i| TaskSpec::new(format!("t{i}"), "w")).collect();
        let edges = edges.iter().map(|&(f, t)| Edge::new(f, t)).collect();
        TaskGraph::construct(
            Decomposition::new(specs, edges),
            &UlidGenerator::new(SystemClock),
        )
        .unwrap()
    }

    #[test]
    fn levels_group_parallel_tasks() {
        // research(0), analysis(1) -> report(2) -> review(3)
        let g = graph(4, &[(0, 2), (1, 2), (2, 3)]);
        let ids = g.task_ids();

        assert_eq!(
            execution_levels(&g),
            vec![vec![ids[0], ids[1]], vec![ids[2]], vec![ids[3]]]
        );
    }

    #[test]
    fn critical_path_follows_longest_chain() {
        // 0 -> 1 -> 2 -> 3, and 4 -> 3
        let g = graph(5, &[(0, 1), (1, 2), (2, 3), (4, 3)]);
        let ids = g.task_ids();

        assert_eq!(critical_path(&g), vec![ids[0], ids[1], ids[2], ids[3]]);
    }

    #[test]
    fn independent_tasks_form_one_level() {
        let g = graph(3, &[]);
        let plan = ExecutionPlan::of(&g);

        assert_eq!(plan.levels.len(), 1);
        assert_eq!(plan.critical_path, vec![g.task_ids()[0]]);
    }
}
