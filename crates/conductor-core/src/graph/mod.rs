//! Task graph: the tasks of one execution and their dependency edges.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (stored on the `Task`)
//! - Reverse edges: task -> tasks that depend on it (`dependents`)
//! - The graph is a DAG, checked once by topological sort at construction.
//!   No edge can be added afterwards.
//! - `apply_transition` is the single mutation path for task state; every
//!   accepted transition is journaled so the owner can publish it.

mod plan;
mod resolver;

pub use plan::{ExecutionPlan, critical_path, execution_levels};
pub use resolver::DependencyResolver;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::domain::{
    Decomposition, GraphError, MAX_PRIORITY, Task, TaskCounts, TaskId, TaskState,
};
use crate::ports::IdGenerator;

/// One accepted state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub task_id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Tasks in insertion order (the scheduler's tie-break order).
    tasks: Vec<Task>,

    index: HashMap<TaskId, usize>,

    /// Reverse edges by position, each list in insertion order.
    dependents: Vec<Vec<usize>>,

    /// Topological order by position.
    topo: Vec<usize>,

    journal: Vec<Transition>,
}

impl TaskGraph {
    /// Build a graph from a decomposer's candidate.
    ///
    /// Edge endpoints are indices into `decomposition.tasks`; an out-of-range
    /// index is a dangling reference.
    pub fn construct(
        decomposition: Decomposition,
        ids: &dyn IdGenerator,
    ) -> Result<Self, GraphError> {
        let Decomposition { tasks: specs, edges } = decomposition;
        let task_ids: Vec<TaskId> = specs.iter().map(|_| ids.task_id()).collect();

        let mut deps: Vec<Vec<TaskId>> = vec![Vec::new(); specs.len()];
        for edge in &edges {
            let Some(&dependent) = task_ids.get(edge.to) else {
                return Err(GraphError::DanglingReference {
                    task: format!("edge #{} -> #{}", edge.from, edge.to),
                    missing: format!("#{}", edge.to),
                });
            };
            let Some(&prerequisite) = task_ids.get(edge.from) else {
                return Err(GraphError::DanglingReference {
                    task: dependent.to_string(),
                    missing: format!("#{}", edge.from),
                });
            };
            deps[edge.to].push(prerequisite);
        }

        let tasks = specs
            .into_iter()
            .zip(task_ids)
            .zip(deps)
            .map(|((spec, id), depends_on)| {
                Task::new(
                    id,
                    spec.description,
                    spec.required_capability,
                    spec.priority.min(MAX_PRIORITY),
                    depends_on,
                )
            })
            .collect();

        Self::from_tasks(tasks)
    }

    /// Build a graph from fully-formed tasks (also used when restoring a
    /// snapshot, so task states are kept as given).
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (pos, task) in tasks.iter().enumerate() {
            if index.insert(task.id(), pos).is_some() {
                return Err(GraphError::DuplicateTask(task.id()));
            }
        }

        let mut dependents = vec![Vec::new(); tasks.len()];
        for (pos, task) in tasks.iter().enumerate() {
            for dep in task.depends_on() {
                let Some(&dep_pos) = index.get(dep) else {
                    return Err(GraphError::DanglingReference {
                        task: task.id().to_string(),
                        missing: dep.to_string(),
                    });
                };
                dependents[dep_pos].push(pos);
            }
        }

        let topo = topological_sort(&tasks, &dependents)?;

        Ok(Self {
            tasks,
            index,
            dependents,
            topo,
            journal: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.index.contains_key(&task_id)
    }

    pub fn get(&self, task_id: TaskId) -> Option<&Task> {
        self.index.get(&task_id).map(|&pos| &self.tasks[pos])
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(Task::id).collect()
    }

    /// Insertion position, used as the stable tie-break between ready tasks.
    pub fn position(&self, task_id: TaskId) -> Option<usize> {
        self.index.get(&task_id).copied()
    }

    pub fn topological_order(&self) -> Vec<TaskId> {
        self.topo.iter().map(|&pos| self.tasks[pos].id()).collect()
    }

    /// Tasks that directly depend on `task_id`, in insertion order.
    pub fn dependents(&self, task_id: TaskId) -> Vec<TaskId> {
        self.index
            .get(&task_id)
            .map(|&pos| {
                self.dependents[pos]
                    .iter()
                    .map(|&d| self.tasks[d].id())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.get(task_id).map(Task::state)
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in &self.tasks {
            counts.record(task.state());
        }
        counts
    }

    /// Owned copy of every task, in insertion order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.clone()
    }

    /// Move a task to `to`, enforcing the transition table.
    ///
    /// `Ready -> Leased` increments `attempt`. Returns the previous state.
    pub fn apply_transition(
        &mut self,
        task_id: TaskId,
        to: TaskState,
    ) -> Result<TaskState, GraphError> {
        let pos = *self
            .index
            .get(&task_id)
            .ok_or(GraphError::UnknownTask(task_id))?;
        let task = &mut self.tasks[pos];
        let from = task.state;
        if !from.can_transition_to(to) {
            return Err(GraphError::InvalidTransition {
                task: task_id,
                from,
                to,
            });
        }

        task.state = to;
        if from == TaskState::Ready && to == TaskState::Leased {
            task.attempt += 1;
        }
        if to == TaskState::Ready {
            task.not_before = None;
        }

        self.journal.push(Transition {
            task_id,
            from,
            to,
            attempt: task.attempt,
        });
        Ok(from)
    }

    /// `Leased -> Completed`, storing the result.
    pub(crate) fn complete(&mut self, task_id: TaskId, result: String) -> Result<(), GraphError> {
        self.apply_transition(task_id, TaskState::Completed)?;
        self.task_mut(task_id)?.result = Some(result);
        Ok(())
    }

    /// `Leased -> Failed`, storing the reason.
    pub(crate) fn fail(&mut self, task_id: TaskId, reason: String) -> Result<(), GraphError> {
        self.apply_transition(task_id, TaskState::Failed)?;
        self.task_mut(task_id)?.failure_reason = Some(reason);
        Ok(())
    }

    /// `Leased -> Pending`, gated until `not_before`.
    pub(crate) fn requeue(
        &mut self,
        task_id: TaskId,
        not_before: Option<DateTime<Utc>>,
        reason: String,
    ) -> Result<(), GraphError> {
        self.apply_transition(task_id, TaskState::Pending)?;
        let task = self.task_mut(task_id)?;
        task.not_before = not_before;
        task.failure_reason = Some(reason);
        Ok(())
    }

    /// Abandon a non-terminal task, recording why.
    pub(crate) fn abandon(&mut self, task_id: TaskId, reason: &str) -> Result<(), GraphError> {
        self.apply_transition(task_id, TaskState::Abandoned)?;
        self.task_mut(task_id)?.failure_reason = Some(reason.to_string());
        Ok(())
    }

    /// Take the transitions accepted since the last drain.
    pub fn drain_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.journal)
    }

    fn task_mut(&mut self, task_id: TaskId) -> Result<&mut Task, GraphError> {
        let pos = *self
            .index
            .get(&task_id)
            .ok_or(GraphError::UnknownTask(task_id))?;
        Ok(&mut self.tasks[pos])
    }
}

/// Kahn's algorithm. Zero in-degree tasks are visited in insertion order so the
/// result is deterministic. Any task left unvisited sits on or behind a cycle.
fn topological_sort(tasks: &[Task], dependents: &[Vec<usize>]) -> Result<Vec<usize>, GraphError> {
    let mut in_degree: Vec<usize> = tasks.iter().map(|t| t.depends_on().len()).collect();
    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(pos, _)| pos)
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(pos) = queue.pop_front() {
        order.push(pos);
        for &dependent in &dependents[pos] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() < tasks.len() {
        let involved = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d > 0)
            .map(|(pos, _)| tasks[pos].id())
            .collect();
        return Err(GraphError::CycleDetected(involved));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Edge, TaskSpec};
    use crate::ports::{SystemClock, UlidGenerator};
    use rstest::rstest;

    fn specs(n: usize) -> Vec<TaskSpec> {
        (0..n)
            .map(|i| TaskSpec::new(format!("task {i}"), "worker"))
            .collect()
    }

    fn build(n: usize, edges: &[(usize, usize)]) -> Result<TaskGraph, GraphError> {
        let edges = edges.iter().map(|&(f, t)| Edge::new(f, t)).collect();
        TaskGraph::construct(
            Decomposition::new(specs(n), edges),
            &UlidGenerator::new(SystemClock),
        )
    }

    #[test]
    fn out_of_range_priority_is_clamped() {
        let mut spec = TaskSpec::new("urgent", "worker");
        spec.priority = 200;
        let graph = TaskGraph::construct(
            Decomposition::new(vec![spec], vec![]),
            &UlidGenerator::new(SystemClock),
        )
        .unwrap();

        let id = graph.task_ids()[0];
        assert_eq!(graph.get(id).unwrap().priority(), MAX_PRIORITY);
    }

    #[test]
    fn builds_forward_and_reverse_edges() {
        let graph = build(3, &[(0, 1), (0, 2)]).unwrap();
        let ids = graph.task_ids();

        assert_eq!(graph.get(ids[1]).unwrap().depends_on(), &[ids[0]]);
        assert_eq!(graph.dependents(ids[0]), vec![ids[1], ids[2]]);
        assert!(graph.dependents(ids[1]).is_empty());
    }

    #[test]
    fn duplicate_edges_are_merged() {
        let graph = build(2, &[(0, 1), (0, 1)]).unwrap();
        let ids = graph.task_ids();
        assert_eq!(graph.get(ids[1]).unwrap().depends_on().len(), 1);
    }

    #[rstest]
    #[case::self_loop(1, vec![(0, 0)])]
    #[case::two_cycle(2, vec![(0, 1), (1, 0)])]
    #[case::behind_a_dag_prefix(4, vec![(0, 1), (1, 2), (2, 3), (3, 1)])]
    fn rejects_cycles(#[case] n: usize, #[case] edges: Vec<(usize, usize)>) {
        let err = build(n, &edges).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected(ref ids) if !ids.is_empty()));
    }

    #[rstest]
    #[case::diamond(4, vec![(0, 1), (0, 2), (1, 3), (2, 3)])]
    #[case::shortcut(3, vec![(0, 1), (1, 2), (0, 2)])]
    #[case::cross(5, vec![(0, 1), (0, 2), (1, 3), (1, 4), (2, 3), (2, 4)])]
    fn accepts_dags_with_convergent_paths(#[case] n: usize, #[case] edges: Vec<(usize, usize)>) {
        assert!(build(n, &edges).is_ok());
    }

    #[test]
    fn rejects_dangling_edge() {
        let err = build(2, &[(0, 5)]).unwrap_err();
        assert!(matches!(err, GraphError::DanglingReference { .. }));

        let err = build(2, &[(7, 1)]).unwrap_err();
        assert!(matches!(err, GraphError::DanglingReference { ref missing, .. } if missing == "#7"));
    }

    #[test]
    fn from_tasks_rejects_unknown_dependency() {
        let ids = UlidGenerator::new(SystemClock);
        let ghost = ids.task_id();
        let task = Task::new(ids.task_id(), "t", "w".into(), 5, vec![ghost]);

        let err = TaskGraph::from_tasks(vec![task]).unwrap_err();
        assert!(matches!(err, GraphError::DanglingReference { .. }));
    }

    #[test]
    fn topological_order_respects_edges() {
        let graph = build(4, &[(3, 0), (0, 1), (2, 1)]).unwrap();
        let ids = graph.task_ids();
        let order = graph.topological_order();
        let at = |id: TaskId| order.iter().position(|&x| x == id).unwrap();

        assert!(at(ids[3]) < at(ids[0]));
        assert!(at(ids[0]) < at(ids[1]));
        assert!(at(ids[2]) < at(ids[1]));
    }

    #[test]
    fn transitions_follow_the_table() {
        let mut graph = build(1, &[]).unwrap();
        let id = graph.task_ids()[0];

        let err = graph.apply_transition(id, TaskState::Completed).unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { .. }));

        graph.apply_transition(id, TaskState::Ready).unwrap();
        graph.apply_transition(id, TaskState::Leased).unwrap();
        assert_eq!(graph.get(id).unwrap().attempt(), 1);

        graph.requeue(id, None, "lease expired".into()).unwrap();
        assert_eq!(graph.get(id).unwrap().attempt(), 1);

        graph.apply_transition(id, TaskState::Ready).unwrap();
        graph.apply_transition(id, TaskState::Leased).unwrap();
        graph.complete(id, "done".into()).unwrap();

        let task = graph.get(id).unwrap();
        assert_eq!(task.attempt(), 2);
        assert_eq!(task.result(), Some("done"));
        assert!(graph.apply_transition(id, TaskState::Pending).is_err());
    }

    #[test]
    fn journal_records_accepted_transitions_only() {
        let mut graph = build(1, &[]).unwrap();
        let id = graph.task_ids()[0];

        graph.apply_transition(id, TaskState::Ready).unwrap();
        let _ = graph.apply_transition(id, TaskState::Completed);

        let journal = graph.drain_transitions();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].from, TaskState::Pending);
        assert_eq!(journal[0].to, TaskState::Ready);
        assert!(graph.drain_transitions().is_empty());
    }
}
