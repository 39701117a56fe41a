//! Dependency graph for ordering and blocking calls.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//! - BTree で持つので、走査順は常に決定的

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::domain::TaskId;
use crate::error::DispatchError;

use super::task::Task;

/// Dependency graph for tracking task dependencies.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: BTreeMap<TaskId, BTreeSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    reverse_edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// add_dependency(task_b, task_a) means "B waits for A"
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// First cycle found, as the path `a -> b -> ... -> a`, or `None` on a DAG.
    ///
    /// Three-colour DFS: a dependency still on the current path (grey)
    /// closes a cycle; fully explored nodes (black) are never revisited.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            Gray,
            Black,
        }

        fn visit(
            graph: &DependencyGraph,
            node: TaskId,
            colors: &mut HashMap<TaskId, Color>,
            path: &mut Vec<TaskId>,
        ) -> Option<Vec<TaskId>> {
            colors.insert(node, Color::Gray);
            path.push(node);
            for dep in graph.edges.get(&node).into_iter().flatten() {
                match colors.get(dep) {
                    Some(Color::Gray) => {
                        let start = path.iter().position(|n| n == dep).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(*dep);
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        if let Some(cycle) = visit(graph, *dep, colors, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
            path.pop();
            colors.insert(node, Color::Black);
            None
        }

        let mut colors = HashMap::new();
        let mut path = Vec::new();
        for &node in self.edges.keys() {
            if colors.contains_key(&node) {
                continue;
            }
            if let Some(cycle) = visit(self, node, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Order `nodes` so that every dependency precedes its dependents.
    ///
    /// Kahn's algorithm. Among nodes ready at the same time the one earlier
    /// in `nodes` goes first. Edges to ids outside `nodes` are ignored.
    /// `Err` carries the participants of a cycle.
    pub fn topological_sort(&self, nodes: &[TaskId]) -> Result<Vec<TaskId>, Vec<TaskId>> {
        let position: HashMap<TaskId, usize> =
            nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut indegree = vec![0usize; nodes.len()];
        for (i, id) in nodes.iter().enumerate() {
            indegree[i] = self
                .edges
                .get(id)
                .into_iter()
                .flatten()
                .filter(|dep| position.contains_key(dep))
                .count();
        }

        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut ordered = Vec::with_capacity(nodes.len());

        while let Some(i) = ready.pop_first() {
            let id = nodes[i];
            ordered.push(id);
            for waiting in self.reverse_edges.get(&id).into_iter().flatten() {
                if let Some(&j) = position.get(waiting) {
                    indegree[j] -= 1;
                    if indegree[j] == 0 {
                        ready.insert(j);
                    }
                }
            }
        }

        if ordered.len() == nodes.len() {
            return Ok(ordered);
        }
        let cycle = self.find_cycle().unwrap_or_else(|| {
            nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, id)| *id)
                .collect()
        });
        Err(cycle)
    }
}

/// Order a batch by its declared dependencies and register every declared
/// dependency as blocking on its dependent.
///
/// Nothing is returned on a cycle: the caller never sees a partial order.
pub fn resolve_dependencies(tasks: Vec<Task>) -> Result<Vec<Task>, DispatchError> {
    let mut graph = DependencyGraph::new();
    for task in &tasks {
        for dep in task.request.dependencies.keys() {
            graph.add_dependency(task.id(), *dep);
        }
    }

    let ids: Vec<TaskId> = tasks.iter().map(Task::id).collect();
    let ordered = graph
        .topological_sort(&ids)
        .map_err(DispatchError::CircularDependencies)?;

    let mut by_id: HashMap<TaskId, Task> = tasks.into_iter().map(|t| (t.id(), t)).collect();
    let mut resolved = Vec::with_capacity(ordered.len());
    for id in ordered {
        if let Some(mut task) = by_id.remove(&id) {
            let deps: Vec<TaskId> = task.request.dependencies.keys().copied().collect();
            task.blocking.extend(deps);
            resolved.push(task);
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CallName, CallRequest};
    use ulid::Ulid;

    fn ids<const N: usize>() -> [TaskId; N] {
        let mut out = [TaskId::from_ulid(Ulid::nil()); N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = TaskId::from_ulid(Ulid::from_parts(1, i as u128 + 1));
        }
        out
    }

    fn task(id: TaskId, deps: &[TaskId]) -> Task {
        let mut request = CallRequest::new(id, CallName::RepoSync);
        for dep in deps {
            request = request.depends_on(*dep);
        }
        Task::new(request)
    }

    #[test]
    fn add_dependency_orders_prerequisite_first() {
        let mut graph = DependencyGraph::new();
        let [a, b] = ids();

        graph.add_dependency(b, a); // B depends on A

        assert_eq!(graph.topological_sort(&[b, a]), Ok(vec![a, b]));
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn detects_simple_cycle() {
        let mut graph = DependencyGraph::new();
        let [a, b] = ids();
        graph.add_dependency(a, b);
        graph.add_dependency(b, a);

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&a) && cycle.contains(&b));
    }

    #[test]
    fn detects_self_dependency() {
        let mut graph = DependencyGraph::new();
        let [a] = ids();
        graph.add_dependency(a, a);

        assert_eq!(graph.find_cycle(), Some(vec![a, a]));
    }

    #[test]
    fn detects_cycle_behind_an_acyclic_prefix() {
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids();
        // B -> C -> D -> B, A is upstream only
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);
        graph.add_dependency(d, c);
        graph.add_dependency(b, d);

        let cycle = graph.find_cycle().unwrap();
        assert!(!cycle.contains(&a));
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids();
        graph.add_dependency(b, a);
        graph.add_dependency(c, a);
        graph.add_dependency(d, b);
        graph.add_dependency(d, c);

        assert!(graph.find_cycle().is_none());
        let order = graph.topological_sort(&[d, c, b, a]).unwrap();
        assert_eq!(order, vec![a, c, b, d]);
    }

    #[test]
    fn prerequisites_precede_dependents_submitted_first() {
        let [a, b, c] = ids();
        let resolved = resolve_dependencies(vec![
            task(c, &[a, b]),
            task(a, &[]),
            task(b, &[]),
        ])
        .unwrap();

        let order: Vec<TaskId> = resolved.iter().map(Task::id).collect();
        assert_eq!(order, vec![a, b, c]);
        assert_eq!(resolved[2].blocking, BTreeSet::from([a, b]));
        assert!(resolved[0].blocking.is_empty());
    }

    #[test]
    fn cycle_fails_without_partial_order() {
        let [a, b, c] = ids();
        let err = resolve_dependencies(vec![
            task(a, &[]),
            task(b, &[c]),
            task(c, &[b]),
        ])
        .unwrap_err();

        match err {
            DispatchError::CircularDependencies(cycle) => {
                assert!(cycle.contains(&b) && cycle.contains(&c));
                assert!(!cycle.contains(&a));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn dependencies_outside_the_batch_still_block() {
        let [a, outside] = ids();
        let resolved = resolve_dependencies(vec![task(a, &[outside])]).unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].blocking, BTreeSet::from([outside]));
    }
}
