//! Task dependencies - submit-time validation and dispatch gating.
//!
//! A task with dependencies stays `pending` until every dependency has
//! completed. If a dependency ends any other way the dependent can never
//! run, and the dispatcher cancels it.

use std::collections::{HashMap, HashSet};

use waypoint_core::{CoreError, CoreResult, Task, TaskId, TaskState};

use crate::store::TaskStore;

/// Longest dependency chain a new task may sit on top of.
pub const MAX_DEPENDENCY_DEPTH: usize = 10;

/// Where a pending task stands with respect to its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency completed.
    Ready,
    /// At least one dependency has not finished yet.
    Blocked,
    /// A dependency ended without completing.
    Unsatisfiable { dependency: TaskId, reason: String },
}

/// Resolves dependency states, caching each lookup. Lives for one
/// dispatch cycle.
pub struct DependencyResolver<'a> {
    store: &'a dyn TaskStore,
    states: HashMap<TaskId, Option<TaskState>>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(store: &'a dyn TaskStore) -> Self {
        Self {
            store,
            states: HashMap::new(),
        }
    }

    async fn state_of(&mut self, id: &TaskId) -> CoreResult<Option<TaskState>> {
        if let Some(state) = self.states.get(id) {
            return Ok(*state);
        }
        let state = match self.store.get(id).await {
            Ok(task) => Some(task.state),
            Err(CoreError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        self.states.insert(id.clone(), state);
        Ok(state)
    }

    pub async fn readiness(&mut self, task: &Task) -> CoreResult<Readiness> {
        let mut blocked = false;
        for dep in &task.dependencies {
            match self.state_of(dep).await? {
                Some(TaskState::Completed) => {}
                Some(state) if state.is_terminal() => {
                    return Ok(Readiness::Unsatisfiable {
                        dependency: dep.clone(),
                        reason: format!("dependency {dep} ended {state}"),
                    })
                }
                Some(_) => blocked = true,
                None => {
                    return Ok(Readiness::Unsatisfiable {
                        dependency: dep.clone(),
                        reason: format!("dependency {dep} no longer exists"),
                    })
                }
            }
        }

        Ok(if blocked {
            Readiness::Blocked
        } else {
            Readiness::Ready
        })
    }
}

/// Dependencies of `task` that have not completed, in declaration order.
pub async fn blocking(store: &dyn TaskStore, task: &Task) -> CoreResult<Vec<Task>> {
    let mut blocking = Vec::new();
    for dep in &task.dependencies {
        let dep = store.get(dep).await?;
        if dep.state != TaskState::Completed {
            blocking.push(dep);
        }
    }
    Ok(blocking)
}

/// Check the dependency list of a task about to be created under `task_id`.
///
/// Every dependency must exist, the graph below the task must be acyclic
/// and no chain may be deeper than [`MAX_DEPENDENCY_DEPTH`].
pub async fn validate(
    store: &dyn TaskStore,
    task_id: &TaskId,
    dependencies: &[TaskId],
) -> CoreResult<()> {
    if dependencies.is_empty() {
        return Ok(());
    }

    let mut graph: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    graph.insert(task_id.clone(), dependencies.to_vec());

    let mut pending: Vec<TaskId> = dependencies.to_vec();
    while let Some(id) = pending.pop() {
        if graph.contains_key(&id) {
            continue;
        }
        let task = match store.get(&id).await {
            Ok(task) => task,
            Err(CoreError::NotFound { .. }) => {
                return Err(CoreError::InvalidInput(format!("dependency {id} does not exist")))
            }
            Err(e) => return Err(e),
        };
        pending.extend(task.dependencies.iter().cloned());
        graph.insert(id, task.dependencies);
    }

    if let Some(cycle) = find_cycle(&graph, task_id) {
        let path: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
        return Err(CoreError::InvalidInput(format!(
            "circular dependency: {}",
            path.join(" -> ")
        )));
    }

    let depth = chain_depth(&graph, task_id, &mut HashMap::new());
    if depth > MAX_DEPENDENCY_DEPTH {
        return Err(CoreError::InvalidInput(format!(
            "dependency chain is {depth} deep, limit is {MAX_DEPENDENCY_DEPTH}"
        )));
    }

    Ok(())
}

/// First cycle reachable from `start`, as the path that closes it.
fn find_cycle(graph: &HashMap<TaskId, Vec<TaskId>>, start: &TaskId) -> Option<Vec<TaskId>> {
    fn visit(
        id: &TaskId,
        graph: &HashMap<TaskId, Vec<TaskId>>,
        path: &mut Vec<TaskId>,
        done: &mut HashSet<TaskId>,
    ) -> Option<Vec<TaskId>> {
        if let Some(pos) = path.iter().position(|seen| seen == id) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(id.clone());
            return Some(cycle);
        }
        if done.contains(id) {
            return None;
        }

        path.push(id.clone());
        for dep in graph.get(id).into_iter().flatten() {
            if let Some(cycle) = visit(dep, graph, path, done) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(id.clone());
        None
    }

    visit(start, graph, &mut Vec::new(), &mut HashSet::new())
}

/// Longest chain below `id`. The graph must be acyclic.
fn chain_depth(
    graph: &HashMap<TaskId, Vec<TaskId>>,
    id: &TaskId,
    memo: &mut HashMap<TaskId, usize>,
) -> usize {
    if let Some(depth) = memo.get(id) {
        return *depth;
    }
    let mut depth = 0;
    for dep in graph.get(id).into_iter().flatten() {
        depth = depth.max(1 + chain_depth(graph, dep, memo));
    }
    memo.insert(id.clone(), depth);
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTaskStore;
    use chrono::Utc;
    use serde_json::json;
    use waypoint_core::WorkerId;

    fn id(s: &str) -> TaskId {
        TaskId::new(s)
    }

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<TaskId, Vec<TaskId>> {
        edges
            .iter()
            .map(|(from, to)| (id(from), to.iter().map(|t| id(t)).collect()))
            .collect()
    }

    async fn put(store: &InMemoryTaskStore, name: &str, deps: &[&str]) -> Task {
        let task = Task::new("build", "alice", json!(null))
            .with_id(id(name))
            .with_dependencies(deps.iter().map(|d| id(d)));
        store.create(task).await.unwrap()
    }

    async fn finish(store: &InMemoryTaskStore, name: &str, state: TaskState) {
        let mut task = store.get(&id(name)).await.unwrap();
        let now = Utc::now();
        match state {
            TaskState::Completed => {
                task.assign(WorkerId::new("w"), now).unwrap();
                task.start(now).unwrap();
                task.complete(None, now).unwrap();
            }
            _ => task.cancel(now).unwrap(),
        }
        store.update(task).await.unwrap();
    }

    #[test]
    fn test_detects_direct_and_indirect_cycles() {
        let direct = graph(&[("a", &["b"]), ("b", &["a"])]);
        assert_eq!(find_cycle(&direct, &id("a")), Some(vec![id("a"), id("b"), id("a")]));

        let indirect = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let cycle = find_cycle(&indirect, &id("a")).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);

        let diamond = graph(&[("a", &["b", "c"]), ("b", &["d"]), ("c", &["d"]), ("d", &[])]);
        assert!(find_cycle(&diamond, &id("a")).is_none());
        assert_eq!(chain_depth(&diamond, &id("a"), &mut HashMap::new()), 2);
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_and_self_dependencies() {
        let store = InMemoryTaskStore::new();
        put(&store, "a", &[]).await;

        validate(&store, &id("new"), &[]).await.unwrap();
        validate(&store, &id("new"), &[id("a")]).await.unwrap();

        let err = validate(&store, &id("new"), &[id("ghost")]).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(ref m) if m.contains("ghost")));

        let err = validate(&store, &id("new"), &[id("new")]).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(ref m) if m.contains("circular")));
    }

    #[tokio::test]
    async fn test_validate_rejects_cycles_through_stored_tasks() {
        let store = InMemoryTaskStore::new();
        // "b" was stored pointing at an id that is only now being created.
        put(&store, "b", &["new"]).await;

        let err = validate(&store, &id("new"), &[id("b")]).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(ref m) if m.contains("new -> b -> new")));
    }

    #[tokio::test]
    async fn test_validate_limits_chain_depth() {
        let store = InMemoryTaskStore::new();
        put(&store, "t0", &[]).await;
        for i in 1..MAX_DEPENDENCY_DEPTH {
            let prev = format!("t{}", i - 1);
            put(&store, &format!("t{i}"), &[prev.as_str()]).await;
        }

        let top = id(&format!("t{}", MAX_DEPENDENCY_DEPTH - 1));
        validate(&store, &id("ok"), &[top.clone()]).await.unwrap();

        put(&store, "deeper", &[top.as_str()]).await;
        let err = validate(&store, &id("too-deep"), &[id("deeper")]).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(ref m) if m.contains("deep")));
    }

    #[tokio::test]
    async fn test_readiness_and_blocking() {
        let store = InMemoryTaskStore::new();
        put(&store, "a", &[]).await;
        put(&store, "b", &[]).await;
        let child = put(&store, "child", &["a", "b"]).await;

        let mut resolver = DependencyResolver::new(&store);
        assert_eq!(resolver.readiness(&child).await.unwrap(), Readiness::Blocked);
        let ids: Vec<TaskId> = blocking(&store, &child).await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![id("a"), id("b")]);

        finish(&store, "a", TaskState::Completed).await;
        finish(&store, "b", TaskState::Completed).await;
        let mut resolver = DependencyResolver::new(&store);
        assert_eq!(resolver.readiness(&child).await.unwrap(), Readiness::Ready);
        assert!(blocking(&store, &child).await.unwrap().is_empty());

        put(&store, "c", &[]).await;
        let other = put(&store, "other", &["a", "c"]).await;
        finish(&store, "c", TaskState::Cancelled).await;
        let mut resolver = DependencyResolver::new(&store);
        assert!(matches!(
            resolver.readiness(&other).await.unwrap(),
            Readiness::Unsatisfiable { dependency, .. } if dependency == id("c")
        ));
    }
}
