//! Dependency-graph execution for environment runs.
//!
//! The sort and closure helpers are pure; `start_environment_run` and
//! `on_module_run_complete` drive a cohort of module runs through the store.
//! Edges point from a module to the module it depends on; execution flows
//! the other way.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::outputs;
use crate::store::{RunUpdate, Store};
use crate::types::{
    EnvironmentOperation, EnvironmentRun, EnvironmentRunStatus, ModuleRun, NewModuleRun,
    RunPriority, RunStatus,
};

/// Kahn's algorithm over `(module, depends_on)` edges.
///
/// Frontier ties break on module id so the order is deterministic. Emitting
/// fewer nodes than the input set means a cycle.
pub fn toposort(nodes: &BTreeSet<Uuid>, edges: &[(Uuid, Uuid)]) -> Result<Vec<Uuid>> {
    let mut in_degree: BTreeMap<Uuid, usize> = nodes.iter().map(|id| (*id, 0)).collect();
    let mut dependents_of: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();

    for (module, depends_on) in edges {
        if !nodes.contains(module) || !nodes.contains(depends_on) {
            continue;
        }
        *in_degree.entry(*module).or_default() += 1;
        dependents_of.entry(*depends_on).or_default().push(*module);
    }

    let mut frontier: BTreeSet<Uuid> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(next) = frontier.iter().next().copied() {
        frontier.remove(&next);
        order.push(next);
        if let Some(dependents) = dependents_of.get(&next) {
            for dependent in dependents {
                let degree = in_degree
                    .get_mut(dependent)
                    .ok_or_else(|| RegistryError::Internal("dangling edge".to_string()))?;
                *degree -= 1;
                if *degree == 0 {
                    frontier.insert(*dependent);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(RegistryError::DependencyCycle);
    }
    Ok(order)
}

/// All transitive dependents of `start` (exclusive).
pub fn downstream_closure(start: Uuid, edges: &[(Uuid, Uuid)]) -> BTreeSet<Uuid> {
    let mut dependents_of: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for (module, depends_on) in edges {
        dependents_of.entry(*depends_on).or_default().push(*module);
    }

    let mut closure = BTreeSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        if let Some(dependents) = dependents_of.get(&node) {
            for dependent in dependents {
                if closure.insert(*dependent) {
                    queue.push_back(*dependent);
                }
            }
        }
    }
    closure
}

/// Kick off an environment operation over every active module.
///
/// Creates the parent record, one waiting run per module, and admits the
/// roots into their queues. Apply-style operations get a confirmation
/// deadline.
pub fn start_environment_run(
    store: &dyn Store,
    environment_id: Uuid,
    operation: EnvironmentOperation,
    triggered_by: &str,
    confirmation_timeout: std::time::Duration,
) -> Result<EnvironmentRun> {
    let environment = store
        .get_environment(environment_id)?
        .ok_or_else(|| RegistryError::NotFound(format!("environment {environment_id}")))?;
    if environment.locked {
        return Err(RegistryError::Conflict(format!(
            "environment {} is locked",
            environment.name
        )));
    }

    let modules: Vec<_> = store
        .list_modules_in_environment(environment_id)?
        .into_iter()
        .filter(|m| m.status == crate::types::ModuleStatus::Active)
        .collect();
    if modules.is_empty() {
        return Err(RegistryError::InvalidInput(
            "environment has no active modules".to_string(),
        ));
    }

    let node_set: BTreeSet<Uuid> = modules.iter().map(|m| m.id).collect();
    let edges = cohort_edges(store, environment_id, &node_set)?;
    let order = toposort(&node_set, &edges)?;

    let confirmation_deadline = match operation {
        // An unrepresentable timeout degrades to "effectively never".
        EnvironmentOperation::ApplyAll => Some(
            Utc::now()
                + chrono::Duration::from_std(confirmation_timeout)
                    .unwrap_or_else(|_| chrono::Duration::days(3650)),
        ),
        _ => None,
    };
    let env_run = store.insert_environment_run(
        environment_id,
        operation,
        triggered_by,
        confirmation_deadline,
    )?;

    let module_by_id: BTreeMap<Uuid, _> = modules.iter().map(|m| (m.id, m)).collect();
    let has_upstream: BTreeSet<Uuid> = edges.iter().map(|(module, _)| *module).collect();

    for module_id in &order {
        let module = module_by_id
            .get(module_id)
            .ok_or_else(|| RegistryError::Internal("sorted unknown module".to_string()))?;
        let mut new_run = NewModuleRun::for_module(
            module,
            operation.module_operation(),
            RunPriority::User,
            triggered_by,
        );
        new_run.environment_run_id = Some(env_run.id);
        let run = store.create_waiting_run(&new_run)?;
        if !has_upstream.contains(module_id) {
            store.admit_run(run.id)?;
        }
    }

    Ok(env_run)
}

/// Advance the cohort after one member reached a terminal status.
///
/// Success admits newly ready downstreams (resolving their upstream outputs
/// first); any non-success marks every transitive downstream skipped. When
/// no member remains non-terminal the parent run is finalized.
pub fn on_module_run_complete(store: &dyn Store, run: &ModuleRun) -> Result<()> {
    let Some(env_run_id) = run.environment_run_id else {
        return Ok(());
    };
    let Some(env_run) = store.get_environment_run(env_run_id)? else {
        warn!(%env_run_id, "completed run references unknown environment run");
        return Ok(());
    };
    if env_run.status.is_terminal() {
        return Ok(());
    }

    let cohort = store.list_runs_for_environment_run(env_run_id)?;
    let by_module: BTreeMap<Uuid, &ModuleRun> = cohort.iter().map(|r| (r.module_id, r)).collect();
    let node_set: BTreeSet<Uuid> = by_module.keys().copied().collect();
    let edges = cohort_edges(store, env_run.environment_id, &node_set)?;

    if run.status == RunStatus::Succeeded {
        advance_ready_dependents(store, run.module_id, &by_module, &edges)?;
    } else {
        skip_downstream(store, run.module_id, &by_module, &edges)?;
    }

    finalize_if_done(store, &env_run)
}

fn cohort_edges(
    store: &dyn Store,
    environment_id: Uuid,
    nodes: &BTreeSet<Uuid>,
) -> Result<Vec<(Uuid, Uuid)>> {
    Ok(store
        .list_dependencies_in_environment(environment_id)?
        .into_iter()
        .map(|d| (d.module_id, d.depends_on_id))
        .filter(|(a, b)| nodes.contains(a) && nodes.contains(b))
        .collect())
}

fn advance_ready_dependents(
    store: &dyn Store,
    completed_module: Uuid,
    by_module: &BTreeMap<Uuid, &ModuleRun>,
    edges: &[(Uuid, Uuid)],
) -> Result<()> {
    let dependents: Vec<Uuid> = edges
        .iter()
        .filter(|(_, upstream)| *upstream == completed_module)
        .map(|(module, _)| *module)
        .collect();

    for dependent in dependents {
        let Some(dep_run) = by_module.get(&dependent) else {
            continue;
        };
        // Only waiting cohort members advance; anything already queued,
        // in flight, or terminal is left alone.
        if dep_run.status != RunStatus::Pending || dep_run.queue_position.is_some() {
            continue;
        }
        let upstreams_succeeded = edges
            .iter()
            .filter(|(module, _)| *module == dependent)
            .all(|(_, upstream)| {
                by_module
                    .get(upstream)
                    .is_some_and(|r| r.status == RunStatus::Succeeded)
            });
        if !upstreams_succeeded {
            continue;
        }

        match outputs::resolve_module_inputs(store, dependent) {
            Ok(resolved) => {
                let merged = outputs::merge_variables(&dep_run.variables, &resolved);
                store.set_run_variables(dep_run.id, &merged)?;
                store.admit_run(dep_run.id)?;
            }
            Err(
                err @ (RegistryError::UpstreamNotReady(_)
                | RegistryError::UpstreamOutputMissing { .. }),
            ) => {
                store.update_run_status(
                    dep_run.id,
                    RunStatus::Failed,
                    &RunUpdate {
                        error_message: Some(err.to_string()),
                        ..RunUpdate::default()
                    },
                )?;
                skip_downstream(store, dependent, by_module, edges)?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn skip_downstream(
    store: &dyn Store,
    failed_module: Uuid,
    by_module: &BTreeMap<Uuid, &ModuleRun>,
    edges: &[(Uuid, Uuid)],
) -> Result<()> {
    for module_id in downstream_closure(failed_module, edges) {
        let Some(dep_run) = by_module.get(&module_id) else {
            continue;
        };
        if dep_run.status != RunStatus::Pending {
            continue;
        }
        store.update_run_status(
            dep_run.id,
            RunStatus::Skipped,
            &RunUpdate {
                skipped_due_to: Some(failed_module),
                ..RunUpdate::default()
            },
        )?;
    }
    Ok(())
}

fn finalize_if_done(store: &dyn Store, env_run: &EnvironmentRun) -> Result<()> {
    let cohort = store.list_runs_for_environment_run(env_run.id)?;
    if cohort.iter().any(|r| !r.status.is_terminal()) {
        return Ok(());
    }
    let status = if cohort.iter().all(|r| r.status == RunStatus::Succeeded) {
        EnvironmentRunStatus::Succeeded
    } else {
        EnvironmentRunStatus::Failed
    };
    store.complete_environment_run(env_run.id, status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        let mut out: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        out.sort();
        out
    }

    #[test]
    fn test_toposort_linear_chain() {
        let v = ids(3);
        let nodes: BTreeSet<Uuid> = v.iter().copied().collect();
        // v[2] -> v[1] -> v[0]
        let edges = vec![(v[2], v[1]), (v[1], v[0])];
        let order = toposort(&nodes, &edges).unwrap();
        assert_eq!(order, vec![v[0], v[1], v[2]]);
    }

    #[test]
    fn test_toposort_diamond_places_source_first_sink_last() {
        let v = ids(4);
        let (a, b, c, d) = (v[0], v[1], v[2], v[3]);
        let nodes: BTreeSet<Uuid> = v.iter().copied().collect();
        let edges = vec![(b, a), (c, a), (d, b), (d, c)];
        let order = toposort(&nodes, &edges).unwrap();
        assert_eq!(order.first(), Some(&a));
        assert_eq!(order.last(), Some(&d));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_toposort_is_deterministic() {
        let v = ids(5);
        let nodes: BTreeSet<Uuid> = v.iter().copied().collect();
        let edges = vec![(v[4], v[0])];
        let first = toposort(&nodes, &edges).unwrap();
        let second = toposort(&nodes, &edges).unwrap();
        assert_eq!(first, second);
        // Independent nodes come out in id order.
        assert_eq!(first[..4], v[..4]);
    }

    #[test]
    fn test_toposort_detects_cycle() {
        let v = ids(2);
        let nodes: BTreeSet<Uuid> = v.iter().copied().collect();
        let edges = vec![(v[0], v[1]), (v[1], v[0])];
        match toposort(&nodes, &edges) {
            Err(RegistryError::DependencyCycle) => {}
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_toposort_ignores_foreign_edges() {
        let v = ids(2);
        let nodes: BTreeSet<Uuid> = v.iter().copied().collect();
        let stranger = Uuid::new_v4();
        let edges = vec![(v[1], v[0]), (stranger, v[0])];
        assert_eq!(toposort(&nodes, &edges).unwrap().len(), 2);
    }

    #[test]
    fn test_downstream_closure_diamond() {
        let v = ids(4);
        let (a, b, c, d) = (v[0], v[1], v[2], v[3]);
        let edges = vec![(b, a), (c, a), (d, b), (d, c)];
        let closure = downstream_closure(a, &edges);
        assert_eq!(closure, BTreeSet::from([b, c, d]));
        // The sink has no dependents.
        assert!(downstream_closure(d, &edges).is_empty());
    }
}
