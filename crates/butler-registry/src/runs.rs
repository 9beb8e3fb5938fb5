//! Run lifecycle choreography.
//!
//! Every terminal transition has three obligations beyond the row update
//! itself: the module's queue advances, and — for cohort members — the DAG
//! executor is notified. The DAG notification is best-effort; its failure
//! is logged and never fails the caller.

use tracing::warn;
use uuid::Uuid;

use crate::dag;
use crate::error::{RegistryError, Result};
use crate::store::{RunUpdate, Store};
use crate::types::{ModuleRun, RunStatus};

/// Apply a status transition with the full terminal choreography.
pub fn transition_run(
    store: &dyn Store,
    run_id: Uuid,
    to: RunStatus,
    update: &RunUpdate,
) -> Result<ModuleRun> {
    let updated = store.update_run_status(run_id, to, update)?;
    if updated.status.is_terminal() {
        store.dequeue_next(updated.module_id)?;
        if updated.environment_run_id.is_some() {
            if let Err(err) = dag::on_module_run_complete(store, &updated) {
                warn!(%err, run_id = %updated.id, "DAG notification failed");
            }
        }
    }
    Ok(updated)
}

/// Cancel a run from the user side. Legal from any non-terminal state
/// except an apply already in flight.
pub fn cancel_run(store: &dyn Store, run_id: Uuid, update: &RunUpdate) -> Result<ModuleRun> {
    transition_run(store, run_id, RunStatus::Cancelled, update)
}

/// Confirm a planned run; the executor observes the change by polling and
/// proceeds to apply.
pub fn confirm_run(store: &dyn Store, run_id: Uuid) -> Result<ModuleRun> {
    let run = require_run(store, run_id)?;
    if run.status != RunStatus::Planned {
        return Err(RegistryError::Conflict(format!(
            "run {run_id} is {} and cannot be confirmed",
            run.status.as_str()
        )));
    }
    store.update_run_status(run_id, RunStatus::Confirmed, &RunUpdate::default())
}

/// Discard a planned run without applying.
pub fn discard_run(store: &dyn Store, run_id: Uuid, reason: Option<String>) -> Result<ModuleRun> {
    transition_run(
        store,
        run_id,
        RunStatus::Discarded,
        &RunUpdate {
            error_message: reason,
            ..RunUpdate::default()
        },
    )
}

pub(crate) fn require_run(store: &dyn Store, run_id: Uuid) -> Result<ModuleRun> {
    store
        .get_run(run_id)?
        .ok_or_else(|| RegistryError::NotFound(format!("run {run_id}")))
}
