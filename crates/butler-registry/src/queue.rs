//! Run queue entry points.
//!
//! The queue itself is stateful in the store (one FIFO per module, user
//! before cascade, latest-wins cascade coalescing); this module adds the
//! admission checks every enqueue shares: the module must be active and its
//! environment unlocked. In-flight state is never held in memory.

use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::store::{EnqueueOutcome, Store};
use crate::types::{Module, ModuleRun, ModuleStatus, NewModuleRun, Operation, RunPriority};

/// Enqueue a user-triggered run against a module.
pub fn enqueue_user_run(
    store: &dyn Store,
    module: &Module,
    operation: Operation,
    triggered_by: &str,
) -> Result<EnqueueOutcome> {
    check_module_accepts_runs(store, module)?;
    store.enqueue_run(&NewModuleRun::for_module(
        module,
        operation,
        RunPriority::User,
        triggered_by,
    ))
}

/// Enqueue a speculative cascade plan against a module.
pub fn enqueue_cascade_plan(
    store: &dyn Store,
    module: &Module,
    triggered_by: &str,
) -> Result<EnqueueOutcome> {
    check_module_accepts_runs(store, module)?;
    store.enqueue_run(&NewModuleRun::for_module(
        module,
        Operation::Plan,
        RunPriority::Cascade,
        triggered_by,
    ))
}

/// The run currently occupying the module's slot.
pub fn active(store: &dyn Store, module_id: Uuid) -> Result<Option<ModuleRun>> {
    store.active_run(module_id)
}

/// Number of runs waiting behind the slot.
pub fn queued_count(store: &dyn Store, module_id: Uuid) -> Result<u64> {
    store.queued_count(module_id)
}

fn check_module_accepts_runs(store: &dyn Store, module: &Module) -> Result<()> {
    if module.status != ModuleStatus::Active {
        return Err(RegistryError::Conflict(format!(
            "module {} is not active",
            module.name
        )));
    }
    let environment = store
        .get_environment(module.environment_id)?
        .ok_or_else(|| RegistryError::Internal("module references missing environment".into()))?;
    if environment.locked {
        return Err(RegistryError::Conflict(format!(
            "environment {} is locked",
            environment.name
        )));
    }
    Ok(())
}
