//! The persistence contract.
//!
//! This trait enumerates exactly the storage operations the engine
//! components require; everything stateful about the run queue and the
//! state machine lives behind it so invariants hold across process
//! restarts and replicas. Implementations must perform every multi-step
//! run-state mutation (create, status update, dequeue) inside a single
//! transaction scoped to the affected module.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    ApiToken, Artifact, ArtifactFilter, ArtifactStatus, AuditEntry, CiResult, Environment,
    EnvironmentOperation, EnvironmentRun, EnvironmentRunStatus, Module, ModuleDependency,
    ModuleRun, NewArtifact, NewModule, NewModuleRun, NewVersion, Page, PolicyBinding,
    PolicyEvaluation, PolicyRules, PolicyScope, RunStatus, VersionRow,
};

/// Result of an enqueue, carrying how many older cascades were coalesced
/// away.
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub run: ModuleRun,
    /// Pending cascade runs discarded by latest-wins coalescing.
    pub coalesced: u64,
}

/// Optional fields accompanying a status transition.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub exit_code: Option<i32>,
    pub resources_added: Option<i64>,
    pub resources_changed: Option<i64>,
    pub resources_destroyed: Option<i64>,
    pub error_message: Option<String>,
    pub skipped_due_to: Option<Uuid>,
}

/// Typed storage operations required by the engine.
pub trait Store: Send + Sync {
    // --- Artifacts ---

    fn insert_artifact(&self, new: &NewArtifact) -> Result<Artifact>;
    fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>>;
    fn update_artifact_status(&self, id: Uuid, status: ArtifactStatus) -> Result<()>;
    /// Exact match after trailing-slash normalization on both sides.
    fn find_artifacts_by_repository_url(&self, url: &str) -> Result<Vec<Artifact>>;
    fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Page<Artifact>>;

    // --- Versions ---

    /// Idempotent upsert keyed by `(artifact_id, version)`. On conflict only
    /// the timestamp and storage reference change; approval status is never
    /// reset. Returns the row and whether it was created.
    fn upsert_version(&self, new: &NewVersion) -> Result<(VersionRow, bool)>;
    fn get_version(&self, id: Uuid) -> Result<Option<VersionRow>>;
    fn find_version(&self, artifact_id: Uuid, version: &str) -> Result<Option<VersionRow>>;
    /// The version currently flagged `is_latest`.
    fn latest_version(&self, artifact_id: Uuid) -> Result<Option<VersionRow>>;
    fn list_versions(&self, artifact_id: Uuid) -> Result<Vec<VersionRow>>;
    /// Approve and recompute the artifact's `is_latest` flag (highest
    /// approved, non-yanked semver wins).
    fn approve_version(&self, id: Uuid, approver: &str) -> Result<VersionRow>;
    fn reject_version(&self, id: Uuid, actor: &str) -> Result<VersionRow>;
    /// Yank: mark `is_bad` and recompute `is_latest`.
    fn yank_version(&self, id: Uuid) -> Result<VersionRow>;
    /// Record an approval; duplicates from the same approver are idempotent.
    fn record_approval(&self, version_id: Uuid, approver: &str) -> Result<()>;
    fn count_approvers(&self, version_id: Uuid) -> Result<u32>;

    // --- Environments, modules, dependencies ---

    fn insert_environment(&self, name: &str, cloud: Option<&Value>) -> Result<Environment>;
    fn get_environment(&self, id: Uuid) -> Result<Option<Environment>>;
    fn set_environment_locked(&self, id: Uuid, locked: bool) -> Result<()>;
    fn insert_module(&self, new: &NewModule) -> Result<Module>;
    fn get_module(&self, id: Uuid) -> Result<Option<Module>>;
    fn list_modules_for_artifact(&self, artifact_id: Uuid) -> Result<Vec<Module>>;
    fn list_modules_in_environment(&self, environment_id: Uuid) -> Result<Vec<Module>>;
    /// Insert a dependency edge; rejects edges that would close a cycle.
    fn insert_dependency(&self, dep: &ModuleDependency) -> Result<()>;
    fn list_dependencies_in_environment(&self, environment_id: Uuid)
    -> Result<Vec<ModuleDependency>>;
    /// Outgoing edges of one module (what it depends on).
    fn list_dependencies_of_module(&self, module_id: Uuid) -> Result<Vec<ModuleDependency>>;

    // --- Module runs ---

    /// Create a run and place it per queue discipline: the module's slot
    /// when free (`queued`), else the tail of the wait queue (`pending`,
    /// position >= 1). Cascade enqueues first discard any older pending
    /// cascades on the module (latest-wins). Atomic.
    fn enqueue_run(&self, new: &NewModuleRun) -> Result<EnqueueOutcome>;
    /// Create a cohort run that waits on upstream modules: `pending` with no
    /// queue position, outside the queue until admitted.
    fn create_waiting_run(&self, new: &NewModuleRun) -> Result<ModuleRun>;
    /// Move a waiting run into the queue (slot or tail). Atomic.
    fn admit_run(&self, run_id: Uuid) -> Result<ModuleRun>;
    fn get_run(&self, id: Uuid) -> Result<Option<ModuleRun>>;
    /// The run currently occupying the module's slot, if any.
    fn active_run(&self, module_id: Uuid) -> Result<Option<ModuleRun>>;
    /// Count of runs waiting in the module's queue.
    fn queued_count(&self, module_id: Uuid) -> Result<u64>;
    /// Validated status transition. Terminal targets set `completed_at` and
    /// clear the callback token hash; `planned` stamps `planned_at`.
    /// Rejects terminal-to-anything with `IllegalTransition`. Atomic.
    fn update_run_status(&self, run_id: Uuid, to: RunStatus, update: &RunUpdate)
    -> Result<ModuleRun>;
    /// Conditional `queued -> running` claim used by dispatch; returns none
    /// when another replica already claimed the run.
    fn try_mark_running(&self, run_id: Uuid, token_hash: &str) -> Result<Option<ModuleRun>>;
    /// Promote the next waiting run (user before cascade, then FIFO) into
    /// the module's free slot. Atomic; no-op when the slot is occupied or
    /// the queue is empty.
    fn dequeue_next(&self, module_id: Uuid) -> Result<Option<ModuleRun>>;
    /// Queued runs ready for dispatch, user priority first.
    fn list_dispatchable(&self, limit: u32) -> Result<Vec<ModuleRun>>;
    /// Runs in an ACTIVE status across both execution modes.
    fn count_active_runs(&self) -> Result<u64>;
    fn latest_successful_apply(&self, module_id: Uuid) -> Result<Option<ModuleRun>>;
    fn set_run_variables(&self, run_id: Uuid, variables: &Value) -> Result<()>;
    fn set_run_outputs(&self, run_id: Uuid, outputs: &Value) -> Result<()>;
    fn set_run_plan(&self, run_id: Uuid, plan: &str) -> Result<()>;
    fn get_run_plan(&self, run_id: Uuid) -> Result<Option<String>>;
    fn append_run_log(&self, run_id: Uuid, chunk: &str) -> Result<()>;
    fn list_run_logs(&self, run_id: Uuid) -> Result<Vec<String>>;
    /// Runs still `running` that were created before `cutoff` (crash
    /// recovery and timeout sweeps).
    fn list_running_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ModuleRun>>;
    /// Runs `planned` before `cutoff`, awaiting confirmation too long.
    fn list_planned_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ModuleRun>>;
    fn list_runs_for_environment_run(&self, environment_run_id: Uuid) -> Result<Vec<ModuleRun>>;

    // --- Environment runs ---

    fn insert_environment_run(
        &self,
        environment_id: Uuid,
        operation: EnvironmentOperation,
        triggered_by: &str,
        confirmation_deadline: Option<DateTime<Utc>>,
    ) -> Result<EnvironmentRun>;
    fn get_environment_run(&self, id: Uuid) -> Result<Option<EnvironmentRun>>;
    /// Set a terminal aggregate status and stamp `completed_at`. No-op when
    /// the run is already terminal.
    fn complete_environment_run(&self, id: Uuid, status: EnvironmentRunStatus) -> Result<()>;
    /// Non-terminal environment runs whose confirmation deadline has passed.
    fn list_environment_runs_expired(&self, now: DateTime<Utc>) -> Result<Vec<EnvironmentRun>>;

    // --- Policy ---

    fn insert_policy_binding(&self, scope: &PolicyScope, rules: &PolicyRules)
    -> Result<PolicyBinding>;
    /// All bindings covering the artifact: artifact-, namespace-, team-, and
    /// global-scoped.
    fn list_policy_bindings(
        &self,
        artifact_id: Uuid,
        namespace: &str,
        team: Option<&str>,
    ) -> Result<Vec<PolicyBinding>>;
    fn insert_policy_evaluation(
        &self,
        artifact_id: Uuid,
        version_id: Uuid,
        actor: &str,
        evaluation: &PolicyEvaluation,
    ) -> Result<()>;

    // --- Audit, CI, tokens, downloads ---

    /// Append-only; rows are never mutated.
    fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
    fn list_audit(&self, action: Option<&str>) -> Result<Vec<AuditEntry>>;
    fn insert_ci_result(&self, result: &CiResult) -> Result<()>;
    fn list_ci_results(&self, version_id: Uuid) -> Result<Vec<CiResult>>;
    fn insert_api_token(&self, name: &str, token_hash: &str) -> Result<ApiToken>;
    fn find_api_token_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>>;
    fn append_download_log(&self, version_id: Uuid, actor: &str) -> Result<()>;
}

/// Trim trailing slashes so stored and presented repository URLs compare
/// exactly.
pub fn normalize_repository_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
