//! Core domain types for the registry and run orchestrator.
//!
//! Everything here is serde-serializable: rows travel between the store, the
//! HTTP surface, and dispatch payloads as the same shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of artifact tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactType {
    TerraformModule,
    TerraformProvider,
    HelmChart,
    OpaBundle,
    OciArtifact,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TerraformModule => "terraform-module",
            Self::TerraformProvider => "terraform-provider",
            Self::HelmChart => "helm-chart",
            Self::OpaBundle => "opa-bundle",
            Self::OciArtifact => "oci-artifact",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "terraform-module" => Some(Self::TerraformModule),
            "terraform-provider" => Some(Self::TerraformProvider),
            "helm-chart" => Some(Self::HelmChart),
            "opa-bundle" => Some(Self::OpaBundle),
            "oci-artifact" => Some(Self::OciArtifact),
            _ => None,
        }
    }
}

/// Artifact lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    #[default]
    Active,
    Deprecated,
    Archived,
}

impl ArtifactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deprecated => "deprecated",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "deprecated" => Some(Self::Deprecated),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Where new versions of an artifact come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// VCS repository URL, matched against webhook deliveries after
    /// trailing-slash normalization.
    pub repository_url: String,
    /// Path inside the repository, when the artifact is not at the root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Tag prefix (e.g. `v`) expected on release tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_prefix: Option<String>,
}

/// A named, versioned object in the registry.
///
/// Identity is `(namespace, name, provider)` when `provider` is set and
/// `(namespace, name)` otherwise; the two uniqueness domains are disjoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    /// Terraform provider qualifier; null for non-Terraform types.
    pub provider: Option<String>,
    pub artifact_type: ArtifactType,
    pub status: ArtifactStatus,
    pub team: Option<String>,
    pub source: Option<SourceConfig>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to register a new artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewArtifact {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    pub artifact_type: ArtifactType,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Version approval status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A specific release of an artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRow {
    pub id: Uuid,
    pub artifact_id: Uuid,
    /// Canonical (prefix-stripped) semver string; unique per artifact.
    pub version: String,
    pub approval_status: ApprovalStatus,
    /// At most one version per artifact carries this flag.
    pub is_latest: bool,
    /// Yanked versions stay on record but are excluded from latest selection.
    pub is_bad: bool,
    pub digest: Option<String>,
    pub changelog: Option<String>,
    /// Type-specific metadata blob.
    pub metadata: Value,
    pub storage_ref: Option<String>,
    pub size_bytes: Option<i64>,
    pub published_by: Option<String>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a version upsert (webhook ingestion or manual publish).
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub artifact_id: Uuid,
    pub version: String,
    pub digest: Option<String>,
    pub changelog: Option<String>,
    pub metadata: Value,
    pub storage_ref: Option<String>,
    pub size_bytes: Option<i64>,
    pub published_by: Option<String>,
}

/// How a module's runs are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Platform-executed: dispatched to the configured executor repository.
    #[default]
    Peaas,
    /// Bring-your-own-CI: dispatched to the module's own trigger repository.
    Byoc,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Peaas => "peaas",
            Self::Byoc => "byoc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "peaas" => Some(Self::Peaas),
            "byoc" => Some(Self::Byoc),
            _ => None,
        }
    }
}

/// Module lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    #[default]
    Active,
    Disabled,
}

impl ModuleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// VCS trigger override for BYOC dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsTrigger {
    pub repository_url: String,
}

/// An artifact bound into an environment with a version pin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub artifact_id: Uuid,
    pub name: String,
    /// Null tracks latest; otherwise an exact version or Terraform-style
    /// constraint expression.
    pub pinned_version: Option<String>,
    pub mode: ExecutionMode,
    pub auto_plan_on_module_update: bool,
    pub tf_version: Option<String>,
    /// State backend configuration, snapshotted into each run.
    pub state_backend: Value,
    pub vcs_trigger: Option<VcsTrigger>,
    /// Current variables, snapshotted into each run as a JSON object.
    pub variables: Value,
    pub status: ModuleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to bind a module into an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewModule {
    pub environment_id: Uuid,
    pub artifact_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub pinned_version: Option<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_true")]
    pub auto_plan_on_module_update: bool,
    #[serde(default)]
    pub tf_version: Option<String>,
    #[serde(default = "empty_object")]
    pub state_backend: Value,
    #[serde(default)]
    pub vcs_trigger: Option<VcsTrigger>,
    #[serde(default = "empty_object")]
    pub variables: Value,
}

fn default_true() -> bool {
    true
}

pub(crate) fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Cloud OIDC integration handed to the executor at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudIntegration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcp_wif_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcp_service_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcp_project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_role_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_region: Option<String>,
}

/// A namespace for a cohort of modules that apply together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub name: String,
    /// A locked environment accepts no new runs against its modules.
    pub locked: bool,
    pub cloud_integration: Option<CloudIntegration>,
    pub created_at: DateTime<Utc>,
}

/// Mapping of one upstream output into one downstream variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMapping {
    pub upstream_output: String,
    pub downstream_variable: String,
}

/// Directed dependency edge: `module_id` depends on `depends_on_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDependency {
    pub module_id: Uuid,
    pub depends_on_id: Uuid,
    pub output_mapping: Vec<OutputMapping>,
}

/// IaC operation a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Plan,
    Apply,
    Destroy,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(Self::Plan),
            "apply" => Some(Self::Apply),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }
}

/// Module run status.
///
/// The full transition table lives in [`crate::runstate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Running,
    Planned,
    Confirmed,
    Applying,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    Discarded,
    Skipped,
}

impl RunStatus {
    /// Terminal statuses are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::Failed
                | Self::Cancelled
                | Self::TimedOut
                | Self::Discarded
                | Self::Skipped
        )
    }

    /// Statuses counted against the dispatcher's concurrency cap.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Planned | Self::Applying | Self::Confirmed
        )
    }

    /// Statuses that occupy a module's single execution slot. At most one
    /// run per module is in any of these at a time.
    pub fn occupies_slot(self) -> bool {
        self == Self::Queued || self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Planned => "planned",
            Self::Confirmed => "confirmed",
            Self::Applying => "applying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Discarded => "discarded",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "planned" => Some(Self::Planned),
            "confirmed" => Some(Self::Confirmed),
            "applying" => Some(Self::Applying),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timed_out" => Some(Self::TimedOut),
            "discarded" => Some(Self::Discarded),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Queue priority class. User work always dequeues before cascade work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPriority {
    #[default]
    User,
    Cascade,
}

impl RunPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Cascade => "cascade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "cascade" => Some(Self::Cascade),
            _ => None,
        }
    }
}

/// The operational unit of work: one IaC operation against one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRun {
    pub id: Uuid,
    pub module_id: Uuid,
    /// Set when this run belongs to an environment-run cohort.
    pub environment_run_id: Option<Uuid>,
    pub operation: Operation,
    pub mode: ExecutionMode,
    pub status: RunStatus,
    pub priority: RunPriority,
    /// Position in the module's wait queue; null for the slot occupant and
    /// for cohort runs still waiting on upstream modules.
    pub queue_position: Option<i64>,
    pub triggered_by: String,
    pub tf_version: Option<String>,
    /// Variables snapshot taken at creation, augmented with resolved
    /// upstream outputs before dispatch.
    pub variables: Value,
    pub state_backend: Value,
    /// SHA-256 of the executor callback token; present exactly while the
    /// run is in flight.
    pub callback_token_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// When the run entered `planned`, for confirmation expiry.
    pub planned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub resources_added: Option<i64>,
    pub resources_changed: Option<i64>,
    pub resources_destroyed: Option<i64>,
    /// Terraform outputs uploaded by the executor after a successful apply.
    pub tf_outputs: Option<Value>,
    pub error_message: Option<String>,
    /// Module whose failure caused this run to be skipped.
    pub skipped_due_to: Option<Uuid>,
}

/// Fields for creating a module run.
#[derive(Debug, Clone)]
pub struct NewModuleRun {
    pub module_id: Uuid,
    pub environment_run_id: Option<Uuid>,
    pub operation: Operation,
    pub mode: ExecutionMode,
    pub priority: RunPriority,
    pub triggered_by: String,
    pub tf_version: Option<String>,
    pub variables: Value,
    pub state_backend: Value,
}

impl NewModuleRun {
    /// Snapshot a module's execution settings into a new run.
    pub fn for_module(
        module: &Module,
        operation: Operation,
        priority: RunPriority,
        triggered_by: impl Into<String>,
    ) -> Self {
        Self {
            module_id: module.id,
            environment_run_id: None,
            operation,
            mode: module.mode,
            priority,
            triggered_by: triggered_by.into(),
            tf_version: module.tf_version.clone(),
            variables: module.variables.clone(),
            state_backend: module.state_backend.clone(),
        }
    }
}

/// Environment-level operation fanning out over a module cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentOperation {
    PlanAll,
    ApplyAll,
    DestroyAll,
}

impl EnvironmentOperation {
    /// Per-module operation for this environment operation.
    pub fn module_operation(self) -> Operation {
        match self {
            Self::PlanAll => Operation::Plan,
            Self::ApplyAll => Operation::Apply,
            Self::DestroyAll => Operation::Destroy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanAll => "plan-all",
            Self::ApplyAll => "apply-all",
            Self::DestroyAll => "destroy-all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan-all" => Some(Self::PlanAll),
            "apply-all" => Some(Self::ApplyAll),
            "destroy-all" => Some(Self::DestroyAll),
            _ => None,
        }
    }
}

/// Aggregate status of an environment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentRunStatus {
    Running,
    Succeeded,
    Failed,
    Discarded,
}

impl EnvironmentRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }
}

/// Parent record for a cohort of module runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentRun {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub operation: EnvironmentOperation,
    pub status: EnvironmentRunStatus,
    pub triggered_by: String,
    /// Deadline for confirming planned applies; null when not applicable.
    pub confirmation_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Security scan grade, best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScanGrade {
    A,
    B,
    C,
    D,
    F,
}

impl ScanGrade {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            "D" => Some(Self::D),
            "F" => Some(Self::F),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        }
    }
}

/// How policy failures are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementLevel {
    /// Failures refuse the operation.
    #[default]
    Block,
    /// Failures downgrade to warnings; the operation proceeds.
    Warn,
    /// Failures are recorded only.
    Audit,
}

impl EnforcementLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Warn => "warn",
            Self::Audit => "audit",
        }
    }
}

/// Composable approval-policy rules. Unset rules fall through to broader
/// scopes during resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_approvers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_approve_patches: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_scan_grade: Option<ScanGrade>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_passing_tests: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_passing_validate: Option<bool>,
    /// Defaults to enabled; only an explicit `false` disables the check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prevent_self_approval: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforcement_level: Option<EnforcementLevel>,
}

/// Scope a policy binding attaches to, narrowest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "scope_ref", rename_all = "snake_case")]
pub enum PolicyScope {
    Artifact(Uuid),
    Namespace(String),
    Team(String),
    Global,
}

impl PolicyScope {
    /// Resolution rank; lower binds tighter.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Artifact(_) => 0,
            Self::Namespace(_) => 1,
            Self::Team(_) => 2,
            Self::Global => 3,
        }
    }
}

/// A policy rule set attached at some scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub id: Uuid,
    #[serde(flatten)]
    pub scope: PolicyScope,
    pub rules: PolicyRules,
    pub created_at: DateTime<Utc>,
}

/// What prompted a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTrigger {
    Approval,
    Download,
}

impl PolicyTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Download => "download",
        }
    }
}

/// Aggregate outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOutcome {
    Pass,
    Warn,
    Fail,
}

impl PolicyOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}

/// Result of evaluating a single rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: String,
    pub passed: bool,
    pub message: String,
}

/// Result of evaluating the resolved policy for one trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub trigger: PolicyTrigger,
    pub outcome: PolicyOutcome,
    pub enforcement_level: EnforcementLevel,
    pub results: Vec<RuleResult>,
}

/// Kind of CI result recorded against a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiKind {
    Tests,
    Validate,
    Scan,
}

impl CiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tests => "tests",
            Self::Validate => "validate",
            Self::Scan => "scan",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tests" => Some(Self::Tests),
            "validate" => Some(Self::Validate),
            "scan" => Some(Self::Scan),
            _ => None,
        }
    }
}

/// A CI run outcome reported for a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiResult {
    pub version_id: Uuid,
    pub kind: CiKind,
    pub success: bool,
    /// Scan grade; only meaningful for `scan` results.
    pub grade: Option<ScanGrade>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<Uuid>,
    pub resource_name: Option<String>,
    pub version: Option<String>,
    pub details: Value,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Build an entry stamped with the current time.
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            resource_name: None,
            version: None,
            details: empty_object(),
            occurred_at: Utc::now(),
        }
    }

    pub fn resource(mut self, id: Uuid, name: impl Into<String>) -> Self {
        self.resource_id = Some(id);
        self.resource_name = Some(name.into());
        self
    }

    pub fn version_str(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A registry API token at rest; only the hash is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: Uuid,
    pub name: String,
    pub token_hash: String,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Opaque cursor for the next page; absent on the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Filters for artifact listing.
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub artifact_type: Option<ArtifactType>,
    pub status: Option<ArtifactStatus>,
    pub team: Option<String>,
    /// Matches artifacts carrying this tag.
    pub category: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

/// Validate a namespace/name slug: `[a-z][a-z0-9-]{2,63}`.
pub fn is_valid_slug(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() < 3 || bytes.len() > 64 {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}
