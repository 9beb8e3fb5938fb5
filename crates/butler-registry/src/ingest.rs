//! Version ingestion from verified push events.
//!
//! A tag push fans out to every artifact sourced from the pushed
//! repository: the version is upserted idempotently, auto-approved when the
//! policy allows it (first version or patch bump, with no run-gating rules),
//! and approved versions cascade into matching environment modules.
//! Re-delivering the same webhook produces no new rows and no new audit
//! entries.

use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use butler_semver::Version;
use butler_webhook::PushEvent;

use crate::cascade::{self, CascadeSummary};
use crate::error::{RegistryError, Result};
use crate::policy;
use crate::store::Store;
use crate::types::{
    ApprovalStatus, Artifact, AuditEntry, NewVersion, PolicyEvaluation, PolicyTrigger, VersionRow,
};

/// Actor recorded on webhook-created versions.
pub const WEBHOOK_ACTOR: &str = "system:webhook";
/// Approver recorded on patch auto-approvals.
pub const AUTO_APPROVER: &str = "system:auto-approval";

/// Counters for one webhook delivery.
#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub matched_artifacts: usize,
    pub created_versions: usize,
    pub auto_approved: usize,
    pub cascades: Vec<CascadeSummary>,
}

/// Ingest a parsed push event.
///
/// Non-tag pushes and tags that do not parse as semver are ignored — the
/// webhook response is 200 either way.
pub fn ingest_push(store: &dyn Store, event: &PushEvent) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    let Some(tag) = event.tag.as_deref() else {
        return Ok(summary);
    };

    let artifacts = store.find_artifacts_by_repository_url(&event.repository_url)?;
    summary.matched_artifacts = artifacts.len();

    for artifact in artifacts {
        // A custom tag prefix (e.g. `release-`) is stripped before parsing;
        // the ubiquitous `v` is handled by the parser itself.
        let effective_tag = artifact
            .source
            .as_ref()
            .and_then(|s| s.tag_prefix.as_deref())
            .and_then(|prefix| tag.strip_prefix(prefix))
            .unwrap_or(tag);
        let Ok(parsed) = Version::parse(effective_tag) else {
            continue;
        };

        let (row, created) = store.upsert_version(&NewVersion {
            artifact_id: artifact.id,
            version: parsed.raw.clone(),
            digest: None,
            changelog: None,
            metadata: json!({
                "source_ref": event.ref_name.clone(),
                "repository": event.repository_full_name.clone(),
            }),
            storage_ref: None,
            size_bytes: None,
            published_by: Some(WEBHOOK_ACTOR.to_string()),
        })?;
        if !created {
            continue;
        }
        summary.created_versions += 1;
        audit(
            store,
            AuditEntry::new(WEBHOOK_ACTOR, "version.published", "version")
                .resource(artifact.id, artifact.name.clone())
                .version_str(&row.version),
        );

        if row.approval_status == ApprovalStatus::Pending
            && auto_approval_applies(store, &artifact, &parsed)?
        {
            let approved = store.approve_version(row.id, AUTO_APPROVER)?;
            summary.auto_approved += 1;
            audit(
                store,
                AuditEntry::new(AUTO_APPROVER, "version.approved", "version")
                    .resource(artifact.id, artifact.name.clone())
                    .version_str(&approved.version)
                    .details(json!({"reason": "patch auto-approval"})),
            );
            summary
                .cascades
                .push(cascade::trigger_cascade(store, &artifact, &parsed)?);
        }
    }

    Ok(summary)
}

/// Patch auto-approval: the policy opts in, no run-gating rule is present,
/// and the version is either the artifact's first or a patch bump over the
/// current latest.
fn auto_approval_applies(
    store: &dyn Store,
    artifact: &Artifact,
    candidate: &Version,
) -> Result<bool> {
    let policy = policy::resolve_for_artifact(store, artifact)?;
    if !policy.allows_auto_approval() {
        return Ok(false);
    }
    match store.latest_version(artifact.id)? {
        None => Ok(true),
        Some(latest) => match Version::parse(&latest.version) {
            Ok(previous) => Ok(candidate.is_patch_bump_of(&previous)),
            Err(_) => Ok(false),
        },
    }
}

/// Outcome of a policy-gated manual approval.
#[derive(Debug)]
pub struct ApprovalOutcome {
    pub version: VersionRow,
    pub evaluation: PolicyEvaluation,
    pub cascade: Option<CascadeSummary>,
}

/// Approve a version on behalf of `actor`, enforcing the resolved policy.
///
/// The actor's approval is recorded first (idempotently), then the policy
/// is evaluated; a blocking failure refuses the approval. On success the
/// cascade fans out.
pub fn approve_version_gated(
    store: &dyn Store,
    version_id: Uuid,
    actor: &str,
) -> Result<ApprovalOutcome> {
    let version = store
        .get_version(version_id)?
        .ok_or_else(|| RegistryError::NotFound(format!("version {version_id}")))?;
    let artifact = store
        .get_artifact(version.artifact_id)?
        .ok_or_else(|| RegistryError::Internal("version references missing artifact".into()))?;

    store.record_approval(version_id, actor)?;
    let evaluation =
        policy::evaluate_and_record(store, PolicyTrigger::Approval, &artifact, &version, actor)?;
    policy::require_pass(&evaluation)?;

    let approved = store.approve_version(version_id, actor)?;
    audit(
        store,
        AuditEntry::new(actor, "version.approved", "version")
            .resource(artifact.id, artifact.name.clone())
            .version_str(&approved.version),
    );

    let cascade = match Version::parse(&approved.version) {
        Ok(parsed) => Some(cascade::trigger_cascade(store, &artifact, &parsed)?),
        Err(_) => None,
    };

    Ok(ApprovalOutcome {
        version: approved,
        evaluation,
        cascade,
    })
}

/// Gate a version download behind the resolved policy and log it.
pub fn gate_download(
    store: &dyn Store,
    artifact: &Artifact,
    version: &VersionRow,
    actor: &str,
) -> Result<PolicyEvaluation> {
    if version.is_bad {
        return Err(RegistryError::Conflict(format!(
            "version {} has been yanked",
            version.version
        )));
    }
    let evaluation =
        policy::evaluate_and_record(store, PolicyTrigger::Download, artifact, version, actor)?;
    policy::require_pass(&evaluation)?;
    if let Err(err) = store.append_download_log(version.id, actor) {
        warn!(%err, version = %version.version, "failed to record download log");
    }
    Ok(evaluation)
}

fn audit(store: &dyn Store, entry: AuditEntry) {
    if let Err(err) = store.append_audit(&entry) {
        warn!(%err, action = %entry.action, "failed to record audit entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;
    use crate::types::{
        ArtifactType, NewArtifact, PolicyRules, PolicyScope, SourceConfig, empty_object,
    };

    fn store_with_artifact(auto_approve: bool) -> (SqliteStore, Artifact) {
        let store = SqliteStore::open_in_memory().unwrap();
        let artifact = store
            .insert_artifact(&NewArtifact {
                namespace: "infra".into(),
                name: "vpc".into(),
                provider: None,
                artifact_type: ArtifactType::TerraformModule,
                team: None,
                source: Some(SourceConfig {
                    repository_url: "https://github.com/infra/vpc".into(),
                    path: None,
                    tag_prefix: None,
                }),
                tags: vec![],
            })
            .unwrap();
        if auto_approve {
            store
                .insert_policy_binding(
                    &PolicyScope::Artifact(artifact.id),
                    &PolicyRules {
                        auto_approve_patches: Some(true),
                        ..PolicyRules::default()
                    },
                )
                .unwrap();
        }
        (store, artifact)
    }

    fn push(tag: &str) -> PushEvent {
        PushEvent {
            repository_url: "https://github.com/infra/vpc".into(),
            repository_full_name: "infra/vpc".into(),
            ref_name: format!("refs/tags/{tag}"),
            tag: Some(tag.to_string()),
        }
    }

    #[test]
    fn test_first_version_auto_approves() {
        let (store, artifact) = store_with_artifact(true);
        let summary = ingest_push(&store, &push("v1.0.0")).unwrap();
        assert_eq!(summary.matched_artifacts, 1);
        assert_eq!(summary.created_versions, 1);
        assert_eq!(summary.auto_approved, 1);
        let latest = store.latest_version(artifact.id).unwrap().unwrap();
        assert_eq!(latest.version, "1.0.0");
        assert_eq!(latest.approved_by.as_deref(), Some(AUTO_APPROVER));
    }

    #[test]
    fn test_patch_bump_auto_approves_minor_does_not() {
        let (store, artifact) = store_with_artifact(true);
        ingest_push(&store, &push("v1.2.3")).unwrap();
        let summary = ingest_push(&store, &push("v1.2.4")).unwrap();
        assert_eq!(summary.auto_approved, 1);
        let summary = ingest_push(&store, &push("v1.3.0")).unwrap();
        assert_eq!(summary.auto_approved, 0);
        let pending = store.find_version(artifact.id, "1.3.0").unwrap().unwrap();
        assert_eq!(pending.approval_status, ApprovalStatus::Pending);
    }

    #[test]
    fn test_no_policy_means_no_auto_approval() {
        let (store, artifact) = store_with_artifact(false);
        let summary = ingest_push(&store, &push("v1.0.0")).unwrap();
        assert_eq!(summary.auto_approved, 0);
        let row = store.find_version(artifact.id, "1.0.0").unwrap().unwrap();
        assert_eq!(row.approval_status, ApprovalStatus::Pending);
    }

    #[test]
    fn test_run_gate_disables_auto_approval() {
        let (store, artifact) = store_with_artifact(false);
        store
            .insert_policy_binding(
                &PolicyScope::Artifact(artifact.id),
                &PolicyRules {
                    auto_approve_patches: Some(true),
                    require_passing_tests: Some(true),
                    ..PolicyRules::default()
                },
            )
            .unwrap();
        let summary = ingest_push(&store, &push("v1.0.0")).unwrap();
        assert_eq!(summary.auto_approved, 0);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let (store, _artifact) = store_with_artifact(true);
        ingest_push(&store, &push("v1.0.0")).unwrap();
        let audits_before = store.list_audit(None).unwrap().len();
        let replay = ingest_push(&store, &push("v1.0.0")).unwrap();
        assert_eq!(replay.created_versions, 0);
        assert_eq!(replay.auto_approved, 0);
        // No additional audit rows beyond the first delivery.
        assert_eq!(store.list_audit(None).unwrap().len(), audits_before);
    }

    #[test]
    fn test_branch_push_is_ignored() {
        let (store, _artifact) = store_with_artifact(true);
        let event = PushEvent {
            repository_url: "https://github.com/infra/vpc".into(),
            repository_full_name: "infra/vpc".into(),
            ref_name: "refs/heads/main".into(),
            tag: None,
        };
        let summary = ingest_push(&store, &event).unwrap();
        assert_eq!(summary.matched_artifacts, 0);
        assert_eq!(summary.created_versions, 0);
    }

    #[test]
    fn test_non_semver_tag_is_ignored() {
        let (store, _artifact) = store_with_artifact(true);
        let summary = ingest_push(&store, &push("nightly-build")).unwrap();
        assert_eq!(summary.created_versions, 0);
    }

    #[test]
    fn test_unrelated_repository_matches_nothing() {
        let (store, _artifact) = store_with_artifact(true);
        let mut event = push("v1.0.0");
        event.repository_url = "https://github.com/other/repo".into();
        let summary = ingest_push(&store, &event).unwrap();
        assert_eq!(summary.matched_artifacts, 0);
    }

    #[test]
    fn test_manual_approval_blocked_by_self_approval() {
        let (store, artifact) = store_with_artifact(false);
        let (row, _) = store
            .upsert_version(&NewVersion {
                artifact_id: artifact.id,
                version: "2.0.0".into(),
                digest: None,
                changelog: None,
                metadata: empty_object(),
                storage_ref: None,
                size_bytes: None,
                published_by: Some("alice".into()),
            })
            .unwrap();
        let err = approve_version_gated(&store, row.id, "alice").unwrap_err();
        assert!(matches!(err, RegistryError::PolicyFail { .. }));
        // A different actor passes the default policy.
        let outcome = approve_version_gated(&store, row.id, "bob").unwrap();
        assert_eq!(outcome.version.approval_status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_download_gate_rejects_yanked() {
        let (store, artifact) = store_with_artifact(false);
        let (row, _) = store
            .upsert_version(&NewVersion {
                artifact_id: artifact.id,
                version: "2.0.0".into(),
                digest: None,
                changelog: None,
                metadata: empty_object(),
                storage_ref: None,
                size_bytes: None,
                published_by: None,
            })
            .unwrap();
        store.approve_version(row.id, "bob").unwrap();
        let yanked = store.yank_version(row.id).unwrap();
        assert!(yanked.is_bad);
        let err = gate_download(&store, &artifact, &yanked, "carol").unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }
}
