//! Cascade triggering.
//!
//! When a version is approved, every environment module bound to the
//! artifact whose pin matches the new version receives a speculative
//! cascade plan. The queue coalesces rapid successions so only the newest
//! cascade survives per module.

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use butler_semver::{Constraint, Version};

use crate::error::Result;
use crate::queue;
use crate::store::Store;
use crate::types::{Artifact, AuditEntry, ModuleStatus};

/// Actor recorded on cascade-created runs.
pub const CASCADE_ACTOR: &str = "system:cascade";

/// Whether a new version should cascade into a module with this pin.
///
/// A null pin tracks latest and always cascades. A parseable pin cascades
/// when the version satisfies it; an unparseable pin degrades to exact
/// string comparison and never over-matches.
pub fn should_cascade(pinned_version: Option<&str>, candidate: &Version) -> bool {
    match pinned_version {
        None => true,
        Some(pin) => Constraint::parse(pin).matches(candidate),
    }
}

/// Counters summarizing one cascade fanout, written as a single audit row.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CascadeSummary {
    pub total_modules: usize,
    pub created: usize,
    pub skipped_constraint: usize,
    pub skipped_disabled: usize,
    pub skipped_locked: usize,
    /// Older pending cascades displaced by latest-wins coalescing.
    pub coalesced: u64,
}

/// Fan a newly approved version out to matching modules.
pub fn trigger_cascade(
    store: &dyn Store,
    artifact: &Artifact,
    candidate: &Version,
) -> Result<CascadeSummary> {
    let modules = store.list_modules_for_artifact(artifact.id)?;
    let mut summary = CascadeSummary {
        total_modules: modules.len(),
        ..CascadeSummary::default()
    };

    for module in modules {
        if !should_cascade(module.pinned_version.as_deref(), candidate) {
            summary.skipped_constraint += 1;
            continue;
        }
        if module.status != ModuleStatus::Active || !module.auto_plan_on_module_update {
            summary.skipped_disabled += 1;
            continue;
        }
        let locked = store
            .get_environment(module.environment_id)?
            .map(|e| e.locked)
            .unwrap_or(true);
        if locked {
            summary.skipped_locked += 1;
            continue;
        }
        let outcome = queue::enqueue_cascade_plan(store, &module, CASCADE_ACTOR)?;
        summary.created += 1;
        summary.coalesced += outcome.coalesced;
    }

    audit_fanout(store, artifact, &candidate.raw, &summary);
    Ok(summary)
}

fn audit_fanout(store: &dyn Store, artifact: &Artifact, version: &str, summary: &CascadeSummary) {
    let entry = AuditEntry::new(CASCADE_ACTOR, "cascade.triggered", "artifact")
        .resource(artifact.id, artifact.name.clone())
        .version_str(version)
        .details(json!(summary));
    if let Err(err) = store.append_audit(&entry) {
        warn!(%err, artifact_id = %artifact.id, "failed to record cascade fanout audit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_null_pin_always_cascades() {
        assert!(should_cascade(None, &v("1.2.4")));
        assert!(should_cascade(None, &v("0.0.1")));
    }

    #[test]
    fn test_constraint_pins() {
        let candidate = v("1.2.4");
        assert!(should_cascade(Some("~> 1.2"), &candidate));
        assert!(should_cascade(Some("~> 1.2.0"), &candidate));
        assert!(should_cascade(Some(">= 1.0"), &candidate));
        assert!(should_cascade(Some("1.2.4"), &candidate));
        assert!(should_cascade(Some("= 1.2.4"), &candidate));
        assert!(!should_cascade(Some("~> 1.1.0"), &candidate));
        assert!(!should_cascade(Some("~> 2.0"), &candidate));
    }

    #[test]
    fn test_unparseable_pin_requires_exact_match() {
        assert!(!should_cascade(Some("latest"), &v("1.2.4")));
        // The raw string itself matches.
        assert!(should_cascade(Some("1.2.4-rc.1"), &v("1.2.4-rc.1")));
    }
}
