//! Policy resolution and evaluation.
//!
//! Bindings attach rule sets at artifact, namespace, team, or global scope;
//! resolution picks the narrowest binding per rule. Evaluation runs the
//! rules relevant to a trigger (approval or download) and folds failures
//! through the enforcement level: `block` fails, `warn` downgrades,
//! `audit` records only.

use tracing::warn;

use crate::error::{RegistryError, Result};
use crate::store::Store;
use crate::types::{
    Artifact, CiKind, CiResult, EnforcementLevel, PolicyBinding, PolicyEvaluation, PolicyOutcome,
    PolicyRules, PolicyTrigger, RuleResult, VersionRow,
};

/// The effective policy for one artifact after scope resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPolicy {
    pub rules: PolicyRules,
}

impl ResolvedPolicy {
    /// Enforcement level, defaulting to `block`.
    pub fn enforcement_level(&self) -> EnforcementLevel {
        self.rules.enforcement_level.unwrap_or_default()
    }

    /// Self-approval prevention is on unless explicitly disabled; an absent
    /// or null value means the default applies.
    pub fn prevents_self_approval(&self) -> bool {
        self.rules.prevent_self_approval != Some(false)
    }

    /// Auto-approval requires the rule and the absence of any run-gating
    /// rule — a freshly ingested version cannot have runs yet.
    pub fn allows_auto_approval(&self) -> bool {
        self.rules.auto_approve_patches == Some(true)
            && self.rules.require_passing_tests != Some(true)
            && self.rules.require_passing_validate != Some(true)
    }
}

/// Merge bindings narrowest-scope-first; the first binding that sets a rule
/// wins, unset rules fall through.
pub fn resolve(bindings: &[PolicyBinding]) -> ResolvedPolicy {
    let mut ordered: Vec<&PolicyBinding> = bindings.iter().collect();
    ordered.sort_by_key(|b| (b.scope.rank(), b.created_at));

    let mut rules = PolicyRules::default();
    for binding in ordered {
        let b = &binding.rules;
        rules.min_approvers = rules.min_approvers.or(b.min_approvers);
        rules.auto_approve_patches = rules.auto_approve_patches.or(b.auto_approve_patches);
        rules.required_scan_grade = rules.required_scan_grade.or(b.required_scan_grade);
        rules.require_passing_tests = rules.require_passing_tests.or(b.require_passing_tests);
        rules.require_passing_validate =
            rules.require_passing_validate.or(b.require_passing_validate);
        rules.prevent_self_approval = rules.prevent_self_approval.or(b.prevent_self_approval);
        rules.enforcement_level = rules.enforcement_level.or(b.enforcement_level);
    }
    ResolvedPolicy { rules }
}

/// Fetch and resolve the effective policy for an artifact.
pub fn resolve_for_artifact(store: &dyn Store, artifact: &Artifact) -> Result<ResolvedPolicy> {
    let bindings = store.list_policy_bindings(
        artifact.id,
        &artifact.namespace,
        artifact.team.as_deref(),
    )?;
    Ok(resolve(&bindings))
}

/// Everything the evaluator needs about the version under consideration.
#[derive(Debug)]
pub struct EvaluationInput<'a> {
    pub version: &'a VersionRow,
    pub actor: &'a str,
    /// Distinct approvers recorded so far.
    pub approver_count: u32,
    pub ci_results: &'a [CiResult],
}

/// Evaluate the rules relevant to `trigger` against the resolved policy.
pub fn evaluate(
    policy: &ResolvedPolicy,
    trigger: PolicyTrigger,
    input: &EvaluationInput<'_>,
) -> PolicyEvaluation {
    let mut results = Vec::new();

    if trigger == PolicyTrigger::Approval {
        if let Some(required) = policy.rules.min_approvers {
            let passed = input.approver_count >= required;
            results.push(RuleResult {
                rule: "min_approvers".to_string(),
                passed,
                message: format!("{}/{required} distinct approvals", input.approver_count),
            });
        }
        if policy.prevents_self_approval() {
            let self_approving = input.version.published_by.as_deref() == Some(input.actor);
            results.push(RuleResult {
                rule: "prevent_self_approval".to_string(),
                passed: !self_approving,
                message: if self_approving {
                    format!("{} published this version and cannot approve it", input.actor)
                } else {
                    "approver is not the publisher".to_string()
                },
            });
        }
    }

    if policy.rules.require_passing_tests == Some(true) {
        results.push(run_requirement(input.ci_results, CiKind::Tests));
    }
    if policy.rules.require_passing_validate == Some(true) {
        results.push(run_requirement(input.ci_results, CiKind::Validate));
    }
    if let Some(required_grade) = policy.rules.required_scan_grade {
        let best = input
            .ci_results
            .iter()
            .filter(|r| r.kind == CiKind::Scan)
            .filter_map(|r| r.grade)
            .min();
        let passed = best.is_some_and(|grade| grade <= required_grade);
        results.push(RuleResult {
            rule: "required_scan_grade".to_string(),
            passed,
            message: match best {
                Some(grade) => format!(
                    "best scan grade {} against required {}",
                    grade.as_str(),
                    required_grade.as_str()
                ),
                None => "no scan results recorded".to_string(),
            },
        });
    }

    let enforcement_level = policy.enforcement_level();
    let any_failed = results.iter().any(|r| !r.passed);
    let outcome = match (any_failed, enforcement_level) {
        (false, _) => PolicyOutcome::Pass,
        (true, EnforcementLevel::Block) => PolicyOutcome::Fail,
        (true, EnforcementLevel::Warn) => PolicyOutcome::Warn,
        (true, EnforcementLevel::Audit) => PolicyOutcome::Pass,
    };

    PolicyEvaluation {
        trigger,
        outcome,
        enforcement_level,
        results,
    }
}

fn run_requirement(ci_results: &[CiResult], kind: CiKind) -> RuleResult {
    let passed = ci_results.iter().any(|r| r.kind == kind && r.success);
    RuleResult {
        rule: match kind {
            CiKind::Tests => "require_passing_tests".to_string(),
            CiKind::Validate => "require_passing_validate".to_string(),
            CiKind::Scan => "required_scan_grade".to_string(),
        },
        passed,
        message: if passed {
            format!("a successful {} run exists", kind.as_str())
        } else {
            format!("no successful {} run for this version", kind.as_str())
        },
    }
}

/// Resolve, evaluate, and persist an evaluation row for audit.
///
/// Persistence is fire-and-forget: a failed insert is logged and never
/// blocks the caller's response.
pub fn evaluate_and_record(
    store: &dyn Store,
    trigger: PolicyTrigger,
    artifact: &Artifact,
    version: &VersionRow,
    actor: &str,
) -> Result<PolicyEvaluation> {
    let policy = resolve_for_artifact(store, artifact)?;
    let ci_results = store.list_ci_results(version.id)?;
    let approver_count = store.count_approvers(version.id)?;
    let evaluation = evaluate(
        &policy,
        trigger,
        &EvaluationInput {
            version,
            actor,
            approver_count,
            ci_results: &ci_results,
        },
    );
    if let Err(err) =
        store.insert_policy_evaluation(artifact.id, version.id, actor, &evaluation)
    {
        warn!(%err, artifact = %artifact.name, "failed to persist policy evaluation");
    }
    Ok(evaluation)
}

/// Convert a blocking evaluation into an error the HTTP layer maps to 422.
pub fn require_pass(evaluation: &PolicyEvaluation) -> Result<()> {
    if evaluation.outcome == PolicyOutcome::Fail {
        return Err(RegistryError::PolicyFail {
            results: evaluation.results.clone(),
        });
    }
    Ok(())
}
