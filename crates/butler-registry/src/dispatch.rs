//! Run dispatch to external executors.
//!
//! Three loops drive execution: a poll loop draining queued runs up to the
//! concurrency cap, a one-shot crash recovery at startup, and a periodic
//! sweep expiring overdue runs and unconfirmed plans. Dispatch itself posts
//! a `butler-run` repository-dispatch event; the executor calls back with a
//! per-run `brce_` token. Loops log failures and continue — they never
//! propagate errors upward.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::{RegistryError, Result};
use crate::runs;
use crate::store::{RunUpdate, Store};
use crate::types::{CloudIntegration, ExecutionMode, ModuleRun, RunStatus};

/// Event type of the outbound repository-dispatch.
const DISPATCH_EVENT_TYPE: &str = "butler-run";

/// Payload the executor receives.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchPayload {
    /// Base URL for run callbacks.
    pub butler_url: String,
    pub run_id: Uuid,
    /// Plaintext callback token; only its hash is stored.
    pub callback_token: String,
    pub operation: String,
    pub module_name: String,
    #[serde(flatten)]
    pub cloud: CloudIntegration,
}

#[derive(Debug, Serialize)]
struct RepositoryDispatch {
    event_type: String,
    client_payload: DispatchPayload,
}

/// Counters from one sweep pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepSummary {
    pub timed_out: usize,
    pub discarded_plans: usize,
    pub discarded_environment_runs: usize,
}

/// Long-lived dispatcher over a shared store.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    config: DispatchConfig,
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, config: DispatchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| RegistryError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            store,
            config,
            client,
        })
    }

    /// Run the poll and sweep loops forever. Crash recovery runs once
    /// before the first tick.
    pub async fn run(self: Arc<Self>) {
        match self.recover_crashed() {
            Ok(recovered) if recovered > 0 => {
                info!(recovered, "crash recovery expired stale running runs");
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "crash recovery failed"),
        }

        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(err) = self.poll_once().await {
                        warn!(%err, "dispatch poll failed");
                    }
                }
                _ = sweep.tick() => {
                    if let Err(err) = self.sweep() {
                        warn!(%err, "confirmation sweep failed");
                    }
                }
            }
        }
    }

    /// Dispatch queued runs up to the remaining concurrency capacity.
    pub async fn poll_once(&self) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let active = self.store.count_active_runs()?;
        let capacity = u64::from(self.config.max_concurrent_runs).saturating_sub(active);
        if capacity == 0 {
            return Ok(0);
        }
        let runs = self.store.list_dispatchable(capacity as u32)?;
        let mut dispatched = 0;
        for run in runs {
            let run_id = run.id;
            match self.dispatch(run).await {
                Ok(()) => dispatched += 1,
                Err(err) => warn!(%err, %run_id, "dispatch failed"),
            }
        }
        Ok(dispatched)
    }

    /// Expire runs that were mid-flight before a restart and have exceeded
    /// their wall-clock budget. Younger running runs are left for their
    /// executor callbacks or a later sweep.
    pub fn recover_crashed(&self) -> Result<usize> {
        self.expire_timed_out()
    }

    /// Periodic sweep: overdue running runs, unconfirmed plans, and expired
    /// environment confirmation windows.
    pub fn sweep(&self) -> Result<SweepSummary> {
        let mut summary = SweepSummary {
            timed_out: self.expire_timed_out()?,
            ..SweepSummary::default()
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.confirmation_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(3650));
        for run in self.store.list_planned_before(cutoff)? {
            runs::discard_run(
                self.store.as_ref(),
                run.id,
                Some("confirmation window elapsed".to_string()),
            )?;
            summary.discarded_plans += 1;
        }

        for env_run in self.store.list_environment_runs_expired(Utc::now())? {
            self.discard_environment_run(env_run.id)?;
            summary.discarded_environment_runs += 1;
        }
        Ok(summary)
    }

    fn expire_timed_out(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.timeout)
                .unwrap_or_else(|_| chrono::Duration::days(3650));
        let stale = self.store.list_running_created_before(cutoff)?;
        let mut expired = 0;
        for run in stale {
            runs::transition_run(
                self.store.as_ref(),
                run.id,
                RunStatus::TimedOut,
                &RunUpdate {
                    error_message: Some("run exceeded its wall-clock budget".to_string()),
                    ..RunUpdate::default()
                },
            )?;
            expired += 1;
        }
        Ok(expired)
    }

    /// Discard an environment run whose confirmation window elapsed: the
    /// parent is marked first so member completions do not re-finalize it,
    /// then planned members are discarded and waiting members cancelled.
    fn discard_environment_run(&self, env_run_id: Uuid) -> Result<()> {
        self.store
            .complete_environment_run(env_run_id, crate::types::EnvironmentRunStatus::Discarded)?;
        for member in self.store.list_runs_for_environment_run(env_run_id)? {
            match member.status {
                RunStatus::Planned => {
                    runs::discard_run(
                        self.store.as_ref(),
                        member.id,
                        Some("environment confirmation window elapsed".to_string()),
                    )?;
                }
                RunStatus::Pending | RunStatus::Queued => {
                    runs::cancel_run(self.store.as_ref(), member.id, &RunUpdate::default())?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Dispatch a single queued run.
    async fn dispatch(&self, run: ModuleRun) -> Result<()> {
        let minted = butler_token::mint_callback_token();
        // Conditional claim; a replica that loses the race simply moves on.
        let Some(run) = self.store.try_mark_running(run.id, &minted.token_hash)? else {
            return Ok(());
        };

        let module = self
            .store
            .get_module(run.module_id)?
            .ok_or_else(|| RegistryError::Internal("run references missing module".into()))?;

        let Some((owner, repo)) = self.resolve_target(&run, &module) else {
            // An unresolvable target is surfaced as a failed run rather
            // than a silent stall in `running`.
            runs::transition_run(
                self.store.as_ref(),
                run.id,
                RunStatus::Failed,
                &RunUpdate {
                    error_message: Some(format!(
                        "no dispatch target for {} mode",
                        run.mode.as_str()
                    )),
                    ..RunUpdate::default()
                },
            )?;
            return Ok(());
        };

        let cloud = self
            .store
            .get_environment(module.environment_id)?
            .and_then(|e| e.cloud_integration)
            .unwrap_or_default();

        let body = RepositoryDispatch {
            event_type: DISPATCH_EVENT_TYPE.to_string(),
            client_payload: DispatchPayload {
                butler_url: self.config.butler_url.clone(),
                run_id: run.id,
                callback_token: minted.token,
                operation: run.operation.as_str().to_string(),
                module_name: module.name.clone(),
                cloud,
            },
        };

        let url = format!(
            "{}/repos/{owner}/{repo}/dispatches",
            self.config.api_base.trim_end_matches('/')
        );
        let mut request = self
            .client
            .post(&url)
            .header("Accept", "application/vnd.github+json")
            .json(&body);
        if let Some(token) = &self.config.github_token {
            request = request.bearer_auth(token);
        }

        let failure = match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!(run_id = %run.id, module = %module.name, %owner, %repo, "run dispatched");
                return Ok(());
            }
            Ok(response) => format!("dispatch target answered {}", response.status()),
            Err(err) => format!("dispatch request failed: {err}"),
        };
        runs::transition_run(
            self.store.as_ref(),
            run.id,
            RunStatus::Failed,
            &RunUpdate {
                error_message: Some(failure),
                ..RunUpdate::default()
            },
        )?;
        Ok(())
    }

    fn resolve_target(
        &self,
        run: &ModuleRun,
        module: &crate::types::Module,
    ) -> Option<(String, String)> {
        match run.mode {
            ExecutionMode::Peaas => self
                .config
                .peaas
                .as_ref()
                .map(|p| (p.owner.clone(), p.repo.clone())),
            ExecutionMode::Byoc => module
                .vcs_trigger
                .as_ref()
                .and_then(|t| parse_repo_target(&t.repository_url)),
        }
    }
}

/// Extract `(owner, repo)` from a repository URL.
///
/// Accepts `https://host/owner/repo[.git]` and `git@host:owner/repo.git`.
pub fn parse_repo_target(url: &str) -> Option<(String, String)> {
    let path = if let Some(rest) = url.strip_prefix("git@") {
        rest.split_once(':')?.1
    } else if let Some(rest) = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    {
        rest.split_once('/')?.1
    } else {
        return None;
    };

    let mut parts = path.trim_end_matches('/').splitn(2, '/');
    let owner = parts.next()?;
    let repo = parts.next()?.trim_end_matches(".git");
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeaasTarget;
    use crate::sqlite::SqliteStore;
    use crate::types::{
        ArtifactType, ExecutionMode, Module, NewArtifact, NewModule, NewModuleRun, Operation,
        RunPriority, VcsTrigger, empty_object,
    };
    use std::time::Duration;

    fn seed(store: &SqliteStore, mode: ExecutionMode, trigger: Option<VcsTrigger>) -> Module {
        let artifact = store
            .insert_artifact(&NewArtifact {
                namespace: "infra".into(),
                name: "net".into(),
                provider: None,
                artifact_type: ArtifactType::TerraformModule,
                team: None,
                source: None,
                tags: vec![],
            })
            .unwrap();
        let env = store.insert_environment("prod", None).unwrap();
        store
            .insert_module(&NewModule {
                environment_id: env.id,
                artifact_id: artifact.id,
                name: "net".into(),
                pinned_version: None,
                mode,
                auto_plan_on_module_update: true,
                tf_version: None,
                state_backend: empty_object(),
                vcs_trigger: trigger,
                variables: empty_object(),
            })
            .unwrap()
    }

    fn dispatcher(store: Arc<SqliteStore>, config: DispatchConfig) -> Dispatcher {
        Dispatcher::new(store, config).unwrap()
    }

    fn enabled_config() -> DispatchConfig {
        DispatchConfig {
            enabled: true,
            peaas: Some(PeaasTarget {
                owner: "butlerdotdev".into(),
                repo: "butler-runner".into(),
            }),
            ..DispatchConfig::default()
        }
    }

    #[test]
    fn test_parse_repo_target_shapes() {
        assert_eq!(
            parse_repo_target("https://github.com/infra/net.git"),
            Some(("infra".into(), "net".into()))
        );
        assert_eq!(
            parse_repo_target("https://github.com/infra/net"),
            Some(("infra".into(), "net".into()))
        );
        assert_eq!(
            parse_repo_target("git@github.com:infra/net.git"),
            Some(("infra".into(), "net".into()))
        );
        assert_eq!(parse_repo_target("https://github.com/"), None);
        assert_eq!(parse_repo_target("https://github.com/just-owner"), None);
        assert_eq!(
            parse_repo_target("https://github.com/a/b/c"),
            None
        );
        assert_eq!(parse_repo_target("ftp://github.com/infra/net"), None);
    }

    #[tokio::test]
    async fn test_poll_disabled_dispatches_nothing() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let module = seed(&store, ExecutionMode::Peaas, None);
        store
            .enqueue_run(&NewModuleRun::for_module(
                &module,
                Operation::Plan,
                RunPriority::User,
                "tester",
            ))
            .unwrap();
        let d = dispatcher(store.clone(), DispatchConfig::default());
        assert_eq!(d.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_posts_and_marks_running() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let api_base = format!("http://{}", server.server_addr());
        let handle = std::thread::spawn(move || {
            let request = server.recv().unwrap();
            assert_eq!(
                request.url(),
                "/repos/butlerdotdev/butler-runner/dispatches"
            );
            let auth = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Authorization"))
                .map(|h| h.value.as_str().to_string());
            assert_eq!(auth.as_deref(), Some("Bearer ghp_test"));
            request
                .respond(tiny_http::Response::empty(tiny_http::StatusCode(204)))
                .unwrap();
        });

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let module = seed(&store, ExecutionMode::Peaas, None);
        let run = store
            .enqueue_run(&NewModuleRun::for_module(
                &module,
                Operation::Plan,
                RunPriority::User,
                "tester",
            ))
            .unwrap()
            .run;

        let config = DispatchConfig {
            api_base,
            github_token: Some("ghp_test".into()),
            ..enabled_config()
        };
        let d = dispatcher(store.clone(), config);
        assert_eq!(d.poll_once().await.unwrap(), 1);
        handle.join().unwrap();

        let dispatched = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(dispatched.status, RunStatus::Running);
        assert!(dispatched.callback_token_hash.is_some());
        assert!(dispatched.started_at.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_failure_fails_run() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let api_base = format!("http://{}", server.server_addr());
        let handle = std::thread::spawn(move || {
            let request = server.recv().unwrap();
            request
                .respond(tiny_http::Response::empty(tiny_http::StatusCode(500)))
                .unwrap();
        });

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let module = seed(&store, ExecutionMode::Peaas, None);
        let run = store
            .enqueue_run(&NewModuleRun::for_module(
                &module,
                Operation::Plan,
                RunPriority::User,
                "tester",
            ))
            .unwrap()
            .run;

        let config = DispatchConfig {
            api_base,
            ..enabled_config()
        };
        let d = dispatcher(store.clone(), config);
        d.poll_once().await.unwrap();
        handle.join().unwrap();

        let failed = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.callback_token_hash.is_none());
        assert!(
            failed
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("500"))
        );
    }

    #[tokio::test]
    async fn test_byoc_without_target_fails_visibly() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let module = seed(&store, ExecutionMode::Byoc, None);
        let run = store
            .enqueue_run(&NewModuleRun::for_module(
                &module,
                Operation::Plan,
                RunPriority::User,
                "tester",
            ))
            .unwrap()
            .run;
        let d = dispatcher(store.clone(), enabled_config());
        d.poll_once().await.unwrap();
        let failed = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(
            failed
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("dispatch target"))
        );
    }

    #[tokio::test]
    async fn test_concurrency_cap_limits_dispatch() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        // Two modules, two queued runs, but a cap of one.
        for name in ["a", "b"] {
            let artifact = store
                .insert_artifact(&NewArtifact {
                    namespace: "infra".into(),
                    name: name.into(),
                    provider: None,
                    artifact_type: ArtifactType::TerraformModule,
                    team: None,
                    source: None,
                    tags: vec![],
                })
                .unwrap();
            let env = store.insert_environment(name, None).unwrap();
            let module = store
                .insert_module(&NewModule {
                    environment_id: env.id,
                    artifact_id: artifact.id,
                    name: name.into(),
                    pinned_version: None,
                    mode: ExecutionMode::Byoc,
                    auto_plan_on_module_update: true,
                    tf_version: None,
                    state_backend: empty_object(),
                    vcs_trigger: None,
                    variables: empty_object(),
                })
                .unwrap();
            store
                .enqueue_run(&NewModuleRun::for_module(
                    &module,
                    Operation::Plan,
                    RunPriority::User,
                    "tester",
                ))
                .unwrap();
        }
        let config = DispatchConfig {
            max_concurrent_runs: 1,
            ..enabled_config()
        };
        let d = dispatcher(store.clone(), config);
        // The single dispatched run fails on target resolution (BYOC, no
        // trigger), which frees capacity only after the transition; one run
        // per poll either way.
        d.poll_once().await.unwrap();
        let dispatchable = store.list_dispatchable(10).unwrap();
        assert_eq!(dispatchable.len(), 1);
    }

    #[test]
    fn test_sweep_discards_unconfirmed_plans() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let module = seed(&store, ExecutionMode::Peaas, None);
        let run = store
            .enqueue_run(&NewModuleRun::for_module(
                &module,
                Operation::Apply,
                RunPriority::User,
                "tester",
            ))
            .unwrap()
            .run;
        store.try_mark_running(run.id, "h").unwrap().unwrap();
        store
            .update_run_status(run.id, RunStatus::Planned, &RunUpdate::default())
            .unwrap();

        // A zero confirmation window means the plan is overdue immediately.
        let config = DispatchConfig {
            confirmation_timeout: Duration::ZERO,
            ..enabled_config()
        };
        let d = dispatcher(store.clone(), config);
        let summary = d.sweep().unwrap();
        assert_eq!(summary.discarded_plans, 1);
        let swept = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(swept.status, RunStatus::Discarded);
    }

    #[test]
    fn test_recovery_times_out_stale_running_runs() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let module = seed(&store, ExecutionMode::Peaas, None);
        let run = store
            .enqueue_run(&NewModuleRun::for_module(
                &module,
                Operation::Plan,
                RunPriority::User,
                "tester",
            ))
            .unwrap()
            .run;
        store.try_mark_running(run.id, "h").unwrap().unwrap();

        let config = DispatchConfig {
            timeout: Duration::ZERO,
            ..enabled_config()
        };
        let d = dispatcher(store.clone(), config);
        assert_eq!(d.recover_crashed().unwrap(), 1);
        let expired = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(expired.status, RunStatus::TimedOut);
        assert!(expired.callback_token_hash.is_none());
    }

    #[test]
    fn test_recovery_leaves_fresh_running_runs() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let module = seed(&store, ExecutionMode::Peaas, None);
        let run = store
            .enqueue_run(&NewModuleRun::for_module(
                &module,
                Operation::Plan,
                RunPriority::User,
                "tester",
            ))
            .unwrap()
            .run;
        store.try_mark_running(run.id, "h").unwrap().unwrap();
        let d = dispatcher(store.clone(), enabled_config());
        assert_eq!(d.recover_crashed().unwrap(), 0);
        let untouched = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(untouched.status, RunStatus::Running);
    }
}
