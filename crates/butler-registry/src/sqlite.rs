//! SQLite-backed [`Store`] implementation.
//!
//! WAL journal mode with a busy timeout; every multi-step run-state
//! mutation runs inside an IMMEDIATE transaction so the at-most-one-active
//! invariant holds under concurrent writers. Timestamps are RFC 3339 text,
//! ids are UUID blobs, and structured columns are JSON text.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::Value;
use uuid::Uuid;

use crate::dag;
use crate::error::{RegistryError, Result};
use crate::runstate;
use crate::store::{EnqueueOutcome, RunUpdate, Store, normalize_repository_url};
use crate::types::{
    ApiToken, ApprovalStatus, Artifact, ArtifactFilter, ArtifactStatus, ArtifactType, AuditEntry,
    CiKind, CiResult, CloudIntegration, Environment, EnvironmentOperation, EnvironmentRun,
    EnvironmentRunStatus, ExecutionMode, Module, ModuleDependency, ModuleRun, ModuleStatus,
    NewArtifact, NewModule, NewModuleRun, NewVersion, Operation, Page, PolicyBinding,
    PolicyEvaluation, PolicyRules, PolicyScope, RunPriority, RunStatus, ScanGrade, VersionRow,
};

/// Schema version written to `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;
/// SQLite busy timeout.
const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);
/// Default and maximum page sizes for listings.
const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 200;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS artifacts (
    id                    BLOB PRIMARY KEY,
    namespace             TEXT NOT NULL,
    name                  TEXT NOT NULL,
    provider              TEXT,
    artifact_type         TEXT NOT NULL,
    status                TEXT NOT NULL,
    team                  TEXT,
    source_config         TEXT,
    source_repository_url TEXT,
    tags                  TEXT NOT NULL,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_artifacts_ident_provider
    ON artifacts (namespace, name, provider) WHERE provider IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_artifacts_ident
    ON artifacts (namespace, name) WHERE provider IS NULL;
CREATE INDEX IF NOT EXISTS idx_artifacts_repo ON artifacts (source_repository_url);

CREATE TABLE IF NOT EXISTS artifact_versions (
    id              BLOB PRIMARY KEY,
    artifact_id     BLOB NOT NULL REFERENCES artifacts (id),
    version         TEXT NOT NULL,
    approval_status TEXT NOT NULL,
    is_latest       INTEGER NOT NULL DEFAULT 0,
    is_bad          INTEGER NOT NULL DEFAULT 0,
    digest          TEXT,
    changelog       TEXT,
    metadata        TEXT NOT NULL,
    storage_ref     TEXT,
    size_bytes      INTEGER,
    published_by    TEXT,
    approved_by     TEXT,
    approved_at     TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE (artifact_id, version)
);

CREATE TABLE IF NOT EXISTS version_approvals (
    version_id  BLOB NOT NULL,
    approver    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE (version_id, approver)
);

CREATE TABLE IF NOT EXISTS api_tokens (
    id         BLOB PRIMARY KEY,
    name       TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    revoked    INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS download_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    version_id  BLOB NOT NULL,
    actor       TEXT NOT NULL,
    occurred_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    actor         TEXT NOT NULL,
    action        TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id   BLOB,
    resource_name TEXT,
    version       TEXT,
    details       TEXT NOT NULL,
    occurred_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ci_results (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    version_id BLOB NOT NULL,
    kind       TEXT NOT NULL,
    success    INTEGER NOT NULL,
    grade      TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS policy_bindings (
    id         BLOB PRIMARY KEY,
    scope      TEXT NOT NULL,
    scope_ref  TEXT,
    rules      TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS policy_evaluations (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    artifact_id       BLOB NOT NULL,
    version_id        BLOB NOT NULL,
    trigger_kind      TEXT NOT NULL,
    outcome           TEXT NOT NULL,
    enforcement_level TEXT NOT NULL,
    results           TEXT NOT NULL,
    actor             TEXT NOT NULL,
    occurred_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS environments (
    id                BLOB PRIMARY KEY,
    name              TEXT NOT NULL UNIQUE,
    locked            INTEGER NOT NULL DEFAULT 0,
    cloud_integration TEXT,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS environment_modules (
    id                         BLOB PRIMARY KEY,
    environment_id             BLOB NOT NULL REFERENCES environments (id),
    artifact_id                BLOB NOT NULL REFERENCES artifacts (id),
    name                       TEXT NOT NULL,
    pinned_version             TEXT,
    mode                       TEXT NOT NULL,
    auto_plan_on_module_update INTEGER NOT NULL,
    tf_version                 TEXT,
    state_backend              TEXT NOT NULL,
    vcs_trigger                TEXT,
    variables                  TEXT NOT NULL,
    status                     TEXT NOT NULL,
    created_at                 TEXT NOT NULL,
    updated_at                 TEXT NOT NULL,
    UNIQUE (environment_id, name)
);

CREATE TABLE IF NOT EXISTS module_dependencies (
    module_id      BLOB NOT NULL,
    depends_on_id  BLOB NOT NULL,
    output_mapping TEXT NOT NULL,
    UNIQUE (module_id, depends_on_id)
);

CREATE TABLE IF NOT EXISTS module_runs (
    id                  BLOB PRIMARY KEY,
    module_id           BLOB NOT NULL,
    environment_run_id  BLOB,
    operation           TEXT NOT NULL,
    mode                TEXT NOT NULL,
    status              TEXT NOT NULL,
    priority            TEXT NOT NULL,
    queue_position      INTEGER,
    triggered_by        TEXT NOT NULL,
    tf_version          TEXT,
    variables           TEXT NOT NULL,
    state_backend       TEXT NOT NULL,
    callback_token_hash TEXT,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    planned_at          TEXT,
    completed_at        TEXT,
    exit_code           INTEGER,
    resources_added     INTEGER,
    resources_changed   INTEGER,
    resources_destroyed INTEGER,
    tf_outputs          TEXT,
    plan_output         TEXT,
    error_message       TEXT,
    skipped_due_to      BLOB
);
CREATE INDEX IF NOT EXISTS idx_module_runs_module_status ON module_runs (module_id, status);
CREATE INDEX IF NOT EXISTS idx_module_runs_status ON module_runs (status);
CREATE INDEX IF NOT EXISTS idx_module_runs_env_run ON module_runs (environment_run_id);

CREATE TABLE IF NOT EXISTS run_logs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     BLOB NOT NULL,
    chunk      TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS environment_runs (
    id                    BLOB PRIMARY KEY,
    environment_id        BLOB NOT NULL REFERENCES environments (id),
    operation             TEXT NOT NULL,
    status                TEXT NOT NULL,
    triggered_by          TEXT NOT NULL,
    confirmation_deadline TEXT,
    created_at            TEXT NOT NULL,
    completed_at          TEXT
);
"#;

const RUN_COLUMNS: &str = "id, module_id, environment_run_id, operation, mode, status, priority, \
     queue_position, triggered_by, tf_version, variables, state_backend, callback_token_hash, \
     created_at, started_at, planned_at, completed_at, exit_code, resources_added, \
     resources_changed, resources_destroyed, tf_outputs, error_message, skipped_due_to";

const SLOT_STATUSES: &str = "('queued', 'running', 'planned', 'confirmed', 'applying')";
const ACTIVE_STATUSES: &str = "('running', 'planned', 'confirmed', 'applying')";

/// Durable store backed by a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and migrate) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.pragma_update(None, "foreign_keys", "on")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(RegistryError::Storage(format!(
                "database schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wrap an enum-parse failure so it surfaces as a column conversion error.
fn bad_column<T>(index: usize, text: &str) -> rusqlite::Result<T> {
    Err(rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("unrecognized value {text:?}").into(),
    ))
}

fn json_column(index: usize, text: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_json_column(index: usize, text: Option<String>) -> rusqlite::Result<Option<Value>> {
    text.map(|t| json_column(index, t)).transpose()
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    let artifact_type_text: String = row.get(4)?;
    let Some(artifact_type) = ArtifactType::parse(&artifact_type_text) else {
        return bad_column(4, &artifact_type_text);
    };
    let status_text: String = row.get(5)?;
    let Some(status) = ArtifactStatus::parse(&status_text) else {
        return bad_column(5, &status_text);
    };
    let source = opt_json_column(7, row.get(7)?)?
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let tags: Vec<String> = serde_json::from_value(json_column(8, row.get(8)?)?).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Artifact {
        id: row.get(0)?,
        namespace: row.get(1)?,
        name: row.get(2)?,
        provider: row.get(3)?,
        artifact_type,
        status,
        team: row.get(6)?,
        source,
        tags,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

const ARTIFACT_COLUMNS: &str = "id, namespace, name, provider, artifact_type, status, team, \
     source_config, tags, created_at, updated_at";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<VersionRow> {
    let status_text: String = row.get(3)?;
    let Some(approval_status) = ApprovalStatus::parse(&status_text) else {
        return bad_column(3, &status_text);
    };
    Ok(VersionRow {
        id: row.get(0)?,
        artifact_id: row.get(1)?,
        version: row.get(2)?,
        approval_status,
        is_latest: row.get(4)?,
        is_bad: row.get(5)?,
        digest: row.get(6)?,
        changelog: row.get(7)?,
        metadata: json_column(8, row.get(8)?)?,
        storage_ref: row.get(9)?,
        size_bytes: row.get(10)?,
        published_by: row.get(11)?,
        approved_by: row.get(12)?,
        approved_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

const VERSION_COLUMNS: &str = "id, artifact_id, version, approval_status, is_latest, is_bad, \
     digest, changelog, metadata, storage_ref, size_bytes, published_by, approved_by, \
     approved_at, created_at, updated_at";

fn module_from_row(row: &Row<'_>) -> rusqlite::Result<Module> {
    let mode_text: String = row.get(5)?;
    let Some(mode) = ExecutionMode::parse(&mode_text) else {
        return bad_column(5, &mode_text);
    };
    let status_text: String = row.get(11)?;
    let Some(status) = ModuleStatus::parse(&status_text) else {
        return bad_column(11, &status_text);
    };
    let vcs_trigger = opt_json_column(9, row.get(9)?)?
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(Module {
        id: row.get(0)?,
        environment_id: row.get(1)?,
        artifact_id: row.get(2)?,
        name: row.get(3)?,
        pinned_version: row.get(4)?,
        mode,
        auto_plan_on_module_update: row.get(6)?,
        tf_version: row.get(7)?,
        state_backend: json_column(8, row.get(8)?)?,
        vcs_trigger,
        variables: json_column(10, row.get(10)?)?,
        status,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

const MODULE_COLUMNS: &str = "id, environment_id, artifact_id, name, pinned_version, mode, \
     auto_plan_on_module_update, tf_version, state_backend, vcs_trigger, variables, status, \
     created_at, updated_at";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<ModuleRun> {
    let operation_text: String = row.get(3)?;
    let Some(operation) = Operation::parse(&operation_text) else {
        return bad_column(3, &operation_text);
    };
    let mode_text: String = row.get(4)?;
    let Some(mode) = ExecutionMode::parse(&mode_text) else {
        return bad_column(4, &mode_text);
    };
    let status_text: String = row.get(5)?;
    let Some(status) = RunStatus::parse(&status_text) else {
        return bad_column(5, &status_text);
    };
    let priority_text: String = row.get(6)?;
    let Some(priority) = RunPriority::parse(&priority_text) else {
        return bad_column(6, &priority_text);
    };
    Ok(ModuleRun {
        id: row.get(0)?,
        module_id: row.get(1)?,
        environment_run_id: row.get(2)?,
        operation,
        mode,
        status,
        priority,
        queue_position: row.get(7)?,
        triggered_by: row.get(8)?,
        tf_version: row.get(9)?,
        variables: json_column(10, row.get(10)?)?,
        state_backend: json_column(11, row.get(11)?)?,
        callback_token_hash: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        planned_at: row.get(15)?,
        completed_at: row.get(16)?,
        exit_code: row.get(17)?,
        resources_added: row.get(18)?,
        resources_changed: row.get(19)?,
        resources_destroyed: row.get(20)?,
        tf_outputs: opt_json_column(21, row.get(21)?)?,
        error_message: row.get(22)?,
        skipped_due_to: row.get(23)?,
    })
}

fn environment_from_row(row: &Row<'_>) -> rusqlite::Result<Environment> {
    let cloud_integration: Option<CloudIntegration> = opt_json_column(3, row.get(3)?)?
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(Environment {
        id: row.get(0)?,
        name: row.get(1)?,
        locked: row.get(2)?,
        cloud_integration,
        created_at: row.get(4)?,
    })
}

fn environment_run_from_row(row: &Row<'_>) -> rusqlite::Result<EnvironmentRun> {
    let operation_text: String = row.get(2)?;
    let Some(operation) = EnvironmentOperation::parse(&operation_text) else {
        return bad_column(2, &operation_text);
    };
    let status_text: String = row.get(3)?;
    let Some(status) = EnvironmentRunStatus::parse(&status_text) else {
        return bad_column(3, &status_text);
    };
    Ok(EnvironmentRun {
        id: row.get(0)?,
        environment_id: row.get(1)?,
        operation,
        status,
        triggered_by: row.get(4)?,
        confirmation_deadline: row.get(5)?,
        created_at: row.get(6)?,
        completed_at: row.get(7)?,
    })
}

const ENVIRONMENT_RUN_COLUMNS: &str =
    "id, environment_id, operation, status, triggered_by, confirmation_deadline, created_at, \
     completed_at";

fn dependency_from_row(row: &Row<'_>) -> rusqlite::Result<ModuleDependency> {
    let mapping: Vec<crate::types::OutputMapping> =
        serde_json::from_value(json_column(2, row.get(2)?)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(ModuleDependency {
        module_id: row.get(0)?,
        depends_on_id: row.get(1)?,
        output_mapping: mapping,
    })
}

/// Create a run row. Shared by the slot/queue/waiting insert paths.
fn insert_run_row(
    conn: &Connection,
    new: &NewModuleRun,
    id: Uuid,
    status: RunStatus,
    queue_position: Option<i64>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO module_runs (id, module_id, environment_run_id, operation, mode, status, \
         priority, queue_position, triggered_by, tf_version, variables, state_backend, \
         created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            id,
            new.module_id,
            new.environment_run_id,
            new.operation.as_str(),
            new.mode.as_str(),
            status.as_str(),
            new.priority.as_str(),
            queue_position,
            new.triggered_by,
            new.tf_version,
            new.variables.to_string(),
            new.state_backend.to_string(),
            now,
        ],
    )?;
    Ok(())
}

fn get_run_tx(conn: &Connection, id: Uuid) -> Result<Option<ModuleRun>> {
    Ok(conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM module_runs WHERE id = ?1"),
            params![id],
            run_from_row,
        )
        .optional()?)
}

fn slot_occupied(conn: &Connection, module_id: Uuid) -> Result<bool> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM module_runs WHERE module_id = ?1 AND status IN {SLOT_STATUSES}"
        ),
        params![module_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn next_queue_position(conn: &Connection, module_id: Uuid) -> Result<i64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(queue_position) FROM module_runs WHERE module_id = ?1 AND status = 'pending'",
        params![module_id],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

/// Place a waiting or new run into the module's slot or queue tail.
fn place_in_queue(conn: &Connection, run_id: Uuid, module_id: Uuid) -> Result<()> {
    if slot_occupied(conn, module_id)? {
        let position = next_queue_position(conn, module_id)?;
        conn.execute(
            "UPDATE module_runs SET status = 'pending', queue_position = ?2 WHERE id = ?1",
            params![run_id, position],
        )?;
    } else {
        conn.execute(
            "UPDATE module_runs SET status = 'queued', queue_position = NULL WHERE id = ?1",
            params![run_id],
        )?;
    }
    Ok(())
}

/// Recompute the `is_latest` flag: highest approved, non-yanked semver.
fn recompute_latest(conn: &Connection, artifact_id: Uuid) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT id, version FROM artifact_versions \
         WHERE artifact_id = ?1 AND approval_status = 'approved' AND is_bad = 0",
    )?;
    let candidates = stmt
        .query_map(params![artifact_id], |row| {
            Ok((row.get::<_, Uuid>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let winner = candidates
        .iter()
        .filter_map(|(id, text)| {
            butler_semver::Version::parse(text)
                .ok()
                .map(|parsed| (*id, parsed))
        })
        .max_by(|(_, a), (_, b)| a.cmp(b))
        .map(|(id, _)| id);

    conn.execute(
        "UPDATE artifact_versions SET is_latest = 0 WHERE artifact_id = ?1 AND is_latest = 1",
        params![artifact_id],
    )?;
    if let Some(id) = winner {
        conn.execute(
            "UPDATE artifact_versions SET is_latest = 1 WHERE id = ?1",
            params![id],
        )?;
    }
    Ok(())
}

fn get_version_tx(conn: &Connection, id: Uuid) -> Result<Option<VersionRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {VERSION_COLUMNS} FROM artifact_versions WHERE id = ?1"),
            params![id],
            version_from_row,
        )
        .optional()?)
}

impl Store for SqliteStore {
    fn insert_artifact(&self, new: &NewArtifact) -> Result<Artifact> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let source_repository_url = new
            .source
            .as_ref()
            .map(|s| normalize_repository_url(&s.repository_url));
        let inserted = conn.execute(
            "INSERT INTO artifacts (id, namespace, name, provider, artifact_type, status, team, \
             source_config, source_repository_url, tags, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id,
                new.namespace,
                new.name,
                new.provider,
                new.artifact_type.as_str(),
                new.team,
                new.source
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                source_repository_url,
                serde_json::to_string(&new.tags)?,
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(RegistryError::Conflict(format!(
                    "artifact {}/{} already exists",
                    new.namespace, new.name
                )));
            }
            Err(e) => return Err(e.into()),
        }
        drop(conn);
        self.get_artifact(id)?
            .ok_or_else(|| RegistryError::Internal("inserted artifact vanished".to_string()))
    }

    fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = ?1"),
                params![id],
                artifact_from_row,
            )
            .optional()?)
    }

    fn update_artifact_status(&self, id: Uuid, status: ArtifactStatus) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE artifacts SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), Utc::now()],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound(format!("artifact {id}")));
        }
        Ok(())
    }

    fn find_artifacts_by_repository_url(&self, url: &str) -> Result<Vec<Artifact>> {
        let normalized = normalize_repository_url(url);
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE source_repository_url = ?1 \
             ORDER BY namespace, name"
        ))?;
        let rows = stmt
            .query_map(params![normalized], artifact_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Page<Artifact>> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(MAX_PAGE_SIZE) as usize;

        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(artifact_type) = filter.artifact_type {
            clauses.push(format!("artifact_type = ?{}", args.len() + 1));
            args.push(Box::new(artifact_type.as_str()));
        }
        if let Some(status) = filter.status {
            clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str()));
        }
        if let Some(team) = &filter.team {
            clauses.push(format!("team = ?{}", args.len() + 1));
            args.push(Box::new(team.clone()));
        }
        if let Some(category) = &filter.category {
            // Tags are a JSON array; membership via instr on the quoted form.
            clauses.push(format!(
                "instr(tags, ?{}) > 0",
                args.len() + 1
            ));
            args.push(Box::new(format!("\"{category}\"")));
        }
        if let Some(cursor) = &filter.cursor {
            let (value, id) = crate::cursor::decode_cursor(cursor)
                .ok_or_else(|| RegistryError::InvalidInput("invalid pagination cursor".into()))?;
            clauses.push(format!(
                "(created_at < ?{} OR (created_at = ?{} AND id < ?{}))",
                args.len() + 1,
                args.len() + 1,
                args.len() + 2
            ));
            args.push(Box::new(value));
            args.push(Box::new(id));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts {where_clause} \
             ORDER BY created_at DESC, id DESC LIMIT {limit}"
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                artifact_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let next_cursor = if items.len() == limit {
            items
                .last()
                .map(|a| crate::cursor::encode_cursor(&a.created_at.to_rfc3339(), a.id))
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    fn upsert_version(&self, new: &NewVersion) -> Result<(VersionRow, bool)> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let existing: Option<Uuid> = tx
            .query_row(
                "SELECT id FROM artifact_versions WHERE artifact_id = ?1 AND version = ?2",
                params![new.artifact_id, new.version],
                |row| row.get(0),
            )
            .optional()?;

        let (id, created) = match existing {
            Some(id) => {
                // Re-delivery: refresh the timestamp and storage reference
                // only; approval status is never reset.
                tx.execute(
                    "UPDATE artifact_versions SET updated_at = ?2, \
                     storage_ref = COALESCE(?3, storage_ref) WHERE id = ?1",
                    params![id, now, new.storage_ref],
                )?;
                (id, false)
            }
            None => {
                let id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO artifact_versions (id, artifact_id, version, approval_status, \
                     digest, changelog, metadata, storage_ref, size_bytes, published_by, \
                     created_at, updated_at) \
                     VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                    params![
                        id,
                        new.artifact_id,
                        new.version,
                        new.digest,
                        new.changelog,
                        new.metadata.to_string(),
                        new.storage_ref,
                        new.size_bytes,
                        new.published_by,
                        now,
                    ],
                )?;
                (id, true)
            }
        };

        let row = get_version_tx(&tx, id)?
            .ok_or_else(|| RegistryError::Internal("upserted version vanished".to_string()))?;
        tx.commit()?;
        Ok((row, created))
    }

    fn get_version(&self, id: Uuid) -> Result<Option<VersionRow>> {
        let conn = self.lock();
        get_version_tx(&conn, id)
    }

    fn find_version(&self, artifact_id: Uuid, version: &str) -> Result<Option<VersionRow>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM artifact_versions \
                     WHERE artifact_id = ?1 AND version = ?2"
                ),
                params![artifact_id, version],
                version_from_row,
            )
            .optional()?)
    }

    fn latest_version(&self, artifact_id: Uuid) -> Result<Option<VersionRow>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM artifact_versions \
                     WHERE artifact_id = ?1 AND is_latest = 1"
                ),
                params![artifact_id],
                version_from_row,
            )
            .optional()?)
    }

    fn list_versions(&self, artifact_id: Uuid) -> Result<Vec<VersionRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM artifact_versions WHERE artifact_id = ?1 \
             ORDER BY created_at DESC, version DESC"
        ))?;
        let rows = stmt
            .query_map(params![artifact_id], version_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn approve_version(&self, id: Uuid, approver: &str) -> Result<VersionRow> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = get_version_tx(&tx, id)?
            .ok_or_else(|| RegistryError::NotFound(format!("version {id}")))?;
        if row.approval_status != ApprovalStatus::Pending {
            return Err(RegistryError::Conflict(format!(
                "version {} is already {}",
                row.version,
                row.approval_status.as_str()
            )));
        }
        tx.execute(
            "UPDATE artifact_versions SET approval_status = 'approved', approved_by = ?2, \
             approved_at = ?3, updated_at = ?3 WHERE id = ?1",
            params![id, approver, Utc::now()],
        )?;
        recompute_latest(&tx, row.artifact_id)?;
        let updated = get_version_tx(&tx, id)?
            .ok_or_else(|| RegistryError::Internal("approved version vanished".to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    fn reject_version(&self, id: Uuid, actor: &str) -> Result<VersionRow> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = get_version_tx(&tx, id)?
            .ok_or_else(|| RegistryError::NotFound(format!("version {id}")))?;
        if row.approval_status != ApprovalStatus::Pending {
            return Err(RegistryError::Conflict(format!(
                "version {} is already {}",
                row.version,
                row.approval_status.as_str()
            )));
        }
        tx.execute(
            "UPDATE artifact_versions SET approval_status = 'rejected', approved_by = ?2, \
             updated_at = ?3 WHERE id = ?1",
            params![id, actor, Utc::now()],
        )?;
        let updated = get_version_tx(&tx, id)?
            .ok_or_else(|| RegistryError::Internal("rejected version vanished".to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    fn yank_version(&self, id: Uuid) -> Result<VersionRow> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = get_version_tx(&tx, id)?
            .ok_or_else(|| RegistryError::NotFound(format!("version {id}")))?;
        tx.execute(
            "UPDATE artifact_versions SET is_bad = 1, updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now()],
        )?;
        recompute_latest(&tx, row.artifact_id)?;
        let updated = get_version_tx(&tx, id)?
            .ok_or_else(|| RegistryError::Internal("yanked version vanished".to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    fn record_approval(&self, version_id: Uuid, approver: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO version_approvals (version_id, approver, created_at) \
             VALUES (?1, ?2, ?3)",
            params![version_id, approver, Utc::now()],
        )?;
        Ok(())
    }

    fn count_approvers(&self, version_id: Uuid) -> Result<u32> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT approver) FROM version_approvals WHERE version_id = ?1",
            params![version_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    fn insert_environment(&self, name: &str, cloud: Option<&Value>) -> Result<Environment> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO environments (id, name, locked, cloud_integration, created_at) \
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![id, name, cloud.map(Value::to_string), Utc::now()],
        )?;
        drop(conn);
        self.get_environment(id)?
            .ok_or_else(|| RegistryError::Internal("inserted environment vanished".to_string()))
    }

    fn get_environment(&self, id: Uuid) -> Result<Option<Environment>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, locked, cloud_integration, created_at \
                 FROM environments WHERE id = ?1",
                params![id],
                environment_from_row,
            )
            .optional()?)
    }

    fn set_environment_locked(&self, id: Uuid, locked: bool) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE environments SET locked = ?2 WHERE id = ?1",
            params![id, locked],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound(format!("environment {id}")));
        }
        Ok(())
    }

    fn insert_module(&self, new: &NewModule) -> Result<Module> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO environment_modules (id, environment_id, artifact_id, name, \
             pinned_version, mode, auto_plan_on_module_update, tf_version, state_backend, \
             vcs_trigger, variables, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'active', ?12, ?12)",
            params![
                id,
                new.environment_id,
                new.artifact_id,
                new.name,
                new.pinned_version,
                new.mode.as_str(),
                new.auto_plan_on_module_update,
                new.tf_version,
                new.state_backend.to_string(),
                new.vcs_trigger
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                new.variables.to_string(),
                now,
            ],
        )?;
        drop(conn);
        self.get_module(id)?
            .ok_or_else(|| RegistryError::Internal("inserted module vanished".to_string()))
    }

    fn get_module(&self, id: Uuid) -> Result<Option<Module>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {MODULE_COLUMNS} FROM environment_modules WHERE id = ?1"),
                params![id],
                module_from_row,
            )
            .optional()?)
    }

    fn list_modules_for_artifact(&self, artifact_id: Uuid) -> Result<Vec<Module>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MODULE_COLUMNS} FROM environment_modules WHERE artifact_id = ?1 \
             ORDER BY name"
        ))?;
        let rows = stmt
            .query_map(params![artifact_id], module_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_modules_in_environment(&self, environment_id: Uuid) -> Result<Vec<Module>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MODULE_COLUMNS} FROM environment_modules WHERE environment_id = ?1 \
             ORDER BY name"
        ))?;
        let rows = stmt
            .query_map(params![environment_id], module_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_dependency(&self, dep: &ModuleDependency) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let environment_id: Uuid = tx
            .query_row(
                "SELECT environment_id FROM environment_modules WHERE id = ?1",
                params![dep.module_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(format!("module {}", dep.module_id)))?;
        let upstream_environment: Uuid = tx
            .query_row(
                "SELECT environment_id FROM environment_modules WHERE id = ?1",
                params![dep.depends_on_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(format!("module {}", dep.depends_on_id)))?;
        if environment_id != upstream_environment {
            return Err(RegistryError::InvalidInput(
                "dependency edges must stay within one environment".to_string(),
            ));
        }

        // Acyclicity is enforced on write: sort the environment's edge set
        // with the candidate edge included.
        let mut nodes = std::collections::BTreeSet::new();
        let mut edges = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id FROM environment_modules WHERE environment_id = ?1",
            )?;
            for id in stmt.query_map(params![environment_id], |row| row.get::<_, Uuid>(0))? {
                nodes.insert(id?);
            }
            let mut stmt = tx.prepare(
                "SELECT d.module_id, d.depends_on_id FROM module_dependencies d \
                 JOIN environment_modules m ON m.id = d.module_id \
                 WHERE m.environment_id = ?1",
            )?;
            for edge in stmt.query_map(params![environment_id], |row| {
                Ok((row.get::<_, Uuid>(0)?, row.get::<_, Uuid>(1)?))
            })? {
                edges.push(edge?);
            }
        }
        edges.push((dep.module_id, dep.depends_on_id));
        dag::toposort(&nodes, &edges)?;

        tx.execute(
            "INSERT INTO module_dependencies (module_id, depends_on_id, output_mapping) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (module_id, depends_on_id) DO UPDATE SET output_mapping = ?3",
            params![
                dep.module_id,
                dep.depends_on_id,
                serde_json::to_string(&dep.output_mapping)?
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_dependencies_in_environment(
        &self,
        environment_id: Uuid,
    ) -> Result<Vec<ModuleDependency>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT d.module_id, d.depends_on_id, d.output_mapping FROM module_dependencies d \
             JOIN environment_modules m ON m.id = d.module_id \
             WHERE m.environment_id = ?1 ORDER BY d.module_id, d.depends_on_id",
        )?;
        let rows = stmt
            .query_map(params![environment_id], dependency_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_dependencies_of_module(&self, module_id: Uuid) -> Result<Vec<ModuleDependency>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT module_id, depends_on_id, output_mapping FROM module_dependencies \
             WHERE module_id = ?1 ORDER BY depends_on_id",
        )?;
        let rows = stmt
            .query_map(params![module_id], dependency_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn enqueue_run(&self, new: &NewModuleRun) -> Result<EnqueueOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        // Latest-wins coalescing: a fresh cascade supersedes any cascade
        // still waiting in this module's queue. User runs are untouched.
        let coalesced = if new.priority == RunPriority::Cascade {
            tx.execute(
                "UPDATE module_runs SET status = 'discarded', queue_position = NULL, \
                 completed_at = ?2 \
                 WHERE module_id = ?1 AND status = 'pending' AND priority = 'cascade' \
                 AND queue_position IS NOT NULL",
                params![new.module_id, now],
            )? as u64
        } else {
            0
        };

        let id = Uuid::new_v4();
        insert_run_row(&tx, new, id, RunStatus::Pending, None, now)?;
        place_in_queue(&tx, id, new.module_id)?;

        let run = get_run_tx(&tx, id)?
            .ok_or_else(|| RegistryError::Internal("enqueued run vanished".to_string()))?;
        tx.commit()?;
        Ok(EnqueueOutcome { run, coalesced })
    }

    fn create_waiting_run(&self, new: &NewModuleRun) -> Result<ModuleRun> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        insert_run_row(&conn, new, id, RunStatus::Pending, None, Utc::now())?;
        get_run_tx(&conn, id)?
            .ok_or_else(|| RegistryError::Internal("created run vanished".to_string()))
    }

    fn admit_run(&self, run_id: Uuid) -> Result<ModuleRun> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = get_run_tx(&tx, run_id)?
            .ok_or_else(|| RegistryError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::Pending {
            return Err(RegistryError::Conflict(format!(
                "run {run_id} is {} and cannot be admitted",
                run.status.as_str()
            )));
        }
        if run.queue_position.is_some() {
            // Already in the queue.
            tx.commit()?;
            return Ok(run);
        }
        place_in_queue(&tx, run_id, run.module_id)?;
        let updated = get_run_tx(&tx, run_id)?
            .ok_or_else(|| RegistryError::Internal("admitted run vanished".to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    fn get_run(&self, id: Uuid) -> Result<Option<ModuleRun>> {
        let conn = self.lock();
        get_run_tx(&conn, id)
    }

    fn active_run(&self, module_id: Uuid) -> Result<Option<ModuleRun>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM module_runs \
                     WHERE module_id = ?1 AND status IN {SLOT_STATUSES}"
                ),
                params![module_id],
                run_from_row,
            )
            .optional()?)
    }

    fn queued_count(&self, module_id: Uuid) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM module_runs WHERE module_id = ?1 AND status = 'pending' \
             AND queue_position IS NOT NULL",
            params![module_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn update_run_status(
        &self,
        run_id: Uuid,
        to: RunStatus,
        update: &RunUpdate,
    ) -> Result<ModuleRun> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = get_run_tx(&tx, run_id)?
            .ok_or_else(|| RegistryError::NotFound(format!("run {run_id}")))?;
        runstate::check_transition(run.status, to)?;

        let now = Utc::now();
        tx.execute(
            "UPDATE module_runs SET status = ?2, \
             exit_code = COALESCE(?3, exit_code), \
             resources_added = COALESCE(?4, resources_added), \
             resources_changed = COALESCE(?5, resources_changed), \
             resources_destroyed = COALESCE(?6, resources_destroyed), \
             error_message = COALESCE(?7, error_message), \
             skipped_due_to = COALESCE(?8, skipped_due_to) \
             WHERE id = ?1",
            params![
                run_id,
                to.as_str(),
                update.exit_code,
                update.resources_added,
                update.resources_changed,
                update.resources_destroyed,
                update.error_message,
                update.skipped_due_to,
            ],
        )?;
        if to == RunStatus::Planned {
            tx.execute(
                "UPDATE module_runs SET planned_at = ?2 WHERE id = ?1",
                params![run_id, now],
            )?;
        }
        if to.is_terminal() {
            tx.execute(
                "UPDATE module_runs SET completed_at = ?2, callback_token_hash = NULL, \
                 queue_position = NULL WHERE id = ?1",
                params![run_id, now],
            )?;
        }
        let updated = get_run_tx(&tx, run_id)?
            .ok_or_else(|| RegistryError::Internal("updated run vanished".to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    fn try_mark_running(&self, run_id: Uuid, token_hash: &str) -> Result<Option<ModuleRun>> {
        let conn = self.lock();
        // Conditional claim: only one dispatcher replica wins the row.
        let claimed = conn.execute(
            "UPDATE module_runs SET status = 'running', callback_token_hash = ?2, \
             started_at = ?3 WHERE id = ?1 AND status = 'queued'",
            params![run_id, token_hash, Utc::now()],
        )?;
        if claimed == 0 {
            return Ok(None);
        }
        get_run_tx(&conn, run_id)
    }

    fn dequeue_next(&self, module_id: Uuid) -> Result<Option<ModuleRun>> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if slot_occupied(&tx, module_id)? {
            return Ok(None);
        }
        let next: Option<Uuid> = tx
            .query_row(
                "SELECT id FROM module_runs WHERE module_id = ?1 AND status = 'pending' \
                 AND queue_position IS NOT NULL \
                 ORDER BY CASE priority WHEN 'user' THEN 0 ELSE 1 END, queue_position ASC \
                 LIMIT 1",
                params![module_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(next_id) = next else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE module_runs SET status = 'queued', queue_position = NULL WHERE id = ?1",
            params![next_id],
        )?;
        let run = get_run_tx(&tx, next_id)?
            .ok_or_else(|| RegistryError::Internal("dequeued run vanished".to_string()))?;
        tx.commit()?;
        Ok(Some(run))
    }

    fn list_dispatchable(&self, limit: u32) -> Result<Vec<ModuleRun>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM module_runs WHERE status = 'queued' \
             ORDER BY CASE priority WHEN 'user' THEN 0 ELSE 1 END, \
             COALESCE(queue_position, 0) ASC, created_at ASC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn count_active_runs(&self) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM module_runs WHERE status IN {ACTIVE_STATUSES}"),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn latest_successful_apply(&self, module_id: Uuid) -> Result<Option<ModuleRun>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM module_runs \
                     WHERE module_id = ?1 AND operation = 'apply' AND status = 'succeeded' \
                     ORDER BY completed_at DESC LIMIT 1"
                ),
                params![module_id],
                run_from_row,
            )
            .optional()?)
    }

    fn set_run_variables(&self, run_id: Uuid, variables: &Value) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE module_runs SET variables = ?2 WHERE id = ?1",
            params![run_id, variables.to_string()],
        )?;
        Ok(())
    }

    fn set_run_outputs(&self, run_id: Uuid, outputs: &Value) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE module_runs SET tf_outputs = ?2 WHERE id = ?1",
            params![run_id, outputs.to_string()],
        )?;
        Ok(())
    }

    fn set_run_plan(&self, run_id: Uuid, plan: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE module_runs SET plan_output = ?2 WHERE id = ?1",
            params![run_id, plan],
        )?;
        Ok(())
    }

    fn get_run_plan(&self, run_id: Uuid) -> Result<Option<String>> {
        let conn = self.lock();
        let plan: Option<Option<String>> = conn
            .query_row(
                "SELECT plan_output FROM module_runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(plan.flatten())
    }

    fn append_run_log(&self, run_id: Uuid, chunk: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO run_logs (run_id, chunk, created_at) VALUES (?1, ?2, ?3)",
            params![run_id, chunk, Utc::now()],
        )?;
        Ok(())
    }

    fn list_run_logs(&self, run_id: Uuid) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT chunk FROM run_logs WHERE run_id = ?1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_running_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ModuleRun>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM module_runs WHERE status = 'running' \
             AND created_at < ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![cutoff], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_planned_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ModuleRun>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM module_runs WHERE status = 'planned' \
             AND planned_at IS NOT NULL AND planned_at <= ?1 ORDER BY planned_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![cutoff], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_runs_for_environment_run(&self, environment_run_id: Uuid) -> Result<Vec<ModuleRun>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM module_runs WHERE environment_run_id = ?1 \
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![environment_run_id], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_environment_run(
        &self,
        environment_id: Uuid,
        operation: EnvironmentOperation,
        triggered_by: &str,
        confirmation_deadline: Option<DateTime<Utc>>,
    ) -> Result<EnvironmentRun> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO environment_runs (id, environment_id, operation, status, triggered_by, \
             confirmation_deadline, created_at) VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?6)",
            params![
                id,
                environment_id,
                operation.as_str(),
                triggered_by,
                confirmation_deadline,
                Utc::now(),
            ],
        )?;
        drop(conn);
        self.get_environment_run(id)?.ok_or_else(|| {
            RegistryError::Internal("inserted environment run vanished".to_string())
        })
    }

    fn get_environment_run(&self, id: Uuid) -> Result<Option<EnvironmentRun>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {ENVIRONMENT_RUN_COLUMNS} FROM environment_runs WHERE id = ?1"),
                params![id],
                environment_run_from_row,
            )
            .optional()?)
    }

    fn complete_environment_run(&self, id: Uuid, status: EnvironmentRunStatus) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE environment_runs SET status = ?2, completed_at = ?3 \
             WHERE id = ?1 AND status = 'running'",
            params![id, status.as_str(), Utc::now()],
        )?;
        Ok(())
    }

    fn list_environment_runs_expired(&self, now: DateTime<Utc>) -> Result<Vec<EnvironmentRun>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENVIRONMENT_RUN_COLUMNS} FROM environment_runs WHERE status = 'running' \
             AND confirmation_deadline IS NOT NULL AND confirmation_deadline <= ?1"
        ))?;
        let rows = stmt
            .query_map(params![now], environment_run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_policy_binding(
        &self,
        scope: &PolicyScope,
        rules: &PolicyRules,
    ) -> Result<PolicyBinding> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let (scope_kind, scope_ref) = match scope {
            PolicyScope::Artifact(artifact_id) => ("artifact", Some(artifact_id.to_string())),
            PolicyScope::Namespace(ns) => ("namespace", Some(ns.clone())),
            PolicyScope::Team(team) => ("team", Some(team.clone())),
            PolicyScope::Global => ("global", None),
        };
        conn.execute(
            "INSERT INTO policy_bindings (id, scope, scope_ref, rules, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, scope_kind, scope_ref, serde_json::to_string(rules)?, now],
        )?;
        Ok(PolicyBinding {
            id,
            scope: scope.clone(),
            rules: rules.clone(),
            created_at: now,
        })
    }

    fn list_policy_bindings(
        &self,
        artifact_id: Uuid,
        namespace: &str,
        team: Option<&str>,
    ) -> Result<Vec<PolicyBinding>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, scope, scope_ref, rules, created_at FROM policy_bindings \
             WHERE (scope = 'artifact' AND scope_ref = ?1) \
             OR (scope = 'namespace' AND scope_ref = ?2) \
             OR (scope = 'team' AND scope_ref = ?3) \
             OR scope = 'global' \
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(
                params![artifact_id.to_string(), namespace, team.unwrap_or("")],
                |row| {
                    let id: Uuid = row.get(0)?;
                    let scope_kind: String = row.get(1)?;
                    let scope_ref: Option<String> = row.get(2)?;
                    let rules: PolicyRules = serde_json::from_str(&row.get::<_, String>(3)?)
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                3,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?;
                    let scope = match (scope_kind.as_str(), scope_ref) {
                        ("artifact", Some(text)) => PolicyScope::Artifact(
                            Uuid::parse_str(&text).map_err(|e| {
                                rusqlite::Error::FromSqlConversionFailure(
                                    2,
                                    rusqlite::types::Type::Text,
                                    Box::new(e),
                                )
                            })?,
                        ),
                        ("namespace", Some(text)) => PolicyScope::Namespace(text),
                        ("team", Some(text)) => PolicyScope::Team(text),
                        _ => PolicyScope::Global,
                    };
                    Ok(PolicyBinding {
                        id,
                        scope,
                        rules,
                        created_at: row.get(4)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_policy_evaluation(
        &self,
        artifact_id: Uuid,
        version_id: Uuid,
        actor: &str,
        evaluation: &PolicyEvaluation,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO policy_evaluations (artifact_id, version_id, trigger_kind, outcome, \
             enforcement_level, results, actor, occurred_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                artifact_id,
                version_id,
                evaluation.trigger.as_str(),
                evaluation.outcome.as_str(),
                evaluation.enforcement_level.as_str(),
                serde_json::to_string(&evaluation.results)?,
                actor,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO audit_logs (actor, action, resource_type, resource_id, resource_name, \
             version, details, occurred_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.actor,
                entry.action,
                entry.resource_type,
                entry.resource_id,
                entry.resource_name,
                entry.version,
                entry.details.to_string(),
                entry.occurred_at,
            ],
        )?;
        Ok(())
    }

    fn list_audit(&self, action: Option<&str>) -> Result<Vec<AuditEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT actor, action, resource_type, resource_id, resource_name, version, details, \
             occurred_at FROM audit_logs WHERE (?1 IS NULL OR action = ?1) ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![action], |row| {
                Ok(AuditEntry {
                    actor: row.get(0)?,
                    action: row.get(1)?,
                    resource_type: row.get(2)?,
                    resource_id: row.get(3)?,
                    resource_name: row.get(4)?,
                    version: row.get(5)?,
                    details: json_column(6, row.get(6)?)?,
                    occurred_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_ci_result(&self, result: &CiResult) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO ci_results (version_id, kind, success, grade, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.version_id,
                result.kind.as_str(),
                result.success,
                result.grade.map(ScanGrade::as_str),
                result.created_at,
            ],
        )?;
        Ok(())
    }

    fn list_ci_results(&self, version_id: Uuid) -> Result<Vec<CiResult>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT version_id, kind, success, grade, created_at FROM ci_results \
             WHERE version_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![version_id], |row| {
                let kind_text: String = row.get(1)?;
                let Some(kind) = CiKind::parse(&kind_text) else {
                    return bad_column(1, &kind_text);
                };
                let grade: Option<String> = row.get(3)?;
                Ok(CiResult {
                    version_id: row.get(0)?,
                    kind,
                    success: row.get(2)?,
                    // Unknown grades never satisfy any requirement.
                    grade: grade.as_deref().and_then(ScanGrade::parse),
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_api_token(&self, name: &str, token_hash: &str) -> Result<ApiToken> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO api_tokens (id, name, token_hash, revoked, created_at) \
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![id, name, token_hash, now],
        )?;
        Ok(ApiToken {
            id,
            name: name.to_string(),
            token_hash: token_hash.to_string(),
            revoked: false,
            created_at: now,
        })
    }

    fn find_api_token_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, token_hash, revoked, created_at FROM api_tokens \
                 WHERE token_hash = ?1 AND revoked = 0",
                params![token_hash],
                |row| {
                    Ok(ApiToken {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        token_hash: row.get(2)?,
                        revoked: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    fn append_download_log(&self, version_id: Uuid, actor: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO download_logs (version_id, actor, occurred_at) VALUES (?1, ?2, ?3)",
            params![version_id, actor, Utc::now()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::empty_object;
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn seed_artifact(store: &SqliteStore) -> Artifact {
        store
            .insert_artifact(&NewArtifact {
                namespace: "infra".into(),
                name: "vpc".into(),
                provider: None,
                artifact_type: ArtifactType::TerraformModule,
                team: Some("platform".into()),
                source: Some(crate::types::SourceConfig {
                    repository_url: "https://github.com/infra/vpc".into(),
                    path: None,
                    tag_prefix: Some("v".into()),
                }),
                tags: vec!["network".into()],
            })
            .unwrap()
    }

    fn seed_module(store: &SqliteStore, artifact: &Artifact, name: &str) -> Module {
        let env = store.insert_environment("prod", None).unwrap();
        seed_module_in(store, artifact, env.id, name)
    }

    fn seed_module_in(
        store: &SqliteStore,
        artifact: &Artifact,
        environment_id: Uuid,
        name: &str,
    ) -> Module {
        store
            .insert_module(&NewModule {
                environment_id,
                artifact_id: artifact.id,
                name: name.into(),
                pinned_version: None,
                mode: ExecutionMode::Peaas,
                auto_plan_on_module_update: true,
                tf_version: None,
                state_backend: empty_object(),
                vcs_trigger: None,
                variables: json!({"region": "eu-west-1"}),
            })
            .unwrap()
    }

    fn new_run(module: &Module, priority: RunPriority) -> NewModuleRun {
        NewModuleRun::for_module(module, Operation::Plan, priority, "tester")
    }

    #[test]
    fn test_artifact_two_domain_uniqueness() {
        let s = store();
        seed_artifact(&s);
        // Same (namespace, name) with null provider conflicts.
        let dup = s.insert_artifact(&NewArtifact {
            namespace: "infra".into(),
            name: "vpc".into(),
            provider: None,
            artifact_type: ArtifactType::TerraformModule,
            team: None,
            source: None,
            tags: vec![],
        });
        assert!(matches!(dup, Err(RegistryError::Conflict(_))));
        // A provider-qualified row is a distinct identity domain.
        let qualified = s.insert_artifact(&NewArtifact {
            namespace: "infra".into(),
            name: "vpc".into(),
            provider: Some("aws".into()),
            artifact_type: ArtifactType::TerraformProvider,
            team: None,
            source: None,
            tags: vec![],
        });
        assert!(qualified.is_ok());
    }

    #[test]
    fn test_find_by_repository_url_normalizes() {
        let s = store();
        let artifact = seed_artifact(&s);
        let hits = s
            .find_artifacts_by_repository_url("https://github.com/infra/vpc/")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, artifact.id);
        assert!(
            s.find_artifacts_by_repository_url("https://github.com/infra/other")
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_upsert_version_is_idempotent() {
        let s = store();
        let artifact = seed_artifact(&s);
        let new = NewVersion {
            artifact_id: artifact.id,
            version: "1.2.3".into(),
            digest: None,
            changelog: None,
            metadata: empty_object(),
            storage_ref: Some("s3://bucket/vpc-1.2.3.tgz".into()),
            size_bytes: Some(1024),
            published_by: Some("alice".into()),
        };
        let (first, created) = s.upsert_version(&new).unwrap();
        assert!(created);
        let (second, created_again) = s.upsert_version(&new).unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert_eq!(second.approval_status, ApprovalStatus::Pending);
    }

    #[test]
    fn test_approve_flips_latest_to_highest_semver() {
        let s = store();
        let artifact = seed_artifact(&s);
        let mk = |v: &str| NewVersion {
            artifact_id: artifact.id,
            version: v.into(),
            digest: None,
            changelog: None,
            metadata: empty_object(),
            storage_ref: None,
            size_bytes: None,
            published_by: None,
        };
        let (v123, _) = s.upsert_version(&mk("1.2.3")).unwrap();
        let (v124, _) = s.upsert_version(&mk("1.2.4")).unwrap();
        s.approve_version(v124.id, "alice").unwrap();
        s.approve_version(v123.id, "alice").unwrap();
        let latest = s.latest_version(artifact.id).unwrap().unwrap();
        assert_eq!(latest.version, "1.2.4");
        // Yanking the latest falls back to the next approved version.
        s.yank_version(v124.id).unwrap();
        let latest = s.latest_version(artifact.id).unwrap().unwrap();
        assert_eq!(latest.version, "1.2.3");
    }

    #[test]
    fn test_approve_twice_conflicts() {
        let s = store();
        let artifact = seed_artifact(&s);
        let (v, _) = s
            .upsert_version(&NewVersion {
                artifact_id: artifact.id,
                version: "1.0.0".into(),
                digest: None,
                changelog: None,
                metadata: empty_object(),
                storage_ref: None,
                size_bytes: None,
                published_by: None,
            })
            .unwrap();
        s.approve_version(v.id, "alice").unwrap();
        assert!(matches!(
            s.approve_version(v.id, "bob"),
            Err(RegistryError::Conflict(_))
        ));
    }

    #[test]
    fn test_enqueue_first_run_takes_slot() {
        let s = store();
        let artifact = seed_artifact(&s);
        let module = seed_module(&s, &artifact, "net");
        let outcome = s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        assert_eq!(outcome.run.status, RunStatus::Queued);
        assert_eq!(outcome.run.queue_position, None);
        assert_eq!(outcome.coalesced, 0);
        assert_eq!(s.queued_count(module.id).unwrap(), 0);
    }

    #[test]
    fn test_enqueue_behind_active_gets_position() {
        let s = store();
        let artifact = seed_artifact(&s);
        let module = seed_module(&s, &artifact, "net");
        s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        let second = s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        assert_eq!(second.run.status, RunStatus::Pending);
        assert_eq!(second.run.queue_position, Some(1));
        let third = s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        assert_eq!(third.run.queue_position, Some(2));
        assert_eq!(s.queued_count(module.id).unwrap(), 2);
    }

    #[test]
    fn test_cascade_coalescing_latest_wins() {
        let s = store();
        let artifact = seed_artifact(&s);
        let module = seed_module(&s, &artifact, "net");
        // Occupy the slot with a user run.
        s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        let c1 = s
            .enqueue_run(&new_run(&module, RunPriority::Cascade))
            .unwrap();
        assert_eq!(c1.coalesced, 0);
        let c2 = s
            .enqueue_run(&new_run(&module, RunPriority::Cascade))
            .unwrap();
        assert_eq!(c2.coalesced, 1);
        let c3 = s
            .enqueue_run(&new_run(&module, RunPriority::Cascade))
            .unwrap();
        assert_eq!(c3.coalesced, 1);
        // Exactly one pending cascade survives, and it is the newest.
        assert_eq!(s.queued_count(module.id).unwrap(), 1);
        let first = s.get_run(c1.run.id).unwrap().unwrap();
        assert_eq!(first.status, RunStatus::Discarded);
        let last = s.get_run(c3.run.id).unwrap().unwrap();
        assert_eq!(last.status, RunStatus::Pending);
    }

    #[test]
    fn test_cascade_never_removes_user_runs() {
        let s = store();
        let artifact = seed_artifact(&s);
        let module = seed_module(&s, &artifact, "net");
        s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        let queued_user = s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        let cascade = s
            .enqueue_run(&new_run(&module, RunPriority::Cascade))
            .unwrap();
        assert_eq!(cascade.coalesced, 0);
        let user = s.get_run(queued_user.run.id).unwrap().unwrap();
        assert_eq!(user.status, RunStatus::Pending);
    }

    #[test]
    fn test_dequeue_prefers_user_priority() {
        let s = store();
        let artifact = seed_artifact(&s);
        let module = seed_module(&s, &artifact, "net");
        let active = s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        let cascade = s
            .enqueue_run(&new_run(&module, RunPriority::Cascade))
            .unwrap();
        let user = s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        // Cascade was enqueued first, but the user run dequeues first.
        s.try_mark_running(active.run.id, "hash").unwrap().unwrap();
        s.update_run_status(active.run.id, RunStatus::Succeeded, &RunUpdate::default())
            .unwrap();
        let next = s.dequeue_next(module.id).unwrap().unwrap();
        assert_eq!(next.id, user.run.id);
        assert_eq!(next.status, RunStatus::Queued);
        assert_eq!(next.queue_position, None);
        // Cascade still waits.
        let parked = s.get_run(cascade.run.id).unwrap().unwrap();
        assert_eq!(parked.status, RunStatus::Pending);
    }

    #[test]
    fn test_dequeue_noop_while_slot_occupied() {
        let s = store();
        let artifact = seed_artifact(&s);
        let module = seed_module(&s, &artifact, "net");
        s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
        assert!(s.dequeue_next(module.id).unwrap().is_none());
    }

    #[test]
    fn test_terminal_transition_clears_token_and_sets_completed() {
        let s = store();
        let artifact = seed_artifact(&s);
        let module = seed_module(&s, &artifact, "net");
        let run = s
            .enqueue_run(&new_run(&module, RunPriority::User))
            .unwrap()
            .run;
        s.try_mark_running(run.id, "deadbeef").unwrap().unwrap();
        let running = s.get_run(run.id).unwrap().unwrap();
        assert_eq!(running.callback_token_hash.as_deref(), Some("deadbeef"));
        let done = s
            .update_run_status(
                run.id,
                RunStatus::Succeeded,
                &RunUpdate {
                    exit_code: Some(0),
                    ..RunUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(done.callback_token_hash, None);
        assert!(done.completed_at.is_some());
        assert_eq!(done.exit_code, Some(0));
    }

    #[test]
    fn test_terminal_runs_are_immutable() {
        let s = store();
        let artifact = seed_artifact(&s);
        let module = seed_module(&s, &artifact, "net");
        let run = s
            .enqueue_run(&new_run(&module, RunPriority::User))
            .unwrap()
            .run;
        s.try_mark_running(run.id, "h").unwrap().unwrap();
        s.update_run_status(run.id, RunStatus::Failed, &RunUpdate::default())
            .unwrap();
        let before = s.get_run(run.id).unwrap().unwrap();
        let err = s
            .update_run_status(run.id, RunStatus::Succeeded, &RunUpdate::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::IllegalTransition { .. }));
        // Byte-equal afterwards.
        let after = s.get_run(run.id).unwrap().unwrap();
        assert_eq!(
            serde_json::to_string(&before).unwrap(),
            serde_json::to_string(&after).unwrap()
        );
    }

    #[test]
    fn test_try_mark_running_is_single_winner() {
        let s = store();
        let artifact = seed_artifact(&s);
        let module = seed_module(&s, &artifact, "net");
        let run = s
            .enqueue_run(&new_run(&module, RunPriority::User))
            .unwrap()
            .run;
        assert!(s.try_mark_running(run.id, "a").unwrap().is_some());
        assert!(s.try_mark_running(run.id, "b").unwrap().is_none());
        let current = s.get_run(run.id).unwrap().unwrap();
        assert_eq!(current.callback_token_hash.as_deref(), Some("a"));
    }

    #[test]
    fn test_insert_dependency_rejects_cycle() {
        let s = store();
        let artifact = seed_artifact(&s);
        let env = s.insert_environment("prod", None).unwrap();
        let a = seed_module_in(&s, &artifact, env.id, "a");
        let b = seed_module_in(&s, &artifact, env.id, "b");
        s.insert_dependency(&ModuleDependency {
            module_id: b.id,
            depends_on_id: a.id,
            output_mapping: vec![],
        })
        .unwrap();
        let err = s
            .insert_dependency(&ModuleDependency {
                module_id: a.id,
                depends_on_id: b.id,
                output_mapping: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::DependencyCycle));
    }

    #[test]
    fn test_latest_successful_apply_ignores_plans_and_failures() {
        let s = store();
        let artifact = seed_artifact(&s);
        let module = seed_module(&s, &artifact, "net");

        let mut apply = new_run(&module, RunPriority::User);
        apply.operation = Operation::Apply;
        let run = s.enqueue_run(&apply).unwrap().run;
        s.try_mark_running(run.id, "h").unwrap().unwrap();
        s.set_run_outputs(run.id, &json!({"vpc_id": "vpc-1"})).unwrap();
        s.update_run_status(run.id, RunStatus::Succeeded, &RunUpdate::default())
            .unwrap();

        // A later failed apply does not shadow the successful one.
        let run2 = s.enqueue_run(&apply).unwrap().run;
        s.dequeue_next(module.id).unwrap();
        s.try_mark_running(run2.id, "h2").unwrap().unwrap();
        s.update_run_status(run2.id, RunStatus::Failed, &RunUpdate::default())
            .unwrap();

        let latest = s.latest_successful_apply(module.id).unwrap().unwrap();
        assert_eq!(latest.id, run.id);
        assert_eq!(latest.tf_outputs, Some(json!({"vpc_id": "vpc-1"})));
    }

    #[test]
    fn test_audit_is_append_only_and_filterable() {
        let s = store();
        s.append_audit(&AuditEntry::new("alice", "version.published", "version"))
            .unwrap();
        s.append_audit(&AuditEntry::new("system", "version.approved", "version"))
            .unwrap();
        assert_eq!(s.list_audit(None).unwrap().len(), 2);
        assert_eq!(s.list_audit(Some("version.approved")).unwrap().len(), 1);
    }

    #[test]
    fn test_list_artifacts_pagination() {
        let s = store();
        for i in 0..5 {
            s.insert_artifact(&NewArtifact {
                namespace: "infra".into(),
                name: format!("module-{i}"),
                provider: None,
                artifact_type: ArtifactType::TerraformModule,
                team: None,
                source: None,
                tags: vec![],
            })
            .unwrap();
        }
        let first = s
            .list_artifacts(&ArtifactFilter {
                limit: Some(2),
                ..ArtifactFilter::default()
            })
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.expect("expected a next cursor");
        let second = s
            .list_artifacts(&ArtifactFilter {
                limit: Some(10),
                cursor: Some(cursor),
                ..ArtifactFilter::default()
            })
            .unwrap();
        assert_eq!(second.items.len(), 3);
        // No overlap between pages.
        for item in &second.items {
            assert!(first.items.iter().all(|f| f.id != item.id));
        }
    }

    #[test]
    fn test_list_artifacts_invalid_cursor() {
        let s = store();
        let err = s
            .list_artifacts(&ArtifactFilter {
                cursor: Some("garbage".into()),
                ..ArtifactFilter::default()
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidInput(_)));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let artifact_id = {
            let s = SqliteStore::open(&path).unwrap();
            let artifact = seed_artifact(&s);
            let module = seed_module(&s, &artifact, "net");
            s.enqueue_run(&new_run(&module, RunPriority::User)).unwrap();
            artifact.id
        };
        // Queue state lives in the store, not in process memory.
        let reopened = SqliteStore::open(&path).unwrap();
        let artifact = reopened.get_artifact(artifact_id).unwrap().unwrap();
        assert_eq!(artifact.name, "vpc");
        let modules = reopened.list_modules_for_artifact(artifact_id).unwrap();
        assert_eq!(modules.len(), 1);
        let active = reopened.active_run(modules[0].id).unwrap().unwrap();
        assert_eq!(active.status, RunStatus::Queued);
    }

    #[test]
    fn test_api_token_lookup() {
        let s = store();
        let token = s.insert_api_token("ci", "hash-1").unwrap();
        let found = s.find_api_token_by_hash("hash-1").unwrap().unwrap();
        assert_eq!(found.id, token.id);
        assert!(s.find_api_token_by_hash("hash-2").unwrap().is_none());
    }
}
