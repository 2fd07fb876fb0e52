use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params, types::Type};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    atom::{AtomSession, AtomStatus},
    awi::{AuthorizationLevel, AwiGrant, GrantConstraint},
    bump::{BumpMarker, MarkerStatus, MarkerType},
    context::ContextEntry,
    identity::ApiKeyRecord,
    storage::{
        bounded,
        error::{StorageError, StoreBackend},
        relational::{ContextPageRequest, MarkerInsert, RelationalStore},
    },
    types::{JsonObject, from_unix_millis, to_unix_millis},
    wave::WaveAnalysis,
};

const BUSY_TIMEOUT: Duration = Duration::from_millis(1_000);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL UNIQUE,
    owner TEXT NOT NULL,
    tier TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS wave_analyses (
    id TEXT PRIMARY KEY,
    caller_id TEXT NOT NULL,
    content_fingerprint TEXT NOT NULL,
    curl REAL NOT NULL,
    divergence REAL NOT NULL,
    potential REAL NOT NULL,
    coherence_score REAL NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS wave_analyses_by_caller
    ON wave_analyses (caller_id, created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS bump_markers (
    id TEXT PRIMARY KEY,
    marker_type TEXT NOT NULL,
    source TEXT NOT NULL,
    target TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    caller_id TEXT NOT NULL,
    idempotency_key TEXT,
    resolution TEXT,
    created_at INTEGER NOT NULL,
    acknowledged_at INTEGER,
    resolved_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS bump_markers_idempotency
    ON bump_markers (caller_id, idempotency_key) WHERE idempotency_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS bump_markers_pending
    ON bump_markers (target, status, id);

CREATE TABLE IF NOT EXISTS awi_grants (
    id TEXT PRIMARY KEY,
    subject TEXT NOT NULL,
    level TEXT NOT NULL,
    intent TEXT NOT NULL,
    constraints TEXT NOT NULL,
    issued_by TEXT NOT NULL,
    issued_at INTEGER NOT NULL,
    expires_at INTEGER,
    revoked INTEGER NOT NULL DEFAULT 0,
    revoked_at INTEGER
);
CREATE INDEX IF NOT EXISTS awi_grants_by_subject ON awi_grants (subject, id);

CREATE TABLE IF NOT EXISTS atom_sessions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    molecule TEXT NOT NULL,
    status TEXT NOT NULL,
    verification TEXT,
    failure_reason TEXT,
    caller_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS atom_sessions_by_molecule ON atom_sessions (molecule, id);

CREATE TABLE IF NOT EXISTS context_entries (
    id TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    metadata TEXT NOT NULL,
    content_ref TEXT NOT NULL UNIQUE,
    content_sha256 TEXT NOT NULL,
    content_bytes INTEGER NOT NULL,
    signals TEXT NOT NULL,
    caller_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS context_entries_by_domain ON context_entries (domain, id);
"#;

const API_KEY_COLUMNS: &str = "id, fingerprint, owner, tier, created_at, revoked";
const WAVE_COLUMNS: &str =
    "id, caller_id, content_fingerprint, curl, divergence, potential, coherence_score, created_at";
const MARKER_COLUMNS: &str = "id, marker_type, source, target, operation, payload, status, \
     caller_id, idempotency_key, resolution, created_at, acknowledged_at, resolved_at";
const GRANT_COLUMNS: &str = "id, subject, level, intent, constraints, issued_by, issued_at, \
     expires_at, revoked, revoked_at";
const TASK_COLUMNS: &str = "id, name, molecule, status, verification, failure_reason, caller_id, \
     created_at, updated_at";
const CONTEXT_COLUMNS: &str = "id, domain, metadata, content_ref, content_sha256, content_bytes, \
     signals, caller_id, created_at, updated_at";

#[derive(Debug, Error)]
#[error("{0}")]
struct CorruptColumn(String);

fn corrupt_column(index: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        Box::new(CorruptColumn(message.into())),
    )
}

fn db_error(err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            StorageError::conflict(StoreBackend::Relational, err.to_string())
        }
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => {
            StorageError::corrupt(StoreBackend::Relational, err.to_string())
        }
        _ => StorageError::unavailable(StoreBackend::Relational, err.to_string()),
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|err| {
        StorageError::corrupt(
            StoreBackend::Relational,
            format!("failed to encode column: {err}"),
        )
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| corrupt_column(index, err.to_string()))
}

fn decode_optional_json<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(|err| corrupt_column(index, err.to_string())))
        .transpose()
}

fn decode_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let millis: i64 = row.get(index)?;
    from_unix_millis(millis).ok_or_else(|| corrupt_column(index, "timestamp out of range"))
}

fn decode_optional_timestamp(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let millis: Option<i64> = row.get(index)?;
    millis
        .map(|millis| {
            from_unix_millis(millis).ok_or_else(|| corrupt_column(index, "timestamp out of range"))
        })
        .transpose()
}

fn decode_enum<T>(
    row: &Row<'_>,
    index: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    parse(&raw).ok_or_else(|| corrupt_column(index, format!("unknown value '{raw}'")))
}

fn api_key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        owner: row.get(2)?,
        tier: row.get(3)?,
        created_at: decode_timestamp(row, 4)?,
        revoked: row.get(5)?,
    })
}

fn wave_from_row(row: &Row<'_>) -> rusqlite::Result<WaveAnalysis> {
    Ok(WaveAnalysis {
        id: row.get(0)?,
        caller_id: row.get(1)?,
        content_fingerprint: row.get(2)?,
        curl: row.get(3)?,
        divergence: row.get(4)?,
        potential: row.get(5)?,
        coherence_score: row.get(6)?,
        created_at: decode_timestamp(row, 7)?,
    })
}

fn marker_from_row(row: &Row<'_>) -> rusqlite::Result<BumpMarker> {
    Ok(BumpMarker {
        id: row.get(0)?,
        marker_type: decode_enum(row, 1, MarkerType::parse)?,
        source: row.get(2)?,
        target: row.get(3)?,
        operation: row.get(4)?,
        payload: decode_json::<JsonObject>(row, 5)?,
        status: decode_enum(row, 6, MarkerStatus::parse)?,
        caller_id: row.get(7)?,
        idempotency_key: row.get(8)?,
        resolution: decode_optional_json::<JsonObject>(row, 9)?,
        created_at: decode_timestamp(row, 10)?,
        acknowledged_at: decode_optional_timestamp(row, 11)?,
        resolved_at: decode_optional_timestamp(row, 12)?,
    })
}

fn grant_from_row(row: &Row<'_>) -> rusqlite::Result<AwiGrant> {
    Ok(AwiGrant {
        id: row.get(0)?,
        subject: row.get(1)?,
        level: decode_enum(row, 2, AuthorizationLevel::parse)?,
        intent: row.get(3)?,
        constraints: decode_json::<Vec<GrantConstraint>>(row, 4)?,
        issued_by: row.get(5)?,
        issued_at: decode_timestamp(row, 6)?,
        expires_at: decode_optional_timestamp(row, 7)?,
        revoked: row.get(8)?,
        revoked_at: decode_optional_timestamp(row, 9)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<AtomSession> {
    Ok(AtomSession {
        id: row.get(0)?,
        name: row.get(1)?,
        molecule: row.get(2)?,
        status: decode_enum(row, 3, AtomStatus::parse)?,
        verification: decode_optional_json::<Value>(row, 4)?,
        failure_reason: row.get(5)?,
        caller_id: row.get(6)?,
        created_at: decode_timestamp(row, 7)?,
        updated_at: decode_timestamp(row, 8)?,
    })
}

fn context_from_row(row: &Row<'_>) -> rusqlite::Result<ContextEntry> {
    let content_bytes: i64 = row.get(5)?;
    Ok(ContextEntry {
        id: row.get(0)?,
        domain: row.get(1)?,
        metadata: decode_json::<JsonObject>(row, 2)?,
        content_ref: row.get(3)?,
        content_sha256: row.get(4)?,
        content_bytes: u64::try_from(content_bytes)
            .map_err(|_| corrupt_column(5, "negative content length"))?,
        signals: decode_json::<Vec<String>>(row, 6)?,
        caller_id: row.get(7)?,
        created_at: decode_timestamp(row, 8)?,
        updated_at: decode_timestamp(row, 9)?,
        content: None,
    })
}

fn millis_opt(at: Option<OffsetDateTime>) -> Option<i64> {
    at.map(to_unix_millis)
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// SQLite-backed relational store. One connection guarded by a mutex; every
/// call runs on the blocking pool under the configured operation timeout.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    operation_timeout: Duration,
}

impl SqliteStore {
    pub fn open(path: &Path, operation_timeout: Duration) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| {
                StorageError::unavailable(
                    StoreBackend::Relational,
                    format!("failed to create '{}': {err}", parent.display()),
                )
            })?;
        }
        let conn = Connection::open(path).map_err(db_error)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_error)?;
        Self::initialize(conn, operation_timeout)
    }

    pub fn open_in_memory(operation_timeout: Duration) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::initialize(conn, operation_timeout)
    }

    fn initialize(conn: Connection, operation_timeout: Duration) -> Result<Self, StorageError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_error)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(db_error)?;
        conn.execute_batch(SCHEMA).map_err(db_error)?;
        tracing::debug!(target: "storage", backend = "relational", "sqlite_schema_ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            operation_timeout,
        })
    }

    async fn call<T, F>(&self, operation: &'static str, work: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| {
                StorageError::unavailable(StoreBackend::Relational, "sqlite connection poisoned")
            })?;
            work(&guard)
        });

        bounded(StoreBackend::Relational, operation, self.operation_timeout, async {
            task.await.map_err(|err| {
                StorageError::unavailable(
                    StoreBackend::Relational,
                    format!("{operation} worker failed: {err}"),
                )
            })?
        })
        .await
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.call("insert_api_key", move |conn| {
            conn.execute(
                "INSERT INTO api_keys (id, fingerprint, owner, tier, created_at, revoked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.fingerprint,
                    record.owner,
                    record.tier,
                    to_unix_millis(record.created_at),
                    record.revoked,
                ],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKeyRecord>, StorageError> {
        let id = id.to_string();
        self.call("get_api_key", move |conn| {
            conn.query_row(
                &format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = ?1"),
                params![id],
                api_key_from_row,
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }

    async fn find_api_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ApiKeyRecord>, StorageError> {
        let fingerprint = fingerprint.to_string();
        self.call("find_api_key_by_fingerprint", move |conn| {
            conn.query_row(
                &format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE fingerprint = ?1"),
                params![fingerprint],
                api_key_from_row,
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }

    async fn revoke_api_key(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.call("revoke_api_key", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE api_keys SET revoked = 1 WHERE id = ?1 AND revoked = 0",
                    params![id],
                )
                .map_err(db_error)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, StorageError> {
        self.call("list_api_keys", move |conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {API_KEY_COLUMNS} FROM api_keys ORDER BY created_at, id"
                ))
                .map_err(db_error)?;
            let rows = statement
                .query_map([], api_key_from_row)
                .map_err(db_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
        })
        .await
    }

    async fn insert_wave_analysis(&self, analysis: &WaveAnalysis) -> Result<(), StorageError> {
        let analysis = analysis.clone();
        self.call("insert_wave_analysis", move |conn| {
            conn.execute(
                &format!("INSERT INTO wave_analyses ({WAVE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    analysis.id,
                    analysis.caller_id,
                    analysis.content_fingerprint,
                    analysis.curl,
                    analysis.divergence,
                    analysis.potential,
                    analysis.coherence_score,
                    to_unix_millis(analysis.created_at),
                ],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn list_wave_analyses(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<WaveAnalysis>, StorageError> {
        let caller_id = caller_id.to_string();
        self.call("list_wave_analyses", move |conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {WAVE_COLUMNS} FROM wave_analyses WHERE caller_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ))
                .map_err(db_error)?;
            let rows = statement
                .query_map(params![caller_id, clamp_limit(limit)], wave_from_row)
                .map_err(db_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
        })
        .await
    }

    async fn insert_marker(&self, marker: &BumpMarker) -> Result<MarkerInsert, StorageError> {
        let marker = marker.clone();
        let payload = encode_json(&marker.payload)?;
        let resolution = marker.resolution.as_ref().map(encode_json).transpose()?;
        self.call("insert_marker", move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT INTO bump_markers ({MARKER_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    marker.id,
                    marker.marker_type.as_str(),
                    marker.source,
                    marker.target,
                    marker.operation,
                    payload,
                    marker.status.as_str(),
                    marker.caller_id,
                    marker.idempotency_key,
                    resolution,
                    to_unix_millis(marker.created_at),
                    millis_opt(marker.acknowledged_at),
                    millis_opt(marker.resolved_at),
                ],
            );

            match inserted {
                Ok(_) => Ok(MarkerInsert::Inserted),
                Err(err) => {
                    let err = db_error(err);
                    let Some(key) = marker.idempotency_key.as_deref() else {
                        return Err(err);
                    };
                    if err.kind != crate::storage::StorageErrorKind::Conflict {
                        return Err(err);
                    }
                    let existing = conn
                        .query_row(
                            &format!(
                                "SELECT {MARKER_COLUMNS} FROM bump_markers
                                 WHERE caller_id = ?1 AND idempotency_key = ?2"
                            ),
                            params![marker.caller_id, key],
                            marker_from_row,
                        )
                        .optional()
                        .map_err(db_error)?;
                    existing.map(MarkerInsert::Duplicate).ok_or(err)
                }
            }
        })
        .await
    }

    async fn get_marker(&self, id: &str) -> Result<Option<BumpMarker>, StorageError> {
        let id = id.to_string();
        self.call("get_marker", move |conn| {
            conn.query_row(
                &format!("SELECT {MARKER_COLUMNS} FROM bump_markers WHERE id = ?1"),
                params![id],
                marker_from_row,
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }

    async fn update_marker(
        &self,
        marker: &BumpMarker,
        expected: MarkerStatus,
    ) -> Result<bool, StorageError> {
        let marker = marker.clone();
        let resolution = marker.resolution.as_ref().map(encode_json).transpose()?;
        self.call("update_marker", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE bump_markers
                     SET status = ?1, resolution = ?2, acknowledged_at = ?3, resolved_at = ?4
                     WHERE id = ?5 AND status = ?6",
                    params![
                        marker.status.as_str(),
                        resolution,
                        millis_opt(marker.acknowledged_at),
                        millis_opt(marker.resolved_at),
                        marker.id,
                        expected.as_str(),
                    ],
                )
                .map_err(db_error)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_pending_markers(
        &self,
        target: &str,
        limit: usize,
    ) -> Result<Vec<BumpMarker>, StorageError> {
        let target = target.to_string();
        self.call("list_pending_markers", move |conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {MARKER_COLUMNS} FROM bump_markers
                     WHERE target = ?1 AND status != 'resolved'
                     ORDER BY id LIMIT ?2"
                ))
                .map_err(db_error)?;
            let rows = statement
                .query_map(params![target, clamp_limit(limit)], marker_from_row)
                .map_err(db_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
        })
        .await
    }

    async fn insert_grant(&self, grant: &AwiGrant) -> Result<(), StorageError> {
        let grant = grant.clone();
        let constraints = encode_json(&grant.constraints)?;
        self.call("insert_grant", move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO awi_grants ({GRANT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    grant.id,
                    grant.subject,
                    grant.level.as_str(),
                    grant.intent,
                    constraints,
                    grant.issued_by,
                    to_unix_millis(grant.issued_at),
                    millis_opt(grant.expires_at),
                    grant.revoked,
                    millis_opt(grant.revoked_at),
                ],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn get_grant(&self, id: &str) -> Result<Option<AwiGrant>, StorageError> {
        let id = id.to_string();
        self.call("get_grant", move |conn| {
            conn.query_row(
                &format!("SELECT {GRANT_COLUMNS} FROM awi_grants WHERE id = ?1"),
                params![id],
                grant_from_row,
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }

    async fn list_grants_for_subject(&self, subject: &str) -> Result<Vec<AwiGrant>, StorageError> {
        let subject = subject.to_string();
        self.call("list_grants_for_subject", move |conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {GRANT_COLUMNS} FROM awi_grants WHERE subject = ?1 ORDER BY id"
                ))
                .map_err(db_error)?;
            let rows = statement
                .query_map(params![subject], grant_from_row)
                .map_err(db_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
        })
        .await
    }

    async fn revoke_grant(
        &self,
        id: &str,
        revoked_at: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.call("revoke_grant", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE awi_grants SET revoked = 1, revoked_at = ?1
                     WHERE id = ?2 AND revoked = 0",
                    params![to_unix_millis(revoked_at), id],
                )
                .map_err(db_error)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn insert_task(&self, task: &AtomSession) -> Result<(), StorageError> {
        let task = task.clone();
        let verification = task.verification.as_ref().map(encode_json).transpose()?;
        self.call("insert_task", move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO atom_sessions ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    task.id,
                    task.name,
                    task.molecule,
                    task.status.as_str(),
                    verification,
                    task.failure_reason,
                    task.caller_id,
                    to_unix_millis(task.created_at),
                    to_unix_millis(task.updated_at),
                ],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, id: &str) -> Result<Option<AtomSession>, StorageError> {
        let id = id.to_string();
        self.call("get_task", move |conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM atom_sessions WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }

    async fn update_task(
        &self,
        task: &AtomSession,
        expected: AtomStatus,
    ) -> Result<bool, StorageError> {
        let task = task.clone();
        let verification = task.verification.as_ref().map(encode_json).transpose()?;
        self.call("update_task", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE atom_sessions
                     SET status = ?1, verification = ?2, failure_reason = ?3, updated_at = ?4
                     WHERE id = ?5 AND status = ?6",
                    params![
                        task.status.as_str(),
                        verification,
                        task.failure_reason,
                        to_unix_millis(task.updated_at),
                        task.id,
                        expected.as_str(),
                    ],
                )
                .map_err(db_error)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_tasks_in_molecule(
        &self,
        molecule: &str,
    ) -> Result<Vec<AtomSession>, StorageError> {
        let molecule = molecule.to_string();
        self.call("list_tasks_in_molecule", move |conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM atom_sessions WHERE molecule = ?1 ORDER BY id"
                ))
                .map_err(db_error)?;
            let rows = statement
                .query_map(params![molecule], task_from_row)
                .map_err(db_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
        })
        .await
    }

    async fn insert_context_entry(&self, entry: &ContextEntry) -> Result<(), StorageError> {
        let entry = entry.clone();
        let metadata = encode_json(&entry.metadata)?;
        let signals = encode_json(&entry.signals)?;
        let content_bytes = i64::try_from(entry.content_bytes).map_err(|_| {
            StorageError::conflict(StoreBackend::Relational, "content length overflows")
        })?;
        self.call("insert_context_entry", move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO context_entries ({CONTEXT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    entry.id,
                    entry.domain,
                    metadata,
                    entry.content_ref,
                    entry.content_sha256,
                    content_bytes,
                    signals,
                    entry.caller_id,
                    to_unix_millis(entry.created_at),
                    to_unix_millis(entry.updated_at),
                ],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn get_context_entry(&self, id: &str) -> Result<Option<ContextEntry>, StorageError> {
        let id = id.to_string();
        self.call("get_context_entry", move |conn| {
            conn.query_row(
                &format!("SELECT {CONTEXT_COLUMNS} FROM context_entries WHERE id = ?1"),
                params![id],
                context_from_row,
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }

    async fn update_context_metadata(
        &self,
        id: &str,
        metadata: &JsonObject,
        updated_at: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        let id = id.to_string();
        let metadata = encode_json(metadata)?;
        self.call("update_context_metadata", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE context_entries SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                    params![metadata, to_unix_millis(updated_at), id],
                )
                .map_err(db_error)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn page_context_entries(
        &self,
        request: ContextPageRequest<'_>,
    ) -> Result<Vec<ContextEntry>, StorageError> {
        let domain = request.domain.to_string();
        let signal = request.signal.map(str::to_string);
        let after = request.after.unwrap_or("").to_string();
        let limit = clamp_limit(request.limit);
        self.call("page_context_entries", move |conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {CONTEXT_COLUMNS} FROM context_entries
                     WHERE domain = ?1 AND id > ?2
                       AND (?3 IS NULL OR EXISTS (
                           SELECT 1 FROM json_each(context_entries.signals) WHERE value = ?3))
                     ORDER BY id LIMIT ?4"
                ))
                .map_err(db_error)?;
            let rows = statement
                .query_map(params![domain, after, signal, limit], context_from_row)
                .map_err(db_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
        })
        .await
    }

    async fn referenced_blob_keys(&self) -> Result<Vec<String>, StorageError> {
        self.call("referenced_blob_keys", move |conn| {
            let mut statement = conn
                .prepare("SELECT content_ref FROM context_entries")
                .map_err(db_error)?;
            let rows = statement
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.call("ping", move |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(db_error)?;
            Ok(())
        })
        .await
    }
}
