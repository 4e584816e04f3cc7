mod locks;
mod unit_of_work;

pub use locks::{AdvisoryGuard, AdvisoryLocks};
pub use unit_of_work::{TxMode, UnitOfWork};

use chrono::{DateTime, SecondsFormat, Utc};
use riskbatch_core::{
    ActorRole, AssessmentId, AssessmentStatus, BatchId, BatchStatus, ContractError, EmployeeId,
    ReportId, ReportStatus, SecurityContext, TenantId,
};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const LEDGER_SCHEMA_VERSION: i64 = 2;

/// Per-connection objects. The context row lives only for one transaction and
/// the scoped views read it to decide which tenant rows are visible.
const SESSION_SCHEMA: &str = "
CREATE TEMP TABLE IF NOT EXISTS session_context (
    singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
    actor_cpf TEXT NOT NULL,
    actor_role TEXT NOT NULL,
    tenant_id INTEGER,
    elevated_label TEXT
);

CREATE TEMP VIEW IF NOT EXISTS scoped_batches AS
SELECT b.* FROM main.batches b
WHERE EXISTS (
    SELECT 1 FROM temp.session_context c
    WHERE c.actor_role IN ('admin', 'system') OR c.tenant_id = b.tenant_id
);

CREATE TEMP VIEW IF NOT EXISTS scoped_assessments AS
SELECT a.* FROM main.assessments a
WHERE a.batch_id IN (SELECT id FROM scoped_batches);

CREATE TEMP VIEW IF NOT EXISTS scoped_reports AS
SELECT r.* FROM main.reports r
WHERE r.batch_id IN (SELECT id FROM scoped_batches);

CREATE TEMP VIEW IF NOT EXISTS scoped_employees AS
SELECT e.* FROM main.employees e
WHERE EXISTS (
    SELECT 1 FROM temp.session_context c
    WHERE c.actor_role IN ('admin', 'system') OR c.tenant_id = e.tenant_id
);
";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("immutability violation: {0}")]
    Immutability(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("database busy: {0}")]
    Busy(String),
    #[error("advisory lock {key} not acquired after {waited_ms} ms")]
    LockTimeout { key: i64, waited_ms: u64 },
    #[error("advisory lock registry poisoned")]
    LockPoisoned,
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("cannot resolve security context for {actor_cpf}: {reason}")]
    ContextUnresolved { actor_cpf: String, reason: String },
    #[error("{entity} {id} is not visible in the current security context")]
    NotVisible { entity: &'static str, id: i64 },
    #[error("role {role} may not {operation}")]
    Forbidden {
        operation: &'static str,
        role: ActorRole,
    },
    #[error("{entity} {id} rejected: {reason}")]
    InvalidState {
        entity: &'static str,
        id: i64,
        reason: String,
    },
}

impl StorageError {
    /// Contention failures that a fresh attempt of the same unit of work can
    /// get past.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Busy(_)
                | StorageError::LockTimeout { .. }
                | StorageError::UniqueViolation(_)
        )
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err {
            let message = message.clone().unwrap_or_else(|| err.to_string());
            match failure.code {
                ErrorCode::ConstraintViolation if message.contains("immutable_") => {
                    return StorageError::Immutability(message);
                }
                ErrorCode::ConstraintViolation
                    if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    return StorageError::UniqueViolation(message);
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    return StorageError::Busy(message);
                }
                _ => {}
            }
        }
        StorageError::Sqlite(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub busy_timeout: Duration,
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRow {
    pub id: TenantId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmployeeRow {
    pub id: EmployeeId,
    pub tenant_id: TenantId,
    pub cpf: String,
    pub name: String,
    pub last_batch_id: Option<BatchId>,
    pub last_batch_index: Option<i64>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    pub id: BatchId,
    pub tenant_id: TenantId,
    pub title: String,
    pub batch_index: Option<i64>,
    pub status: BatchStatus,
    pub released_by_cpf: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBatch {
    pub tenant_id: TenantId,
    pub title: String,
    pub batch_index: Option<i64>,
    pub released_by_cpf: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssessmentRow {
    pub id: AssessmentId,
    pub batch_id: BatchId,
    pub employee_id: EmployeeId,
    pub status: AssessmentStatus,
    pub released_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRow {
    pub assessment_id: AssessmentId,
    pub group: u32,
    pub score: f64,
    pub answered_items: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub id: ReportId,
    pub batch_id: BatchId,
    pub status: ReportStatus,
    pub content_hash: String,
    pub document_location: String,
    pub metadata_location: String,
    pub issued_by: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReport {
    pub batch_id: BatchId,
    pub content_hash: String,
    pub document_location: String,
    pub metadata_location: String,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRow {
    pub id: i64,
    pub batch_id: BatchId,
    pub recipient_cpf: String,
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub batch_id: BatchId,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed ledger of batches, assessments, reports and the emission
/// queue. Cloning is cheap and clones share one advisory lock registry.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
    config: StoreConfig,
    locks: Arc<AdvisoryLocks>,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config(
        path: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<Self, StorageError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            config,
            locks: Arc::new(AdvisoryLocks::new()),
        };
        let conn = store.connect()?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(event = "ledger_opened", path = %store.path.display(), journal_mode = %mode);
        store.migrate(&conn)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> StoreConfig {
        self.config
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.connect()?;
        read_schema_version(&conn)
    }

    fn migrate(&self, conn: &Connection) -> Result<(), StorageError> {
        let mut current = read_schema_version(conn)?;
        if current > LEDGER_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: LEDGER_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_ledger_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute_batch("PRAGMA user_version = 1")?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_emission_queue.sql");
            conn.execute_batch(sql)?;
            conn.execute_batch("PRAGMA user_version = 2")?;
        }

        Ok(())
    }

    /// Opens a write unit of work carrying `ctx`. Nothing tenant-scoped is
    /// reachable through the returned unit before the context is installed.
    ///
    /// The database write lock is taken up front. Units that only read, or
    /// that need advisory locks first, start with [`LedgerStore::begin_read`].
    pub fn begin(&self, ctx: &SecurityContext) -> Result<UnitOfWork, StorageError> {
        self.open_unit(ctx, TxMode::Write)
    }

    /// Opens a deferred unit of work. It takes no database lock until it
    /// reads, and never blocks other writers. Call
    /// [`UnitOfWork::into_write`] once the advisory locks are held.
    pub fn begin_read(&self, ctx: &SecurityContext) -> Result<UnitOfWork, StorageError> {
        self.open_unit(ctx, TxMode::Read)
    }

    fn open_unit(&self, ctx: &SecurityContext, mode: TxMode) -> Result<UnitOfWork, StorageError> {
        if ctx.role() == ActorRole::System && !ctx.is_elevated() {
            return Err(StorageError::ContextUnresolved {
                actor_cpf: ctx.actor_cpf().to_string(),
                reason: "the system role is only available through an elevated context"
                    .to_string(),
            });
        }
        let conn = self.connect()?;
        conn.execute_batch(SESSION_SCHEMA)?;
        UnitOfWork::start(
            conn,
            ctx.clone(),
            Arc::clone(&self.locks),
            self.config.lock_timeout,
            mode,
        )
    }

    /// Builds the full context for an acting user once, at the start of a
    /// use case. An explicit tenant wins, then the actor record, then the
    /// manager relation (or the employee record for employees).
    pub fn resolve_context(
        &self,
        actor_cpf: &str,
        role: ActorRole,
        tenant: Option<TenantId>,
    ) -> Result<SecurityContext, StorageError> {
        let unresolved = |reason: &str| StorageError::ContextUnresolved {
            actor_cpf: actor_cpf.to_string(),
            reason: reason.to_string(),
        };

        if role == ActorRole::System {
            return Err(unresolved(
                "system contexts are elevated and must be built explicitly",
            ));
        }
        if !role.is_tenant_scoped() {
            return Ok(SecurityContext::new(actor_cpf, role, tenant));
        }
        if let Some(tenant) = tenant {
            return Ok(SecurityContext::new(actor_cpf, role, Some(tenant)));
        }

        let conn = self.connect()?;
        let mut source = "actor";
        let mut resolved: Option<i64> = conn
            .query_row(
                "SELECT tenant_id FROM actors WHERE cpf = ?1",
                [actor_cpf],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();

        if resolved.is_none() && matches!(role, ActorRole::Manager | ActorRole::Clinic) {
            source = "tenant_managers";
            resolved = conn
                .query_row(
                    "
                    SELECT tenant_id
                    FROM tenant_managers
                    WHERE cpf = ?1
                    ORDER BY tenant_id ASC
                    LIMIT 1
                    ",
                    [actor_cpf],
                    |row| row.get(0),
                )
                .optional()?;
        }

        if resolved.is_none() && role == ActorRole::Employee {
            source = "employees";
            resolved = conn
                .query_row(
                    "SELECT tenant_id FROM employees WHERE cpf = ?1",
                    [actor_cpf],
                    |row| row.get(0),
                )
                .optional()?;
        }

        match resolved {
            Some(tenant_id) => {
                debug!(
                    event = "context_resolved",
                    actor = actor_cpf,
                    role = %role,
                    tenant_id,
                    source
                );
                Ok(SecurityContext::new(
                    actor_cpf,
                    role,
                    Some(TenantId(tenant_id)),
                ))
            }
            None => Err(unresolved("no tenant linked to this actor")),
        }
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let conn = self.connect()?;
        let exists = conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.config.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
        Ok(conn)
    }
}

fn read_schema_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{value}: {err}")))
}

fn conversion_failure<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(row.get::<_, String>(idx)?).map_err(|err| conversion_failure(idx, err))
}

pub(crate) fn optional_timestamp_at(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(parse_timestamp)
        .transpose()
        .map_err(|err| conversion_failure(idx, err))
}

pub(crate) fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ContractError>,
{
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|err| conversion_failure(idx, err))
}

pub(crate) fn count_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(idx)?;
    u32::try_from(value).map_err(|err| conversion_failure(idx, err))
}

pub(crate) const BATCH_COLUMNS: &str =
    "id, tenant_id, title, batch_index, status, released_by_cpf, created_at, updated_at, completed_at";

impl BatchRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: BatchId(row.get(0)?),
            tenant_id: TenantId(row.get(1)?),
            title: row.get(2)?,
            batch_index: row.get(3)?,
            status: parsed_at(row, 4)?,
            released_by_cpf: row.get(5)?,
            created_at: timestamp_at(row, 6)?,
            updated_at: timestamp_at(row, 7)?,
            completed_at: optional_timestamp_at(row, 8)?,
        })
    }
}

pub(crate) const ASSESSMENT_COLUMNS: &str =
    "id, batch_id, employee_id, status, released_at, completed_at, deactivated_at";

impl AssessmentRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: AssessmentId(row.get(0)?),
            batch_id: BatchId(row.get(1)?),
            employee_id: EmployeeId(row.get(2)?),
            status: parsed_at(row, 3)?,
            released_at: optional_timestamp_at(row, 4)?,
            completed_at: optional_timestamp_at(row, 5)?,
            deactivated_at: optional_timestamp_at(row, 6)?,
        })
    }

    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }
}

pub(crate) const REPORT_COLUMNS: &str = "id, batch_id, status, content_hash, document_location, \
     metadata_location, issued_by, issued_at, delivered_at, created_at";

impl ReportRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: ReportId(row.get(0)?),
            batch_id: BatchId(row.get(1)?),
            status: parsed_at(row, 2)?,
            content_hash: row.get(3)?,
            document_location: row.get(4)?,
            metadata_location: row.get(5)?,
            issued_by: row.get(6)?,
            issued_at: optional_timestamp_at(row, 7)?,
            delivered_at: optional_timestamp_at(row, 8)?,
            created_at: timestamp_at(row, 9)?,
        })
    }
}

pub(crate) const EMPLOYEE_COLUMNS: &str =
    "id, tenant_id, cpf, name, last_batch_id, last_batch_index, last_completed_at";

impl EmployeeRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: EmployeeId(row.get(0)?),
            tenant_id: TenantId(row.get(1)?),
            cpf: row.get(2)?,
            name: row.get(3)?,
            last_batch_id: row.get::<_, Option<i64>>(4)?.map(BatchId),
            last_batch_index: row.get(5)?,
            last_completed_at: optional_timestamp_at(row, 6)?,
        })
    }
}

pub(crate) const QUEUE_COLUMNS: &str =
    "batch_id, attempt_count, last_error, next_eligible_at, created_at, updated_at";

impl QueueItem {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            batch_id: BatchId(row.get(0)?),
            attempt_count: count_at(row, 1)?,
            last_error: row.get(2)?,
            next_eligible_at: timestamp_at(row, 3)?,
            created_at: timestamp_at(row, 4)?,
            updated_at: timestamp_at(row, 5)?,
        })
    }
}
