use crate::locks::{AdvisoryGuard, AdvisoryLocks};
use crate::{
    count_at, format_timestamp, timestamp_at, AssessmentRow, BatchRow, EmployeeRow, NewBatch,
    NewReport, NotificationRow, QueueItem, ReportRow, ScoreRow, StorageError, TenantRow,
    ASSESSMENT_COLUMNS, BATCH_COLUMNS, EMPLOYEE_COLUMNS, QUEUE_COLUMNS, REPORT_COLUMNS,
};
use chrono::{DateTime, Utc};
use riskbatch_core::scoring::{AnswerRecord, GroupScore};
use riskbatch_core::{
    ActorRole, AssessmentId, AssessmentStatus, AssessmentTally, BatchId, BatchStatus, EmployeeId,
    ReportId, SecurityContext, TenantId,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Which transaction a unit of work currently has open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// `BEGIN DEFERRED`: a snapshot read that holds no write lock.
    Read,
    /// `BEGIN IMMEDIATE`: holds the database write lock until the unit ends.
    Write,
}

impl TxMode {
    fn begin_sql(self) -> &'static str {
        match self {
            TxMode::Read => "BEGIN DEFERRED",
            TxMode::Write => "BEGIN IMMEDIATE",
        }
    }
}

/// One transaction on its own connection, carrying a security context and
/// any advisory locks taken inside it.
///
/// Dropping a unit of work without calling [`UnitOfWork::commit`] rolls it
/// back. Either way every advisory lock it holds is released.
///
/// Advisory locks belong in read mode. A unit that already holds the write
/// lock and then waits on an advisory key can stall the holder of that key
/// until one side times out.
pub struct UnitOfWork {
    conn: Connection,
    ctx: SecurityContext,
    locks: Arc<AdvisoryLocks>,
    held: Vec<AdvisoryGuard>,
    lock_timeout: Duration,
    mode: TxMode,
    finished: bool,
}

impl UnitOfWork {
    pub(crate) fn start(
        conn: Connection,
        ctx: SecurityContext,
        locks: Arc<AdvisoryLocks>,
        lock_timeout: Duration,
        mode: TxMode,
    ) -> Result<Self, StorageError> {
        conn.execute_batch(mode.begin_sql())?;
        let uow = Self {
            conn,
            ctx,
            locks,
            held: Vec::new(),
            lock_timeout,
            mode,
            finished: false,
        };
        uow.install_context()?;
        Ok(uow)
    }

    /// Ends the read transaction and opens a write transaction on the same
    /// connection, keeping the context and every advisory lock.
    ///
    /// Anything read before the upgrade may be stale; re-read what the
    /// writes depend on.
    pub fn into_write(mut self) -> Result<Self, StorageError> {
        if self.mode == TxMode::Write {
            return Ok(self);
        }
        self.conn.execute("DELETE FROM temp.session_context", [])?;
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;

        self.conn.execute_batch(TxMode::Write.begin_sql())?;
        self.finished = false;
        self.mode = TxMode::Write;
        self.install_context()?;
        debug!(event = "unit_of_work_upgraded", locks = self.held.len());
        Ok(self)
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    fn install_context(&self) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO temp.session_context (singleton, actor_cpf, actor_role, tenant_id, elevated_label)
            VALUES (1, ?1, ?2, ?3, ?4)
            ",
            params![
                self.ctx.actor_cpf(),
                self.ctx.role().as_str(),
                self.ctx.tenant_id().map(TenantId::get),
                self.ctx.elevated_label(),
            ],
        )?;
        Ok(())
    }

    pub fn context(&self) -> &SecurityContext {
        &self.ctx
    }

    pub fn commit(mut self) -> Result<(), StorageError> {
        self.conn.execute("DELETE FROM temp.session_context", [])?;
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        self.release_locks();
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), StorageError> {
        self.finished = true;
        let outcome = self.conn.execute_batch("ROLLBACK");
        self.release_locks();
        Ok(outcome?)
    }

    /// Takes the exclusive lock for `key` until this unit of work ends.
    /// Re-acquiring a key this unit already holds is a no-op.
    pub fn advisory_lock(&mut self, key: i64) -> Result<(), StorageError> {
        if self.held.iter().any(|guard| guard.key() == key) {
            return Ok(());
        }
        let guard = self.locks.acquire(key, self.lock_timeout)?;
        debug!(event = "advisory_lock_acquired", key);
        self.held.push(guard);
        Ok(())
    }

    pub fn holds_lock(&self, key: i64) -> bool {
        self.held.iter().any(|guard| guard.key() == key)
    }

    /// Runs `op` inside a savepoint. A failing `op` undoes only its own
    /// writes and leaves the enclosing transaction usable.
    pub fn savepoint<T, E, F>(&mut self, name: &str, op: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StorageError::InvalidValue(format!("savepoint name {name:?}")).into());
        }
        self.conn
            .execute_batch(&format!("SAVEPOINT {name}"))
            .map_err(StorageError::from)?;

        match op(self) {
            Ok(value) => {
                self.conn
                    .execute_batch(&format!("RELEASE {name}"))
                    .map_err(StorageError::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    warn!(event = "savepoint_rollback_failed", savepoint = name, error = %rollback);
                }
                Err(err)
            }
        }
    }

    fn release_locks(&mut self) {
        if !self.held.is_empty() {
            debug!(event = "advisory_locks_released", count = self.held.len());
        }
        self.held.clear();
    }

    fn ensure_tenant_access(&self, tenant: TenantId) -> Result<(), StorageError> {
        if self.ctx.role().is_tenant_scoped() && self.ctx.tenant_id() != Some(tenant) {
            return Err(StorageError::NotVisible {
                entity: "tenant",
                id: tenant.get(),
            });
        }
        Ok(())
    }

    fn ensure_unscoped(&self, operation: &'static str) -> Result<(), StorageError> {
        if self.ctx.role().is_tenant_scoped() {
            return Err(StorageError::Forbidden {
                operation,
                role: self.ctx.role(),
            });
        }
        Ok(())
    }

    // tenants and batches

    pub fn tenant(&self, id: TenantId) -> Result<Option<TenantRow>, StorageError> {
        if self.ensure_tenant_access(id).is_err() {
            return Ok(None);
        }
        Ok(self
            .conn
            .query_row(
                "SELECT id, name FROM tenants WHERE id = ?1",
                [id.get()],
                |row| {
                    Ok(TenantRow {
                        id: TenantId(row.get(0)?),
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn batch(&self, id: BatchId) -> Result<Option<BatchRow>, StorageError> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM scoped_batches WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id.get()], BatchRow::from_row)
            .optional()?)
    }

    /// Counts the batch's assessments by state. Only released assessments
    /// contribute to `completed` and `in_flight`.
    pub fn assessment_tally(&self, batch_id: BatchId) -> Result<AssessmentTally, StorageError> {
        Ok(self.conn.query_row(
            "
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN released_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN released_at IS NOT NULL AND status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'deactivated' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN released_at IS NOT NULL AND status = 'deactivated' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN released_at IS NOT NULL AND status IN ('started', 'in_progress') THEN 1 ELSE 0 END), 0)
            FROM scoped_assessments
            WHERE batch_id = ?1
            ",
            [batch_id.get()],
            |row| {
                Ok(AssessmentTally {
                    total: count_at(row, 0)?,
                    released: count_at(row, 1)?,
                    completed: count_at(row, 2)?,
                    deactivated: count_at(row, 3)?,
                    released_deactivated: count_at(row, 4)?,
                    in_flight: count_at(row, 5)?,
                })
            },
        )?)
    }

    /// Returns `false` when the batch is not visible.
    pub fn update_batch_status(
        &self,
        id: BatchId,
        status: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "
            UPDATE batches
            SET status = ?2,
                updated_at = ?3,
                completed_at = CASE WHEN ?2 = 'completed' THEN ?3 ELSE NULL END
            WHERE id = ?1 AND id IN (SELECT id FROM scoped_batches)
            ",
            params![id.get(), status.as_str(), format_timestamp(now)],
        )?;
        Ok(changed == 1)
    }

    pub fn insert_notification(
        &self,
        batch_id: BatchId,
        recipient_cpf: &str,
        kind: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let inserted = self.conn.execute(
            "
            INSERT INTO notifications (batch_id, recipient_cpf, kind, message, created_at)
            SELECT ?1, ?2, ?3, ?4, ?5
            WHERE EXISTS (SELECT 1 FROM scoped_batches WHERE id = ?1)
            ",
            params![
                batch_id.get(),
                recipient_cpf,
                kind,
                message,
                format_timestamp(now)
            ],
        )?;
        if inserted == 0 {
            return Err(StorageError::NotVisible {
                entity: "batch",
                id: batch_id.get(),
            });
        }
        Ok(self.conn.last_insert_rowid())
    }

    pub fn notifications_for_batch(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<NotificationRow>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT n.id, n.batch_id, n.recipient_cpf, n.kind, n.message, n.created_at
            FROM notifications n
            WHERE n.batch_id IN (SELECT id FROM scoped_batches WHERE id = ?1)
            ORDER BY n.id ASC
            ",
        )?;
        let rows = statement.query_map([batch_id.get()], |row| {
            Ok(NotificationRow {
                id: row.get(0)?,
                batch_id: BatchId(row.get(1)?),
                recipient_cpf: row.get(2)?,
                kind: row.get(3)?,
                message: row.get(4)?,
                created_at: timestamp_at(row, 5)?,
            })
        })?;

        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    // assessments, answers and scores

    pub fn assessment(&self, id: AssessmentId) -> Result<Option<AssessmentRow>, StorageError> {
        let sql = format!("SELECT {ASSESSMENT_COLUMNS} FROM scoped_assessments WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id.get()], AssessmentRow::from_row)
            .optional()?)
    }

    pub fn assessments_for_batch(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<AssessmentRow>, StorageError> {
        let sql = format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM scoped_assessments WHERE batch_id = ?1 ORDER BY id ASC"
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([batch_id.get()], AssessmentRow::from_row)?;

        let mut assessments = Vec::new();
        for row in rows {
            assessments.push(row?);
        }
        Ok(assessments)
    }

    /// Distinct (group, item) pairs answered so far.
    pub fn distinct_answer_count(&self, assessment_id: AssessmentId) -> Result<u32, StorageError> {
        Ok(self.conn.query_row(
            "
            SELECT COUNT(*) FROM (
                SELECT DISTINCT group_no, item
                FROM answers
                WHERE assessment_id IN (SELECT id FROM scoped_assessments WHERE id = ?1)
            )
            ",
            [assessment_id.get()],
            |row| count_at(row, 0),
        )?)
    }

    /// Every stored answer in insertion order, superseded ones included.
    pub fn answers(&self, assessment_id: AssessmentId) -> Result<Vec<AnswerRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, group_no, item, value
            FROM answers
            WHERE assessment_id IN (SELECT id FROM scoped_assessments WHERE id = ?1)
            ORDER BY id ASC
            ",
        )?;
        let rows = statement.query_map([assessment_id.get()], |row| {
            Ok(AnswerRecord {
                seq: row.get(0)?,
                group: count_at(row, 1)?,
                item: row.get(2)?,
                value: row.get(3)?,
            })
        })?;

        let mut answers = Vec::new();
        for row in rows {
            answers.push(row?);
        }
        Ok(answers)
    }

    pub fn upsert_score(
        &self,
        assessment_id: AssessmentId,
        score: &GroupScore,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let written = self.conn.execute(
            "
            INSERT INTO assessment_scores (assessment_id, group_no, score, answered_items, computed_at)
            SELECT ?1, ?2, ?3, ?4, ?5
            WHERE EXISTS (SELECT 1 FROM scoped_assessments WHERE id = ?1)
            ON CONFLICT(assessment_id, group_no) DO UPDATE SET
                score = excluded.score,
                answered_items = excluded.answered_items,
                computed_at = excluded.computed_at
            ",
            params![
                assessment_id.get(),
                score.group,
                score.score,
                score.answered_items,
                format_timestamp(now)
            ],
        )?;
        if written == 0 {
            return Err(StorageError::NotVisible {
                entity: "assessment",
                id: assessment_id.get(),
            });
        }
        Ok(())
    }

    pub fn scores_for_assessment(
        &self,
        assessment_id: AssessmentId,
    ) -> Result<Vec<ScoreRow>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT s.assessment_id, s.group_no, s.score, s.answered_items
            FROM assessment_scores s
            JOIN scoped_assessments a ON a.id = s.assessment_id
            WHERE s.assessment_id = ?1
            ORDER BY s.group_no ASC
            ",
        )?;
        let rows = statement.query_map([assessment_id.get()], score_from_row)?;
        collect_scores(rows)
    }

    /// Scores of the batch's completed assessments, grouped by group number.
    pub fn completed_scores_for_batch(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<ScoreRow>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT s.assessment_id, s.group_no, s.score, s.answered_items
            FROM assessment_scores s
            JOIN scoped_assessments a ON a.id = s.assessment_id
            WHERE a.batch_id = ?1 AND a.status = 'completed'
            ORDER BY s.group_no ASC, s.assessment_id ASC
            ",
        )?;
        let rows = statement.query_map([batch_id.get()], score_from_row)?;
        collect_scores(rows)
    }

    /// Flips a started or in-progress assessment to completed. Returns
    /// `false` when it was not in flight (or not visible).
    pub fn complete_assessment(
        &self,
        id: AssessmentId,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "
            UPDATE assessments
            SET status = 'completed', completed_at = ?2, updated_at = ?2
            WHERE id = ?1
              AND status IN ('started', 'in_progress')
              AND id IN (SELECT id FROM scoped_assessments)
            ",
            params![id.get(), format_timestamp(now)],
        )?;
        Ok(changed == 1)
    }

    pub fn employee(&self, id: EmployeeId) -> Result<Option<EmployeeRow>, StorageError> {
        let sql = format!("SELECT {EMPLOYEE_COLUMNS} FROM scoped_employees WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id.get()], EmployeeRow::from_row)
            .optional()?)
    }

    pub fn record_employee_batch_marker(
        &self,
        employee_id: EmployeeId,
        batch: &BatchRow,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "
            UPDATE employees
            SET last_batch_id = ?2, last_batch_index = ?3, last_completed_at = ?4
            WHERE id = ?1 AND id IN (SELECT id FROM scoped_employees)
            ",
            params![
                employee_id.get(),
                batch.id.get(),
                batch.batch_index,
                format_timestamp(now)
            ],
        )?;
        Ok(changed == 1)
    }

    // reports

    pub fn report(&self, id: ReportId) -> Result<Option<ReportRow>, StorageError> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM scoped_reports WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id.get()], ReportRow::from_row)
            .optional()?)
    }

    /// The batch's non-superseded report, whatever its status.
    pub fn active_report_for_batch(
        &self,
        batch_id: BatchId,
    ) -> Result<Option<ReportRow>, StorageError> {
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM scoped_reports WHERE batch_id = ?1 AND superseded = 0"
        );
        Ok(self
            .conn
            .query_row(&sql, [batch_id.get()], ReportRow::from_row)
            .optional()?)
    }

    pub fn report_count_for_batch(&self, batch_id: BatchId) -> Result<u32, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM scoped_reports WHERE batch_id = ?1",
            [batch_id.get()],
            |row| count_at(row, 0),
        )?)
    }

    pub fn insert_issued_report(&self, report: &NewReport) -> Result<ReportId, StorageError> {
        let issued_at = format_timestamp(report.issued_at);
        let inserted = self.conn.execute(
            "
            INSERT INTO reports (
                batch_id, status, content_hash, document_location, metadata_location,
                issued_by, issued_at, created_at
            )
            SELECT ?1, 'issued', ?2, ?3, ?4, ?5, ?6, ?6
            WHERE EXISTS (SELECT 1 FROM scoped_batches WHERE id = ?1)
            ",
            params![
                report.batch_id.get(),
                report.content_hash,
                report.document_location,
                report.metadata_location,
                report.issued_by,
                issued_at
            ],
        )?;
        if inserted == 0 {
            return Err(StorageError::NotVisible {
                entity: "batch",
                id: report.batch_id.get(),
            });
        }
        Ok(ReportId(self.conn.last_insert_rowid()))
    }

    /// Inserts a live drafted report with empty content, the way an operator
    /// reserves a batch's report before it is issued.
    pub fn insert_drafted_report(
        &self,
        batch_id: BatchId,
        drafted_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ReportId, StorageError> {
        let inserted = self.conn.execute(
            "
            INSERT INTO reports (
                batch_id, status, content_hash, document_location, metadata_location,
                issued_by, created_at
            )
            SELECT ?1, 'drafted', '', '', '', ?2, ?3
            WHERE EXISTS (SELECT 1 FROM scoped_batches WHERE id = ?1)
            ",
            params![batch_id.get(), drafted_by, format_timestamp(now)],
        )?;
        if inserted == 0 {
            return Err(StorageError::NotVisible {
                entity: "batch",
                id: batch_id.get(),
            });
        }
        Ok(ReportId(self.conn.last_insert_rowid()))
    }

    /// Fills a drafted report with its content and issues it. Returns
    /// `false` when the report is no longer a draft.
    pub fn issue_drafted_report(
        &self,
        id: ReportId,
        report: &NewReport,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "
            UPDATE reports
            SET status = 'issued',
                content_hash = ?3,
                document_location = ?4,
                metadata_location = ?5,
                issued_by = ?6,
                issued_at = ?7
            WHERE id = ?1
              AND batch_id = ?2
              AND status = 'drafted'
              AND id IN (SELECT id FROM scoped_reports)
            ",
            params![
                id.get(),
                report.batch_id.get(),
                report.content_hash,
                report.document_location,
                report.metadata_location,
                report.issued_by,
                format_timestamp(report.issued_at)
            ],
        )?;
        Ok(changed == 1)
    }

    /// Moves an issued report to delivered. Returns `false` when the report
    /// is not issued (or not visible).
    pub fn mark_report_delivered(
        &self,
        id: ReportId,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "
            UPDATE reports
            SET status = 'delivered', delivered_at = ?2
            WHERE id = ?1 AND status = 'issued' AND id IN (SELECT id FROM scoped_reports)
            ",
            params![id.get(), format_timestamp(now)],
        )?;
        Ok(changed == 1)
    }

    // emission queue

    pub fn queue_item(&self, batch_id: BatchId) -> Result<Option<QueueItem>, StorageError> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM emission_queue WHERE batch_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [batch_id.get()], QueueItem::from_row)
            .optional()?)
    }

    pub fn insert_queue_item(
        &self,
        batch_id: BatchId,
        error: &str,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let now = format_timestamp(now);
        self.conn.execute(
            "
            INSERT INTO emission_queue (batch_id, attempt_count, last_error, next_eligible_at, created_at, updated_at)
            VALUES (?1, 1, ?2, ?3, ?4, ?4)
            ",
            params![batch_id.get(), error, format_timestamp(next_eligible_at), now],
        )?;
        Ok(())
    }

    pub fn bump_queue_item(
        &self,
        batch_id: BatchId,
        attempt_count: u32,
        error: &str,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "
            UPDATE emission_queue
            SET attempt_count = ?2, last_error = ?3, next_eligible_at = ?4, updated_at = ?5
            WHERE batch_id = ?1
            ",
            params![
                batch_id.get(),
                attempt_count,
                error,
                format_timestamp(next_eligible_at),
                format_timestamp(now)
            ],
        )?;
        Ok(changed == 1)
    }

    /// Items whose next eligible time has passed, oldest due first.
    pub fn due_queue_items(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<QueueItem>, StorageError> {
        let sql = format!(
            "
            SELECT {QUEUE_COLUMNS}
            FROM emission_queue
            WHERE next_eligible_at <= ?1
            ORDER BY next_eligible_at ASC, batch_id ASC
            LIMIT ?2
            "
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(
            params![format_timestamp(now), i64::from(limit)],
            QueueItem::from_row,
        )?;
        collect_queue(rows)
    }

    pub fn queue_items(&self) -> Result<Vec<QueueItem>, StorageError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM emission_queue ORDER BY next_eligible_at ASC, batch_id ASC"
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([], QueueItem::from_row)?;
        collect_queue(rows)
    }

    pub fn delete_queue_item(&self, batch_id: BatchId) -> Result<bool, StorageError> {
        let deleted = self.conn.execute(
            "DELETE FROM emission_queue WHERE batch_id = ?1",
            [batch_id.get()],
        )?;
        Ok(deleted == 1)
    }

    // administrative writes

    pub fn insert_tenant(&self, name: &str, now: DateTime<Utc>) -> Result<TenantId, StorageError> {
        self.ensure_unscoped("create tenants")?;
        self.conn.execute(
            "INSERT INTO tenants (name, created_at) VALUES (?1, ?2)",
            params![name, format_timestamp(now)],
        )?;
        Ok(TenantId(self.conn.last_insert_rowid()))
    }

    pub fn insert_actor(
        &self,
        cpf: &str,
        role: ActorRole,
        tenant: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.ensure_unscoped("create actors")?;
        self.conn.execute(
            "INSERT INTO actors (cpf, role, tenant_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                cpf,
                role.as_str(),
                tenant.map(TenantId::get),
                format_timestamp(now)
            ],
        )?;
        Ok(())
    }

    pub fn link_tenant_manager(&self, cpf: &str, tenant: TenantId) -> Result<(), StorageError> {
        self.ensure_unscoped("link managers")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO tenant_managers (cpf, tenant_id) VALUES (?1, ?2)",
            params![cpf, tenant.get()],
        )?;
        Ok(())
    }

    pub fn insert_employee(
        &self,
        tenant: TenantId,
        cpf: &str,
        name: &str,
    ) -> Result<EmployeeId, StorageError> {
        self.ensure_tenant_access(tenant)?;
        self.conn.execute(
            "INSERT INTO employees (tenant_id, cpf, name) VALUES (?1, ?2, ?3)",
            params![tenant.get(), cpf, name],
        )?;
        Ok(EmployeeId(self.conn.last_insert_rowid()))
    }

    pub fn insert_batch(
        &self,
        batch: &NewBatch,
        now: DateTime<Utc>,
    ) -> Result<BatchId, StorageError> {
        self.ensure_tenant_access(batch.tenant_id)?;
        let now = format_timestamp(now);
        self.conn.execute(
            "
            INSERT INTO batches (tenant_id, title, batch_index, status, released_by_cpf, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)
            ",
            params![
                batch.tenant_id.get(),
                batch.title,
                batch.batch_index,
                batch.released_by_cpf,
                now
            ],
        )?;
        Ok(BatchId(self.conn.last_insert_rowid()))
    }

    /// Adds an assessment to a visible batch, either released or as a draft.
    pub fn insert_assessment(
        &self,
        batch_id: BatchId,
        employee_id: EmployeeId,
        released: bool,
        now: DateTime<Utc>,
    ) -> Result<AssessmentId, StorageError> {
        let now = format_timestamp(now);
        let released_at = released.then(|| now.clone());
        let inserted = self.conn.execute(
            "
            INSERT INTO assessments (batch_id, employee_id, status, released_at, created_at, updated_at)
            SELECT ?1, ?2, 'started', ?3, ?4, ?4
            WHERE EXISTS (SELECT 1 FROM scoped_batches WHERE id = ?1)
              AND EXISTS (SELECT 1 FROM scoped_employees WHERE id = ?2)
            ",
            params![batch_id.get(), employee_id.get(), released_at, now],
        )?;
        if inserted == 0 {
            return Err(StorageError::NotVisible {
                entity: "batch",
                id: batch_id.get(),
            });
        }
        Ok(AssessmentId(self.conn.last_insert_rowid()))
    }

    pub fn release_assessment(
        &self,
        id: AssessmentId,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "
            UPDATE assessments
            SET released_at = ?2, updated_at = ?2
            WHERE id = ?1 AND released_at IS NULL AND id IN (SELECT id FROM scoped_assessments)
            ",
            params![id.get(), format_timestamp(now)],
        )?;
        Ok(changed == 1)
    }

    /// Appends an answer and moves a started assessment to in progress.
    pub fn record_answer(
        &self,
        assessment_id: AssessmentId,
        group: u32,
        item: &str,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let assessment = self
            .assessment(assessment_id)?
            .ok_or(StorageError::NotVisible {
                entity: "assessment",
                id: assessment_id.get(),
            })?;
        if !assessment.is_released() {
            return Err(StorageError::InvalidState {
                entity: "assessment",
                id: assessment_id.get(),
                reason: "draft assessments do not accept answers".to_string(),
            });
        }
        if assessment.status == AssessmentStatus::Deactivated {
            return Err(StorageError::InvalidState {
                entity: "assessment",
                id: assessment_id.get(),
                reason: "deactivated assessments do not accept answers".to_string(),
            });
        }

        let now = format_timestamp(now);
        self.conn.execute(
            "
            INSERT INTO answers (assessment_id, group_no, item, value, answered_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![assessment_id.get(), group, item, value, now],
        )?;
        let answer_id = self.conn.last_insert_rowid();
        self.conn.execute(
            "
            UPDATE assessments
            SET status = 'in_progress', updated_at = ?2
            WHERE id = ?1 AND status = 'started'
            ",
            params![assessment_id.get(), now],
        )?;
        Ok(answer_id)
    }

    /// Deactivates an assessment that has not completed yet.
    pub fn deactivate_assessment(
        &self,
        id: AssessmentId,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "
            UPDATE assessments
            SET status = 'deactivated', deactivated_at = ?2, updated_at = ?2
            WHERE id = ?1
              AND status IN ('started', 'in_progress')
              AND id IN (SELECT id FROM scoped_assessments)
            ",
            params![id.get(), format_timestamp(now)],
        )?;
        Ok(changed == 1)
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                debug!(event = "unit_of_work_rollback_failed", error = %err);
            }
        }
        self.release_locks();
    }
}

fn score_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoreRow> {
    Ok(ScoreRow {
        assessment_id: AssessmentId(row.get(0)?),
        group: count_at(row, 1)?,
        score: row.get(2)?,
        answered_items: count_at(row, 3)?,
    })
}

fn collect_scores<I>(rows: I) -> Result<Vec<ScoreRow>, StorageError>
where
    I: Iterator<Item = rusqlite::Result<ScoreRow>>,
{
    let mut scores = Vec::new();
    for row in rows {
        scores.push(row?);
    }
    Ok(scores)
}

fn collect_queue<I>(rows: I) -> Result<Vec<QueueItem>, StorageError>
where
    I: Iterator<Item = rusqlite::Result<QueueItem>>,
{
    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LedgerStore;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use riskbatch_core::ReportStatus;
    use tempfile::TempDir;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp")
            + ChronoDuration::seconds(offset_secs)
    }

    struct Fixture {
        _dir: TempDir,
        store: LedgerStore,
        tenant: TenantId,
        other_tenant: TenantId,
        batch: BatchId,
        assessment: AssessmentId,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let store = LedgerStore::open(dir.path().join("ledger.db")).expect("open");
        let uow = store
            .begin(&SecurityContext::system("fixtures"))
            .expect("begin");
        let tenant = uow.insert_tenant("North", ts(0)).expect("tenant");
        let other_tenant = uow.insert_tenant("South", ts(0)).expect("tenant");
        let employee = uow
            .insert_employee(tenant, "52998224725", "Ana")
            .expect("employee");
        let batch = uow
            .insert_batch(
                &NewBatch {
                    tenant_id: tenant,
                    title: "Q1 survey".to_string(),
                    batch_index: Some(1),
                    released_by_cpf: Some("11144477735".to_string()),
                },
                ts(0),
            )
            .expect("batch");
        let assessment = uow
            .insert_assessment(batch, employee, true, ts(1))
            .expect("assessment");
        uow.commit().expect("commit");

        Fixture {
            _dir: dir,
            store,
            tenant,
            other_tenant,
            batch,
            assessment,
        }
    }

    fn system(store: &LedgerStore) -> UnitOfWork {
        store
            .begin(&SecurityContext::system("test"))
            .expect("begin")
    }

    fn issue_report(uow: &UnitOfWork, batch: BatchId) -> ReportId {
        uow.insert_issued_report(&NewReport {
            batch_id: batch,
            content_hash: "a".repeat(64),
            document_location: "doc.txt".to_string(),
            metadata_location: "doc.json".to_string(),
            issued_by: "system:test".to_string(),
            issued_at: ts(100),
        })
        .expect("issue report")
    }

    #[test]
    fn tenant_scoped_context_sees_only_its_tenant() {
        let fx = fixture();

        let own = fx
            .store
            .begin(&SecurityContext::new(
                "11144477735",
                ActorRole::Manager,
                Some(fx.tenant),
            ))
            .expect("begin");
        assert!(own.batch(fx.batch).expect("read").is_some());
        assert!(own.assessment(fx.assessment).expect("read").is_some());
        drop(own);

        let foreign = fx
            .store
            .begin(&SecurityContext::new(
                "99999999999",
                ActorRole::Manager,
                Some(fx.other_tenant),
            ))
            .expect("begin");
        assert!(foreign.batch(fx.batch).expect("read").is_none());
        assert!(foreign.assessment(fx.assessment).expect("read").is_none());
        assert!(!foreign
            .update_batch_status(fx.batch, BatchStatus::Cancelled, ts(5))
            .expect("update"));
        let err = foreign
            .insert_batch(
                &NewBatch {
                    tenant_id: fx.tenant,
                    title: "intrusion".to_string(),
                    batch_index: None,
                    released_by_cpf: None,
                },
                ts(5),
            )
            .expect_err("foreign tenant");
        assert!(matches!(err, StorageError::NotVisible { .. }));
        assert!(matches!(
            foreign.insert_tenant("Rogue", ts(5)),
            Err(StorageError::Forbidden { .. })
        ));
    }

    #[test]
    fn nothing_is_visible_without_a_context_row() {
        let fx = fixture();
        let uow = system(&fx.store);
        uow.conn
            .execute("DELETE FROM temp.session_context", [])
            .expect("clear context");
        assert!(uow.batch(fx.batch).expect("read").is_none());
        assert_eq!(
            uow.assessment_tally(fx.batch).expect("tally"),
            AssessmentTally::default()
        );
    }

    #[test]
    fn context_row_is_installed_at_begin() {
        let fx = fixture();
        let uow = system(&fx.store);
        let rows: i64 = uow
            .conn
            .query_row("SELECT COUNT(*) FROM temp.session_context", [], |row| {
                row.get(0)
            })
            .expect("count");
        assert_eq!(rows, 1);
        uow.commit().expect("commit");
    }

    #[test]
    fn dropped_unit_of_work_rolls_back() {
        let fx = fixture();
        {
            let uow = system(&fx.store);
            assert!(uow
                .update_batch_status(fx.batch, BatchStatus::Cancelled, ts(5))
                .expect("update"));
        }
        let uow = system(&fx.store);
        let batch = uow.batch(fx.batch).expect("read").expect("batch");
        assert_eq!(batch.status, BatchStatus::Active);
    }

    #[test]
    fn advisory_locks_are_released_at_commit() {
        let fx = fixture();
        let mut uow = system(&fx.store);
        uow.advisory_lock(fx.batch.advisory_key()).expect("lock");
        uow.advisory_lock(fx.batch.advisory_key())
            .expect("re-entrant lock");
        assert!(uow.holds_lock(fx.batch.advisory_key()));
        assert!(fx.store.locks.is_held(fx.batch.advisory_key()));
        uow.commit().expect("commit");
        assert!(!fx.store.locks.is_held(fx.batch.advisory_key()));

        let mut dropped = system(&fx.store);
        dropped.advisory_lock(42).expect("lock");
        drop(dropped);
        assert!(!fx.store.locks.is_held(42));
    }

    #[test]
    fn read_unit_holding_a_lock_does_not_block_writers() {
        let fx = fixture();
        let key = fx.batch.advisory_key();
        let mut reader = fx
            .store
            .begin_read(&SecurityContext::system("reader"))
            .expect("begin read");
        assert_eq!(reader.mode(), TxMode::Read);
        reader.advisory_lock(key).expect("lock");
        let before = reader.batch(fx.batch).expect("read").expect("batch");
        assert_eq!(before.status, BatchStatus::Active);

        let writer = system(&fx.store);
        assert!(writer
            .update_batch_status(fx.batch, BatchStatus::Cancelled, ts(5))
            .expect("update"));
        writer.commit().expect("writer commits while the reader is open");

        let upgraded = reader.into_write().expect("upgrade");
        assert_eq!(upgraded.mode(), TxMode::Write);
        assert!(upgraded.holds_lock(key));
        let after = upgraded.batch(fx.batch).expect("read").expect("batch");
        assert_eq!(after.status, BatchStatus::Cancelled);
        assert!(upgraded
            .update_batch_status(fx.batch, BatchStatus::Active, ts(6))
            .expect("update after upgrade"));
        upgraded.commit().expect("commit");
        assert!(!fx.store.locks.is_held(key));

        let uow = system(&fx.store);
        let batch = uow.batch(fx.batch).expect("read").expect("batch");
        assert_eq!(batch.status, BatchStatus::Active);
    }

    #[test]
    fn tally_separates_released_and_draft_assessments() {
        let fx = fixture();
        let uow = system(&fx.store);
        let second = uow
            .insert_employee(fx.tenant, "39053344705", "Bruno")
            .expect("employee");
        let third = uow
            .insert_employee(fx.tenant, "15350946056", "Carla")
            .expect("employee");
        let draft = uow
            .insert_assessment(fx.batch, second, false, ts(2))
            .expect("draft");
        let released = uow
            .insert_assessment(fx.batch, third, true, ts(2))
            .expect("released");
        uow.deactivate_assessment(draft, ts(3)).expect("deactivate");
        uow.record_answer(released, 1, "Q1", 50.0, ts(3))
            .expect("answer");
        uow.complete_assessment(fx.assessment, ts(4))
            .expect("complete");

        let tally = uow.assessment_tally(fx.batch).expect("tally");
        assert_eq!(
            tally,
            AssessmentTally {
                total: 3,
                released: 2,
                completed: 1,
                deactivated: 1,
                released_deactivated: 0,
                in_flight: 1,
            }
        );
        let in_progress = uow.assessment(released).expect("read").expect("row");
        assert_eq!(in_progress.status, AssessmentStatus::InProgress);
    }

    #[test]
    fn drafts_do_not_accept_answers() {
        let fx = fixture();
        let uow = system(&fx.store);
        let employee = uow
            .insert_employee(fx.tenant, "39053344705", "Bruno")
            .expect("employee");
        let draft = uow
            .insert_assessment(fx.batch, employee, false, ts(2))
            .expect("draft");
        let err = uow
            .record_answer(draft, 1, "Q1", 10.0, ts(3))
            .expect_err("draft");
        assert!(matches!(err, StorageError::InvalidState { .. }));
        assert!(uow.release_assessment(draft, ts(4)).expect("release"));
        uow.record_answer(draft, 1, "Q1", 10.0, ts(5))
            .expect("released now");
    }

    #[test]
    fn answers_of_completed_assessment_are_sealed() {
        let fx = fixture();
        let uow = system(&fx.store);
        uow.record_answer(fx.assessment, 1, "Q1", 10.0, ts(2))
            .expect("answer");
        assert!(uow
            .complete_assessment(fx.assessment, ts(3))
            .expect("complete"));
        assert!(!uow
            .complete_assessment(fx.assessment, ts(4))
            .expect("already complete"));

        let err = uow
            .conn
            .execute(
                "INSERT INTO answers (assessment_id, group_no, item, value, answered_at) VALUES (?1, 1, 'Q2', 5.0, 'x')",
                [fx.assessment.get()],
            )
            .map_err(StorageError::from)
            .expect_err("sealed");
        assert!(matches!(err, StorageError::Immutability(ref message) if message.contains("immutable_answers")));

        let err = uow
            .conn
            .execute("UPDATE answers SET value = 99.0", [])
            .map_err(StorageError::from)
            .expect_err("sealed");
        assert!(matches!(err, StorageError::Immutability(_)));
    }

    #[test]
    fn second_live_report_for_batch_is_a_unique_violation() {
        let fx = fixture();
        let uow = system(&fx.store);
        issue_report(&uow, fx.batch);
        let err = uow
            .insert_issued_report(&NewReport {
                batch_id: fx.batch,
                content_hash: "b".repeat(64),
                document_location: "other.txt".to_string(),
                metadata_location: "other.json".to_string(),
                issued_by: "system:test".to_string(),
                issued_at: ts(101),
            })
            .expect_err("duplicate");
        assert!(matches!(err, StorageError::UniqueViolation(_)));
        assert!(err.is_transient());
        assert_eq!(uow.report_count_for_batch(fx.batch).expect("count"), 1);
    }

    #[test]
    fn issued_report_content_is_sealed_by_trigger() {
        let fx = fixture();
        let uow = system(&fx.store);
        let report = issue_report(&uow, fx.batch);

        for sql in [
            "UPDATE reports SET content_hash = 'tampered' WHERE id = ?1",
            "UPDATE reports SET batch_id = batch_id WHERE id = ?1",
            "UPDATE reports SET status = 'drafted' WHERE id = ?1",
            "DELETE FROM reports WHERE id = ?1",
        ] {
            let err = uow
                .conn
                .execute(sql, [report.get()])
                .map_err(StorageError::from)
                .expect_err(sql);
            assert!(
                matches!(err, StorageError::Immutability(ref message) if message.contains("immutable_report")),
                "{sql}: {err}"
            );
        }

        assert!(uow.mark_report_delivered(report, ts(200)).expect("deliver"));
        assert!(!uow
            .mark_report_delivered(report, ts(201))
            .expect("already delivered"));
        let row = uow.report(report).expect("read").expect("report");
        assert_eq!(row.status, ReportStatus::Delivered);
        assert_eq!(row.content_hash, "a".repeat(64));
        assert_eq!(row.delivered_at, Some(ts(200)));
    }

    #[test]
    fn drafted_report_is_issued_in_place_once() {
        let fx = fixture();
        let uow = system(&fx.store);
        let draft = uow
            .insert_drafted_report(fx.batch, "11144477735", ts(10))
            .expect("draft");
        let row = uow.report(draft).expect("read").expect("report");
        assert_eq!(row.status, ReportStatus::Drafted);
        assert_eq!(row.issued_at, None);

        let content = NewReport {
            batch_id: fx.batch,
            content_hash: "b".repeat(64),
            document_location: "batch/report.txt".to_string(),
            metadata_location: "batch/report.json".to_string(),
            issued_by: "system:test".to_string(),
            issued_at: ts(20),
        };
        assert!(uow.issue_drafted_report(draft, &content).expect("issue"));
        assert!(!uow
            .issue_drafted_report(draft, &content)
            .expect("already issued"));

        let row = uow.report(draft).expect("read").expect("report");
        assert_eq!(row.status, ReportStatus::Issued);
        assert_eq!(row.content_hash, "b".repeat(64));
        assert_eq!(row.issued_at, Some(ts(20)));
        assert_eq!(uow.report_count_for_batch(fx.batch).expect("count"), 1);
    }

    #[test]
    fn batch_with_issued_report_cannot_leave_completed() {
        let fx = fixture();
        let uow = system(&fx.store);
        assert!(uow
            .update_batch_status(fx.batch, BatchStatus::Completed, ts(10))
            .expect("complete"));
        issue_report(&uow, fx.batch);

        let err = uow
            .update_batch_status(fx.batch, BatchStatus::Active, ts(11))
            .expect_err("sealed batch");
        assert!(matches!(err, StorageError::Immutability(ref message) if message.contains("immutable_batch")));
        let batch = uow.batch(fx.batch).expect("read").expect("batch");
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.completed_at, Some(ts(10)));
    }

    #[test]
    fn savepoint_rolls_back_only_its_own_writes() {
        let fx = fixture();
        let mut uow = system(&fx.store);
        let score = GroupScore {
            group: 1,
            score: 40.0,
            answered_items: 2,
        };

        let outcome: Result<(), StorageError> = uow.savepoint("scores", |inner| {
            inner.upsert_score(fx.assessment, &score, ts(2))?;
            Err(StorageError::InvalidValue("boom".to_string()))
        });
        assert!(outcome.is_err());
        assert!(uow
            .scores_for_assessment(fx.assessment)
            .expect("scores")
            .is_empty());

        uow.savepoint("scores", |inner| {
            inner.upsert_score(fx.assessment, &score, ts(3))
        })
        .expect("savepoint");
        uow.complete_assessment(fx.assessment, ts(4))
            .expect("complete");
        uow.commit().expect("commit");

        let mut uow = system(&fx.store);
        let scores = uow.scores_for_assessment(fx.assessment).expect("scores");
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].score, 40.0);
        assert!(uow.savepoint("bad name", |_| Ok::<_, StorageError>(())).is_err());
    }

    #[test]
    fn upsert_score_replaces_existing_group_row() {
        let fx = fixture();
        let uow = system(&fx.store);
        for value in [10.0, 30.0] {
            uow.upsert_score(
                fx.assessment,
                &GroupScore {
                    group: 2,
                    score: value,
                    answered_items: 1,
                },
                ts(2),
            )
            .expect("upsert");
        }
        let scores = uow.scores_for_assessment(fx.assessment).expect("scores");
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].score, 30.0);
    }

    #[test]
    fn queue_items_come_back_oldest_due_first() {
        let fx = fixture();
        let uow = system(&fx.store);
        let later = uow
            .insert_batch(
                &NewBatch {
                    tenant_id: fx.tenant,
                    title: "Q2 survey".to_string(),
                    batch_index: Some(2),
                    released_by_cpf: None,
                },
                ts(0),
            )
            .expect("batch");

        uow.insert_queue_item(later, "render failed", ts(120), ts(60))
            .expect("enqueue");
        uow.insert_queue_item(fx.batch, "disk full", ts(90), ts(30))
            .expect("enqueue");

        let due = uow.due_queue_items(ts(100), 10).expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].batch_id, fx.batch);
        assert_eq!(due[0].attempt_count, 1);

        let due = uow.due_queue_items(ts(200), 10).expect("due");
        assert_eq!(
            due.iter().map(|item| item.batch_id).collect::<Vec<_>>(),
            vec![fx.batch, later]
        );
        assert_eq!(uow.due_queue_items(ts(200), 1).expect("due").len(), 1);

        assert!(uow
            .bump_queue_item(fx.batch, 2, "still full", ts(300), ts(150))
            .expect("bump"));
        let item = uow.queue_item(fx.batch).expect("read").expect("item");
        assert_eq!(item.attempt_count, 2);
        assert_eq!(item.last_error.as_deref(), Some("still full"));
        assert_eq!(item.next_eligible_at, ts(300));
        assert_eq!(item.created_at, ts(30));

        let err = uow
            .insert_queue_item(fx.batch, "again", ts(400), ts(160))
            .expect_err("one row per batch");
        assert!(matches!(err, StorageError::UniqueViolation(_)));

        assert!(uow.delete_queue_item(fx.batch).expect("delete"));
        assert!(!uow.delete_queue_item(fx.batch).expect("already gone"));
        assert_eq!(uow.queue_items().expect("all").len(), 1);
    }

    #[test]
    fn employee_marker_tracks_last_batch() {
        let fx = fixture();
        let uow = system(&fx.store);
        let assessment = uow.assessment(fx.assessment).expect("read").expect("row");
        let batch = uow.batch(fx.batch).expect("read").expect("batch");
        assert!(uow
            .record_employee_batch_marker(assessment.employee_id, &batch, ts(9))
            .expect("marker"));
        let employee = uow
            .employee(assessment.employee_id)
            .expect("read")
            .expect("employee");
        assert_eq!(employee.last_batch_index, Some(1));
        assert_eq!(employee.last_batch_id, Some(fx.batch));
        assert_eq!(employee.last_completed_at, Some(ts(9)));
    }
}
