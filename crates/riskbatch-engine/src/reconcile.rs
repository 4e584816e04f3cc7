use crate::{BatchEngine, EngineError};
use chrono::{DateTime, Utc};
use riskbatch_core::{
    best_effort, derive_batch_status, AssessmentId, AssessmentTally, BatchId, BatchStatus,
    SecurityContext,
};
use riskbatch_storage::{BatchRow, UnitOfWork};
use serde::Serialize;
use tracing::{debug, error, info};

pub const COMPLETION_NOTIFICATION_KIND: &str = "batch_completed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub batch_id: BatchId,
    pub previous_status: BatchStatus,
    pub new_status: BatchStatus,
    /// The batch is completed after this call, whether or not this call
    /// moved it there.
    pub batch_finalized: bool,
    pub transitioned: bool,
    pub tally: AssessmentTally,
}

impl BatchEngine {
    /// Re-derives the batch status from its assessments under the batch's
    /// advisory lock and persists it when it changed.
    ///
    /// The lock is taken in a read transaction, so reconciling one batch
    /// never waits on another. The write lock is only taken for a
    /// transition, and the status is derived again once it is held.
    pub fn recalculate_batch_status(
        &self,
        ctx: &SecurityContext,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, EngineError> {
        let mut uow = self.store.begin_read(ctx)?;
        uow.advisory_lock(batch_id.advisory_key())?;

        let observed = observe_batch(&uow, batch_id)?;
        if !observed.outcome.transitioned {
            uow.commit()?;
            return Ok(observed.unchanged());
        }

        let mut uow = uow.into_write()?;
        let observed = observe_batch(&uow, batch_id)?;
        if !observed.outcome.transitioned {
            uow.commit()?;
            return Ok(observed.unchanged());
        }
        let Observed {
            batch,
            derived,
            outcome,
        } = observed;
        let tally = outcome.tally;

        if let Err(err) = guard_sealed_batch(&uow, &batch, derived) {
            error!(
                event = "batch_transition_rejected",
                batch_id = %batch_id,
                from = %batch.status,
                to = %derived,
                error = %err
            );
            return Err(err);
        }

        if !uow.update_batch_status(batch_id, derived, now)? {
            return Err(EngineError::NotFound {
                entity: "batch",
                id: batch_id.get(),
            });
        }

        if derived == BatchStatus::Completed {
            notify_releasing_manager(&mut uow, &batch, now);
        }

        uow.commit()?;
        info!(
            event = "batch_status_transitioned",
            batch_id = %batch_id,
            from = %batch.status,
            to = %derived,
            released = tally.released,
            completed = tally.completed,
            deactivated = tally.deactivated
        );
        Ok(outcome)
    }

    /// Resolves the assessment's batch, then reconciles it.
    pub fn recalculate_batch_status_from_assessment(
        &self,
        ctx: &SecurityContext,
        assessment_id: AssessmentId,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, EngineError> {
        let batch_id = {
            let uow = self.store.begin_read(ctx)?;
            let assessment = uow.assessment(assessment_id)?.ok_or(EngineError::NotFound {
                entity: "assessment",
                id: assessment_id.get(),
            })?;
            uow.commit()?;
            assessment.batch_id
        };
        self.recalculate_batch_status(ctx, batch_id, now)
    }
}

struct Observed {
    batch: BatchRow,
    derived: BatchStatus,
    outcome: ReconcileOutcome,
}

impl Observed {
    fn unchanged(self) -> ReconcileOutcome {
        debug!(
            event = "batch_status_unchanged",
            batch_id = %self.batch.id,
            status = %self.derived,
            finalized = self.outcome.batch_finalized
        );
        self.outcome
    }
}

fn observe_batch(uow: &UnitOfWork, batch_id: BatchId) -> Result<Observed, EngineError> {
    let batch = uow.batch(batch_id)?.ok_or(EngineError::NotFound {
        entity: "batch",
        id: batch_id.get(),
    })?;
    let tally = uow.assessment_tally(batch_id)?;
    let derived = derive_batch_status(&tally);
    let outcome = ReconcileOutcome {
        batch_id,
        previous_status: batch.status,
        new_status: derived,
        batch_finalized: derived == BatchStatus::Completed,
        transitioned: derived != batch.status,
        tally,
    };
    Ok(Observed {
        batch,
        derived,
        outcome,
    })
}

/// A completed batch that owns an issued report keeps its status.
fn guard_sealed_batch(
    uow: &UnitOfWork,
    batch: &BatchRow,
    derived: BatchStatus,
) -> Result<(), EngineError> {
    if batch.status != BatchStatus::Completed || derived == BatchStatus::Completed {
        return Ok(());
    }
    match uow.active_report_for_batch(batch.id)? {
        Some(report) if report.status.is_sealed() => Err(EngineError::Immutable(format!(
            "batch {} owns {} report {} and cannot move from completed to {derived}",
            batch.id, report.status, report.id
        ))),
        _ => Ok(()),
    }
}

fn notify_releasing_manager(uow: &mut UnitOfWork, batch: &BatchRow, now: DateTime<Utc>) {
    let Some(recipient) = batch.released_by_cpf.as_deref() else {
        debug!(event = "batch_notification_skipped", batch_id = %batch.id, reason = "no releasing manager");
        return;
    };
    let message = format!(
        "All assessments of batch \"{}\" are concluded; the report is being issued.",
        batch.title
    );

    let outcome = best_effort("batch_completed_notification", || {
        uow.savepoint("batch_notification", |inner| {
            inner.insert_notification(
                batch.id,
                recipient,
                COMPLETION_NOTIFICATION_KIND,
                &message,
                now,
            )
        })
    });
    if let Some(notification_id) = outcome.ok() {
        debug!(event = "batch_notification_recorded", batch_id = %batch.id, notification_id);
    }
}
