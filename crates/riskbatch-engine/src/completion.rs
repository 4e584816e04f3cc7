use crate::{BatchEngine, EmissionTrigger, EngineError, ReconcileOutcome};
use chrono::{DateTime, Utc};
use riskbatch_core::scoring::compute_group_scores;
use riskbatch_core::{
    best_effort, AssessmentId, AssessmentStatus, BatchId, EmployeeId, SecurityContext,
};
use riskbatch_storage::UnitOfWork;
use serde::Serialize;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// Not enough distinct answers yet. Nothing was written.
    Incomplete { answered: u32, required: u32 },
    AlreadyCompleted { batch_id: BatchId },
    CannotComplete { status: AssessmentStatus },
    Concluded {
        batch_id: BatchId,
        scores_persisted: bool,
        reconcile: ReconcileOutcome,
        emission: Option<EmissionTrigger>,
    },
}

impl BatchEngine {
    /// Concludes the assessment once it has enough distinct answers.
    ///
    /// Safe to call after every answer submission. The completion commits on
    /// its own before the batch is reconciled, so a reconciliation error is
    /// returned to the caller while the assessment stays completed.
    pub fn conclude_assessment_if_complete(
        &self,
        ctx: &SecurityContext,
        assessment_id: AssessmentId,
        employee_id: EmployeeId,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome, EngineError> {
        let uow = self.store.begin_read(ctx)?;

        let answered = uow.distinct_answer_count(assessment_id)?;
        let required = self.config.required_answers;
        if answered < required {
            debug!(
                event = "assessment_incomplete",
                assessment_id = %assessment_id,
                answered,
                required
            );
            return Ok(CompletionOutcome::Incomplete { answered, required });
        }

        let assessment = uow.assessment(assessment_id)?.ok_or(EngineError::NotFound {
            entity: "assessment",
            id: assessment_id.get(),
        })?;
        if assessment.employee_id != employee_id {
            return Err(EngineError::EmployeeMismatch {
                assessment_id,
                employee_id,
            });
        }

        match assessment.status {
            AssessmentStatus::Completed => {
                debug!(event = "assessment_already_completed", assessment_id = %assessment_id);
                return Ok(CompletionOutcome::AlreadyCompleted {
                    batch_id: assessment.batch_id,
                });
            }
            AssessmentStatus::Deactivated => {
                debug!(event = "assessment_cannot_complete", assessment_id = %assessment_id, status = %assessment.status);
                return Ok(CompletionOutcome::CannotComplete {
                    status: assessment.status,
                });
            }
            AssessmentStatus::Started | AssessmentStatus::InProgress => {}
        }

        // A concurrent conclusion can land between the read and the upgrade;
        // the conditional update below reports it.
        let mut uow = uow.into_write()?;
        let batch = uow.batch(assessment.batch_id)?.ok_or(EngineError::NotFound {
            entity: "batch",
            id: assessment.batch_id.get(),
        })?;

        let scores_persisted = best_effort("assessment_scores", || {
            uow.savepoint("assessment_scores", |inner| {
                persist_scores(inner, assessment_id, now)
            })
        })
        .is_done();

        if !uow.complete_assessment(assessment_id, now)? {
            return Ok(CompletionOutcome::AlreadyCompleted { batch_id: batch.id });
        }
        if !uow.record_employee_batch_marker(employee_id, &batch, now)? {
            debug!(event = "employee_marker_skipped", employee_id = %employee_id);
        }
        uow.commit()?;

        info!(
            event = "assessment_concluded",
            assessment_id = %assessment_id,
            batch_id = %batch.id,
            answered,
            scores_persisted
        );

        let reconcile = self
            .recalculate_batch_status(ctx, batch.id, now)
            .map_err(|err| {
                error!(
                    event = "batch_reconcile_failed",
                    batch_id = %batch.id,
                    assessment_id = %assessment_id,
                    error = %err
                );
                err
            })?;

        let emission = if reconcile.batch_finalized {
            Some(self.dispatch_emission(ctx, batch.id, now)?)
        } else {
            None
        };

        Ok(CompletionOutcome::Concluded {
            batch_id: batch.id,
            scores_persisted,
            reconcile,
            emission,
        })
    }
}

fn persist_scores(
    uow: &mut UnitOfWork,
    assessment_id: AssessmentId,
    now: DateTime<Utc>,
) -> Result<usize, EngineError> {
    let answers = uow.answers(assessment_id)?;
    let scores = compute_group_scores(&answers)?;
    for score in &scores {
        uow.upsert_score(assessment_id, score, now)?;
    }
    Ok(scores.len())
}
