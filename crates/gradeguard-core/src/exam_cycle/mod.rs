//! Exam cycle state machine.
//!
//! A cycle moves `planning → scheduled → in_progress → marking → moderation
//! → approved → locked → published`, with `unlock` stepping a locked cycle
//! back to `approved`. Each transition re-reads the cycle, checks its
//! precondition, and commits the new status together with its audit event.
//! Applying an operation whose target status is already current is a no-op.

pub mod aggregate;
pub mod transitions;

pub use aggregate::aggregate_moderation_status;
pub use transitions::{next_status, CycleOperation};

use std::collections::HashSet;

use chrono::NaiveDate;
use gradeguard_state::{
    AssessmentId, Attribution, ChangeSet, EntityKind, ExamCycle, ExamCycleId, ExamCycleStatus,
    ExamType, GradeModeration, GradebookStore, ModerationStatus, Mutation,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::audit::AuditSink;
use crate::domain::{Actor, GradeGuardError, Result};
use crate::service::{cycle_ref, Committed, GradeGuardService, Versioned};

/// Input for [`GradeGuardService::create_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleDraft {
    pub academic_year: String,
    pub term: String,
    pub name: String,
    #[serde(default)]
    pub exam_type: ExamType,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    /// Falls back to the configured default when unset.
    #[serde(default)]
    pub moderation_required: Option<bool>,
}

fn blocked(cycle: &ExamCycle, requested: &str, reason: impl Into<String>) -> GradeGuardError {
    GradeGuardError::InvalidTransition {
        entity: EntityKind::ExamCycle,
        id: cycle.id.to_string(),
        current: cycle.status.to_string(),
        requested: requested.to_string(),
        reason: reason.into(),
    }
}

fn check_window(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if start > end {
        return Err(GradeGuardError::InvalidInput(format!(
            "exam window starts ({start}) after it ends ({end})"
        )));
    }
    Ok(())
}

impl<S, A> GradeGuardService<S, A>
where
    S: GradebookStore,
    A: AuditSink,
{
    #[instrument(skip_all, fields(actor = %actor, name = %draft.name))]
    pub async fn create_cycle(
        &self,
        actor: &Actor,
        draft: CycleDraft,
    ) -> Result<Committed<ExamCycle>> {
        if draft.name.trim().is_empty() {
            return Err(GradeGuardError::InvalidInput(
                "exam cycle name is empty".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (draft.start_date, draft.end_date) {
            check_window(start, end)?;
        }

        let now = self.now();
        let cycle = ExamCycle {
            id: ExamCycleId::new(),
            tenant_id: actor.tenant.clone(),
            academic_year: draft.academic_year,
            term: draft.term,
            name: draft.name.trim().to_string(),
            exam_type: draft.exam_type,
            status: ExamCycleStatus::Planning,
            start_date: draft.start_date,
            end_date: draft.end_date,
            assessment_ids: Vec::new(),
            moderation_required: draft
                .moderation_required
                .unwrap_or(self.config.moderation_required_default),
            moderation_status: ModerationStatus::Pending,
            moderated: None,
            locked: None,
            published: None,
            archived: None,
            created_by: actor.id.clone(),
            created_at: now,
            updated_at: now,
            version: 0,
        };

        let operation = "exam_cycle.create";
        let entity = cycle_ref(&cycle);
        let event = self.event(actor, entity.clone(), operation, None, Some("planning"), None);
        let changes = ChangeSet::new()
            .put(Mutation::Cycle(cycle.clone()))
            .record(event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(cycle.stored(), &receipt))
    }

    pub async fn schedule(&self, actor: &Actor, id: &ExamCycleId) -> Result<Committed<ExamCycle>> {
        self.transition(actor, id, CycleOperation::Schedule).await
    }

    pub async fn begin(&self, actor: &Actor, id: &ExamCycleId) -> Result<Committed<ExamCycle>> {
        self.transition(actor, id, CycleOperation::Begin).await
    }

    pub async fn end_exams(
        &self,
        actor: &Actor,
        id: &ExamCycleId,
    ) -> Result<Committed<ExamCycle>> {
        self.transition(actor, id, CycleOperation::EndExams).await
    }

    pub async fn submit_for_moderation(
        &self,
        actor: &Actor,
        id: &ExamCycleId,
    ) -> Result<Committed<ExamCycle>> {
        self.transition(actor, id, CycleOperation::SubmitForModeration)
            .await
    }

    pub async fn approve_moderation(
        &self,
        actor: &Actor,
        id: &ExamCycleId,
    ) -> Result<Committed<ExamCycle>> {
        self.transition(actor, id, CycleOperation::ApproveModeration)
            .await
    }

    pub async fn lock(&self, actor: &Actor, id: &ExamCycleId) -> Result<Committed<ExamCycle>> {
        self.transition(actor, id, CycleOperation::Lock).await
    }

    pub async fn publish(&self, actor: &Actor, id: &ExamCycleId) -> Result<Committed<ExamCycle>> {
        self.transition(actor, id, CycleOperation::Publish).await
    }

    /// Administrative unlock: back to `approved`, lock attribution cleared.
    pub async fn unlock(&self, actor: &Actor, id: &ExamCycleId) -> Result<Committed<ExamCycle>> {
        self.transition(actor, id, CycleOperation::Unlock).await
    }

    /// Apply one row of the transition table.
    #[instrument(skip_all, fields(actor = %actor, cycle_id = %id, op = %op))]
    pub async fn transition(
        &self,
        actor: &Actor,
        id: &ExamCycleId,
        op: CycleOperation,
    ) -> Result<Committed<ExamCycle>> {
        let cycle = self.load_cycle(actor, id).await?;
        let target = op.target();
        let operation = format!("exam_cycle.{op}");
        let entity = cycle_ref(&cycle);

        if cycle.is_archived() {
            return Err(blocked(&cycle, target.as_str(), "exam cycle is archived"));
        }
        if cycle.status == target {
            return Ok(self.no_op(&operation, &entity, cycle));
        }
        if next_status(cycle.status, op).is_none() {
            return Err(blocked(
                &cycle,
                target.as_str(),
                format!("{op} is only allowed from {}", op.source()),
            ));
        }

        let mut updated = cycle.clone();
        self.check_precondition(&mut updated, op).await?;

        let now = self.now();
        let stamp = Attribution::new(actor.id.clone(), now);
        match op {
            CycleOperation::ApproveModeration => updated.moderated = Some(stamp),
            CycleOperation::Lock => updated.locked = Some(stamp),
            CycleOperation::Publish => updated.published = Some(stamp),
            CycleOperation::Unlock => updated.locked = None,
            _ => {}
        }
        updated.status = target;
        updated.updated_at = now;

        let event = self.event(
            actor,
            entity.clone(),
            &operation,
            Some(cycle.status.as_str()),
            Some(target.as_str()),
            None,
        );
        let changes = ChangeSet::new()
            .put(Mutation::Cycle(updated.clone()))
            .record(event);
        let receipt = self.commit(&operation, &entity, changes).await?;
        Ok(Committed::new(updated.stored(), &receipt))
    }

    /// Check `op`'s precondition against `cycle`, refreshing its stored
    /// moderation aggregate where the check depends on it.
    async fn check_precondition(&self, cycle: &mut ExamCycle, op: CycleOperation) -> Result<()> {
        let requested = op.target().as_str();
        match op {
            CycleOperation::Schedule => match (cycle.start_date, cycle.end_date) {
                (Some(start), Some(end)) if start <= end => Ok(()),
                (Some(_), Some(_)) => Err(blocked(cycle, requested, "exam window is inverted")),
                _ => Err(blocked(cycle, requested, "exam window is not set")),
            },
            CycleOperation::Begin => {
                let today = self.clock.today();
                match (cycle.start_date, cycle.end_date) {
                    (Some(start), Some(end)) if start <= today && today <= end => Ok(()),
                    _ => Err(blocked(
                        cycle,
                        requested,
                        format!("{today} is outside the exam window"),
                    )),
                }
            }
            CycleOperation::SubmitForModeration => {
                self.ensure_fully_graded(cycle).await?;
                cycle.moderation_status = self.moderation_status(cycle, None).await?;
                Ok(())
            }
            CycleOperation::ApproveModeration | CycleOperation::Lock => {
                let status = self.moderation_status(cycle, None).await?;
                cycle.moderation_status = status;
                if cycle.moderation_required && status != ModerationStatus::Approved {
                    return Err(blocked(
                        cycle,
                        requested,
                        format!("moderation status is {status}"),
                    ));
                }
                Ok(())
            }
            CycleOperation::EndExams | CycleOperation::Publish | CycleOperation::Unlock => Ok(()),
        }
    }

    /// Every rostered student of every attached assessment has a grade.
    async fn ensure_fully_graded(&self, cycle: &ExamCycle) -> Result<()> {
        let requested = CycleOperation::SubmitForModeration.target().as_str();
        if cycle.assessment_ids.is_empty() {
            return Err(blocked(cycle, requested, "no assessments attached"));
        }
        for assessment_id in &cycle.assessment_ids {
            let assessment = self
                .store
                .get_assessment(assessment_id)
                .await?
                .ok_or_else(|| GradeGuardError::not_found(EntityKind::Assessment, assessment_id))?;
            let graded: HashSet<_> = self
                .store
                .grades_for_assessment(assessment_id)
                .await?
                .into_iter()
                .map(|g| g.student_id)
                .collect();
            let missing = assessment
                .roster
                .iter()
                .filter(|s| !graded.contains(*s))
                .count();
            if missing > 0 {
                return Err(blocked(
                    cycle,
                    requested,
                    format!("{missing} student(s) ungraded in {}", assessment.name),
                ));
            }
        }
        Ok(())
    }

    /// Aggregate moderation status over the cycle's grades. `overlay` stands
    /// in for its grade's latest stored moderation (a record about to be
    /// committed).
    pub(crate) async fn moderation_status(
        &self,
        cycle: &ExamCycle,
        overlay: Option<&GradeModeration>,
    ) -> Result<ModerationStatus> {
        let mut latest = Vec::new();
        for assessment_id in &cycle.assessment_ids {
            for grade in self.store.grades_for_assessment(assessment_id).await? {
                let current = match overlay {
                    Some(m) if m.grade_id == grade.id => Some(m.clone()),
                    _ => self.store.moderations_for_grade(&grade.id).await?.pop(),
                };
                latest.push(current);
            }
        }
        Ok(aggregate_moderation_status(latest.iter().map(Option::as_ref)))
    }

    /// Recompute the aggregate of every covering cycle still collecting
    /// moderation outcomes, as if `overlay` were committed, and add the
    /// changed cycles to `changes`.
    pub(crate) async fn sync_cycle_moderation(
        &self,
        actor: &Actor,
        cycles: &[ExamCycle],
        overlay: &GradeModeration,
        mut changes: ChangeSet,
    ) -> Result<ChangeSet> {
        for cycle in cycles {
            let collecting = matches!(
                cycle.status,
                ExamCycleStatus::Marking | ExamCycleStatus::Moderation | ExamCycleStatus::Approved
            );
            if !collecting || cycle.is_archived() {
                continue;
            }
            let status = self.moderation_status(cycle, Some(overlay)).await?;
            if status == cycle.moderation_status {
                continue;
            }
            let mut updated = cycle.clone();
            updated.moderation_status = status;
            updated.updated_at = self.now();
            let event = self.event(
                actor,
                cycle_ref(cycle),
                "exam_cycle.moderation_status",
                Some(&cycle.moderation_status.to_string()),
                Some(&status.to_string()),
                None,
            );
            changes = changes.put(Mutation::Cycle(updated)).record(event);
        }
        Ok(changes)
    }

    /// Set or move the exam window while the cycle is still being planned.
    #[instrument(skip_all, fields(actor = %actor, cycle_id = %id))]
    pub async fn set_exam_window(
        &self,
        actor: &Actor,
        id: &ExamCycleId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Committed<ExamCycle>> {
        let cycle = self.load_cycle(actor, id).await?;
        let operation = "exam_cycle.set_exam_window";
        let entity = cycle_ref(&cycle);
        let editable = matches!(
            cycle.status,
            ExamCycleStatus::Planning | ExamCycleStatus::Scheduled
        );
        if cycle.is_archived() || !editable {
            return Err(blocked(
                &cycle,
                cycle.status.as_str(),
                "exam window can only change while planning or scheduled",
            ));
        }
        check_window(start, end)?;
        if cycle.start_date == Some(start) && cycle.end_date == Some(end) {
            return Ok(self.no_op(operation, &entity, cycle));
        }

        let mut updated = cycle.clone();
        updated.start_date = Some(start);
        updated.end_date = Some(end);
        updated.updated_at = self.now();

        let event = self.event(
            actor,
            entity.clone(),
            operation,
            Some(cycle.status.as_str()),
            Some(cycle.status.as_str()),
            None,
        );
        let changes = ChangeSet::new()
            .put(Mutation::Cycle(updated.clone()))
            .record(event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(updated.stored(), &receipt))
    }

    /// Bring an assessment's grades under this cycle's governance.
    #[instrument(skip_all, fields(actor = %actor, cycle_id = %id, assessment_id = %assessment_id))]
    pub async fn attach_assessment(
        &self,
        actor: &Actor,
        id: &ExamCycleId,
        assessment_id: &AssessmentId,
    ) -> Result<Committed<ExamCycle>> {
        let cycle = self.load_cycle(actor, id).await?;
        let assessment = self.load_assessment(actor, assessment_id).await?;
        let operation = "exam_cycle.attach_assessment";
        let entity = cycle_ref(&cycle);

        if cycle.is_archived() || cycle.status > ExamCycleStatus::Marking {
            return Err(blocked(
                &cycle,
                cycle.status.as_str(),
                "assessments can only be attached before moderation starts",
            ));
        }
        if assessment.tenant_id != cycle.tenant_id {
            return Err(GradeGuardError::not_found(
                EntityKind::Assessment,
                assessment_id,
            ));
        }
        if cycle.covers(assessment_id) {
            return Ok(self.no_op(operation, &entity, cycle));
        }

        let mut updated = cycle.clone();
        updated.assessment_ids.push(*assessment_id);
        updated.updated_at = self.now();

        let event = self.event(
            actor,
            entity.clone(),
            operation,
            Some(cycle.status.as_str()),
            Some(cycle.status.as_str()),
            None,
        );
        let changes = ChangeSet::new()
            .put(Mutation::Cycle(updated.clone()))
            .record(event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(updated.stored(), &receipt))
    }

    /// Retire an abandoned (`planning`) or finished (`published`) cycle.
    #[instrument(skip_all, fields(actor = %actor, cycle_id = %id))]
    pub async fn archive(&self, actor: &Actor, id: &ExamCycleId) -> Result<Committed<ExamCycle>> {
        let cycle = self.load_cycle(actor, id).await?;
        let operation = "exam_cycle.archive";
        let entity = cycle_ref(&cycle);

        if cycle.is_archived() {
            return Ok(self.no_op(operation, &entity, cycle));
        }
        if !matches!(
            cycle.status,
            ExamCycleStatus::Planning | ExamCycleStatus::Published
        ) {
            return Err(blocked(
                &cycle,
                "archived",
                "only planning or published cycles can be archived",
            ));
        }

        let mut updated = cycle.clone();
        let now = self.now();
        updated.archived = Some(Attribution::new(actor.id.clone(), now));
        updated.updated_at = now;

        let event = self.event(
            actor,
            entity.clone(),
            operation,
            Some(cycle.status.as_str()),
            Some("archived"),
            None,
        );
        let changes = ChangeSet::new()
            .put(Mutation::Cycle(updated.clone()))
            .record(event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(updated.stored(), &receipt))
    }

    /// Recompute and store the cycle's aggregate moderation status.
    #[instrument(skip_all, fields(actor = %actor, cycle_id = %id))]
    pub async fn refresh_moderation_status(
        &self,
        actor: &Actor,
        id: &ExamCycleId,
    ) -> Result<Committed<ExamCycle>> {
        let cycle = self.load_cycle(actor, id).await?;
        let operation = "exam_cycle.refresh_moderation_status";
        let entity = cycle_ref(&cycle);
        if cycle.is_archived() {
            return Err(blocked(
                &cycle,
                cycle.status.as_str(),
                "exam cycle is archived",
            ));
        }

        let status = self.moderation_status(&cycle, None).await?;
        if status == cycle.moderation_status {
            return Ok(self.no_op(operation, &entity, cycle));
        }

        let mut updated = cycle.clone();
        updated.moderation_status = status;
        updated.updated_at = self.now();

        let event = self.event(
            actor,
            entity.clone(),
            operation,
            Some(&cycle.moderation_status.to_string()),
            Some(&status.to_string()),
            None,
        );
        let changes = ChangeSet::new()
            .put(Mutation::Cycle(updated.clone()))
            .record(event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(updated.stored(), &receipt))
    }
}
