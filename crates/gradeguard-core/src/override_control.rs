//! Post-lock override control.
//!
//! Once a covering cycle is locked, the only way to change a grade is a
//! justified change request approved by someone other than its requester.
//! Approval writes the new score and stamps the request in one commit.

use gradeguard_state::{
    ChangeSet, EntityKind, GradeId, GradebookStore, Mutation, OverrideId, OverrideState,
    PostLockGradeChange, ScoreChange, Table,
};
use tracing::instrument;

use crate::audit::AuditSink;
use crate::domain::{Actor, GradeGuardError, Result};
use crate::grading::{apply_score, validate_score};
use crate::service::{
    grade_ref, guard_cycles, override_ref, Committed, GradeGuardService, Versioned,
};

fn resolved(change: &PostLockGradeChange, requested: &str, reason: &str) -> GradeGuardError {
    GradeGuardError::InvalidTransition {
        entity: EntityKind::PostLockGradeChange,
        id: change.id.to_string(),
        current: change.state.as_str().to_string(),
        requested: requested.to_string(),
        reason: reason.to_string(),
    }
}

impl<S, A> GradeGuardService<S, A>
where
    S: GradebookStore,
    A: AuditSink,
{
    /// Ask for `new_score` on a locked grade.
    #[instrument(skip_all, fields(actor = %actor, grade_id = %grade_id))]
    pub async fn request_override(
        &self,
        actor: &Actor,
        grade_id: &GradeId,
        new_score: f64,
        justification: &str,
    ) -> Result<Committed<PostLockGradeChange>> {
        let justification = justification.trim();
        if justification.is_empty() {
            return Err(GradeGuardError::JustificationRequired);
        }

        let grade = self.load_grade(actor, grade_id).await?;
        let (_, locked) = self.covering_cycles(&grade.assessment_id).await?;
        if locked.is_none() {
            return Err(GradeGuardError::GradeNotLocked { grade_id: grade.id });
        }
        let assessment = self.load_assessment(actor, &grade.assessment_id).await?;
        validate_score(new_score, assessment.max_score)?;

        let change = PostLockGradeChange {
            id: OverrideId::new(),
            tenant_id: actor.tenant.clone(),
            grade_id: grade.id,
            original_score: grade.score,
            new_score,
            justification: justification.to_string(),
            requested_by: actor.id.clone(),
            requested_at: self.now(),
            state: OverrideState::Pending,
            version: 0,
        };

        let operation = "post_lock_override.request";
        let entity = override_ref(&change);
        let event = self.event(
            actor,
            entity.clone(),
            operation,
            None,
            Some("pending"),
            Some(ScoreChange {
                before: grade.score,
                after: new_score,
            }),
        );
        let changes = ChangeSet::new()
            .put(Mutation::Override(change.clone()))
            .expect(Table::Grades, grade.id, grade.version)
            .record(event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(change.stored(), &receipt))
    }

    /// Approve a pending change and write its score into the grade.
    #[instrument(skip_all, fields(actor = %actor, change_id = %id))]
    pub async fn approve_override(
        &self,
        actor: &Actor,
        id: &OverrideId,
    ) -> Result<Committed<PostLockGradeChange>> {
        let change = self.load_override(actor, id).await?;
        let operation = "post_lock_override.approve";
        let entity = override_ref(&change);

        if change.approved_at().is_some() {
            return Ok(self.no_op(operation, &entity, change));
        }
        if !change.is_pending() {
            return Err(resolved(&change, "approved", "change request was rejected"));
        }
        if change.requested_by == actor.id {
            return Err(GradeGuardError::SelfApprovalForbidden {
                change_id: change.id,
                actor: actor.id.clone(),
            });
        }

        let grade = self.load_grade(actor, &change.grade_id).await?;
        // An unlock since the request sends the change back to the normal
        // write paths.
        let (cycles, locked) = self.covering_cycles(&grade.assessment_id).await?;
        if locked.is_none() {
            return Err(GradeGuardError::GradeNotLocked { grade_id: grade.id });
        }
        let assessment = self.load_assessment(actor, &grade.assessment_id).await?;
        let now = self.now();

        let mut regraded = grade.clone();
        apply_score(&mut regraded, change.new_score, assessment.max_score)?;
        regraded.updated_at = now;

        let mut updated = change.clone();
        updated.state = OverrideState::Approved {
            approved_by: actor.id.clone(),
            approved_at: now,
        };

        let score_change = Some(ScoreChange {
            before: grade.score,
            after: change.new_score,
        });
        let event = self.event(
            actor,
            entity.clone(),
            operation,
            Some("pending"),
            Some("approved"),
            score_change,
        );
        let grade_event = self.event(
            actor,
            grade_ref(&grade),
            "grade.apply_override",
            None,
            None,
            score_change,
        );
        let changes = guard_cycles(ChangeSet::new(), &cycles)
            .put(Mutation::Override(updated.clone()))
            .put(Mutation::Grade(regraded))
            .record(event)
            .record(grade_event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(updated.stored(), &receipt))
    }

    /// Close a pending change without touching the grade.
    #[instrument(skip_all, fields(actor = %actor, change_id = %id))]
    pub async fn reject_override(
        &self,
        actor: &Actor,
        id: &OverrideId,
        reason: &str,
    ) -> Result<Committed<PostLockGradeChange>> {
        let change = self.load_override(actor, id).await?;
        let operation = "post_lock_override.reject";
        let entity = override_ref(&change);

        if matches!(change.state, OverrideState::Rejected { .. }) {
            return Ok(self.no_op(operation, &entity, change));
        }
        if !change.is_pending() {
            return Err(resolved(&change, "rejected", "change was already applied"));
        }

        let mut updated = change.clone();
        updated.state = OverrideState::Rejected {
            rejected_by: actor.id.clone(),
            rejected_at: self.now(),
            reason: reason.to_string(),
        };

        let event = self.event(
            actor,
            entity.clone(),
            operation,
            Some("pending"),
            Some("rejected"),
            None,
        );
        let changes = ChangeSet::new()
            .put(Mutation::Override(updated.clone()))
            .record(event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(updated.stored(), &receipt))
    }
}
