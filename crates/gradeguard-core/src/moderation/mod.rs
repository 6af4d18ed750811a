//! Grade moderation workflow.
//!
//! A moderation walks one grade through the review chain its tenant had
//! configured when it was submitted. The chain is copied onto the record at
//! submit time, so later config changes never reroute work in flight.
//! Approval at the final stage writes any moderated score into the grade
//! in the same commit.

pub mod chain;

pub use chain::validate_chain;

use gradeguard_state::{
    Attribution, ChangeSet, EntityKind, ExamCycleId, GradeId, GradeModeration, GradebookStore,
    ModerationId, ModerationStage, ModerationState, Mutation, ScoreChange, Table,
};
use tracing::instrument;

use crate::audit::AuditSink;
use crate::domain::{Actor, GradeGuardError, Result};
use crate::grading::{apply_score, validate_score};
use crate::service::{
    grade_ref, guard_cycles, moderation_ref, Committed, GradeGuardService, Versioned,
};

fn closed(moderation: &GradeModeration, requested: &str, reason: &str) -> GradeGuardError {
    GradeGuardError::InvalidTransition {
        entity: EntityKind::GradeModeration,
        id: moderation.id.to_string(),
        current: moderation.state.as_str().to_string(),
        requested: requested.to_string(),
        reason: reason.to_string(),
    }
}

impl<S, A> GradeGuardService<S, A>
where
    S: GradebookStore,
    A: AuditSink,
{
    /// Open a moderation for `grade_id` at the first stage of the tenant's
    /// chain.
    #[instrument(skip_all, fields(actor = %actor, grade_id = %grade_id))]
    pub async fn submit_moderation(
        &self,
        actor: &Actor,
        grade_id: &GradeId,
        reason: &str,
        exam_cycle_id: Option<ExamCycleId>,
    ) -> Result<Committed<GradeModeration>> {
        let grade = self.load_grade(actor, grade_id).await?;
        let (changes, cycles) = self.unlocked_write(&grade).await?;

        if let Some(cycle_id) = exam_cycle_id {
            let cycle = self.load_cycle(actor, &cycle_id).await?;
            if !cycle.covers(&grade.assessment_id) {
                return Err(GradeGuardError::InvalidInput(format!(
                    "exam cycle {cycle_id} does not cover assessment {}",
                    grade.assessment_id
                )));
            }
        }

        let history = self.store.moderations_for_grade(&grade.id).await?;
        if history.iter().any(|m| m.is_in_review()) {
            return Err(GradeGuardError::DuplicateInFlight { grade_id: grade.id });
        }

        let chain = self.config.resolve_chain(&actor.tenant).to_vec();
        let stage = chain.first().copied().ok_or_else(|| {
            GradeGuardError::InvalidConfig(format!("tenant {} has an empty chain", actor.tenant))
        })?;

        let now = self.now();
        let moderation = GradeModeration {
            id: ModerationId::new(),
            tenant_id: actor.tenant.clone(),
            grade_id: grade.id,
            exam_cycle_id,
            chain,
            stage,
            original_score: grade.score,
            moderated_score: None,
            moderation_reason: reason.to_string(),
            moderated: None,
            submitted_by: actor.id.clone(),
            submitted_at: now,
            state: ModerationState::InReview,
            version: 0,
        };

        let operation = "grade_moderation.submit";
        let entity = moderation_ref(&moderation);
        let event = self.event(
            actor,
            entity.clone(),
            operation,
            None,
            Some(stage.as_str()),
            None,
        );
        let changes = changes
            .put(Mutation::Moderation(moderation.clone()))
            .expect(Table::Grades, grade.id, grade.version)
            .record(event);
        let changes = self
            .sync_cycle_moderation(actor, &cycles, &moderation, changes)
            .await?;

        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(moderation.stored(), &receipt))
    }

    /// Move to the next stage of the record's chain, optionally proposing a
    /// moderated score. Naming the current stage again with a new score
    /// amends the proposal in place.
    #[instrument(skip_all, fields(actor = %actor, moderation_id = %id, to = %to))]
    pub async fn advance_moderation(
        &self,
        actor: &Actor,
        id: &ModerationId,
        to: ModerationStage,
        moderated_score: Option<f64>,
        reason: Option<String>,
    ) -> Result<Committed<GradeModeration>> {
        let moderation = self.load_moderation(actor, id).await?;
        let entity = moderation_ref(&moderation);

        if !moderation.is_in_review() {
            return Err(closed(&moderation, to.as_str(), "moderation is closed"));
        }
        let amending = to == moderation.stage;
        let operation = if amending {
            "grade_moderation.amend"
        } else {
            "grade_moderation.advance"
        };
        if amending && moderated_score.is_none() {
            return Ok(self.no_op(operation, &entity, moderation));
        }
        if !amending {
            let expected = moderation.next_stage();
            if expected != Some(to) {
                return Err(GradeGuardError::StageSkipped {
                    moderation_id: moderation.id,
                    current: moderation.stage,
                    requested: to,
                    expected,
                });
            }
        }

        let mut updated = moderation.clone();
        let mut score_change = None;
        if let Some(score) = moderated_score {
            let grade = self.load_grade(actor, &moderation.grade_id).await?;
            let assessment = self.load_assessment(actor, &grade.assessment_id).await?;
            validate_score(score, assessment.max_score)?;
            score_change = Some(ScoreChange {
                before: moderation
                    .moderated_score
                    .unwrap_or(moderation.original_score),
                after: score,
            });
            updated.moderated_score = Some(score);
            updated.moderated = Some(Attribution::new(actor.id.clone(), self.now()));
        }
        if let Some(reason) = reason {
            updated.moderation_reason = reason;
        }
        updated.stage = to;

        let event = self.event(
            actor,
            entity.clone(),
            operation,
            Some(moderation.stage.as_str()),
            Some(to.as_str()),
            score_change,
        );
        let changes = ChangeSet::new()
            .put(Mutation::Moderation(updated.clone()))
            .record(event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(updated.stored(), &receipt))
    }

    /// Approve at the final stage, writing any moderated score into the grade.
    #[instrument(skip_all, fields(actor = %actor, moderation_id = %id))]
    pub async fn approve_grade_moderation(
        &self,
        actor: &Actor,
        id: &ModerationId,
    ) -> Result<Committed<GradeModeration>> {
        let moderation = self.load_moderation(actor, id).await?;
        let operation = "grade_moderation.approve";
        let entity = moderation_ref(&moderation);

        if moderation.is_approved() {
            return Ok(self.no_op(operation, &entity, moderation));
        }
        if moderation.is_rejected() {
            return Err(closed(&moderation, "approved", "moderation was rejected"));
        }
        if !moderation.is_final_stage() {
            return Err(GradeGuardError::StageSkipped {
                moderation_id: moderation.id,
                current: moderation.stage,
                requested: moderation.chain.last().copied().unwrap_or(moderation.stage),
                expected: moderation.next_stage(),
            });
        }

        let grade = self.load_grade(actor, &moderation.grade_id).await?;
        let (cycles, locked) = self.covering_cycles(&grade.assessment_id).await?;
        let new_score = moderation
            .moderated_score
            .filter(|s| *s != moderation.original_score);
        if let (Some(_), Some(exam_cycle_id)) = (new_score, locked) {
            return Err(GradeGuardError::GradeLocked {
                grade_id: grade.id,
                exam_cycle_id,
            });
        }

        let now = self.now();
        let mut updated = moderation.clone();
        updated.state = ModerationState::Approved {
            approved_by: actor.id.clone(),
            approved_at: now,
        };
        let score_change = new_score.map(|after| ScoreChange {
            before: grade.score,
            after,
        });

        let event = self.event(
            actor,
            entity.clone(),
            operation,
            Some(moderation.stage.as_str()),
            Some("approved"),
            score_change,
        );
        let mut changes = guard_cycles(ChangeSet::new(), &cycles)
            .put(Mutation::Moderation(updated.clone()))
            .record(event);

        if let Some(score) = new_score {
            let assessment = self.load_assessment(actor, &grade.assessment_id).await?;
            let mut regraded = grade.clone();
            apply_score(&mut regraded, score, assessment.max_score)?;
            regraded.updated_at = now;
            let grade_event = self.event(
                actor,
                grade_ref(&grade),
                "grade.apply_moderation",
                None,
                None,
                score_change,
            );
            changes = changes.put(Mutation::Grade(regraded)).record(grade_event);
        }
        let changes = self
            .sync_cycle_moderation(actor, &cycles, &updated, changes)
            .await?;

        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(updated.stored(), &receipt))
    }

    /// Close the moderation without touching the grade.
    #[instrument(skip_all, fields(actor = %actor, moderation_id = %id))]
    pub async fn reject_grade_moderation(
        &self,
        actor: &Actor,
        id: &ModerationId,
        reason: &str,
    ) -> Result<Committed<GradeModeration>> {
        let moderation = self.load_moderation(actor, id).await?;
        let operation = "grade_moderation.reject";
        let entity = moderation_ref(&moderation);

        if moderation.is_rejected() {
            return Ok(self.no_op(operation, &entity, moderation));
        }
        if moderation.is_approved() {
            return Err(closed(
                &moderation,
                "rejected",
                "approved moderations are final",
            ));
        }

        let grade = self.load_grade(actor, &moderation.grade_id).await?;
        let (cycles, _) = self.covering_cycles(&grade.assessment_id).await?;

        let mut updated = moderation.clone();
        updated.state = ModerationState::Rejected {
            rejected_by: actor.id.clone(),
            rejected_at: self.now(),
            reason: reason.to_string(),
        };

        let event = self.event(
            actor,
            entity.clone(),
            operation,
            Some(moderation.stage.as_str()),
            Some("rejected"),
            None,
        );
        let changes = ChangeSet::new()
            .put(Mutation::Moderation(updated.clone()))
            .record(event);
        let changes = self
            .sync_cycle_moderation(actor, &cycles, &updated, changes)
            .await?;

        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(updated.stored(), &receipt))
    }
}
