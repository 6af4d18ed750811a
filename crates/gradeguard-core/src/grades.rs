//! Direct grade entry.
//!
//! Assessments are registered with a roster; grades are recorded per
//! rostered student. Direct writes are refused while a covering cycle is
//! locked, while a covering cycle that requires moderation is past marking,
//! or while the grade has a moderation in review.

use gradeguard_state::{
    Assessment, AssessmentId, ChangeSet, EntityKind, ExamCycle, ExamCycleStatus, Grade, GradeId,
    GradebookStore, LetterGrade, Mutation, ScoreChange, StudentId,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::audit::AuditSink;
use crate::domain::{Actor, GradeGuardError, Result};
use crate::grading::{apply_score, validate_max_score, validate_score};
use crate::service::{assessment_ref, grade_ref, Committed, GradeGuardService, Versioned};

/// Input for [`GradeGuardService::register_assessment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentDraft {
    pub name: String,
    pub subject: String,
    pub max_score: f64,
    #[serde(default)]
    pub roster: Vec<StudentId>,
}

impl<S, A> GradeGuardService<S, A>
where
    S: GradebookStore,
    A: AuditSink,
{
    #[instrument(skip_all, fields(actor = %actor, name = %draft.name))]
    pub async fn register_assessment(
        &self,
        actor: &Actor,
        draft: AssessmentDraft,
    ) -> Result<Committed<Assessment>> {
        if draft.name.trim().is_empty() {
            return Err(GradeGuardError::InvalidInput(
                "assessment name is empty".to_string(),
            ));
        }
        validate_max_score(draft.max_score)?;

        let mut roster: Vec<StudentId> = Vec::with_capacity(draft.roster.len());
        for student in draft.roster {
            if !roster.contains(&student) {
                roster.push(student);
            }
        }

        let assessment = Assessment {
            id: AssessmentId::new(),
            tenant_id: actor.tenant.clone(),
            name: draft.name.trim().to_string(),
            subject: draft.subject,
            max_score: draft.max_score,
            roster,
            created_at: self.now(),
            version: 0,
        };

        let operation = "assessment.register";
        let entity = assessment_ref(&assessment);
        let event = self.event(actor, entity.clone(), operation, None, None, None);
        let changes = ChangeSet::new()
            .put(Mutation::Assessment(assessment.clone()))
            .record(event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(assessment.stored(), &receipt))
    }

    /// Create or update `student`'s grade on an assessment.
    #[instrument(skip_all, fields(actor = %actor, assessment_id = %assessment_id, student = %student))]
    pub async fn record_grade(
        &self,
        actor: &Actor,
        assessment_id: &AssessmentId,
        student: &StudentId,
        score: f64,
        remarks: &str,
    ) -> Result<Committed<Grade>> {
        let assessment = self.load_assessment(actor, assessment_id).await?;
        if !assessment.roster.contains(student) {
            return Err(GradeGuardError::InvalidInput(format!(
                "student {student} is not on the roster of {}",
                assessment.name
            )));
        }
        validate_score(score, assessment.max_score)?;

        let now = self.now();
        let existing = self.store.find_grade(assessment_id, student).await?;
        let (operation, before, mut grade) = match existing {
            Some(grade) => {
                if grade.score == score && grade.remarks == remarks {
                    let entity = grade_ref(&grade);
                    return Ok(self.no_op("grade.update", &entity, grade));
                }
                let in_review = self
                    .store
                    .moderations_for_grade(&grade.id)
                    .await?
                    .iter()
                    .any(|m| m.is_in_review());
                if in_review {
                    return Err(GradeGuardError::DuplicateInFlight { grade_id: grade.id });
                }
                ("grade.update", Some(grade.score), grade)
            }
            None => (
                "grade.record",
                None,
                Grade {
                    id: GradeId::new(),
                    tenant_id: actor.tenant.clone(),
                    assessment_id: *assessment_id,
                    student_id: student.clone(),
                    score,
                    percentage: 0.0,
                    letter_grade: LetterGrade::F,
                    remarks: String::new(),
                    entered_by: actor.id.clone(),
                    updated_at: now,
                    version: 0,
                },
            ),
        };

        let (changes, cycles) = self.unlocked_write(&grade).await?;
        if let Some(cycle) = cycles.iter().find(|c| in_review_phase(c)) {
            return Err(GradeGuardError::InvalidTransition {
                entity: EntityKind::Grade,
                id: grade.id.to_string(),
                current: cycle.status.as_str().to_string(),
                requested: operation.to_string(),
                reason: format!(
                    "exam cycle {} is under moderation; submit a grade moderation instead",
                    cycle.id
                ),
            });
        }
        apply_score(&mut grade, score, assessment.max_score)?;
        grade.remarks = remarks.to_string();
        grade.entered_by = actor.id.clone();
        grade.updated_at = now;

        let entity = grade_ref(&grade);
        let score_change = before
            .filter(|b| *b != score)
            .map(|before| ScoreChange {
                before,
                after: score,
            });
        let event = self.event(actor, entity.clone(), operation, None, None, score_change);
        let changes = changes.put(Mutation::Grade(grade.clone())).record(event);
        let receipt = self.commit(operation, &entity, changes).await?;
        Ok(Committed::new(grade.stored(), &receipt))
    }
}

/// Scores in a cycle that requires moderation only change through a
/// moderation once marking has ended.
fn in_review_phase(cycle: &ExamCycle) -> bool {
    cycle.moderation_required
        && matches!(
            cycle.status,
            ExamCycleStatus::Moderation | ExamCycleStatus::Approved
        )
}
