//! Domain-level error taxonomy for GradeGuard.

use gradeguard_state::{
    ActorId, EntityKind, ExamCycleId, GradeId, ModerationId, ModerationStage, OverrideId,
    StorageError,
};

/// GradeGuard domain errors.
///
/// Everything except `Persistence` is a client error: retrying the same
/// request cannot succeed until something else changes.
#[derive(Debug, thiserror::Error)]
pub enum GradeGuardError {
    #[error("{entity} {id}: cannot move from {current} to {requested}: {reason}")]
    InvalidTransition {
        entity: EntityKind,
        id: String,
        current: String,
        requested: String,
        reason: String,
    },

    #[error("grade {grade_id} already has a moderation in review")]
    DuplicateInFlight { grade_id: GradeId },

    #[error(
        "moderation {moderation_id} at {current} cannot move to {requested}; next stage is {}",
        .expected.map(|s| s.as_str()).unwrap_or("none")
    )]
    StageSkipped {
        moderation_id: ModerationId,
        current: ModerationStage,
        requested: ModerationStage,
        expected: Option<ModerationStage>,
    },

    #[error("override {change_id} cannot be approved by its requester {actor}")]
    SelfApprovalForbidden { change_id: OverrideId, actor: ActorId },

    #[error("a post-lock change requires a non-empty justification")]
    JustificationRequired,

    #[error("grade {grade_id} is not locked; change it directly")]
    GradeNotLocked { grade_id: GradeId },

    #[error("grade {grade_id} is locked by exam cycle {exam_cycle_id}")]
    GradeLocked {
        grade_id: GradeId,
        exam_cycle_id: ExamCycleId,
    },

    #[error("score {score} is outside 0..={max_score}")]
    InvalidScore { score: f64, max_score: f64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),
}

impl GradeGuardError {
    /// Whether the caller may re-read and retry. Only transient storage
    /// failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(e) if e.is_transient())
    }

    pub(crate) fn not_found(entity: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Result type for GradeGuard domain operations.
pub type Result<T> = std::result::Result<T, GradeGuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_skipped_names_expected_stage() {
        let err = GradeGuardError::StageSkipped {
            moderation_id: ModerationId::new(),
            current: ModerationStage::TeacherSubmitted,
            requested: ModerationStage::PrincipalApproval,
            expected: Some(ModerationStage::HodReview),
        };
        let msg = err.to_string();
        assert!(msg.contains("principal_approval"));
        assert!(msg.contains("next stage is hod_review"));
    }

    #[test]
    fn only_transient_storage_errors_are_retryable() {
        let conflict = GradeGuardError::Persistence(StorageError::Conflict {
            table: "exam_cycles".into(),
            key: "c-1".into(),
            expected: 3,
            found: 4,
        });
        assert!(conflict.is_retryable());

        let corrupt = GradeGuardError::Persistence(StorageError::Serialization("bad".into()));
        assert!(!corrupt.is_retryable());

        assert!(!GradeGuardError::JustificationRequired.is_retryable());
    }

    #[test]
    fn invalid_transition_display() {
        let err = GradeGuardError::InvalidTransition {
            entity: EntityKind::ExamCycle,
            id: "c-1".into(),
            current: "approved".into(),
            requested: "locked".into(),
            reason: "moderation status is rejected".into(),
        };
        assert_eq!(
            err.to_string(),
            "exam_cycle c-1: cannot move from approved to locked: moderation status is rejected"
        );
    }
}
