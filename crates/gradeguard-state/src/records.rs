//! Persisted record types.
//!
//! Exam cycles, assessments and grades are independently owned aggregates
//! that refer to each other by id only. Every record carries a `version`
//! used by [`crate::GradebookStore::commit`] for optimistic concurrency:
//! a record submitted with version `n` is stored as `n + 1`, and a brand
//! new record is submitted with version `0`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse an id from its hyphenated string form.
            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an [`ExamCycle`].
    ExamCycleId
);
uuid_id!(
    /// Identifier of an [`Assessment`].
    AssessmentId
);
uuid_id!(
    /// Identifier of a [`Grade`].
    GradeId
);
uuid_id!(
    /// Identifier of a [`GradeModeration`].
    ModerationId
);
uuid_id!(
    /// Identifier of a [`PostLockGradeChange`].
    OverrideId
);
uuid_id!(
    /// Identifier of an [`AuditEvent`].
    AuditRecordId
);

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Tenant (school) identifier, issued by the tenant directory.
    TenantId
);
string_id!(
    /// User identity of whoever performs an operation.
    ActorId
);
string_id!(
    /// Student identifier, issued by the student registry.
    StudentId
);

/// Who did something, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub by: ActorId,
    pub at: DateTime<Utc>,
}

impl Attribution {
    pub fn new(by: ActorId, at: DateTime<Utc>) -> Self {
        Self { by, at }
    }
}

// ---------------------------------------------------------------------------
// ExamCycle
// ---------------------------------------------------------------------------

/// Kind of examination a cycle runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamType {
    Formative,
    #[default]
    Summative,
    MidTerm,
    Final,
}

impl std::fmt::Display for ExamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Formative => "formative",
            Self::Summative => "summative",
            Self::MidTerm => "mid_term",
            Self::Final => "final",
        };
        f.write_str(s)
    }
}

/// Lifecycle position of an exam cycle.
///
/// Locking is part of the lifecycle rather than a separate flag: a cycle is
/// locked exactly when its status is `Locked` or `Published`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamCycleStatus {
    Planning,
    Scheduled,
    InProgress,
    Marking,
    Moderation,
    Approved,
    Locked,
    Published,
}

impl ExamCycleStatus {
    pub const ALL: [ExamCycleStatus; 8] = [
        Self::Planning,
        Self::Scheduled,
        Self::InProgress,
        Self::Marking,
        Self::Moderation,
        Self::Approved,
        Self::Locked,
        Self::Published,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Marking => "marking",
            Self::Moderation => "moderation",
            Self::Approved => "approved",
            Self::Locked => "locked",
            Self::Published => "published",
        }
    }

    /// Whether grades covered by a cycle in this status are frozen.
    pub fn is_locked(self) -> bool {
        matches!(self, Self::Locked | Self::Published)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Published)
    }
}

impl std::fmt::Display for ExamCycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate moderation outcome over a cycle's grades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    #[default]
    Pending,
    InProgress,
    Approved,
    Rejected,
}

impl std::fmt::Display for ModerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// A governed examination period, e.g. "End of Term 1 Exams".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamCycle {
    pub id: ExamCycleId,
    pub tenant_id: TenantId,
    pub academic_year: String,
    pub term: String,
    pub name: String,
    pub exam_type: ExamType,
    pub status: ExamCycleStatus,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Assessments whose grades this cycle governs.
    pub assessment_ids: Vec<AssessmentId>,
    pub moderation_required: bool,
    pub moderation_status: ModerationStatus,
    /// Cycle-level moderation sign-off.
    pub moderated: Option<Attribution>,
    pub locked: Option<Attribution>,
    pub published: Option<Attribution>,
    pub archived: Option<Attribution>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl ExamCycle {
    pub fn is_locked(&self) -> bool {
        self.status.is_locked()
    }

    pub fn is_archived(&self) -> bool {
        self.archived.is_some()
    }

    pub fn covers(&self, assessment_id: &AssessmentId) -> bool {
        self.assessment_ids.contains(assessment_id)
    }
}

// ---------------------------------------------------------------------------
// Assessment & Grade
// ---------------------------------------------------------------------------

/// An assessment whose grades may be claimed by exam cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub id: AssessmentId,
    pub tenant_id: TenantId,
    pub name: String,
    pub subject: String,
    pub max_score: f64,
    /// Students expected to receive a grade for this assessment.
    pub roster: Vec<StudentId>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

/// Letter band derived from a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LetterGrade {
    A,
    B,
    C,
    D,
    F,
}

impl std::fmt::Display for LetterGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        };
        f.write_str(s)
    }
}

/// Scored outcome for one student on one assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grade {
    pub id: GradeId,
    pub tenant_id: TenantId,
    pub assessment_id: AssessmentId,
    pub student_id: StudentId,
    pub score: f64,
    pub percentage: f64,
    pub letter_grade: LetterGrade,
    pub remarks: String,
    pub entered_by: ActorId,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// GradeModeration
// ---------------------------------------------------------------------------

/// A review stage in a moderation chain.
///
/// Declaration order is the canonical chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStage {
    TeacherSubmitted,
    HodReview,
    AdminApproval,
    PrincipalApproval,
}

impl ModerationStage {
    /// The full chain used when a tenant configures nothing else.
    pub const DEFAULT_CHAIN: [ModerationStage; 4] = [
        Self::TeacherSubmitted,
        Self::HodReview,
        Self::AdminApproval,
        Self::PrincipalApproval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TeacherSubmitted => "teacher_submitted",
            Self::HodReview => "hod_review",
            Self::AdminApproval => "admin_approval",
            Self::PrincipalApproval => "principal_approval",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::DEFAULT_CHAIN.into_iter().find(|st| st.as_str() == s)
    }
}

impl std::fmt::Display for ModerationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution of a single moderation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModerationState {
    InReview,
    Approved {
        approved_by: ActorId,
        approved_at: DateTime<Utc>,
    },
    Rejected {
        rejected_by: ActorId,
        rejected_at: DateTime<Utc>,
        reason: String,
    },
}

impl ModerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InReview => "in_review",
            Self::Approved { .. } => "approved",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// One pass of a grade through the moderation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeModeration {
    pub id: ModerationId,
    pub tenant_id: TenantId,
    pub grade_id: GradeId,
    pub exam_cycle_id: Option<ExamCycleId>,
    /// Stage sequence frozen when the moderation was submitted.
    pub chain: Vec<ModerationStage>,
    pub stage: ModerationStage,
    pub original_score: f64,
    pub moderated_score: Option<f64>,
    pub moderation_reason: String,
    /// Who proposed `moderated_score`.
    pub moderated: Option<Attribution>,
    pub submitted_by: ActorId,
    pub submitted_at: DateTime<Utc>,
    pub state: ModerationState,
    pub version: u64,
}

impl GradeModeration {
    pub fn is_in_review(&self) -> bool {
        matches!(self.state, ModerationState::InReview)
    }

    pub fn is_approved(&self) -> bool {
        matches!(self.state, ModerationState::Approved { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.state, ModerationState::Rejected { .. })
    }

    /// The stage after the current one in this record's chain, if any.
    pub fn next_stage(&self) -> Option<ModerationStage> {
        let pos = self.chain.iter().position(|s| *s == self.stage)?;
        self.chain.get(pos + 1).copied()
    }

    pub fn is_final_stage(&self) -> bool {
        self.chain.last() == Some(&self.stage)
    }
}

// ---------------------------------------------------------------------------
// PostLockGradeChange
// ---------------------------------------------------------------------------

/// Resolution of a post-lock override request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OverrideState {
    Pending,
    Approved {
        approved_by: ActorId,
        approved_at: DateTime<Utc>,
    },
    Rejected {
        rejected_by: ActorId,
        rejected_at: DateTime<Utc>,
        reason: String,
    },
}

impl OverrideState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved { .. } => "approved",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// A justified exception change to a locked grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostLockGradeChange {
    pub id: OverrideId,
    pub tenant_id: TenantId,
    pub grade_id: GradeId,
    pub original_score: f64,
    pub new_score: f64,
    pub justification: String,
    pub requested_by: ActorId,
    pub requested_at: DateTime<Utc>,
    pub state: OverrideState,
    pub version: u64,
}

impl PostLockGradeChange {
    pub fn is_pending(&self) -> bool {
        matches!(self.state, OverrideState::Pending)
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            OverrideState::Approved { approved_at, .. } => Some(*approved_at),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

/// Kind of entity an audit event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ExamCycle,
    Assessment,
    Grade,
    GradeModeration,
    PostLockGradeChange,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExamCycle => "exam_cycle",
            Self::Assessment => "assessment",
            Self::Grade => "grade",
            Self::GradeModeration => "grade_moderation",
            Self::PostLockGradeChange => "post_lock_grade_change",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl ToString) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }
}

/// Score value before and after a write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreChange {
    pub before: f64,
    pub after: f64,
}

/// Immutable attribution record for one committed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: AuditRecordId,
    /// Position in commit order; `0` until the store commits the event.
    pub seq: u64,
    pub tenant_id: TenantId,
    pub actor: ActorId,
    pub timestamp: DateTime<Utc>,
    pub entity: EntityRef,
    pub operation: String,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub score_change: Option<ScoreChange>,
    /// SHA-256 over the event content, excluding `seq` and `digest`.
    pub digest: String,
}

impl AuditEvent {
    /// Build an uncommitted event and seal its digest.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: TenantId,
        actor: ActorId,
        timestamp: DateTime<Utc>,
        entity: EntityRef,
        operation: impl Into<String>,
        from_state: Option<String>,
        to_state: Option<String>,
        score_change: Option<ScoreChange>,
    ) -> Self {
        let mut event = Self {
            event_id: AuditRecordId::new(),
            seq: 0,
            tenant_id,
            actor,
            timestamp,
            entity,
            operation: operation.into(),
            from_state,
            to_state,
            score_change,
            digest: String::new(),
        };
        event.digest = event.compute_digest();
        event
    }

    fn compute_digest(&self) -> String {
        let payload = serde_json::json!({
            "event_id": self.event_id,
            "tenant_id": self.tenant_id,
            "actor": self.actor,
            "timestamp": self.timestamp.to_rfc3339(),
            "entity": self.entity,
            "operation": self.operation,
            "from_state": self.from_state,
            "to_state": self.to_state,
            "score_change": self.score_change,
        });
        let mut hasher = Sha256::new();
        hasher.update(payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the stored digest still matches the event content.
    pub fn verify_integrity(&self) -> bool {
        self.digest == self.compute_digest()
    }
}
