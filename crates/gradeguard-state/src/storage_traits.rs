//! Storage trait definitions for GradeGuard
//!
//! - `GradebookStore`: lookups for cycles, assessments, grades, moderations
//!   and overrides, plus an atomic `commit` of a [`ChangeSet`].
//! - Audit outbox: events committed alongside the state they describe,
//!   drained in commit order by the audit relay.
//!
//! The trait is async and backend-agnostic. An in-memory implementation is
//! provided in the `fakes` module.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::records::*;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Constraint name for the one-in-review-moderation-per-grade rule.
pub const IN_REVIEW_MODERATION_CONSTRAINT: &str = "grade_moderations.in_review_per_grade";

/// Constraint name for the one-grade-per-student-per-assessment rule.
pub const GRADE_PER_STUDENT_CONSTRAINT: &str = "grades.assessment_student";

/// Logical tables, used for error reporting and backend row routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    ExamCycles,
    Assessments,
    Grades,
    GradeModerations,
    PostLockChanges,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExamCycles => "exam_cycles",
            Self::Assessments => "assessments",
            Self::Grades => "grades",
            Self::GradeModerations => "grade_moderations",
            Self::PostLockChanges => "post_lock_changes",
        }
    }
}

/// A single record write inside a [`ChangeSet`].
///
/// The record's `version` must equal the stored version (or `0` for an
/// insert); the store persists it with `version + 1`.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Cycle(ExamCycle),
    Assessment(Assessment),
    Grade(Grade),
    Moderation(GradeModeration),
    Override(PostLockGradeChange),
}

impl Mutation {
    pub fn table(&self) -> Table {
        match self {
            Self::Cycle(_) => Table::ExamCycles,
            Self::Assessment(_) => Table::Assessments,
            Self::Grade(_) => Table::Grades,
            Self::Moderation(_) => Table::GradeModerations,
            Self::Override(_) => Table::PostLockChanges,
        }
    }

    /// Primary key as stored.
    pub fn key(&self) -> String {
        match self {
            Self::Cycle(r) => r.id.to_string(),
            Self::Assessment(r) => r.id.to_string(),
            Self::Grade(r) => r.id.to_string(),
            Self::Moderation(r) => r.id.to_string(),
            Self::Override(r) => r.id.to_string(),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Cycle(r) => r.version,
            Self::Assessment(r) => r.version,
            Self::Grade(r) => r.version,
            Self::Moderation(r) => r.version,
            Self::Override(r) => r.version,
        }
    }

    /// The record with its version advanced, as it will be stored.
    pub fn committed(&self) -> Mutation {
        let mut m = self.clone();
        match &mut m {
            Self::Cycle(r) => r.version += 1,
            Self::Assessment(r) => r.version += 1,
            Self::Grade(r) => r.version += 1,
            Self::Moderation(r) => r.version += 1,
            Self::Override(r) => r.version += 1,
        }
        m
    }
}

/// A record version a commit depends on without writing the record.
///
/// Lets an operation fail with `Conflict` when something it only read
/// (such as the cycle that decides whether a grade is locked) moved
/// underneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub table: Table,
    pub key: String,
    pub version: u64,
}

/// Everything one operation writes: record mutations plus the audit events
/// describing them. Applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub mutations: Vec<Mutation>,
    pub guards: Vec<Guard>,
    pub events: Vec<AuditEvent>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    /// Require `table/key` to still be at `version` when the commit applies.
    pub fn expect(mut self, table: Table, key: impl ToString, version: u64) -> Self {
        self.guards.push(Guard {
            table,
            key: key.to_string(),
            version,
        });
        self
    }

    pub fn record(mut self, event: AuditEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.events.is_empty()
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    /// Committed events with their assigned `seq`, in order.
    pub events: Vec<AuditEvent>,
}

impl CommitReceipt {
    pub fn first_event_id(&self) -> Option<AuditRecordId> {
        self.events.first().map(|e| e.event_id)
    }
}

/// Persistence for the grade-integrity pipeline.
///
/// Guarantees:
/// - `commit` applies every mutation and appends every event atomically, or
///   nothing at all.
/// - A mutation or guard whose `version` differs from the stored version
///   fails the whole commit with `StorageError::Conflict`. An update of a missing
///   record fails with `StorageError::MissingRecord`.
/// - At most one in-review moderation exists per grade and at most one grade
///   per (assessment, student); violations fail with
///   `StorageError::UniqueViolation` naming the constraint.
/// - Committed events get strictly increasing `seq` values in commit order.
/// - Lookups filtered by a parent id return records ordered by creation.
#[async_trait]
pub trait GradebookStore: Send + Sync {
    async fn get_cycle(&self, id: &ExamCycleId) -> StorageResult<Option<ExamCycle>>;

    async fn list_cycles(&self, tenant_id: &TenantId) -> StorageResult<Vec<ExamCycle>>;

    /// Cycles whose `assessment_ids` include the given assessment.
    async fn cycles_covering(&self, assessment_id: &AssessmentId)
        -> StorageResult<Vec<ExamCycle>>;

    async fn get_assessment(&self, id: &AssessmentId) -> StorageResult<Option<Assessment>>;

    async fn get_grade(&self, id: &GradeId) -> StorageResult<Option<Grade>>;

    async fn find_grade(
        &self,
        assessment_id: &AssessmentId,
        student_id: &StudentId,
    ) -> StorageResult<Option<Grade>>;

    async fn grades_for_assessment(&self, assessment_id: &AssessmentId)
        -> StorageResult<Vec<Grade>>;

    async fn get_moderation(&self, id: &ModerationId) -> StorageResult<Option<GradeModeration>>;

    async fn moderations_for_grade(&self, grade_id: &GradeId)
        -> StorageResult<Vec<GradeModeration>>;

    async fn get_override(&self, id: &OverrideId) -> StorageResult<Option<PostLockGradeChange>>;

    async fn overrides_for_grade(&self, grade_id: &GradeId)
        -> StorageResult<Vec<PostLockGradeChange>>;

    /// Apply a change set atomically.
    async fn commit(&self, changes: ChangeSet) -> StorageResult<CommitReceipt>;

    /// Undelivered audit events, oldest `seq` first.
    async fn pending_audit(&self, limit: usize) -> StorageResult<Vec<AuditEvent>>;

    /// Mark an outbox event as handed to the audit sink. No-op if already marked.
    async fn mark_audit_delivered(&self, event_id: &AuditRecordId) -> StorageResult<()>;
}
