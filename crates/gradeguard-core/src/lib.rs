//! GradeGuard Core Library
//!
//! Exam cycle lifecycle, grade moderation and post-lock override control
//! on top of a [`gradeguard_state::GradebookStore`]. Every mutating
//! operation commits its state change and audit events atomically, then
//! relays the outbox to an [`AuditSink`].

pub mod audit;
pub mod config;
pub mod domain;
pub mod exam_cycle;
pub mod grades;
pub mod grading;
pub mod metrics;
pub mod moderation;
pub mod obs;
pub mod override_control;
pub mod service;
pub mod telemetry;

pub use audit::{relay_pending, AuditSink, AuditSinkError, MemoryAuditSink, TracingAuditSink};
pub use config::GradeGuardConfig;
pub use domain::{Actor, Clock, FixedClock, GradeGuardError, Result, SystemClock};
pub use exam_cycle::aggregate::aggregate_moderation_status;
pub use exam_cycle::transitions::{next_status, CycleOperation};
pub use exam_cycle::CycleDraft;
pub use grades::AssessmentDraft;
pub use grading::{letter_grade, percentage};
pub use metrics::METRICS;
pub use moderation::validate_chain;
pub use service::{Committed, GradeGuardService};

pub use gradeguard_state::{
    Assessment, AssessmentId, AuditEvent, ExamCycle, ExamCycleId, ExamCycleStatus, ExamType,
    Grade, GradeId, GradeModeration, GradebookStore, LetterGrade, MemoryGradebookStore,
    ModerationId, ModerationStage, ModerationStatus, OverrideId, PostLockGradeChange, StudentId,
    SurrealGradebookStore, TenantId,
};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
