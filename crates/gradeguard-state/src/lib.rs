//! GradeGuard-State: versioned persistence for exam records
//!
//! This crate owns every byte GradeGuard stores: exam cycles, assessments,
//! grades, moderation records, post-lock change requests and the audit
//! outbox.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: record versions, atomic change sets, and an outbox that never
//! loses or reorders an audit event.
//!
//! ## Key Components
//!
//! - `GradebookStore`: the backend-agnostic storage trait
//! - `MemoryGradebookStore`: in-process implementation for tests and embedding
//! - `SurrealGradebookStore`: SurrealDB implementation (`mem://`, `surrealkv://`, `ws://`)
//! - `records`: the persisted record types and `AuditEvent`

mod error;
pub mod fakes;
mod handle;
mod migrations;
pub mod records;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use fakes::MemoryGradebookStore;
pub use handle::{Credentials, StoreConfig, DEFAULT_LOCAL_PATH};
pub use records::*;
pub use storage_traits::{
    ChangeSet, CommitReceipt, GradebookStore, Guard, Mutation, StorageResult, Table,
    GRADE_PER_STUDENT_CONSTRAINT, IN_REVIEW_MODERATION_CONSTRAINT,
};
pub use surreal_store::SurrealGradebookStore;

/// Result type for gradeguard-state operations
pub type Result<T> = std::result::Result<T, StateError>;
