//! SurrealDB row shapes.
//!
//! Records are stored as JSON bodies next to the few columns the backend
//! filters on. Keeping the typed record out of SurrealDB's own value model
//! means chrono and uuid fields round-trip exactly as serde writes them.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::records::*;
use crate::storage_traits::{Mutation, StorageResult};

/// One stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// Primary key (record uuid)
    pub doc_key: String,
    /// Owning tenant
    pub tenant_key: String,
    /// Foreign keys used for lookups (assessment ids, grade ids, slot keys)
    pub links: Vec<String>,
    /// Monotonic insertion position, for creation-ordered listings
    pub created_seq: u64,
    /// Record version
    pub rev: u64,
    /// Serialized record (JSON)
    pub body: String,
}

/// One audit outbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub event_id: String,
    pub seq: u64,
    pub delivered: bool,
    /// Serialized `AuditEvent` (JSON)
    pub body: String,
}

/// Counters persisted alongside every commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountersRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub last_seq: u64,
    pub last_row: u64,
}

/// Lookup key for a grade's (assessment, student) slot.
pub fn grade_slot_key(assessment_id: &AssessmentId, student_id: &StudentId) -> String {
    format!("slot:{}/{}", assessment_id, student_id)
}

/// Link carried by a moderation while it is in review; at most one row per
/// grade may hold it.
pub fn in_review_key(grade_id: &GradeId) -> String {
    format!("in_review:{grade_id}")
}

impl DocumentRow {
    /// Build the row a mutation will be stored as.
    pub fn from_mutation(mutation: &Mutation, created_seq: u64) -> StorageResult<Self> {
        let committed = mutation.committed();
        let (tenant_key, links, body) = match &committed {
            Mutation::Cycle(r) => (
                r.tenant_id.to_string(),
                r.assessment_ids.iter().map(|a| a.to_string()).collect(),
                serde_json::to_string(r)?,
            ),
            Mutation::Assessment(r) => (
                r.tenant_id.to_string(),
                Vec::new(),
                serde_json::to_string(r)?,
            ),
            Mutation::Grade(r) => (
                r.tenant_id.to_string(),
                vec![
                    r.assessment_id.to_string(),
                    grade_slot_key(&r.assessment_id, &r.student_id),
                ],
                serde_json::to_string(r)?,
            ),
            Mutation::Moderation(r) => {
                let mut links = vec![r.grade_id.to_string()];
                if r.is_in_review() {
                    links.push(in_review_key(&r.grade_id));
                }
                (r.tenant_id.to_string(), links, serde_json::to_string(r)?)
            }
            Mutation::Override(r) => (
                r.tenant_id.to_string(),
                vec![r.grade_id.to_string()],
                serde_json::to_string(r)?,
            ),
        };
        Ok(Self {
            id: None,
            doc_key: mutation.key(),
            tenant_key,
            links,
            created_seq,
            rev: mutation.version() + 1,
            body,
        })
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> StorageResult<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            StorageError::Serialization(format!("row {} is not decodable: {e}", self.doc_key))
        })
    }
}

impl OutboxRow {
    pub fn from_event(event: &AuditEvent) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            event_id: event.event_id.to_string(),
            seq: event.seq,
            delivered: false,
            body: serde_json::to_string(event)?,
        })
    }

    pub fn decode(&self) -> StorageResult<AuditEvent> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

pub const OUTBOX_TABLE: &str = "audit_outbox";
pub const COUNTERS_RECORD: &str = "gradeguard_meta:counters";
