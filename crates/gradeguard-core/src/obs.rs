//! Structured observability hooks for GradeGuard operations.
//!
//! Every line carries an `event = "..."` field so log pipelines can key on
//! it. Operation spans come from `#[instrument]` on the service methods;
//! this module covers what happens at the commit and relay boundaries.

use gradeguard_state::{AuditEvent, EntityRef, StorageError};
use tracing::{debug, info, warn};

/// Emit event: an operation committed.
pub fn emit_committed(operation: &str, entity: &EntityRef, events: usize) {
    info!(
        event = "op.committed",
        operation = %operation,
        entity_kind = %entity.kind,
        entity_id = %entity.id,
        audit_events = events,
    );
}

/// Emit event: an operation found its target state already in place.
pub fn emit_no_op(operation: &str, entity: &EntityRef) {
    debug!(
        event = "op.no_op",
        operation = %operation,
        entity_kind = %entity.kind,
        entity_id = %entity.id,
    );
}

/// Emit event: a commit lost an optimistic-concurrency race.
pub fn emit_commit_conflict(error: &StorageError) {
    warn!(event = "op.conflict", error = %error);
}

/// Emit event: a batch of audit events reached the sink.
pub fn emit_audit_relayed(count: usize, last_seq: u64) {
    debug!(event = "audit.relayed", count = count, last_seq = last_seq);
}

/// Emit event: the audit sink refused an event; it stays in the outbox.
pub fn emit_audit_relay_failed(audit: &AuditEvent, error: &dyn std::fmt::Display) {
    warn!(
        event = "audit.relay_failed",
        event_id = %audit.event_id,
        seq = audit.seq,
        error = %error,
    );
}
