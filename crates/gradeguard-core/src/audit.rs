//! Attribution & audit collaborator.
//!
//! Audit events are committed to the store's outbox together with the state
//! change they describe. [`relay_pending`] then hands them to an
//! [`AuditSink`] in commit order. A sink failure stops the relay at that
//! event; it and everything after it stay in the outbox for the next relay,
//! so the sink never sees a gap or a reordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use gradeguard_state::{AuditEvent, GradebookStore, StorageResult};
use tracing::info;

use crate::metrics::METRICS;
use crate::obs;

/// Events fetched from the outbox per round trip.
pub const RELAY_BATCH: usize = 64;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditSinkError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Receiver of committed audit events.
///
/// `record` may be called again with an event it already accepted if the
/// process stops between delivery and the outbox acknowledgement; sinks
/// should treat `event_id` as an idempotency key.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditSinkError>;
}

#[async_trait]
impl<T: AuditSink + ?Sized> AuditSink for std::sync::Arc<T> {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        (**self).record(event).await
    }
}

/// Writes each event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        info!(
            event = "audit.recorded",
            seq = event.seq,
            event_id = %event.event_id,
            tenant = %event.tenant_id,
            actor = %event.actor,
            operation = %event.operation,
            entity_kind = %event.entity.kind,
            entity_id = %event.entity.id,
            from_state = event.from_state.as_deref().unwrap_or("-"),
            to_state = event.to_state.as_deref().unwrap_or("-"),
            score_before = event.score_change.map(|c| c.before),
            score_after = event.score_change.map(|c| c.after),
            digest = %event.digest,
        );
        Ok(())
    }
}

/// Collects events in memory. Can be switched offline to exercise relay
/// retries.
#[derive(Debug)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    available: AtomicBool,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.operation).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AuditSinkError::Unavailable("memory sink offline".into()));
        }
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Drain the outbox into `sink`, oldest first. Returns how many events were
/// delivered; stops early (without error) at the first sink failure.
pub async fn relay_pending(
    store: &dyn GradebookStore,
    sink: &dyn AuditSink,
) -> StorageResult<usize> {
    let mut delivered = 0;
    loop {
        let batch = store.pending_audit(RELAY_BATCH).await?;
        if batch.is_empty() {
            break;
        }
        let batch_len = batch.len();
        let mut last_seq = 0;
        for event in batch {
            if let Err(e) = sink.record(&event).await {
                METRICS.inc_audit_relay_failures();
                obs::emit_audit_relay_failed(&event, &e);
                METRICS.add_audit_relayed(delivered as u64);
                return Ok(delivered);
            }
            store.mark_audit_delivered(&event.event_id).await?;
            last_seq = event.seq;
            delivered += 1;
        }
        obs::emit_audit_relayed(batch_len, last_seq);
        if batch_len < RELAY_BATCH {
            break;
        }
    }
    METRICS.add_audit_relayed(delivered as u64);
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gradeguard_state::{
        ActorId, ChangeSet, EntityKind, EntityRef, GradeId, MemoryGradebookStore, TenantId,
    };

    fn event(op: &str) -> AuditEvent {
        AuditEvent::new(
            TenantId::new("school-a"),
            ActorId::new("officer"),
            Utc::now(),
            EntityRef::new(EntityKind::Grade, GradeId::new()),
            op,
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn relay_stops_at_failure_and_resumes_in_order() {
        let store = MemoryGradebookStore::new();
        let sink = MemoryAuditSink::new();
        store
            .commit(ChangeSet::new().record(event("a")).record(event("b")))
            .await
            .unwrap();

        sink.set_available(false);
        assert_eq!(relay_pending(&store, &sink).await.unwrap(), 0);
        assert_eq!(store.pending_audit(10).await.unwrap().len(), 2);

        store
            .commit(ChangeSet::new().record(event("c")))
            .await
            .unwrap();
        sink.set_available(true);
        assert_eq!(relay_pending(&store, &sink).await.unwrap(), 3);
        assert_eq!(sink.operations(), vec!["a", "b", "c"]);
        assert!(store.pending_audit(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn relay_drains_more_than_one_batch() {
        let store = MemoryGradebookStore::new();
        let sink = MemoryAuditSink::new();
        let mut changes = ChangeSet::new();
        for i in 0..(RELAY_BATCH + 3) {
            changes = changes.record(event(&format!("op-{i}")));
        }
        store.commit(changes).await.unwrap();

        assert_eq!(relay_pending(&store, &sink).await.unwrap(), RELAY_BATCH + 3);
        let seqs: Vec<u64> = sink.events().iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] + 1 == w[1]));
    }

    #[tokio::test]
    async fn tracing_sink_accepts_everything() {
        assert!(TracingAuditSink.record(&event("x")).await.is_ok());
    }
}
