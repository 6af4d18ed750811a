//! The GradeGuard service facade.
//!
//! [`GradeGuardService`] owns a store, an audit sink, a clock and the
//! workflow config. Operations live next to their rules in
//! `exam_cycle`, `moderation`, `override_control` and `grades`, each as an
//! `impl` block on this type; this module holds the plumbing they share:
//! tenant-scoped loading, event construction, and the commit-then-relay
//! step.

use std::sync::Arc;

use gradeguard_state::{
    Assessment, AssessmentId, AuditEvent, AuditRecordId, ChangeSet, CommitReceipt, EntityKind,
    EntityRef, ExamCycle, ExamCycleId, Grade, GradeId, GradeModeration, GradebookStore,
    ModerationId, OverrideId, PostLockGradeChange, ScoreChange, StorageError, Table, TenantId,
    IN_REVIEW_MODERATION_CONSTRAINT,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::audit::{relay_pending, AuditSink};
use crate::config::GradeGuardConfig;
use crate::domain::{Actor, Clock, GradeGuardError, Result, SystemClock};
use crate::metrics::METRICS;
use crate::obs;

/// Outcome of a mutating operation.
///
/// `audit_id` is the primary audit event written by the commit, or `None`
/// when the operation found its target state already in place and wrote
/// nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Committed<T> {
    pub entity: T,
    pub audit_id: Option<AuditRecordId>,
}

impl<T> Committed<T> {
    pub(crate) fn new(entity: T, receipt: &CommitReceipt) -> Self {
        Self {
            entity,
            audit_id: receipt.first_event_id(),
        }
    }

    pub(crate) fn unchanged(entity: T) -> Self {
        Self {
            entity,
            audit_id: None,
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.audit_id.is_none()
    }
}

/// Records carry the version they were read at; a commit stores `version + 1`.
pub(crate) trait Versioned {
    fn version_mut(&mut self) -> &mut u64;

    /// The record as the store holds it after a successful commit.
    fn stored(mut self) -> Self
    where
        Self: Sized,
    {
        *self.version_mut() += 1;
        self
    }
}

macro_rules! versioned {
    ($($ty:ty),*) => {
        $(impl Versioned for $ty {
            fn version_mut(&mut self) -> &mut u64 {
                &mut self.version
            }
        })*
    };
}

versioned!(ExamCycle, Assessment, Grade, GradeModeration, PostLockGradeChange);

pub struct GradeGuardService<S, A> {
    pub(crate) store: S,
    pub(crate) sink: A,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: GradeGuardConfig,
    /// One relay at a time, so concurrent commits never hand the sink the
    /// same pending event twice.
    relay: Mutex<()>,
}

impl<S, A> GradeGuardService<S, A>
where
    S: GradebookStore,
    A: AuditSink,
{
    /// Service with the wall clock and default config.
    pub fn new(store: S, sink: A) -> Self {
        Self {
            store,
            sink,
            clock: Arc::new(SystemClock),
            config: GradeGuardConfig::default(),
            relay: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: GradeGuardConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sink(&self) -> &A {
        &self.sink
    }

    pub fn config(&self) -> &GradeGuardConfig {
        &self.config
    }

    /// Deliver any audit events still waiting in the outbox.
    pub async fn relay_audit(&self) -> Result<usize> {
        Ok(self.relay_outbox().await?)
    }

    async fn relay_outbox(&self) -> gradeguard_state::StorageResult<usize> {
        let _relay = self.relay.lock().await;
        relay_pending(&self.store, &self.sink).await
    }

    // -- reads ---------------------------------------------------------------

    pub async fn get_cycle(&self, actor: &Actor, id: &ExamCycleId) -> Result<ExamCycle> {
        self.load_cycle(actor, id).await
    }

    pub async fn list_cycles(&self, actor: &Actor) -> Result<Vec<ExamCycle>> {
        Ok(self.store.list_cycles(&actor.tenant).await?)
    }

    pub async fn get_assessment(&self, actor: &Actor, id: &AssessmentId) -> Result<Assessment> {
        self.load_assessment(actor, id).await
    }

    pub async fn get_grade(&self, actor: &Actor, id: &GradeId) -> Result<Grade> {
        self.load_grade(actor, id).await
    }

    pub async fn grades_for_assessment(
        &self,
        actor: &Actor,
        id: &AssessmentId,
    ) -> Result<Vec<Grade>> {
        self.load_assessment(actor, id).await?;
        Ok(self.store.grades_for_assessment(id).await?)
    }

    pub async fn get_moderation(
        &self,
        actor: &Actor,
        id: &ModerationId,
    ) -> Result<GradeModeration> {
        self.load_moderation(actor, id).await
    }

    /// Moderation history of a grade, oldest first.
    pub async fn moderations_for_grade(
        &self,
        actor: &Actor,
        grade_id: &GradeId,
    ) -> Result<Vec<GradeModeration>> {
        self.load_grade(actor, grade_id).await?;
        Ok(self.store.moderations_for_grade(grade_id).await?)
    }

    pub async fn get_override(
        &self,
        actor: &Actor,
        id: &OverrideId,
    ) -> Result<PostLockGradeChange> {
        self.load_override(actor, id).await
    }

    pub async fn overrides_for_grade(
        &self,
        actor: &Actor,
        grade_id: &GradeId,
    ) -> Result<Vec<PostLockGradeChange>> {
        self.load_grade(actor, grade_id).await?;
        Ok(self.store.overrides_for_grade(grade_id).await?)
    }

    // -- shared plumbing -----------------------------------------------------

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub(crate) async fn load_cycle(&self, actor: &Actor, id: &ExamCycleId) -> Result<ExamCycle> {
        let cycle = self.store.get_cycle(id).await?;
        visible(actor, cycle, |c| &c.tenant_id, EntityKind::ExamCycle, id)
    }

    pub(crate) async fn load_assessment(
        &self,
        actor: &Actor,
        id: &AssessmentId,
    ) -> Result<Assessment> {
        let assessment = self.store.get_assessment(id).await?;
        visible(actor, assessment, |a| &a.tenant_id, EntityKind::Assessment, id)
    }

    pub(crate) async fn load_grade(&self, actor: &Actor, id: &GradeId) -> Result<Grade> {
        let grade = self.store.get_grade(id).await?;
        visible(actor, grade, |g| &g.tenant_id, EntityKind::Grade, id)
    }

    pub(crate) async fn load_moderation(
        &self,
        actor: &Actor,
        id: &ModerationId,
    ) -> Result<GradeModeration> {
        let moderation = self.store.get_moderation(id).await?;
        visible(
            actor,
            moderation,
            |m| &m.tenant_id,
            EntityKind::GradeModeration,
            id,
        )
    }

    pub(crate) async fn load_override(
        &self,
        actor: &Actor,
        id: &OverrideId,
    ) -> Result<PostLockGradeChange> {
        let change = self.store.get_override(id).await?;
        visible(
            actor,
            change,
            |c| &c.tenant_id,
            EntityKind::PostLockGradeChange,
            id,
        )
    }

    /// Cycles covering an assessment, plus a locked one if there is any.
    pub(crate) async fn covering_cycles(
        &self,
        assessment_id: &AssessmentId,
    ) -> Result<(Vec<ExamCycle>, Option<ExamCycleId>)> {
        let cycles = self.store.cycles_covering(assessment_id).await?;
        let locked = cycles.iter().find(|c| c.is_locked()).map(|c| c.id);
        Ok((cycles, locked))
    }

    /// Fail with `GradeLocked` if a covering cycle is locked; otherwise
    /// return a change set guarded on every covering cycle, so a lock that
    /// lands before the commit turns the write into a conflict.
    pub(crate) async fn unlocked_write(&self, grade: &Grade) -> Result<(ChangeSet, Vec<ExamCycle>)> {
        let (cycles, locked) = self.covering_cycles(&grade.assessment_id).await?;
        if let Some(exam_cycle_id) = locked {
            return Err(GradeGuardError::GradeLocked {
                grade_id: grade.id,
                exam_cycle_id,
            });
        }
        let changes = guard_cycles(ChangeSet::new(), &cycles);
        Ok((changes, cycles))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn event(
        &self,
        actor: &Actor,
        entity: EntityRef,
        operation: &str,
        from_state: Option<&str>,
        to_state: Option<&str>,
        score_change: Option<ScoreChange>,
    ) -> AuditEvent {
        AuditEvent::new(
            actor.tenant.clone(),
            actor.id.clone(),
            self.now(),
            entity,
            operation,
            from_state.map(str::to_string),
            to_state.map(str::to_string),
            score_change,
        )
    }

    /// Commit, classify storage failures, then relay the outbox.
    ///
    /// Relay failures never fail the operation: the state change is already
    /// durable and its events stay queued.
    pub(crate) async fn commit(
        &self,
        operation: &str,
        entity: &EntityRef,
        changes: ChangeSet,
    ) -> Result<CommitReceipt> {
        let receipt = self.store.commit(changes).await.map_err(classify)?;
        METRICS.inc_commits();
        obs::emit_committed(operation, entity, receipt.events.len());

        if let Err(e) = self.relay_outbox().await {
            warn!(event = "audit.relay_error", error = %e, "audit relay deferred");
        }
        Ok(receipt)
    }

    pub(crate) fn no_op<T>(&self, operation: &str, entity: &EntityRef, value: T) -> Committed<T> {
        METRICS.inc_no_ops();
        obs::emit_no_op(operation, entity);
        Committed::unchanged(value)
    }
}

/// Tenant-scoped visibility: another tenant's record reads as missing.
fn visible<T>(
    actor: &Actor,
    record: Option<T>,
    tenant_of: impl Fn(&T) -> &TenantId,
    entity: EntityKind,
    id: &impl ToString,
) -> Result<T> {
    match record {
        Some(r) if actor.can_see(tenant_of(&r)) => Ok(r),
        _ => Err(GradeGuardError::not_found(entity, id.to_string())),
    }
}

pub(crate) fn cycle_ref(cycle: &ExamCycle) -> EntityRef {
    EntityRef::new(EntityKind::ExamCycle, cycle.id)
}

pub(crate) fn assessment_ref(assessment: &Assessment) -> EntityRef {
    EntityRef::new(EntityKind::Assessment, assessment.id)
}

pub(crate) fn grade_ref(grade: &Grade) -> EntityRef {
    EntityRef::new(EntityKind::Grade, grade.id)
}

pub(crate) fn moderation_ref(moderation: &GradeModeration) -> EntityRef {
    EntityRef::new(EntityKind::GradeModeration, moderation.id)
}

pub(crate) fn override_ref(change: &PostLockGradeChange) -> EntityRef {
    EntityRef::new(EntityKind::PostLockGradeChange, change.id)
}

pub(crate) fn guard_cycles(mut changes: ChangeSet, cycles: &[ExamCycle]) -> ChangeSet {
    for cycle in cycles {
        changes = changes.expect(Table::ExamCycles, cycle.id, cycle.version);
    }
    changes
}

fn classify(err: StorageError) -> GradeGuardError {
    match &err {
        StorageError::UniqueViolation { constraint, key }
            if constraint == IN_REVIEW_MODERATION_CONSTRAINT =>
        {
            match GradeId::parse(key) {
                Some(grade_id) => GradeGuardError::DuplicateInFlight { grade_id },
                None => GradeGuardError::Persistence(err),
            }
        }
        StorageError::Conflict { .. } => {
            METRICS.inc_commit_conflicts();
            obs::emit_commit_conflict(&err);
            GradeGuardError::Persistence(err)
        }
        _ => GradeGuardError::Persistence(err),
    }
}
