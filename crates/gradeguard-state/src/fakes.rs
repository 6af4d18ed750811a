//! In-memory `GradebookStore` (testing and embedding)
//!
//! `MemoryGradebookStore` satisfies the full trait contract without any
//! external dependencies. Commits are staged on a copy of the tables and
//! swapped in only after every version and uniqueness check passes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::records::*;
use crate::storage_traits::*;

/// Rows keyed by primary key, remembering insertion order.
#[derive(Debug, Clone)]
struct Rows<T> {
    by_key: HashMap<String, T>,
    order: Vec<String>,
}

impl<T> Default for Rows<T> {
    fn default() -> Self {
        Self {
            by_key: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<T: Clone> Rows<T> {
    fn get(&self, key: &str) -> Option<&T> {
        self.by_key.get(key)
    }

    fn put(&mut self, key: String, row: T) {
        if !self.by_key.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.by_key.insert(key, row);
    }

    fn ordered(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|k| self.by_key.get(k))
    }
}

#[derive(Debug, Clone)]
struct OutboxEntry {
    event: AuditEvent,
    delivered: bool,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    cycles: Rows<ExamCycle>,
    assessments: Rows<Assessment>,
    grades: Rows<Grade>,
    moderations: Rows<GradeModeration>,
    overrides: Rows<PostLockGradeChange>,
    outbox: Vec<OutboxEntry>,
    last_seq: u64,
}

impl Tables {
    fn stored_version(&self, table: Table, key: &str) -> Option<u64> {
        match table {
            Table::ExamCycles => self.cycles.get(key).map(|r| r.version),
            Table::Assessments => self.assessments.get(key).map(|r| r.version),
            Table::Grades => self.grades.get(key).map(|r| r.version),
            Table::GradeModerations => self.moderations.get(key).map(|r| r.version),
            Table::PostLockChanges => self.overrides.get(key).map(|r| r.version),
        }
    }

    /// Stage a mutation without checking its version.
    fn put(&mut self, mutation: &Mutation) {
        let key = mutation.key();
        match mutation.committed() {
            Mutation::Cycle(r) => self.cycles.put(key, r),
            Mutation::Assessment(r) => self.assessments.put(key, r),
            Mutation::Grade(r) => self.grades.put(key, r),
            Mutation::Moderation(r) => self.moderations.put(key, r),
            Mutation::Override(r) => self.overrides.put(key, r),
        }
    }

    fn check_unique(&self, mutation: &Mutation) -> StorageResult<()> {
        match mutation {
            Mutation::Moderation(m) if m.is_in_review() => {
                let in_review = self
                    .moderations
                    .ordered()
                    .filter(|o| o.grade_id == m.grade_id && o.is_in_review())
                    .count();
                if in_review > 1 {
                    return Err(unique_violation(mutation));
                }
            }
            Mutation::Grade(g) => {
                let same_slot = self
                    .grades
                    .ordered()
                    .filter(|o| o.assessment_id == g.assessment_id && o.student_id == g.student_id)
                    .count();
                if same_slot > 1 {
                    return Err(unique_violation(mutation));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// The constraint a mutation of this kind can violate.
pub(crate) fn unique_violation(mutation: &Mutation) -> StorageError {
    match mutation {
        Mutation::Grade(g) => StorageError::UniqueViolation {
            constraint: GRADE_PER_STUDENT_CONSTRAINT.to_string(),
            key: format!("{}/{}", g.assessment_id, g.student_id),
        },
        Mutation::Moderation(m) => StorageError::UniqueViolation {
            constraint: IN_REVIEW_MODERATION_CONSTRAINT.to_string(),
            key: m.grade_id.to_string(),
        },
        other => StorageError::Backend(format!(
            "no unique constraint on {}",
            other.table().as_str()
        )),
    }
}

/// Shared version check: `0` means insert, anything else means update.
pub(crate) fn check_version(mutation: &Mutation, stored: Option<u64>) -> StorageResult<()> {
    let table = mutation.table().as_str().to_string();
    let key = mutation.key();
    match (mutation.version(), stored) {
        (0, None) => Ok(()),
        (0, Some(found)) => Err(StorageError::Conflict {
            table,
            key,
            expected: 0,
            found,
        }),
        (_, None) => Err(StorageError::MissingRecord { table, key }),
        (expected, Some(found)) if expected != found => Err(StorageError::Conflict {
            table,
            key,
            expected,
            found,
        }),
        _ => Ok(()),
    }
}

/// Shared guard check: the record must exist at exactly `guard.version`.
pub(crate) fn check_guard(guard: &Guard, stored: Option<u64>) -> StorageResult<()> {
    match stored {
        None => Err(StorageError::MissingRecord {
            table: guard.table.as_str().to_string(),
            key: guard.key.clone(),
        }),
        Some(found) if found != guard.version => Err(StorageError::Conflict {
            table: guard.table.as_str().to_string(),
            key: guard.key.clone(),
            expected: guard.version,
            found,
        }),
        Some(_) => Ok(()),
    }
}

/// In-memory gradebook backed by `HashMap`s behind a single mutex.
#[derive(Debug, Default)]
pub struct MemoryGradebookStore {
    tables: Mutex<Tables>,
}

impl MemoryGradebookStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    /// Every committed event, delivered or not, in `seq` order.
    pub fn audit_log(&self) -> StorageResult<Vec<AuditEvent>> {
        let tables = self.lock()?;
        let events = tables.outbox.iter().map(|e| e.event.clone()).collect();
        Ok(events)
    }
}

#[async_trait]
impl GradebookStore for MemoryGradebookStore {
    async fn get_cycle(&self, id: &ExamCycleId) -> StorageResult<Option<ExamCycle>> {
        Ok(self.lock()?.cycles.get(&id.to_string()).cloned())
    }

    async fn list_cycles(&self, tenant_id: &TenantId) -> StorageResult<Vec<ExamCycle>> {
        let tables = self.lock()?;
        let cycles = tables
            .cycles
            .ordered()
            .filter(|c| &c.tenant_id == tenant_id)
            .cloned()
            .collect();
        Ok(cycles)
    }

    async fn cycles_covering(
        &self,
        assessment_id: &AssessmentId,
    ) -> StorageResult<Vec<ExamCycle>> {
        let tables = self.lock()?;
        let cycles = tables
            .cycles
            .ordered()
            .filter(|c| c.covers(assessment_id))
            .cloned()
            .collect();
        Ok(cycles)
    }

    async fn get_assessment(&self, id: &AssessmentId) -> StorageResult<Option<Assessment>> {
        Ok(self.lock()?.assessments.get(&id.to_string()).cloned())
    }

    async fn get_grade(&self, id: &GradeId) -> StorageResult<Option<Grade>> {
        Ok(self.lock()?.grades.get(&id.to_string()).cloned())
    }

    async fn find_grade(
        &self,
        assessment_id: &AssessmentId,
        student_id: &StudentId,
    ) -> StorageResult<Option<Grade>> {
        let tables = self.lock()?;
        let grade = tables
            .grades
            .ordered()
            .find(|g| &g.assessment_id == assessment_id && &g.student_id == student_id)
            .cloned();
        Ok(grade)
    }

    async fn grades_for_assessment(
        &self,
        assessment_id: &AssessmentId,
    ) -> StorageResult<Vec<Grade>> {
        let tables = self.lock()?;
        let grades = tables
            .grades
            .ordered()
            .filter(|g| &g.assessment_id == assessment_id)
            .cloned()
            .collect();
        Ok(grades)
    }

    async fn get_moderation(&self, id: &ModerationId) -> StorageResult<Option<GradeModeration>> {
        Ok(self.lock()?.moderations.get(&id.to_string()).cloned())
    }

    async fn moderations_for_grade(
        &self,
        grade_id: &GradeId,
    ) -> StorageResult<Vec<GradeModeration>> {
        let tables = self.lock()?;
        let moderations = tables
            .moderations
            .ordered()
            .filter(|m| &m.grade_id == grade_id)
            .cloned()
            .collect();
        Ok(moderations)
    }

    async fn get_override(&self, id: &OverrideId) -> StorageResult<Option<PostLockGradeChange>> {
        Ok(self.lock()?.overrides.get(&id.to_string()).cloned())
    }

    async fn overrides_for_grade(
        &self,
        grade_id: &GradeId,
    ) -> StorageResult<Vec<PostLockGradeChange>> {
        let tables = self.lock()?;
        let overrides = tables
            .overrides
            .ordered()
            .filter(|o| &o.grade_id == grade_id)
            .cloned()
            .collect();
        Ok(overrides)
    }

    async fn commit(&self, changes: ChangeSet) -> StorageResult<CommitReceipt> {
        let mut tables = self.lock()?;
        let mut staged = tables.clone();
        for mutation in &changes.mutations {
            staged.put(mutation);
        }

        // Constraints are judged before versions: a losing duplicate reports
        // the constraint it would break.
        for mutation in &changes.mutations {
            staged.check_unique(mutation)?;
        }
        for guard in &changes.guards {
            check_guard(guard, tables.stored_version(guard.table, &guard.key))?;
        }
        let mut written: HashMap<(Table, String), u64> = HashMap::new();
        for mutation in &changes.mutations {
            let slot = (mutation.table(), mutation.key());
            let stored = match written.get(&slot) {
                Some(version) => Some(*version),
                None => tables.stored_version(slot.0, &slot.1),
            };
            check_version(mutation, stored)?;
            written.insert(slot, mutation.version() + 1);
        }

        let mut committed = Vec::with_capacity(changes.events.len());
        for mut event in changes.events {
            staged.last_seq += 1;
            event.seq = staged.last_seq;
            staged.outbox.push(OutboxEntry {
                event: event.clone(),
                delivered: false,
            });
            committed.push(event);
        }

        *tables = staged;
        Ok(CommitReceipt { events: committed })
    }

    async fn pending_audit(&self, limit: usize) -> StorageResult<Vec<AuditEvent>> {
        let tables = self.lock()?;
        let pending = tables
            .outbox
            .iter()
            .filter(|e| !e.delivered)
            .take(limit)
            .map(|e| e.event.clone())
            .collect();
        Ok(pending)
    }

    async fn mark_audit_delivered(&self, event_id: &AuditRecordId) -> StorageResult<()> {
        let mut tables = self.lock()?;
        if let Some(entry) = tables
            .outbox
            .iter_mut()
            .find(|e| &e.event.event_id == event_id)
        {
            entry.delivered = true;
        }
        Ok(())
    }
}
