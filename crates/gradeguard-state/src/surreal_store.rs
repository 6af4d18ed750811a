//! SurrealDB-backed GradebookStore implementation
//!
//! Records live as [`DocumentRow`]s; audit events as [`OutboxRow`]s.
//! A commit is one `BEGIN TRANSACTION … COMMIT TRANSACTION` query that
//! re-checks everything it depends on: guard revs are read first, updates
//! only match rows still at the expected `rev`, uniqueness is counted after
//! the writes, and the counters row must not have moved since it was read.
//! Any failed check `THROW`s, which cancels the whole transaction, so
//! several processes may share one database. The in-process writer lock
//! only keeps local commits from cancelling each other.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::fakes::{check_guard, check_version, unique_violation};
use crate::handle::{connect, StoreConfig};
use crate::records::*;
use crate::schema::{
    grade_slot_key, in_review_key, CountersRow, DocumentRow, OutboxRow, COUNTERS_RECORD,
    OUTBOX_TABLE,
};
use crate::storage_traits::*;

/// Prefix of every message the commit transaction throws.
const ABORT: &str = "gradeguard-abort|";

/// SurrealDB-backed implementation of [`GradebookStore`].
pub struct SurrealGradebookStore {
    db: Surreal<Any>,
    writer: Mutex<()>,
}

impl SurrealGradebookStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::open(&StoreConfig::in_memory()).await
    }

    /// Create from environment variables (see [`StoreConfig::from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        Self::open(&StoreConfig::from_env()?).await
    }

    pub async fn open(config: &StoreConfig) -> crate::Result<Self> {
        let db = connect(config).await?;
        let store = Self::with_connection(db);

        let counters = store.load_counters().await.map_err(|e| {
            StateError::Query(format!("reading counters: {e}"))
        })?;
        info!(
            last_seq = counters.last_seq,
            last_row = counters.last_row,
            "SurrealGradebookStore ready"
        );
        Ok(store)
    }

    /// Wrap a connection whose schema is already in place. Stores built on
    /// clones of one connection behave like separate processes sharing a
    /// database.
    pub fn with_connection(db: Surreal<Any>) -> Self {
        Self {
            db,
            writer: Mutex::new(()),
        }
    }

    pub fn connection(&self) -> Surreal<Any> {
        self.db.clone()
    }

    // -- private helpers -----------------------------------------------------

    async fn load_counters(&self) -> StorageResult<CountersRow> {
        let mut res = self
            .db
            .query(format!("SELECT * FROM {COUNTERS_RECORD}"))
            .await?;
        let rows: Vec<CountersRow> = res.take(0)?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    async fn fetch_row(&self, table: Table, key: &str) -> StorageResult<Option<DocumentRow>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT * FROM {} WHERE doc_key = $key",
                table.as_str()
            ))
            .bind(("key", key.to_string()))
            .await?;
        let rows: Vec<DocumentRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn stored_rev(&self, table: Table, key: &str) -> StorageResult<Option<u64>> {
        Ok(self.fetch_row(table, key).await?.map(|row| row.rev))
    }

    async fn fetch_one<T: DeserializeOwned>(
        &self,
        table: Table,
        key: String,
    ) -> StorageResult<Option<T>> {
        self.fetch_row(table, &key)
            .await?
            .map(|row| row.decode())
            .transpose()
    }

    async fn fetch_linked<T: DeserializeOwned>(
        &self,
        table: Table,
        link: String,
    ) -> StorageResult<Vec<T>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT * FROM {} WHERE links CONTAINS $link ORDER BY created_seq ASC",
                table.as_str()
            ))
            .bind(("link", link))
            .await?;
        let rows: Vec<DocumentRow> = res.take(0)?;
        rows.iter().map(|row| row.decode()).collect()
    }

    /// Turn a cancelled transaction into the `StorageError` the trait
    /// promises, re-reading revs so `Conflict` reports what it found.
    async fn abort_error(
        &self,
        changes: &ChangeSet,
        counters: &CountersRow,
        mut errors: Vec<(usize, surrealdb::Error)>,
    ) -> StorageError {
        errors.sort_by_key(|(index, _)| *index);
        let messages: Vec<String> = errors.iter().map(|(_, e)| e.to_string()).collect();

        let thrown = messages
            .iter()
            .find_map(|m| m.find(ABORT).map(|at| m[at + ABORT.len()..].to_string()));
        let Some(thrown) = thrown else {
            if messages.iter().any(|m| m.contains("already contains")) {
                return self.insert_race(changes).await;
            }
            return StorageError::Backend(messages.join("; "));
        };

        let mut parts = thrown.split('|');
        let kind = parts.next().unwrap_or_default();
        let index: Option<usize> = parts.next().and_then(|raw| {
            let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        });

        let resolved = match (kind, index) {
            ("unique", Some(i)) if i < changes.mutations.len() => {
                Ok(unique_violation(&changes.mutations[i]))
            }
            ("guard", Some(i)) if i < changes.guards.len() => {
                let guard = &changes.guards[i];
                self.stored_rev(guard.table, &guard.key).await.map(|stored| {
                    check_guard(guard, stored)
                        .err()
                        .unwrap_or_else(|| moved(guard.table, &guard.key))
                })
            }
            ("write", Some(i)) if i < changes.mutations.len() => {
                let mutation = &changes.mutations[i];
                let (table, key) = (mutation.table(), mutation.key());
                self.stored_rev(table, &key).await.map(|stored| {
                    check_version(mutation, stored)
                        .err()
                        .unwrap_or_else(|| moved(table, &key))
                })
            }
            ("counters", _) => self.load_counters().await.map(|now| StorageError::Conflict {
                table: "gradeguard_meta".to_string(),
                key: "counters".to_string(),
                expected: counters.last_seq,
                found: now.last_seq,
            }),
            _ => Ok(StorageError::Backend(format!("commit aborted: {thrown}"))),
        };
        resolved.unwrap_or_else(|read_err| read_err)
    }

    /// A concurrent insert took one of our new keys first.
    async fn insert_race(&self, changes: &ChangeSet) -> StorageError {
        for mutation in changes.mutations.iter().filter(|m| m.version() == 0) {
            match self.stored_rev(mutation.table(), &mutation.key()).await {
                Ok(stored) => {
                    if let Err(err) = check_version(mutation, stored) {
                        return err;
                    }
                }
                Err(read_err) => return read_err,
            }
        }
        StorageError::Backend("commit aborted: duplicate key".to_string())
    }
}

/// The rev matched again by the time it was re-read; still a lost race.
fn moved(table: Table, key: &str) -> StorageError {
    StorageError::Backend(format!(
        "commit aborted on {}/{key}: record moved during commit",
        table.as_str()
    ))
}

/// Statement text plus bound parameters for one commit transaction.
///
/// Statements land in three groups: reads of guarded revs, writes, and the
/// checks that run last. Checks are ordered so a duplicate reports its
/// constraint ahead of the version race that usually accompanies it.
#[derive(Default)]
struct TxBuilder {
    reads: Vec<String>,
    writes: Vec<String>,
    unique_checks: Vec<String>,
    guard_checks: Vec<String>,
    write_checks: Vec<String>,
    doc_binds: Vec<(String, DocumentRow)>,
    outbox_binds: Vec<(String, OutboxRow)>,
    text_binds: Vec<(String, String)>,
    number_binds: Vec<(String, u64)>,
}

impl TxBuilder {
    fn text(&mut self, value: String) -> String {
        let var = format!("t{}", self.text_binds.len());
        self.text_binds.push((var.clone(), value));
        var
    }

    fn number(&mut self, value: u64) -> String {
        let var = format!("n{}", self.number_binds.len());
        self.number_binds.push((var.clone(), value));
        var
    }

    fn guard(&mut self, index: usize, guard: &Guard) {
        let key = self.text(guard.key.clone());
        let rev = self.number(guard.version);
        self.reads.push(format!(
            "LET $g{index} = array::len((SELECT doc_key FROM {} WHERE doc_key = ${key} AND rev = ${rev}));",
            guard.table.as_str()
        ));
        self.guard_checks.push(format!(
            "IF $g{index} == 0 {{ THROW \"{ABORT}guard|{index}\" }};"
        ));
    }

    fn insert(&mut self, table: Table, row: DocumentRow) {
        let var = format!("d{}", self.doc_binds.len());
        self.writes
            .push(format!("CREATE {} CONTENT ${var};", table.as_str()));
        self.doc_binds.push((var, row));
    }

    fn update(&mut self, index: usize, table: Table, expected: u64, row: DocumentRow) {
        let var = format!("d{}", self.doc_binds.len());
        let key = self.text(row.doc_key.clone());
        let rev = self.number(expected);
        self.writes.push(format!(
            "LET $w{index} = (UPDATE {} SET rev = ${var}.rev, links = ${var}.links, body = ${var}.body WHERE doc_key = ${key} AND rev = ${rev});",
            table.as_str()
        ));
        self.write_checks.push(format!(
            "IF array::len($w{index}) == 0 {{ THROW \"{ABORT}write|{index}\" }};"
        ));
        self.doc_binds.push((var, row));
    }

    /// At most one row of `table` may carry `link` once the writes land.
    fn unique(&mut self, index: usize, table: Table, link: String) {
        let link = self.text(link);
        self.unique_checks.push(format!(
            "IF array::len((SELECT doc_key FROM {} WHERE links CONTAINS ${link})) > 1 {{ THROW \"{ABORT}unique|{index}\" }};",
            table.as_str()
        ));
    }

    fn append_event(&mut self, row: OutboxRow) {
        let var = format!("e{}", self.outbox_binds.len());
        self.writes
            .push(format!("CREATE {OUTBOX_TABLE} CONTENT ${var};"));
        self.outbox_binds.push((var, row));
    }

    fn sql(&self) -> String {
        let mut sql = String::from("BEGIN TRANSACTION;\n");
        sql.push_str(&format!(
            "LET $meta = array::first((SELECT last_seq, last_row FROM {COUNTERS_RECORD}));\n"
        ));
        let groups = [
            &self.reads,
            &self.writes,
            &self.unique_checks,
            &self.guard_checks,
            &self.write_checks,
        ];
        for stmt in groups.into_iter().flatten() {
            sql.push_str(stmt);
            sql.push('\n');
        }
        sql.push_str(&format!(
            "IF ($meta.last_seq ?? 0) != $prev_seq OR ($meta.last_row ?? 0) != $prev_row {{ THROW \"{ABORT}counters\" }};\n"
        ));
        sql.push_str(&format!(
            "UPSERT {COUNTERS_RECORD} SET last_seq = $last_seq, last_row = $last_row;\n"
        ));
        sql.push_str("COMMIT TRANSACTION;");
        sql
    }
}

#[async_trait]
impl GradebookStore for SurrealGradebookStore {
    async fn get_cycle(&self, id: &ExamCycleId) -> StorageResult<Option<ExamCycle>> {
        self.fetch_one(Table::ExamCycles, id.to_string()).await
    }

    async fn list_cycles(&self, tenant_id: &TenantId) -> StorageResult<Vec<ExamCycle>> {
        let mut res = self
            .db
            .query("SELECT * FROM exam_cycles WHERE tenant_key = $tenant ORDER BY created_seq ASC")
            .bind(("tenant", tenant_id.to_string()))
            .await?;
        let rows: Vec<DocumentRow> = res.take(0)?;
        rows.iter().map(|row| row.decode()).collect()
    }

    async fn cycles_covering(
        &self,
        assessment_id: &AssessmentId,
    ) -> StorageResult<Vec<ExamCycle>> {
        self.fetch_linked(Table::ExamCycles, assessment_id.to_string())
            .await
    }

    async fn get_assessment(&self, id: &AssessmentId) -> StorageResult<Option<Assessment>> {
        self.fetch_one(Table::Assessments, id.to_string()).await
    }

    async fn get_grade(&self, id: &GradeId) -> StorageResult<Option<Grade>> {
        self.fetch_one(Table::Grades, id.to_string()).await
    }

    async fn find_grade(
        &self,
        assessment_id: &AssessmentId,
        student_id: &StudentId,
    ) -> StorageResult<Option<Grade>> {
        let grades: Vec<Grade> = self
            .fetch_linked(Table::Grades, grade_slot_key(assessment_id, student_id))
            .await?;
        Ok(grades.into_iter().next())
    }

    async fn grades_for_assessment(
        &self,
        assessment_id: &AssessmentId,
    ) -> StorageResult<Vec<Grade>> {
        self.fetch_linked(Table::Grades, assessment_id.to_string())
            .await
    }

    async fn get_moderation(&self, id: &ModerationId) -> StorageResult<Option<GradeModeration>> {
        self.fetch_one(Table::GradeModerations, id.to_string())
            .await
    }

    async fn moderations_for_grade(
        &self,
        grade_id: &GradeId,
    ) -> StorageResult<Vec<GradeModeration>> {
        self.fetch_linked(Table::GradeModerations, grade_id.to_string())
            .await
    }

    async fn get_override(&self, id: &OverrideId) -> StorageResult<Option<PostLockGradeChange>> {
        self.fetch_one(Table::PostLockChanges, id.to_string()).await
    }

    async fn overrides_for_grade(
        &self,
        grade_id: &GradeId,
    ) -> StorageResult<Vec<PostLockGradeChange>> {
        self.fetch_linked(Table::PostLockChanges, grade_id.to_string())
            .await
    }

    async fn commit(&self, changes: ChangeSet) -> StorageResult<CommitReceipt> {
        let _writer = self.writer.lock().await;
        let counters = self.load_counters().await?;
        let mut last_row = counters.last_row;
        let mut tx = TxBuilder::default();

        for (index, guard) in changes.guards.iter().enumerate() {
            tx.guard(index, guard);
        }

        for (index, mutation) in changes.mutations.iter().enumerate() {
            let table = mutation.table();
            if mutation.version() == 0 {
                last_row += 1;
                tx.insert(table, DocumentRow::from_mutation(mutation, last_row)?);
            } else {
                let row = DocumentRow::from_mutation(mutation, 0)?;
                tx.update(index, table, mutation.version(), row);
            }
            match mutation {
                Mutation::Moderation(m) if m.is_in_review() => {
                    tx.unique(index, table, in_review_key(&m.grade_id));
                }
                Mutation::Grade(g) => {
                    tx.unique(index, table, grade_slot_key(&g.assessment_id, &g.student_id));
                }
                _ => {}
            }
        }

        let mut last_seq = counters.last_seq;
        let mut committed = Vec::with_capacity(changes.events.len());
        for event in &changes.events {
            let mut event = event.clone();
            last_seq += 1;
            event.seq = last_seq;
            tx.append_event(OutboxRow::from_event(&event)?);
            committed.push(event);
        }

        let mut query = self.db.query(tx.sql());
        for (var, row) in tx.doc_binds {
            query = query.bind((var, row));
        }
        for (var, row) in tx.outbox_binds {
            query = query.bind((var, row));
        }
        for (var, value) in tx.text_binds {
            query = query.bind((var, value));
        }
        for (var, value) in tx.number_binds {
            query = query.bind((var, value));
        }
        query = query
            .bind(("prev_seq", counters.last_seq))
            .bind(("prev_row", counters.last_row))
            .bind(("last_seq", last_seq))
            .bind(("last_row", last_row));

        let mut response = query.await?;
        let errors: Vec<(usize, surrealdb::Error)> = response.take_errors().into_iter().collect();
        if !errors.is_empty() {
            let err = self.abort_error(&changes, &counters, errors).await;
            debug!(error = %err, "commit aborted");
            return Err(err);
        }

        debug!(
            mutations = changes.mutations.len(),
            events = committed.len(),
            last_seq,
            "commit applied"
        );
        Ok(CommitReceipt { events: committed })
    }

    async fn pending_audit(&self, limit: usize) -> StorageResult<Vec<AuditEvent>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT * FROM {OUTBOX_TABLE} WHERE delivered = false ORDER BY seq ASC LIMIT {limit}"
            ))
            .await?;
        let rows: Vec<OutboxRow> = res.take(0)?;
        rows.iter().map(|row| row.decode()).collect()
    }

    async fn mark_audit_delivered(&self, event_id: &AuditRecordId) -> StorageResult<()> {
        self.db
            .query(format!(
                "UPDATE {OUTBOX_TABLE} SET delivered = true WHERE event_id = $eid"
            ))
            .bind(("eid", event_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }
}
