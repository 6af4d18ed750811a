//! Trait contract tests for GradebookStore.
//!
//! Every contract is written once against `&dyn GradebookStore` and run on
//! both the in-memory fake and the SurrealDB store.

use chrono::Utc;
use gradeguard_state::*;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn tenant() -> TenantId {
    TenantId::new("school-a")
}

fn assessment(roster: &[&str]) -> Assessment {
    Assessment {
        id: AssessmentId::new(),
        tenant_id: tenant(),
        name: "Algebra paper 1".into(),
        subject: "mathematics".into(),
        max_score: 100.0,
        roster: roster.iter().map(|s| StudentId::new(*s)).collect(),
        created_at: Utc::now(),
        version: 0,
    }
}

fn grade(assessment_id: AssessmentId, student: &str, score: f64) -> Grade {
    Grade {
        id: GradeId::new(),
        tenant_id: tenant(),
        assessment_id,
        student_id: StudentId::new(student),
        score,
        percentage: score,
        letter_grade: LetterGrade::C,
        remarks: String::new(),
        entered_by: ActorId::new("teacher"),
        updated_at: Utc::now(),
        version: 0,
    }
}

fn cycle(assessment_ids: Vec<AssessmentId>) -> ExamCycle {
    let now = Utc::now();
    ExamCycle {
        id: ExamCycleId::new(),
        tenant_id: tenant(),
        academic_year: "2026".into(),
        term: "1".into(),
        name: "End of Term 1".into(),
        exam_type: ExamType::Summative,
        status: ExamCycleStatus::Planning,
        start_date: None,
        end_date: None,
        assessment_ids,
        moderation_required: true,
        moderation_status: ModerationStatus::Pending,
        moderated: None,
        locked: None,
        published: None,
        archived: None,
        created_by: ActorId::new("officer"),
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

fn moderation(grade_id: GradeId) -> GradeModeration {
    GradeModeration {
        id: ModerationId::new(),
        tenant_id: tenant(),
        grade_id,
        exam_cycle_id: None,
        chain: ModerationStage::DEFAULT_CHAIN.to_vec(),
        stage: ModerationStage::TeacherSubmitted,
        original_score: 50.0,
        moderated_score: None,
        moderation_reason: String::new(),
        moderated: None,
        submitted_by: ActorId::new("teacher"),
        submitted_at: Utc::now(),
        state: ModerationState::InReview,
        version: 0,
    }
}

fn event(operation: &str) -> AuditEvent {
    AuditEvent::new(
        tenant(),
        ActorId::new("officer"),
        Utc::now(),
        EntityRef::new(EntityKind::ExamCycle, ExamCycleId::new()),
        operation,
        None,
        None,
        None,
    )
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

async fn insert_assigns_version_one(store: &dyn GradebookStore) {
    let a = assessment(&["stu-1"]);
    store
        .commit(ChangeSet::new().put(Mutation::Assessment(a.clone())))
        .await
        .unwrap();

    let stored = store.get_assessment(&a.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.roster, a.roster);
}

async fn stale_version_is_conflict(store: &dyn GradebookStore) {
    let a = assessment(&["stu-1"]);
    let g = grade(a.id, "stu-1", 40.0);
    store
        .commit(ChangeSet::new().put(Mutation::Grade(g.clone())))
        .await
        .unwrap();

    let read = store.get_grade(&g.id).await.unwrap().unwrap();
    let mut first = read.clone();
    first.score = 45.0;
    store
        .commit(ChangeSet::new().put(Mutation::Grade(first)))
        .await
        .unwrap();

    let mut second = read;
    second.score = 60.0;
    let err = store
        .commit(ChangeSet::new().put(Mutation::Grade(second)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, StorageError::Conflict { expected: 1, found: 2, .. }),
        "got {err:?}"
    );

    let stored = store.get_grade(&g.id).await.unwrap().unwrap();
    assert_eq!(stored.score, 45.0);
    assert_eq!(stored.version, 2);
}

async fn update_of_missing_record_fails(store: &dyn GradebookStore) {
    let mut g = grade(AssessmentId::new(), "stu-1", 40.0);
    g.version = 3;
    let err = store
        .commit(ChangeSet::new().put(Mutation::Grade(g)))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::MissingRecord { .. }));
}

async fn failed_commit_writes_nothing(store: &dyn GradebookStore) {
    let a = assessment(&["stu-1"]);
    let good = grade(a.id, "stu-1", 40.0);
    let mut missing = grade(a.id, "stu-2", 40.0);
    missing.version = 5;

    let err = store
        .commit(
            ChangeSet::new()
                .put(Mutation::Grade(good.clone()))
                .put(Mutation::Grade(missing))
                .record(event("grade.record")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::MissingRecord { .. }));

    assert!(store.get_grade(&good.id).await.unwrap().is_none());
    assert!(store.pending_audit(10).await.unwrap().is_empty());
}

async fn one_in_review_moderation_per_grade(store: &dyn GradebookStore) {
    let g = grade(AssessmentId::new(), "stu-1", 40.0);
    store
        .commit(
            ChangeSet::new()
                .put(Mutation::Grade(g.clone()))
                .put(Mutation::Moderation(moderation(g.id))),
        )
        .await
        .unwrap();

    let err = store
        .commit(ChangeSet::new().put(Mutation::Moderation(moderation(g.id))))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, StorageError::UniqueViolation { constraint, .. }
            if constraint == IN_REVIEW_MODERATION_CONSTRAINT),
        "got {err:?}"
    );
    assert_eq!(store.moderations_for_grade(&g.id).await.unwrap().len(), 1);
}

async fn resolved_moderation_frees_the_grade(store: &dyn GradebookStore) {
    let g = grade(AssessmentId::new(), "stu-1", 40.0);
    let first = moderation(g.id);
    store
        .commit(
            ChangeSet::new()
                .put(Mutation::Grade(g.clone()))
                .put(Mutation::Moderation(first.clone())),
        )
        .await
        .unwrap();

    let mut rejected = store.get_moderation(&first.id).await.unwrap().unwrap();
    rejected.state = ModerationState::Rejected {
        rejected_by: ActorId::new("hod"),
        rejected_at: Utc::now(),
        reason: "recount".into(),
    };
    let second = moderation(g.id);
    store
        .commit(
            ChangeSet::new()
                .put(Mutation::Moderation(rejected))
                .put(Mutation::Moderation(second.clone())),
        )
        .await
        .unwrap();

    let listed = store.moderations_for_grade(&g.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first.id);
    assert_eq!(listed[1].id, second.id);
    assert!(listed[0].is_rejected());
    assert!(listed[1].is_in_review());
}

async fn one_grade_per_student_slot(store: &dyn GradebookStore) {
    let a = assessment(&["stu-1"]);
    store
        .commit(ChangeSet::new().put(Mutation::Grade(grade(a.id, "stu-1", 40.0))))
        .await
        .unwrap();

    let err = store
        .commit(ChangeSet::new().put(Mutation::Grade(grade(a.id, "stu-1", 70.0))))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, StorageError::UniqueViolation { constraint, .. }
            if constraint == GRADE_PER_STUDENT_CONSTRAINT),
        "got {err:?}"
    );

    let found = store
        .find_grade(&a.id, &StudentId::new("stu-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.score, 40.0);
}

async fn events_get_increasing_seq(store: &dyn GradebookStore) {
    let r1 = store
        .commit(
            ChangeSet::new()
                .record(event("exam_cycle.create"))
                .record(event("exam_cycle.schedule")),
        )
        .await
        .unwrap();
    let r2 = store
        .commit(ChangeSet::new().record(event("exam_cycle.start")))
        .await
        .unwrap();

    let seqs: Vec<u64> = r1.events.iter().chain(&r2.events).map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs: {seqs:?}");

    let pending = store.pending_audit(10).await.unwrap();
    let ops: Vec<&str> = pending.iter().map(|e| e.operation.as_str()).collect();
    assert_eq!(
        ops,
        vec!["exam_cycle.create", "exam_cycle.schedule", "exam_cycle.start"]
    );
    assert!(pending.iter().all(|e| e.verify_integrity()));
}

async fn delivered_events_leave_the_outbox(store: &dyn GradebookStore) {
    let receipt = store
        .commit(
            ChangeSet::new()
                .record(event("grade.record"))
                .record(event("grade.update")),
        )
        .await
        .unwrap();
    let first = receipt.first_event_id().unwrap();

    store.mark_audit_delivered(&first).await.unwrap();
    store.mark_audit_delivered(&first).await.unwrap();

    let pending = store.pending_audit(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, "grade.update");
}

async fn covering_and_listing_cycles(store: &dyn GradebookStore) {
    let a = assessment(&["stu-1"]);
    let other = assessment(&["stu-2"]);
    let c1 = cycle(vec![a.id]);
    let c2 = cycle(vec![a.id, other.id]);
    store
        .commit(
            ChangeSet::new()
                .put(Mutation::Cycle(c1.clone()))
                .put(Mutation::Cycle(c2.clone())),
        )
        .await
        .unwrap();

    let covering = store.cycles_covering(&a.id).await.unwrap();
    assert_eq!(covering.len(), 2);
    assert_eq!(store.cycles_covering(&other.id).await.unwrap().len(), 1);

    let listed = store.list_cycles(&tenant()).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(store
        .list_cycles(&TenantId::new("school-b"))
        .await
        .unwrap()
        .is_empty());

    let mut updated = store.get_cycle(&c1.id).await.unwrap().unwrap();
    updated.assessment_ids.push(other.id);
    updated.status = ExamCycleStatus::Scheduled;
    store
        .commit(ChangeSet::new().put(Mutation::Cycle(updated)))
        .await
        .unwrap();
    assert_eq!(store.cycles_covering(&other.id).await.unwrap().len(), 2);
}

async fn overrides_listed_by_grade(store: &dyn GradebookStore) {
    let g = grade(AssessmentId::new(), "stu-1", 40.0);
    let change = PostLockGradeChange {
        id: OverrideId::new(),
        tenant_id: tenant(),
        grade_id: g.id,
        original_score: 40.0,
        new_score: 55.0,
        justification: "script re-marked".into(),
        requested_by: ActorId::new("teacher"),
        requested_at: Utc::now(),
        state: OverrideState::Pending,
        version: 0,
    };
    store
        .commit(
            ChangeSet::new()
                .put(Mutation::Grade(g.clone()))
                .put(Mutation::Override(change.clone())),
        )
        .await
        .unwrap();

    let listed = store.overrides_for_grade(&g.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].justification, "script re-marked");
    assert!(store.get_override(&change.id).await.unwrap().unwrap().is_pending());
}

async fn guard_detects_moved_dependency(store: &dyn GradebookStore) {
    let a = assessment(&["stu-1"]);
    let c = cycle(vec![a.id]);
    store
        .commit(ChangeSet::new().put(Mutation::Cycle(c.clone())))
        .await
        .unwrap();

    let mut locked = store.get_cycle(&c.id).await.unwrap().unwrap();
    locked.status = ExamCycleStatus::Locked;
    store
        .commit(ChangeSet::new().put(Mutation::Cycle(locked)))
        .await
        .unwrap();

    let g = grade(a.id, "stu-1", 40.0);
    let err = store
        .commit(
            ChangeSet::new()
                .put(Mutation::Grade(g.clone()))
                .expect(Table::ExamCycles, c.id, 1),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, StorageError::Conflict { expected: 1, found: 2, .. }),
        "got {err:?}"
    );
    assert!(store.get_grade(&g.id).await.unwrap().is_none());

    store
        .commit(
            ChangeSet::new()
                .put(Mutation::Grade(g.clone()))
                .expect(Table::ExamCycles, c.id, 2),
        )
        .await
        .unwrap();
    assert!(store.get_grade(&g.id).await.unwrap().is_some());
}

async fn duplicate_outranks_version_race(store: &dyn GradebookStore) {
    let a = assessment(&["stu-1"]);
    let g = grade(a.id, "stu-1", 40.0);
    let c = cycle(vec![a.id]);
    store
        .commit(
            ChangeSet::new()
                .put(Mutation::Grade(g.clone()))
                .put(Mutation::Cycle(c.clone())),
        )
        .await
        .unwrap();
    let read = store.get_cycle(&c.id).await.unwrap().unwrap();

    // Both submitters read the cycle at version 1 and rewrite its aggregate.
    let submit = |cycle: ExamCycle| {
        ChangeSet::new()
            .put(Mutation::Moderation(moderation(g.id)))
            .put(Mutation::Cycle(cycle))
            .expect(Table::ExamCycles, c.id, 1)
    };
    store.commit(submit(read.clone())).await.unwrap();
    let err = store.commit(submit(read)).await.unwrap_err();
    assert!(
        matches!(&err, StorageError::UniqueViolation { constraint, .. }
            if constraint == IN_REVIEW_MODERATION_CONSTRAINT),
        "got {err:?}"
    );
    assert_eq!(store.get_cycle(&c.id).await.unwrap().unwrap().version, 2);
}

async fn run_all(store: &dyn GradebookStore) {
    insert_assigns_version_one(store).await;
    stale_version_is_conflict(store).await;
    update_of_missing_record_fails(store).await;
    one_in_review_moderation_per_grade(store).await;
    resolved_moderation_frees_the_grade(store).await;
    one_grade_per_student_slot(store).await;
    covering_and_listing_cycles(store).await;
    overrides_listed_by_grade(store).await;
    guard_detects_moved_dependency(store).await;
    duplicate_outranks_version_race(store).await;
}

// ===========================================================================
// MemoryGradebookStore
// ===========================================================================

#[tokio::test]
async fn memory_store_satisfies_contracts() {
    run_all(&MemoryGradebookStore::new()).await;
}

#[tokio::test]
async fn memory_store_failed_commit_is_atomic() {
    failed_commit_writes_nothing(&MemoryGradebookStore::new()).await;
}

#[tokio::test]
async fn memory_store_orders_events() {
    events_get_increasing_seq(&MemoryGradebookStore::new()).await;
}

#[tokio::test]
async fn memory_store_outbox_delivery() {
    delivered_events_leave_the_outbox(&MemoryGradebookStore::new()).await;
}

// ===========================================================================
// SurrealGradebookStore (mirrors the memory tests above)
// ===========================================================================

async fn surreal() -> SurrealGradebookStore {
    SurrealGradebookStore::in_memory()
        .await
        .expect("in_memory() failed")
}

#[tokio::test]
async fn surreal_store_satisfies_contracts() {
    run_all(&surreal().await).await;
}

#[tokio::test]
async fn surreal_store_failed_commit_is_atomic() {
    failed_commit_writes_nothing(&surreal().await).await;
}

#[tokio::test]
async fn surreal_store_orders_events() {
    events_get_increasing_seq(&surreal().await).await;
}

#[tokio::test]
async fn surreal_store_outbox_delivery() {
    delivered_events_leave_the_outbox(&surreal().await).await;
}

#[tokio::test]
async fn surreal_store_on_disk_engine() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::local(dir.path().join("db"));
    let store = SurrealGradebookStore::open(&config).await.unwrap();
    let a = assessment(&["stu-1", "stu-2"]);

    let receipt = store
        .commit(
            ChangeSet::new()
                .put(Mutation::Assessment(a.clone()))
                .record(event("assessment.register")),
        )
        .await
        .unwrap();
    assert_eq!(receipt.events[0].seq, 1);

    let stored = store.get_assessment(&a.id).await.unwrap().unwrap();
    assert_eq!(stored.roster.len(), 2);
    assert_eq!(stored.version, 1);
}

// ---------------------------------------------------------------------------
// Two stores on one database: nothing in-process serializes their commits,
// so every check has to hold inside the transaction.
// ---------------------------------------------------------------------------

async fn shared_pair() -> (SurrealGradebookStore, SurrealGradebookStore) {
    let first = surreal().await;
    let second = SurrealGradebookStore::with_connection(first.connection());
    (first, second)
}

#[tokio::test]
async fn surreal_shared_database_rechecks_versions() {
    let (first, second) = shared_pair().await;
    let a = assessment(&["stu-1"]);
    let g = grade(a.id, "stu-1", 40.0);
    first
        .commit(ChangeSet::new().put(Mutation::Grade(g.clone())))
        .await
        .unwrap();

    let read = second.get_grade(&g.id).await.unwrap().unwrap();
    let mut winner = read.clone();
    winner.score = 45.0;
    first
        .commit(ChangeSet::new().put(Mutation::Grade(winner)))
        .await
        .unwrap();

    let mut loser = read;
    loser.score = 90.0;
    let err = second
        .commit(ChangeSet::new().put(Mutation::Grade(loser)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, StorageError::Conflict { expected: 1, found: 2, .. }),
        "got {err:?}"
    );
    assert_eq!(first.get_grade(&g.id).await.unwrap().unwrap().score, 45.0);
}

#[tokio::test]
async fn surreal_shared_database_rechecks_guards_and_uniqueness() {
    let (first, second) = shared_pair().await;
    let a = assessment(&["stu-1"]);
    let c = cycle(vec![a.id]);
    let g = grade(a.id, "stu-1", 40.0);
    first
        .commit(
            ChangeSet::new()
                .put(Mutation::Cycle(c.clone()))
                .put(Mutation::Grade(g.clone()))
                .put(Mutation::Moderation(moderation(g.id))),
        )
        .await
        .unwrap();

    let err = second
        .commit(ChangeSet::new().put(Mutation::Moderation(moderation(g.id))))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, StorageError::UniqueViolation { constraint, .. }
            if constraint == IN_REVIEW_MODERATION_CONSTRAINT),
        "got {err:?}"
    );

    let mut locked = first.get_cycle(&c.id).await.unwrap().unwrap();
    locked.status = ExamCycleStatus::Locked;
    first
        .commit(ChangeSet::new().put(Mutation::Cycle(locked)))
        .await
        .unwrap();

    let mut regraded = second.get_grade(&g.id).await.unwrap().unwrap();
    regraded.score = 95.0;
    let err = second
        .commit(
            ChangeSet::new()
                .put(Mutation::Grade(regraded))
                .expect(Table::ExamCycles, c.id, 1),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, StorageError::Conflict { expected: 1, found: 2, .. }),
        "got {err:?}"
    );
    assert_eq!(first.get_grade(&g.id).await.unwrap().unwrap().score, 40.0);
}

#[tokio::test]
async fn surreal_shared_database_keeps_one_event_sequence() {
    let (first, second) = shared_pair().await;
    first
        .commit(ChangeSet::new().record(event("exam_cycle.create")))
        .await
        .unwrap();
    let receipt = second
        .commit(ChangeSet::new().record(event("exam_cycle.schedule")))
        .await
        .unwrap();
    assert_eq!(receipt.events[0].seq, 2);

    let pending = first.pending_audit(10).await.unwrap();
    let seqs: Vec<u64> = pending.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
}

async fn lock(store: &SurrealGradebookStore, mut cycle: ExamCycle) -> StorageResult<CommitReceipt> {
    cycle.status = ExamCycleStatus::Locked;
    store
        .commit(
            ChangeSet::new()
                .put(Mutation::Cycle(cycle))
                .record(event("exam_cycle.lock")),
        )
        .await
}

#[tokio::test]
async fn surreal_shared_database_racing_writers_commit_once() {
    let (first, second) = shared_pair().await;
    let c = cycle(Vec::new());
    first
        .commit(ChangeSet::new().put(Mutation::Cycle(c.clone())))
        .await
        .unwrap();
    let read = first.get_cycle(&c.id).await.unwrap().unwrap();

    let (a, b) = tokio::join!(lock(&first, read.clone()), lock(&second, read));

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1, "{outcomes:?}");
    assert!(outcomes
        .iter()
        .filter_map(|o| o.as_ref().err())
        .all(StorageError::is_transient));
    assert_eq!(first.get_cycle(&c.id).await.unwrap().unwrap().version, 2);
    assert_eq!(first.pending_audit(10).await.unwrap().len(), 1);
}
