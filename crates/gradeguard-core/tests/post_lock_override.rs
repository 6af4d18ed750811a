//! Post-lock override control and lock immutability across every write path.

mod common;

use common::*;
use gradeguard_core::*;
use gradeguard_state::EntityKind;

fn locked(err: &GradeGuardError, cycle: &ExamCycle) -> bool {
    matches!(err, GradeGuardError::GradeLocked { exam_cycle_id, .. } if *exam_cycle_id == cycle.id)
}

#[tokio::test]
async fn override_needs_justification_and_a_second_person() {
    let h = harness();
    let (_, grades, _) = h.locked_cycle(&[58.0]).await;
    let grade = &grades[0];

    let err = h
        .svc
        .request_override(&h.teacher, &grade.id, 63.0, "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, GradeGuardError::JustificationRequired));

    let requested = h
        .svc
        .request_override(&h.teacher, &grade.id, 63.0, "page 4 was not marked")
        .await
        .unwrap();
    let change = requested.entity;
    assert!(change.is_pending());
    assert_eq!(change.original_score, 58.0);
    assert_eq!(change.new_score, 63.0);
    assert_eq!(change.requested_by, h.teacher.id);
    assert!(requested.audit_id.is_some());

    let err = h
        .svc
        .approve_override(&h.teacher, &change.id)
        .await
        .unwrap_err();
    assert!(
        matches!(err, GradeGuardError::SelfApprovalForbidden { ref actor, .. } if *actor == h.teacher.id)
    );
    let untouched = h.svc.get_grade(&h.teacher, &grade.id).await.unwrap();
    assert_eq!(untouched.score, 58.0);

    let approved = h
        .svc
        .approve_override(&h.principal, &change.id)
        .await
        .unwrap();
    assert!(approved.entity.approved_at().is_some());

    let regraded = h.svc.get_grade(&h.teacher, &grade.id).await.unwrap();
    assert_eq!(regraded.score, 63.0);
    assert_eq!(regraded.percentage, 63.0);
    assert_eq!(regraded.letter_grade, LetterGrade::C);

    let cycle_still_locked = h.svc.list_cycles(&h.officer).await.unwrap();
    assert!(cycle_still_locked.iter().all(|c| c.is_locked()));
}

#[tokio::test]
async fn override_approval_is_idempotent() {
    let h = harness();
    let (_, grades, _) = h.locked_cycle(&[70.0]).await;
    let change = h
        .svc
        .request_override(&h.teacher, &grades[0].id, 75.0, "transcription error")
        .await
        .unwrap()
        .entity;
    let first = h
        .svc
        .approve_override(&h.principal, &change.id)
        .await
        .unwrap();
    let events = h.sink.events().len();
    let grade_version = h.svc.get_grade(&h.teacher, &grades[0].id).await.unwrap().version;

    let second = h
        .svc
        .approve_override(&h.officer, &change.id)
        .await
        .unwrap();
    assert!(second.is_no_op());
    assert_eq!(second.entity, first.entity);
    assert_eq!(h.sink.events().len(), events);
    let grade = h.svc.get_grade(&h.teacher, &grades[0].id).await.unwrap();
    assert_eq!(grade.version, grade_version);
    assert_eq!(grade.score, 75.0);

    let err = h
        .svc
        .reject_override(&h.officer, &change.id, "changed my mind")
        .await
        .unwrap_err();
    assert!(matches!(err, GradeGuardError::InvalidTransition { .. }));
}

#[tokio::test]
async fn rejected_override_leaves_grade_alone() {
    let h = harness();
    let (_, grades, _) = h.locked_cycle(&[70.0]).await;
    let change = h
        .svc
        .request_override(&h.teacher, &grades[0].id, 90.0, "appeal")
        .await
        .unwrap()
        .entity;

    let rejected = h
        .svc
        .reject_override(&h.principal, &change.id, "appeal dismissed")
        .await
        .unwrap();
    assert_eq!(rejected.entity.state.as_str(), "rejected");
    assert!(h
        .svc
        .reject_override(&h.principal, &change.id, "appeal dismissed")
        .await
        .unwrap()
        .is_no_op());

    let err = h
        .svc
        .approve_override(&h.principal, &change.id)
        .await
        .unwrap_err();
    assert!(matches!(err, GradeGuardError::InvalidTransition { .. }));
    assert_eq!(h.svc.get_grade(&h.teacher, &grades[0].id).await.unwrap().score, 70.0);

    let history = h
        .svc
        .overrides_for_grade(&h.teacher, &grades[0].id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn override_lapses_when_the_cycle_is_unlocked() {
    let h = harness();
    let (_, grades, cycle) = h.locked_cycle(&[58.0]).await;
    let change = h
        .svc
        .request_override(&h.teacher, &grades[0].id, 66.0, "missed question 7")
        .await
        .unwrap()
        .entity;
    h.svc.unlock(&h.principal, &cycle.id).await.unwrap();

    let err = h
        .svc
        .approve_override(&h.principal, &change.id)
        .await
        .unwrap_err();
    assert!(
        matches!(err, GradeGuardError::GradeNotLocked { grade_id } if grade_id == grades[0].id),
        "{err:?}"
    );
    let grade = h.svc.get_grade(&h.teacher, &grades[0].id).await.unwrap();
    assert_eq!(grade.score, 58.0);
    assert!(h
        .svc
        .get_override(&h.teacher, &change.id)
        .await
        .unwrap()
        .is_pending());

    h.svc.lock(&h.principal, &cycle.id).await.unwrap();
    let approved = h
        .svc
        .approve_override(&h.principal, &change.id)
        .await
        .unwrap();
    assert!(!approved.is_no_op());
    let grade = h.svc.get_grade(&h.teacher, &grades[0].id).await.unwrap();
    assert_eq!(grade.score, 66.0);
}

#[tokio::test]
async fn overrides_are_only_for_locked_grades() {
    let h = harness();
    let assessment = h.assessment(&["s-001"]).await;
    let grade = h.grade(&assessment, "s-001", 40.0).await;
    let err = h
        .svc
        .request_override(&h.teacher, &grade.id, 45.0, "late script")
        .await
        .unwrap_err();
    assert!(matches!(err, GradeGuardError::GradeNotLocked { .. }));
}

#[tokio::test]
async fn override_score_must_fit_the_assessment() {
    let h = harness();
    let (_, grades, _) = h.locked_cycle(&[40.0]).await;
    let err = h
        .svc
        .request_override(&h.teacher, &grades[0].id, -1.0, "typo")
        .await
        .unwrap_err();
    assert!(matches!(err, GradeGuardError::InvalidScore { .. }));
}

#[tokio::test]
async fn lock_freezes_direct_entry_and_moderation() {
    let h = harness();
    let (assessment, grades, cycle) = h.locked_cycle(&[58.0]).await;
    let grade = &grades[0];

    let err = h
        .svc
        .record_grade(&h.teacher, &assessment.id, &grade.student_id, 60.0, "")
        .await
        .unwrap_err();
    assert!(locked(&err, &cycle), "{err:?}");

    let err = h
        .svc
        .submit_moderation(&h.teacher, &grade.id, "after lock", None)
        .await
        .unwrap_err();
    assert!(locked(&err, &cycle), "{err:?}");

    h.svc.publish(&h.principal, &cycle.id).await.unwrap();
    let err = h
        .svc
        .record_grade(&h.teacher, &assessment.id, &grade.student_id, 60.0, "")
        .await
        .unwrap_err();
    assert!(locked(&err, &cycle), "published cycles stay locked: {err:?}");

    let after = h.svc.get_grade(&h.teacher, &grade.id).await.unwrap();
    assert_eq!(after.score, 58.0);
    assert_eq!(after.version, grade.version);
}

#[tokio::test]
async fn direct_entry_closes_once_moderation_starts() {
    let h = harness();
    let assessment = h.assessment(&["s-001"]).await;
    let grade = h.grade(&assessment, "s-001", 58.0).await;
    let cycle = h.cycle_in_marking(&[&assessment], true).await;
    h.svc
        .submit_for_moderation(&h.officer, &cycle.id)
        .await
        .unwrap();
    h.moderate(&grade, None).await;

    let err = h
        .svc
        .record_grade(&h.teacher, &assessment.id, &grade.student_id, 95.0, "")
        .await
        .unwrap_err();
    assert!(
        matches!(&err, GradeGuardError::InvalidTransition { entity: EntityKind::Grade, current, .. }
            if current == "moderation"),
        "{err:?}"
    );

    h.svc
        .approve_moderation(&h.principal, &cycle.id)
        .await
        .unwrap();
    let err = h
        .svc
        .record_grade(&h.teacher, &assessment.id, &grade.student_id, 95.0, "")
        .await
        .unwrap_err();
    assert!(
        matches!(&err, GradeGuardError::InvalidTransition { current, .. } if current == "approved"),
        "{err:?}"
    );

    let locked = h.svc.lock(&h.principal, &cycle.id).await.unwrap();
    assert_eq!(locked.entity.status, ExamCycleStatus::Locked);
    let frozen = h.svc.get_grade(&h.teacher, &grade.id).await.unwrap();
    assert_eq!(frozen.score, 58.0);
    assert_eq!(frozen.version, grade.version);
}

#[tokio::test]
async fn pending_moderation_cannot_change_a_locked_grade() {
    let h = harness();
    let assessment = h.assessment(&["s-001"]).await;
    let grade = h.grade(&assessment, "s-001", 58.0).await;
    let cycle = h.cycle_in_marking(&[&assessment], false).await;

    let moderation = h
        .svc
        .submit_moderation(&h.teacher, &grade.id, "borderline", Some(cycle.id))
        .await
        .unwrap()
        .entity;
    h.walk_chain(&moderation, Some(66.0)).await;

    h.svc
        .submit_for_moderation(&h.officer, &cycle.id)
        .await
        .unwrap();
    h.svc
        .approve_moderation(&h.principal, &cycle.id)
        .await
        .unwrap();
    h.svc.lock(&h.principal, &cycle.id).await.unwrap();

    let err = h
        .svc
        .approve_grade_moderation(&h.principal, &moderation.id)
        .await
        .unwrap_err();
    assert!(locked(&err, &cycle), "{err:?}");
    assert_eq!(h.svc.get_grade(&h.teacher, &grade.id).await.unwrap().score, 58.0);

    // Closing it without a score change is still allowed.
    let rejected = h
        .svc
        .reject_grade_moderation(&h.principal, &moderation.id, "superseded by lock")
        .await
        .unwrap();
    assert!(rejected.entity.is_rejected());
}

#[tokio::test]
async fn letter_grade_tracks_every_write_path() {
    let h = harness();
    let assessment = h.assessment(&["s-001"]).await;
    let grade = h.grade(&assessment, "s-001", 72.0).await;
    assert_eq!((grade.percentage, grade.letter_grade), (72.0, LetterGrade::B));

    let cycle = h.cycle_in_marking(&[&assessment], true).await;
    h.svc
        .submit_for_moderation(&h.officer, &cycle.id)
        .await
        .unwrap();
    h.moderate(&grade, Some(85.0)).await;
    let grade = h.svc.get_grade(&h.teacher, &grade.id).await.unwrap();
    assert_eq!((grade.percentage, grade.letter_grade), (85.0, LetterGrade::A));

    h.svc
        .approve_moderation(&h.principal, &cycle.id)
        .await
        .unwrap();
    h.svc.lock(&h.principal, &cycle.id).await.unwrap();
    let change = h
        .svc
        .request_override(&h.teacher, &grade.id, 55.5, "penalty for late submission")
        .await
        .unwrap()
        .entity;
    h.svc
        .approve_override(&h.principal, &change.id)
        .await
        .unwrap();
    let grade = h.svc.get_grade(&h.teacher, &grade.id).await.unwrap();
    assert_eq!((grade.percentage, grade.letter_grade), (55.5, LetterGrade::D));
}
