//! Shared fixtures for the workflow suites.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::NaiveDate;
use gradeguard_core::*;

pub type Service = GradeGuardService<MemoryGradebookStore, Arc<MemoryAuditSink>>;

pub struct Harness {
    pub svc: Service,
    pub sink: Arc<MemoryAuditSink>,
    pub clock: Arc<FixedClock>,
    pub teacher: Actor,
    pub hod: Actor,
    pub officer: Actor,
    pub principal: Actor,
}

pub const TENANT: &str = "school-a";

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 6, d).unwrap()
}

pub fn harness() -> Harness {
    harness_with(GradeGuardConfig::default())
}

pub fn harness_with(config: GradeGuardConfig) -> Harness {
    let sink = Arc::new(MemoryAuditSink::new());
    let clock = Arc::new(FixedClock::on(day(10)));
    let svc = GradeGuardService::new(MemoryGradebookStore::new(), sink.clone())
        .with_clock(clock.clone())
        .with_config(config)
        .unwrap();
    Harness {
        svc,
        sink,
        clock,
        teacher: Actor::new("t.okafor", TENANT),
        hod: Actor::new("h.mensah", TENANT),
        officer: Actor::new("e.banda", TENANT),
        principal: Actor::new("p.adeyemi", TENANT),
    }
}

impl Harness {
    pub async fn assessment(&self, roster: &[&str]) -> Assessment {
        self.svc
            .register_assessment(
                &self.officer,
                AssessmentDraft {
                    name: "Mathematics paper 1".into(),
                    subject: "mathematics".into(),
                    max_score: 100.0,
                    roster: roster.iter().map(|s| StudentId::new(*s)).collect(),
                },
            )
            .await
            .unwrap()
            .entity
    }

    pub async fn grade(&self, assessment: &Assessment, student: &str, score: f64) -> Grade {
        self.svc
            .record_grade(
                &self.teacher,
                &assessment.id,
                &StudentId::new(student),
                score,
                "",
            )
            .await
            .unwrap()
            .entity
    }

    /// A cycle over `assessments`, walked from `planning` to `marking`.
    pub async fn cycle_in_marking(
        &self,
        assessments: &[&Assessment],
        moderation_required: bool,
    ) -> ExamCycle {
        let cycle = self
            .svc
            .create_cycle(
                &self.officer,
                CycleDraft {
                    academic_year: "2025/2026".into(),
                    term: "3".into(),
                    name: "End of year".into(),
                    start_date: Some(day(1)),
                    end_date: Some(day(20)),
                    moderation_required: Some(moderation_required),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .entity;
        for a in assessments {
            self.svc
                .attach_assessment(&self.officer, &cycle.id, &a.id)
                .await
                .unwrap();
        }
        self.svc.schedule(&self.officer, &cycle.id).await.unwrap();
        self.svc.begin(&self.officer, &cycle.id).await.unwrap();
        self.svc
            .end_exams(&self.officer, &cycle.id)
            .await
            .unwrap()
            .entity
    }

    /// Submit, walk the default chain, and approve.
    pub async fn moderate(&self, grade: &Grade, score: Option<f64>) -> GradeModeration {
        let moderation = self
            .svc
            .submit_moderation(&self.teacher, &grade.id, "end of term review", None)
            .await
            .unwrap()
            .entity;
        self.walk_chain(&moderation, score).await;
        self.svc
            .approve_grade_moderation(&self.principal, &moderation.id)
            .await
            .unwrap()
            .entity
    }

    /// Advance a submitted moderation to the last stage of its chain,
    /// proposing `score` at the first step.
    pub async fn walk_chain(&self, moderation: &GradeModeration, score: Option<f64>) {
        let mut proposal = score;
        for stage in moderation.chain.iter().skip(1) {
            self.svc
                .advance_moderation(&self.hod, &moderation.id, *stage, proposal.take(), None)
                .await
                .unwrap();
        }
    }

    /// One assessment with `scores.len()` students, each moderated without
    /// a score change, and a cycle over it walked all the way to `locked`.
    pub async fn locked_cycle(&self, scores: &[f64]) -> (Assessment, Vec<Grade>, ExamCycle) {
        let students: Vec<String> = (1..=scores.len()).map(|i| format!("s-{i:03}")).collect();
        let roster: Vec<&str> = students.iter().map(String::as_str).collect();
        let assessment = self.assessment(&roster).await;
        let mut grades = Vec::new();
        for (student, score) in roster.iter().zip(scores) {
            grades.push(self.grade(&assessment, student, *score).await);
        }

        let cycle = self.cycle_in_marking(&[&assessment], true).await;
        self.svc
            .submit_for_moderation(&self.officer, &cycle.id)
            .await
            .unwrap();
        for grade in &grades {
            self.moderate(grade, None).await;
        }
        self.svc
            .approve_moderation(&self.principal, &cycle.id)
            .await
            .unwrap();
        let cycle = self
            .svc
            .lock(&self.principal, &cycle.id)
            .await
            .unwrap()
            .entity;
        (assessment, grades, cycle)
    }
}
