//! The exam cycle transition table.

use gradeguard_state::ExamCycleStatus;
use serde::{Deserialize, Serialize};

use ExamCycleStatus::*;

/// Named lifecycle operations. Each has exactly one source and one target
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOperation {
    Schedule,
    Begin,
    EndExams,
    SubmitForModeration,
    ApproveModeration,
    Lock,
    Publish,
    Unlock,
}

impl CycleOperation {
    pub const ALL: [CycleOperation; 8] = [
        Self::Schedule,
        Self::Begin,
        Self::EndExams,
        Self::SubmitForModeration,
        Self::ApproveModeration,
        Self::Lock,
        Self::Publish,
        Self::Unlock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Begin => "begin",
            Self::EndExams => "end_exams",
            Self::SubmitForModeration => "submit_for_moderation",
            Self::ApproveModeration => "approve_moderation",
            Self::Lock => "lock",
            Self::Publish => "publish",
            Self::Unlock => "unlock",
        }
    }

    /// `(from, to)` for this operation.
    pub fn edge(self) -> (ExamCycleStatus, ExamCycleStatus) {
        match self {
            Self::Schedule => (Planning, Scheduled),
            Self::Begin => (Scheduled, InProgress),
            Self::EndExams => (InProgress, Marking),
            Self::SubmitForModeration => (Marking, Moderation),
            Self::ApproveModeration => (Moderation, Approved),
            Self::Lock => (Approved, Locked),
            Self::Publish => (Locked, Published),
            Self::Unlock => (Locked, Approved),
        }
    }

    pub fn source(self) -> ExamCycleStatus {
        self.edge().0
    }

    pub fn target(self) -> ExamCycleStatus {
        self.edge().1
    }
}

impl std::fmt::Display for CycleOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reached by applying `op` in `current`, if the table allows it.
pub fn next_status(current: ExamCycleStatus, op: CycleOperation) -> Option<ExamCycleStatus> {
    let (from, to) = op.edge();
    (current == from).then_some(to)
}
