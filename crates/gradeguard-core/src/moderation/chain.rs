//! Moderation chain validation and stage stepping.

use gradeguard_state::ModerationStage;

use crate::domain::{GradeGuardError, Result};

/// Check that a configured chain can be walked by the workflow.
///
/// A chain must be non-empty, start at `teacher_submitted`, contain each
/// stage at most once and keep the canonical stage order. Tenants shorten
/// the review path by leaving stages out, never by reordering them.
pub fn validate_chain(chain: &[ModerationStage]) -> Result<()> {
    let Some(first) = chain.first() else {
        return Err(GradeGuardError::InvalidConfig(
            "moderation chain is empty".to_string(),
        ));
    };
    if *first != ModerationStage::TeacherSubmitted {
        return Err(GradeGuardError::InvalidConfig(format!(
            "moderation chain must start at {}, found {first}",
            ModerationStage::TeacherSubmitted
        )));
    }
    for pair in chain.windows(2) {
        if pair[0] == pair[1] {
            return Err(GradeGuardError::InvalidConfig(format!(
                "moderation chain repeats {}",
                pair[0]
            )));
        }
        if pair[0] > pair[1] {
            return Err(GradeGuardError::InvalidConfig(format!(
                "moderation chain puts {} before {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}
