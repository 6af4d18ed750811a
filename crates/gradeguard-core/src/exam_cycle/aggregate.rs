//! Cycle-level moderation status, folded from each grade's latest moderation.

use gradeguard_state::{GradeModeration, ModerationStatus};

/// Fold the latest moderation of every grade a cycle covers.
///
/// `None` entries are grades that were never submitted for moderation.
/// Any in-review record wins, then any rejection; the cycle is approved
/// only when every grade's latest record is approved.
pub fn aggregate_moderation_status<'a>(
    latest: impl IntoIterator<Item = Option<&'a GradeModeration>>,
) -> ModerationStatus {
    let mut seen = 0usize;
    let mut approved = 0usize;
    let mut rejected = false;

    for moderation in latest {
        seen += 1;
        match moderation {
            Some(m) if m.is_in_review() => return ModerationStatus::InProgress,
            Some(m) if m.is_rejected() => rejected = true,
            Some(m) if m.is_approved() => approved += 1,
            _ => {}
        }
    }

    if rejected {
        ModerationStatus::Rejected
    } else if seen > 0 && approved == seen {
        ModerationStatus::Approved
    } else {
        ModerationStatus::Pending
    }
}
