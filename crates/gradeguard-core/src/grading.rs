//! Derived grade fields.
//!
//! Every path that writes a score (direct entry, moderation approval,
//! post-lock override) goes through [`apply_score`], so `percentage` and
//! `letter_grade` can never drift from `score`.

use gradeguard_state::{Grade, LetterGrade};

use crate::domain::{GradeGuardError, Result};

/// `score / max_score * 100`, rounded to two decimals.
pub fn percentage(score: f64, max_score: f64) -> f64 {
    (score / max_score * 10_000.0).round() / 100.0
}

pub fn letter_grade(percentage: f64) -> LetterGrade {
    match percentage {
        p if p >= 80.0 => LetterGrade::A,
        p if p >= 70.0 => LetterGrade::B,
        p if p >= 60.0 => LetterGrade::C,
        p if p >= 50.0 => LetterGrade::D,
        _ => LetterGrade::F,
    }
}

/// Reject scores outside `0..=max_score` (including NaN and infinities).
pub fn validate_score(score: f64, max_score: f64) -> Result<()> {
    if score.is_finite() && (0.0..=max_score).contains(&score) {
        Ok(())
    } else {
        Err(GradeGuardError::InvalidScore { score, max_score })
    }
}

/// Reject a maximum that no score could be measured against.
pub fn validate_max_score(max_score: f64) -> Result<()> {
    if max_score.is_finite() && max_score > 0.0 {
        Ok(())
    } else {
        Err(GradeGuardError::InvalidScore {
            score: max_score,
            max_score,
        })
    }
}

/// Stored percentage and letter for a score. The letter is banded on the
/// unrounded ratio, so 79.996% is still a B.
pub fn derive(score: f64, max_score: f64) -> (f64, LetterGrade) {
    let exact = score / max_score * 100.0;
    (percentage(score, max_score), letter_grade(exact))
}

/// Write `score` into `grade` and recompute its derived fields.
pub fn apply_score(grade: &mut Grade, score: f64, max_score: f64) -> Result<()> {
    validate_score(score, max_score)?;
    let (percentage, letter) = derive(score, max_score);
    grade.score = score;
    grade.percentage = percentage;
    grade.letter_grade = letter;
    Ok(())
}
