use crate::error::ThresholdViolation;
use crate::models::{Grade, PartialCutoffs, Scored};

/// Grades every student against cutoffs that must name all of A..D.
///
/// Scores are rounded half-up before comparison.
pub fn assign_grades<S: Scored>(
    scores: &[S],
    cutoffs: &PartialCutoffs,
) -> Result<Vec<(String, Grade)>, ThresholdViolation> {
    let cutoffs = cutoffs.validate()?;
    Ok(scores
        .iter()
        .map(|score| (score.student_id().to_string(), cutoffs.grade_for(score.points())))
        .collect())
}
