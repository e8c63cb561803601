use crate::config::WarningConfig;
use crate::models::{
    Cutoffs, DiffStatistics, Grade, GradeCounts, PartialCutoffs, Scored, WarningLevel,
};

/// Original and adjusted distributions for one population, plus what moved.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeShift {
    pub original: Option<GradeCounts>,
    pub adjusted: GradeCounts,
    pub diff: DiffStatistics,
}

/// Regrades every student under `adjusted` and compares with `current`.
///
/// Rank order is A > B > C > D > E; moving toward A is an upgrade. When
/// `current` cannot grade anyone (a cutoff is missing) every student counts
/// as newly graded.
pub fn grade_shift<S: Scored>(
    scores: &[S],
    current: &PartialCutoffs,
    adjusted: &Cutoffs,
) -> GradeShift {
    let current = current.validate().ok();

    let mut original = current.map(|_| GradeCounts::default());
    let mut adjusted_counts = GradeCounts::default();
    let (mut upgraded, mut downgraded, mut unchanged, mut newly_graded) = (0, 0, 0, 0);

    for score in scores {
        let points = score.points();
        let new_grade = adjusted.grade_for(points);
        adjusted_counts.add(new_grade, 1);

        match (&current, original.as_mut()) {
            (Some(current), Some(original)) => {
                let old_grade = current.grade_for(points);
                original.add(old_grade, 1);
                match new_grade.index().cmp(&old_grade.index()) {
                    std::cmp::Ordering::Less => upgraded += 1,
                    std::cmp::Ordering::Greater => downgraded += 1,
                    std::cmp::Ordering::Equal => unchanged += 1,
                }
            }
            _ => newly_graded += 1,
        }
    }

    let baseline = original.unwrap_or_default();
    let mut count_delta = [0i64; 5];
    for grade in Grade::ALL {
        count_delta[grade.index()] = adjusted_counts.get(grade) as i64 - baseline.get(grade) as i64;
    }

    let mut threshold_delta = [None; 4];
    for (slot, grade) in Grade::WITH_CUTOFF.into_iter().enumerate() {
        let before = current.as_ref().and_then(|c| c.get(grade));
        threshold_delta[slot] = match (before, adjusted.get(grade)) {
            (Some(before), Some(after)) => Some(after - before),
            _ => None,
        };
    }

    let changed = upgraded + downgraded + newly_graded;
    let swing = if scores.is_empty() {
        0.0
    } else {
        changed as f64 / scores.len() as f64
    };

    GradeShift {
        original,
        adjusted: adjusted_counts,
        diff: DiffStatistics {
            count_delta,
            upgraded,
            downgraded,
            unchanged,
            newly_graded,
            threshold_delta,
            swing,
        },
    }
}

/// NORMAL up to `warning_swing`, WARNING up to `danger_swing`, DANGER above.
pub fn warning_level(diff: &DiffStatistics, config: &WarningConfig) -> WarningLevel {
    if diff.swing > config.danger_swing {
        WarningLevel::Danger
    } else if diff.swing > config.warning_swing {
        WarningLevel::Warning
    } else {
        WarningLevel::Normal
    }
}
