use crate::models::{
    Cutoffs, Grade, GradeAggregateRow, GradeCounts, GradeDistribution, Percentage, ScoreRange,
    ScoreSegmentRow, Scored, SegmentTable, ThresholdKey,
};

/// `cumulative / total` as a percentage that never overstates the true value.
///
/// Exact integers render without a decimal. Anything else is rounded to one
/// decimal unless that rounding overstates the true value by 0.01 points or
/// more, in which case it is truncated. `100` is only produced once the
/// whole population is counted.
pub fn cumulative_percentage(cumulative: usize, total: usize) -> Percentage {
    if total == 0 {
        return Percentage::ZERO;
    }
    let (cumulative, total) = (cumulative as u128, total as u128);
    let scaled = cumulative * 1000;

    if (cumulative * 100) % total == 0 {
        return Percentage {
            tenths: (scaled / total) as u32,
            whole: true,
        };
    }

    let truncated = scaled / total;
    let remainder = scaled % total;
    let mut tenths = truncated;
    if remainder * 2 >= total {
        // Overstatement in points is (rounded * total - scaled) / (10 * total).
        let overstatement = (truncated + 1) * total - scaled;
        if overstatement * 10 < total {
            tenths = truncated + 1;
        }
    }
    if tenths >= 1000 {
        tenths = 999;
    }

    Percentage {
        tenths: tenths as u32,
        whole: false,
    }
}

/// One row per integer score in `population_range`, highest score first.
///
/// `population_range` is the whole population's bound even for a
/// single-city table, so every city's table shares one grid. Counting uses
/// one bucket per representable score rather than a scan per row.
pub fn build_segment_table<S: Scored>(
    key: ThresholdKey,
    scores: &[S],
    population_range: ScoreRange,
    cutoffs: Option<&Cutoffs>,
) -> SegmentTable {
    let range = scores
        .iter()
        .map(Scored::points)
        .fold(population_range, |range, points| {
            range.union(ScoreRange::new(points, points))
        });

    let mut buckets = vec![0usize; range.len()];
    for score in scores {
        buckets[(score.points() - range.min) as usize] += 1;
    }

    let total = scores.len();
    let mut cumulative_count = 0usize;
    let rows = (range.min..=range.max)
        .rev()
        .map(|score| {
            let count = buckets[(score - range.min) as usize];
            cumulative_count += count;
            ScoreSegmentRow {
                score,
                count,
                cumulative_count,
                cumulative_percentage: cumulative_percentage(cumulative_count, total),
                grade: cutoffs.map(|cutoffs| cutoffs.grade_for(score)),
            }
        })
        .collect();

    SegmentTable {
        key,
        range,
        total,
        rows,
    }
}

/// Per-grade aggregate rows, A first, cumulative in grade order.
pub fn build_distribution(key: ThresholdKey, counts: &GradeCounts) -> GradeDistribution {
    let total = counts.total();
    let mut cumulative_count = 0usize;
    let rows = Grade::ALL
        .into_iter()
        .map(|grade| {
            let count = counts.get(grade);
            cumulative_count += count;
            GradeAggregateRow {
                grade,
                count,
                cumulative_count,
                cumulative_percentage: cumulative_percentage(cumulative_count, total),
            }
        })
        .collect();

    GradeDistribution { key, total, rows }
}
