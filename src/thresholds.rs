use crate::config::{GradeRatios, GradingConfig};
use crate::error::GradingError;
use crate::models::{Cutoffs, Grade, GradeCounts, Scored};

/// Ratios are compared in millionths so cumulative targets are exact.
const RATIO_SCALE: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdCalculation {
    pub cutoffs: Cutoffs,
    pub counts: GradeCounts,
    /// Cumulative rank (1-based) each of A..D ends at before any floor shift.
    pub target_ranks: [usize; 4],
    pub e_floor_applied: bool,
}

/// Percentile cutoffs from a ranked population.
///
/// Each cutoff is the actual rounded score found at the grade's cumulative
/// target rank, so everyone sharing that score lands in the same grade. A
/// grade whose target rank equals the one above it gets that grade's cutoff
/// and ends up empty; a zero share for A puts its cutoff one above the top
/// score.
#[derive(Debug, Clone)]
pub struct ThresholdCalculator {
    ratios: GradeRatios,
    e_floor: Option<f64>,
}

impl ThresholdCalculator {
    pub fn new(ratios: GradeRatios, e_floor: Option<f64>) -> Result<Self, GradingError> {
        ratios.validate().map_err(GradingError::InvalidRatios)?;
        if let Some(floor) = e_floor {
            if !(0.0..=1.0).contains(&floor) {
                return Err(GradingError::InvalidRatios(vec![format!(
                    "e_floor.min_share: must be within [0, 1], got {floor}"
                )]));
            }
        }
        Ok(Self { ratios, e_floor })
    }

    pub fn from_config(config: &GradingConfig) -> Result<Self, GradingError> {
        Self::new(config.ratios, config.e_floor.floor())
    }

    /// Returns `None` for an empty population.
    pub fn calculate<S: Scored>(&self, ranked: &[S]) -> Option<ThresholdCalculation> {
        if ranked.is_empty() {
            return None;
        }

        let mut points: Vec<i32> = ranked.iter().map(Scored::points).collect();
        if !points.windows(2).all(|pair| pair[0] >= pair[1]) {
            points.sort_unstable_by(|a, b| b.cmp(a));
        }

        let target_ranks = self.target_ranks(points.len());
        let cutoff_at = |rank: usize| {
            if rank == 0 {
                points[0] + 1
            } else {
                points[rank - 1]
            }
        };
        let mut cutoffs = Cutoffs {
            a: cutoff_at(target_ranks[0]),
            b: cutoff_at(target_ranks[1]),
            c: cutoff_at(target_ranks[2]),
            d: cutoff_at(target_ranks[3]),
        };

        let e_floor_applied = match self.e_floor {
            Some(floor) => raise_d_for_e_floor(&points, &mut cutoffs, floor),
            None => false,
        };

        let mut counts = GradeCounts::default();
        for &score in &points {
            counts.add(cutoffs.grade_for(score), 1);
        }

        Some(ThresholdCalculation {
            cutoffs,
            counts,
            target_ranks,
            e_floor_applied,
        })
    }

    fn target_ranks(&self, population: usize) -> [usize; 4] {
        let population = population as u64;
        let mut cumulative = 0u64;
        let mut ranks = [0usize; 4];
        for (slot, grade) in Grade::WITH_CUTOFF.into_iter().enumerate() {
            cumulative += (self.ratios.get(grade) * RATIO_SCALE as f64).round() as u64;
            let rank = (cumulative * population).div_ceil(RATIO_SCALE);
            ranks[slot] = rank.min(population) as usize;
        }
        ranks
    }
}

/// Moves the D cutoff up one attained score at a time until E holds at
/// least `floor` of the population or D is empty (D cutoff reaches C).
/// A, B and C are left as they are.
fn raise_d_for_e_floor(descending: &[i32], cutoffs: &mut Cutoffs, floor: f64) -> bool {
    let population = descending.len();
    let required = ((floor * population as f64) - 1e-9).ceil().max(0.0) as usize;
    let required = required.min(population);
    let below = |cutoff: i32| population - descending.partition_point(|&score| score >= cutoff);

    let mut e_count = below(cutoffs.d);
    let mut applied = false;
    while e_count < required && cutoffs.d < cutoffs.c {
        let first_at_or_below = descending.partition_point(|&score| score > cutoffs.d);
        cutoffs.d = match first_at_or_below {
            0 => cutoffs.c,
            index => descending[index - 1].min(cutoffs.c),
        };
        e_count = below(cutoffs.d);
        applied = true;
    }
    applied
}
