use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GradingError, ThresholdViolation};

/// City label used for rows that cover the whole population.
pub const ALL_CITIES: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    E,
}

impl Grade {
    pub const ALL: [Grade; 5] = [Grade::A, Grade::B, Grade::C, Grade::D, Grade::E];

    /// Grades that carry a cutoff. E is everything below D.
    pub const WITH_CUTOFF: [Grade; 4] = [Grade::A, Grade::B, Grade::C, Grade::D];

    /// Position in A..E order; a lower index is a better grade.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::E => "E",
        }
    }

    pub fn parse(value: &str) -> Option<Grade> {
        match value.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Grade::A),
            "B" => Some(Grade::B),
            "C" => Some(Grade::C),
            "D" => Some(Grade::D),
            "E" => Some(Grade::E),
            _ => None,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExamScope {
    pub exam_plan: String,
    pub subject: String,
}

impl ExamScope {
    pub fn new(exam_plan: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            exam_plan: exam_plan.into(),
            subject: subject.into(),
        }
    }

    pub fn city(&self, city: &str) -> ThresholdKey {
        self.key(CityScope::City(city.to_string()))
    }

    pub fn all_cities(&self) -> ThresholdKey {
        self.key(CityScope::All)
    }

    pub fn key(&self, city: CityScope) -> ThresholdKey {
        ThresholdKey {
            exam_plan: self.exam_plan.clone(),
            subject: self.subject.clone(),
            city,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CityScope {
    City(String),
    All,
}

impl CityScope {
    /// The city to filter score rows by, `None` for the whole population.
    pub fn as_filter(&self) -> Option<&str> {
        match self {
            CityScope::City(city) => Some(city),
            CityScope::All => None,
        }
    }

    /// The value stored in the `city` column of statistics rows.
    pub fn label(&self) -> &str {
        match self {
            CityScope::City(city) => city,
            CityScope::All => ALL_CITIES,
        }
    }

    #[cfg(test)]
    pub fn is_all(&self) -> bool {
        matches!(self, CityScope::All)
    }
}

impl fmt::Display for CityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CityScope::City(city) => f.write_str(city),
            CityScope::All => f.write_str("all cities"),
        }
    }
}

/// Identifies one set of cutoffs: (exam plan, subject, city | all).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThresholdKey {
    pub exam_plan: String,
    pub subject: String,
    pub city: CityScope,
}

impl ThresholdKey {
    pub fn scope(&self) -> ExamScope {
        ExamScope::new(self.exam_plan.clone(), self.subject.clone())
    }

    pub fn cache_key(&self, kind: &str) -> String {
        format!(
            "score-banding:{}:{}:{}:{}",
            self.exam_plan,
            self.subject,
            self.city.label(),
            kind
        )
    }
}

impl fmt::Display for ThresholdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.exam_plan, self.subject, self.city.label())
    }
}

/// Rounds half-up to the integer grid every cutoff lives on.
pub fn round_half_up(score: f64) -> i32 {
    (score + 0.5).floor() as i32
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub student_id: String,
    pub city: String,
    pub exam_plan: String,
    pub subject: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedScore {
    pub student_id: String,
    pub score: f64,
}

impl RankedScore {
    pub fn new(student_id: impl Into<String>, score: f64) -> Self {
        Self {
            student_id: student_id.into(),
            score,
        }
    }
}

/// Anything that carries one student's raw score.
pub trait Scored {
    fn student_id(&self) -> &str;
    fn score(&self) -> f64;

    fn points(&self) -> i32 {
        round_half_up(self.score())
    }
}

impl Scored for ScoreRecord {
    fn student_id(&self) -> &str {
        &self.student_id
    }

    fn score(&self) -> f64 {
        self.score
    }
}

impl Scored for RankedScore {
    fn student_id(&self) -> &str {
        &self.student_id
    }

    fn score(&self) -> f64 {
        self.score
    }
}

/// Inclusive integer score bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: i32,
    pub max: i32,
}

impl ScoreRange {
    pub fn new(min: i32, max: i32) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    pub fn len(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    pub fn union(self, other: ScoreRange) -> ScoreRange {
        ScoreRange::new(self.min.min(other.min), self.max.max(other.max))
    }
}

/// A complete set of cutoffs for A..D. E is everything below `d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cutoffs {
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub d: i32,
}

impl Cutoffs {
    pub fn get(&self, grade: Grade) -> Option<i32> {
        match grade {
            Grade::A => Some(self.a),
            Grade::B => Some(self.b),
            Grade::C => Some(self.c),
            Grade::D => Some(self.d),
            Grade::E => None,
        }
    }

    pub fn grade_for(&self, points: i32) -> Grade {
        if points >= self.a {
            Grade::A
        } else if points >= self.b {
            Grade::B
        } else if points >= self.c {
            Grade::C
        } else if points >= self.d {
            Grade::D
        } else {
            Grade::E
        }
    }
}

/// Cutoffs as stored or as requested by an operator; any grade may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCutoffs {
    pub a: Option<i32>,
    pub b: Option<i32>,
    pub c: Option<i32>,
    pub d: Option<i32>,
}

impl PartialCutoffs {
    pub fn get(&self, grade: Grade) -> Option<i32> {
        match grade {
            Grade::A => self.a,
            Grade::B => self.b,
            Grade::C => self.c,
            Grade::D => self.d,
            Grade::E => None,
        }
    }

    fn slot(&mut self, grade: Grade) -> Option<&mut Option<i32>> {
        match grade {
            Grade::A => Some(&mut self.a),
            Grade::B => Some(&mut self.b),
            Grade::C => Some(&mut self.c),
            Grade::D => Some(&mut self.d),
            Grade::E => None,
        }
    }

    /// Builds overrides from `(grade, cutoff)` pairs. A grade listed twice is
    /// rejected rather than resolved by position.
    pub fn from_pairs(pairs: &[(Grade, i32)]) -> Result<Self, ThresholdViolation> {
        let mut cutoffs = PartialCutoffs::default();
        for &(grade, value) in pairs {
            let slot = cutoffs
                .slot(grade)
                .ok_or(ThresholdViolation::NotAdjustable(grade))?;
            if slot.is_some() {
                return Err(ThresholdViolation::DuplicateGrade(grade));
            }
            *slot = Some(value);
        }
        Ok(cutoffs)
    }

    /// Overlays `self` onto `current`; grades absent here keep their current value.
    pub fn merge_onto(&self, current: &PartialCutoffs) -> PartialCutoffs {
        PartialCutoffs {
            a: self.a.or(current.a),
            b: self.b.or(current.b),
            c: self.c.or(current.c),
            d: self.d.or(current.d),
        }
    }

    pub fn validate(&self) -> Result<Cutoffs, ThresholdViolation> {
        let missing: Vec<Grade> = Grade::WITH_CUTOFF
            .into_iter()
            .filter(|grade| self.get(*grade).is_none())
            .collect();
        let (Some(a), Some(b), Some(c), Some(d)) = (self.a, self.b, self.c, self.d) else {
            return Err(ThresholdViolation::Incomplete { missing });
        };

        let cutoffs = Cutoffs { a, b, c, d };
        let pairs: Vec<(Grade, Grade)> = Grade::WITH_CUTOFF
            .windows(2)
            .filter(|pair| cutoffs.get(pair[0]) < cutoffs.get(pair[1]))
            .map(|pair| (pair[0], pair[1]))
            .collect();
        if pairs.is_empty() {
            Ok(cutoffs)
        } else {
            Err(ThresholdViolation::Misordered { pairs })
        }
    }
}

impl From<Cutoffs> for PartialCutoffs {
    fn from(cutoffs: Cutoffs) -> Self {
        PartialCutoffs {
            a: Some(cutoffs.a),
            b: Some(cutoffs.b),
            c: Some(cutoffs.c),
            d: Some(cutoffs.d),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeCounts {
    counts: [usize; 5],
}

impl GradeCounts {
    pub fn from_array(counts: [usize; 5]) -> Self {
        Self { counts }
    }

    pub fn get(&self, grade: Grade) -> usize {
        self.counts[grade.index()]
    }

    pub fn add(&mut self, grade: Grade, amount: usize) {
        self.counts[grade.index()] += amount;
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn as_array(&self) -> [usize; 5] {
        self.counts
    }
}

/// The persisted cutoffs for one key, with the population they were computed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeThresholds {
    pub key: ThresholdKey,
    pub cutoffs: PartialCutoffs,
    pub counts: GradeCounts,
    pub total: usize,
}

/// A cumulative percentage carried in tenths of a point.
///
/// `whole` marks values that are exact integers and render without a decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Percentage {
    pub tenths: u32,
    pub whole: bool,
}

impl Percentage {
    pub const ZERO: Percentage = Percentage {
        tenths: 0,
        whole: true,
    };

    pub const HUNDRED: Percentage = Percentage {
        tenths: 1000,
        whole: true,
    };

    #[cfg(test)]
    pub fn as_f64(&self) -> f64 {
        f64::from(self.tenths) / 10.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.whole {
            write!(f, "{}", self.tenths / 10)
        } else {
            write!(f, "{}.{}", self.tenths / 10, self.tenths % 10)
        }
    }
}

impl FromStr for Percentage {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let parse = |part: &str| {
            part.parse::<u32>()
                .map_err(|_| format!("invalid percentage '{value}'"))
        };
        match value.split_once('.') {
            None => Ok(Percentage {
                tenths: parse(value)? * 10,
                whole: true,
            }),
            Some((integer, fraction)) if fraction.len() == 1 => Ok(Percentage {
                tenths: parse(integer)? * 10 + parse(fraction)?,
                whole: false,
            }),
            Some(_) => Err(format!("invalid percentage '{value}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSegmentRow {
    pub score: i32,
    pub count: usize,
    pub cumulative_count: usize,
    pub cumulative_percentage: Percentage,
    pub grade: Option<Grade>,
}

/// One row per integer score, highest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentTable {
    pub key: ThresholdKey,
    pub range: ScoreRange,
    pub total: usize,
    pub rows: Vec<ScoreSegmentRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeAggregateRow {
    pub grade: Grade,
    pub count: usize,
    pub cumulative_count: usize,
    pub cumulative_percentage: Percentage,
}

/// Per-grade aggregate rows for one key, A first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeDistribution {
    pub key: ThresholdKey,
    pub total: usize,
    pub rows: Vec<GradeAggregateRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CityAdjustment {
    pub city: String,
    pub overrides: PartialCutoffs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentRequest {
    pub exam_plan: String,
    pub subject: String,
    pub cities: Vec<CityAdjustment>,
    pub operator: String,
    pub reason: String,
}

impl AdjustmentRequest {
    pub fn scope(&self) -> ExamScope {
        ExamScope::new(self.exam_plan.clone(), self.subject.clone())
    }

    /// The same request narrowed to one of its cities.
    pub fn for_city(&self, adjustment: &CityAdjustment) -> AdjustmentRequest {
        AdjustmentRequest {
            exam_plan: self.exam_plan.clone(),
            subject: self.subject.clone(),
            cities: vec![adjustment.clone()],
            operator: self.operator.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentState {
    Received,
    Validated,
    Previewed,
    Rejected,
    Confirmed,
    Persisted,
    CacheRefreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WarningLevel {
    Normal,
    Warning,
    Danger,
}

impl fmt::Display for WarningLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WarningLevel::Normal => "NORMAL",
            WarningLevel::Warning => "WARNING",
            WarningLevel::Danger => "DANGER",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffStatistics {
    /// Adjusted minus original count, indexed A..E.
    pub count_delta: [i64; 5],
    pub upgraded: usize,
    pub downgraded: usize,
    pub unchanged: usize,
    /// Students with no current grade because the current cutoffs were incomplete.
    pub newly_graded: usize,
    /// New minus current cutoff for A..D; `None` when no current value exists.
    pub threshold_delta: [Option<i32>; 4],
    /// Share of the population whose grade changes.
    pub swing: f64,
}

impl DiffStatistics {
    pub fn changed(&self) -> usize {
        self.upgraded + self.downgraded + self.newly_graded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentPreview {
    pub key: ThresholdKey,
    pub current: PartialCutoffs,
    pub adjusted_cutoffs: Cutoffs,
    /// `None` when the current cutoffs were not complete enough to grade with.
    pub original: Option<GradeCounts>,
    pub adjusted: GradeCounts,
    pub diff: DiffStatistics,
    pub warning: WarningLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentRejection {
    pub key: ThresholdKey,
    pub current: PartialCutoffs,
    pub merged: PartialCutoffs,
    pub violation: ThresholdViolation,
}

/// What a preview produced. Never persisted on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum AdjustmentResult {
    Previewed(AdjustmentPreview),
    Rejected(AdjustmentRejection),
}

impl AdjustmentResult {
    pub fn key(&self) -> &ThresholdKey {
        match self {
            AdjustmentResult::Previewed(preview) => &preview.key,
            AdjustmentResult::Rejected(rejection) => &rejection.key,
        }
    }

    pub fn warning(&self) -> WarningLevel {
        match self {
            AdjustmentResult::Previewed(preview) => preview.warning,
            AdjustmentResult::Rejected(_) => WarningLevel::Danger,
        }
    }

    pub fn state(&self) -> AdjustmentState {
        match self {
            AdjustmentResult::Previewed(_) => AdjustmentState::Previewed,
            AdjustmentResult::Rejected(_) => AdjustmentState::Rejected,
        }
    }

    pub fn preview(&self) -> Option<&AdjustmentPreview> {
        match self {
            AdjustmentResult::Previewed(preview) => Some(preview),
            AdjustmentResult::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub result: AdjustmentResult,
    pub persisted: bool,
    /// `Persisted` when the cache could not be repopulated after commit.
    pub state: AdjustmentState,
    pub affected_students: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct CityConfirmOutcome {
    pub city: String,
    pub outcome: Result<ConfirmOutcome, GradingError>,
}

impl CityConfirmOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(&self.outcome, Ok(outcome) if outcome.persisted)
    }
}

#[derive(Debug)]
pub struct BatchConfirmOutcome {
    pub success_count: usize,
    pub failure_count: usize,
    pub cities: Vec<CityConfirmOutcome>,
    pub elapsed: Duration,
}

impl BatchConfirmOutcome {
    pub fn is_success(&self) -> bool {
        self.failure_count == 0 && self.success_count == self.cities.len()
    }
}

/// Audit entry written alongside every persisted confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentAudit {
    pub id: Uuid,
    pub key: ThresholdKey,
    pub operator: String,
    pub reason: String,
    pub before: PartialCutoffs,
    pub after: Cutoffs,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CitySyncOutcome {
    pub city: String,
    pub result: Result<usize, GradingError>,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced_count: usize,
    pub cities: Vec<CitySyncOutcome>,
}

impl SyncReport {
    pub fn failures(&self) -> usize {
        self.cities.iter().filter(|city| city.result.is_err()).count()
    }
}
