use thiserror::Error;

use crate::models::{Grade, ThresholdKey};

/// Why a set of cutoffs cannot be used to grade anyone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThresholdViolation {
    #[error("incomplete thresholds: {}", join_grades(.missing))]
    Incomplete { missing: Vec<Grade> },

    /// Each pair `(upper, lower)` has `cutoff(upper) < cutoff(lower)`.
    #[error("misordered thresholds: {}", join_pairs(.pairs))]
    Misordered { pairs: Vec<(Grade, Grade)> },

    /// The same grade was supplied more than once in one override list.
    #[error("duplicate grade in overrides: {0}")]
    DuplicateGrade(Grade),

    #[error("grade {0} has no cutoff and cannot be adjusted")]
    NotAdjustable(Grade),
}

impl ThresholdViolation {
    /// Every grade the violation names, in A..E order.
    pub fn grades(&self) -> Vec<Grade> {
        let mut grades = match self {
            ThresholdViolation::Incomplete { missing } => missing.clone(),
            ThresholdViolation::Misordered { pairs } => {
                pairs.iter().flat_map(|(upper, lower)| [*upper, *lower]).collect()
            }
            ThresholdViolation::DuplicateGrade(grade)
            | ThresholdViolation::NotAdjustable(grade) => vec![*grade],
        };
        grades.sort();
        grades.dedup();
        grades
    }
}

fn join_grades(grades: &[Grade]) -> String {
    grades
        .iter()
        .map(|grade| grade.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_pairs(pairs: &[(Grade, Grade)]) -> String {
    pairs
        .iter()
        .map(|(upper, lower)| format!("{upper} < {lower}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failures reported by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Another writer holds the per-key lock, or changed the key's cutoffs
    /// after they were read.
    #[error("concurrent write to {0}")]
    Conflict(String),

    #[error("corrupt row for {key}: {detail}")]
    Corrupt { key: String, detail: String },

    /// No connection could be had; the call never reached the database.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Unavailable(e.to_string())
            }
            e => StoreError::Database(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum GradingError {
    #[error(transparent)]
    InvalidThresholds(#[from] ThresholdViolation),

    #[error("no scores recorded for {0}")]
    EmptyPopulation(ThresholdKey),

    #[error("invalid grade ratios: {}", .0.join("; "))]
    InvalidRatios(Vec<String>),

    #[error("no thresholds stored for {0}")]
    ThresholdsNotFound(ThresholdKey),

    #[error("confirmation already in progress for {0}")]
    ConfirmInProgress(ThresholdKey),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("worker task failed: {0}")]
    TaskFailed(String),

    #[error("sync cancelled for {key} after {processed} students")]
    Cancelled { key: ThresholdKey, processed: usize },

    #[error("store failure for {key}: {source}")]
    Store {
        key: ThresholdKey,
        #[source]
        source: StoreError,
    },
}

impl GradingError {
    pub fn store(key: &ThresholdKey, source: StoreError) -> Self {
        match source {
            StoreError::Conflict(_) => GradingError::ConfirmInProgress(key.clone()),
            source => GradingError::Store {
                key: key.clone(),
                source,
            },
        }
    }

    /// True for the outcome a caller may simply retry later.
    pub fn is_conflict(&self) -> bool {
        matches!(self, GradingError::ConfirmInProgress(_))
    }
}
