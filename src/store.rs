use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{
    AdjustmentAudit, ExamScope, Grade, GradeDistribution, GradeThresholds, PartialCutoffs,
    RankedScore, ScoreRange, Scored, SegmentTable, ThresholdKey,
};

/// Everything written for one key in a single transaction.
#[derive(Debug, Clone)]
pub struct StatisticsSnapshot {
    /// Stored cutoffs this snapshot was computed from. A key with no row
    /// reads as all-`None`.
    pub expected: PartialCutoffs,
    pub thresholds: GradeThresholds,
    pub distribution: GradeDistribution,
    pub segments: SegmentTable,
    /// Present for operator confirms, absent for initial assignment.
    pub audit: Option<AdjustmentAudit>,
}

impl StatisticsSnapshot {
    pub fn key(&self) -> &ThresholdKey {
        &self.thresholds.key
    }
}

/// Read-only view of recorded scores. Absent students are excluded.
#[async_trait]
pub trait ScoreSource: Send + Sync {
    /// Scores for the key's city (or everyone), highest first.
    async fn rank(&self, key: &ThresholdKey) -> Result<Vec<RankedScore>, StoreError>;

    /// Rounded bounds over the whole population of the exam and subject.
    async fn range(&self, scope: &ExamScope) -> Result<Option<ScoreRange>, StoreError>;

    async fn cities(&self, scope: &ExamScope) -> Result<Vec<String>, StoreError>;
}

/// Denormalized thresholds, per-grade aggregate rows and per-score detail rows.
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn thresholds(&self, key: &ThresholdKey) -> Result<Option<GradeThresholds>, StoreError>;

    async fn distribution(
        &self,
        key: &ThresholdKey,
    ) -> Result<Option<GradeDistribution>, StoreError>;

    async fn segments(&self, key: &ThresholdKey) -> Result<Option<SegmentTable>, StoreError>;

    /// Replaces thresholds, aggregate rows and detail rows for the snapshot's
    /// key and records its audit entry, all or nothing.
    ///
    /// Returns `StoreError::Conflict` when another writer holds the key, or
    /// when the stored cutoffs no longer equal `snapshot.expected`.
    async fn replace_statistics(&self, snapshot: &StatisticsSnapshot) -> Result<(), StoreError>;
}

/// One student's row in the fact store.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub student_id: String,
    pub score: f64,
    pub grade: Option<Grade>,
}

impl Scored for FactRow {
    fn student_id(&self) -> &str {
        &self.student_id
    }

    fn score(&self) -> f64 {
        self.score
    }
}

/// Authoritative per-student grades.
#[async_trait]
pub trait FactStore: Send + Sync {
    async fn cities(&self, scope: &ExamScope) -> Result<Vec<String>, StoreError>;

    /// Up to `limit` present students of the key's city with ids after
    /// `after`, ordered by student id.
    async fn students_after(
        &self,
        key: &ThresholdKey,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FactRow>, StoreError>;

    /// Writes the grades in one transaction and returns the rows updated.
    async fn update_grades(
        &self,
        key: &ThresholdKey,
        grades: &[(String, Grade)],
    ) -> Result<usize, StoreError>;
}
