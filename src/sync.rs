//! Reconciles the per-student grade column with confirmed thresholds.
//!
//! Runs on demand, never as part of a confirm. Rows are paged by student id
//! and written one chunk per transaction; cancellation is honoured between
//! chunks only.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::GradingError;
use crate::grading::assign_grades;
use crate::models::{CitySyncOutcome, ExamScope, SyncReport, ThresholdKey};
use crate::store::{FactStore, StatisticsStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Latest progress of the city being synced, for an external job poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub city: Option<String>,
    pub processed: usize,
    pub updated: usize,
    pub state: SyncState,
}

impl SyncStatus {
    fn idle() -> Self {
        Self {
            city: None,
            processed: 0,
            updated: 0,
            state: SyncState::Idle,
        }
    }
}

pub struct FactStoreSyncer {
    statistics: Arc<dyn StatisticsStore>,
    facts: Arc<dyn FactStore>,
    chunk_size: usize,
    status: watch::Sender<SyncStatus>,
}

impl FactStoreSyncer {
    pub fn new(
        statistics: Arc<dyn StatisticsStore>,
        facts: Arc<dyn FactStore>,
        chunk_size: usize,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::idle());
        Self {
            statistics,
            facts,
            chunk_size: chunk_size.max(1),
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Syncs one city, or every city of the exam when `city` is `None`.
    ///
    /// A single city's failure is returned as the error. In the all-cities
    /// case each city is attempted and failures are collected in the report.
    #[instrument(
        skip(self, cancel),
        fields(exam_plan = %scope.exam_plan, subject = %scope.subject)
    )]
    pub async fn sync_grades(
        &self,
        scope: &ExamScope,
        city: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, GradingError> {
        if let Some(city) = city {
            let synced = self.sync_city(&scope.city(city), cancel).await?;
            return Ok(SyncReport {
                synced_count: synced,
                cities: vec![CitySyncOutcome {
                    city: city.to_string(),
                    result: Ok(synced),
                }],
            });
        }

        let all = scope.all_cities();
        let cities = self.facts.cities(scope).await.map_err(|e| GradingError::store(&all, e))?;

        let mut report = SyncReport::default();
        for city in cities {
            if cancel.is_cancelled() {
                info!(city = %city, "Sync cancelled before city started");
                report.cities.push(CitySyncOutcome {
                    result: Err(GradingError::Cancelled {
                        key: scope.city(&city),
                        processed: 0,
                    }),
                    city,
                });
                continue;
            }
            let result = self.sync_city(&scope.city(&city), cancel).await;
            match &result {
                Ok(synced) => report.synced_count += synced,
                Err(e) => warn!(city = %city, error = %e, "City sync failed, continuing"),
            }
            report.cities.push(CitySyncOutcome { city, result });
        }

        info!(
            synced = report.synced_count,
            cities = report.cities.len(),
            failures = report.failures(),
            "Sync finished"
        );
        Ok(report)
    }

    async fn sync_city(
        &self,
        key: &ThresholdKey,
        cancel: &CancellationToken,
    ) -> Result<usize, GradingError> {
        let city = key.city.label().to_string();
        let result = self.relabel(key, cancel).await;
        let state = match &result {
            Ok(_) => SyncState::Completed,
            Err(GradingError::Cancelled { .. }) => SyncState::Cancelled,
            Err(_) => SyncState::Failed,
        };
        self.status.send_modify(|status| {
            status.city = Some(city);
            status.state = state;
        });
        result
    }

    async fn relabel(
        &self,
        key: &ThresholdKey,
        cancel: &CancellationToken,
    ) -> Result<usize, GradingError> {
        let thresholds = self
            .statistics
            .thresholds(key)
            .await
            .map_err(|e| GradingError::store(key, e))?
            .ok_or_else(|| GradingError::ThresholdsNotFound(key.clone()))?;
        let cutoffs = thresholds.cutoffs;
        cutoffs.validate()?;

        self.publish(key, 0, 0, SyncState::Running);

        let mut after: Option<String> = None;
        let (mut processed, mut updated) = (0usize, 0usize);
        loop {
            if cancel.is_cancelled() {
                info!(key = %key, processed, "Sync cancelled at chunk boundary");
                return Err(GradingError::Cancelled {
                    key: key.clone(),
                    processed,
                });
            }

            let rows = self
                .facts
                .students_after(key, after.as_deref(), self.chunk_size)
                .await
                .map_err(|e| GradingError::store(key, e))?;
            let Some(last) = rows.last() else {
                break;
            };
            after = Some(last.student_id.clone());

            let changed: Vec<_> = assign_grades(&rows, &cutoffs)?
                .into_iter()
                .zip(&rows)
                .filter(|((_, grade), row)| row.grade != Some(*grade))
                .map(|(assignment, _)| assignment)
                .collect();
            if !changed.is_empty() {
                updated += self
                    .facts
                    .update_grades(key, &changed)
                    .await
                    .map_err(|e| GradingError::store(key, e))?;
            }
            processed += rows.len();
            debug!(key = %key, processed, updated, "Chunk committed");
            self.publish(key, processed, updated, SyncState::Running);

            if rows.len() < self.chunk_size {
                break;
            }
        }

        info!(key = %key, processed, updated, "Grades synced");
        Ok(updated)
    }

    fn publish(&self, key: &ThresholdKey, processed: usize, updated: usize, state: SyncState) {
        self.status.send_replace(SyncStatus {
            city: Some(key.city.label().to_string()),
            processed,
            updated,
            state,
        });
    }
}
