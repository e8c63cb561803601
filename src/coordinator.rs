//! Preview, confirm and batch-confirm of operator threshold adjustments,
//! plus initial assignment and cache-first readers.
//!
//! A confirm moves through RECEIVED → VALIDATED → PREVIEWED → CONFIRMED →
//! PERSISTED → CACHE_REFRESHED, or stops at REJECTED. Preview stops at
//! PREVIEWED and never writes. The fact store is not touched here; see
//! `sync`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::cache::{ConfirmLocks, GradeCache};
use crate::config::{GradingConfig, WarningConfig};
use crate::diff::{grade_shift, warning_level};
use crate::error::GradingError;
use crate::models::{
    AdjustmentAudit, AdjustmentPreview, AdjustmentRejection, AdjustmentRequest, AdjustmentResult,
    AdjustmentState, BatchConfirmOutcome, CityAdjustment, CityConfirmOutcome, ConfirmOutcome,
    Cutoffs, ExamScope, GradeCounts, GradeDistribution, GradeThresholds, PartialCutoffs,
    RankedScore, ScoreRange, Scored, SegmentTable, ThresholdKey,
};
use crate::pool::WorkerPool;
use crate::segments::{build_distribution, build_segment_table};
use crate::store::{ScoreSource, StatisticsSnapshot, StatisticsStore};
use crate::thresholds::{ThresholdCalculation, ThresholdCalculator};

#[derive(Debug)]
pub enum Assignment {
    Assigned(ThresholdCalculation),
    /// Thresholds were already stored; they are left as they are.
    AlreadyAssigned(PartialCutoffs),
    NoScores,
}

/// Result of initial assignment for one key.
#[derive(Debug)]
pub struct InitialAssignment {
    pub key: ThresholdKey,
    pub outcome: Result<Assignment, GradingError>,
}

#[derive(Debug, Clone, Copy)]
enum ThresholdRead {
    CacheFirst,
    StoreOnly,
}

struct Evaluation {
    result: AdjustmentResult,
    scores: Vec<RankedScore>,
}

pub struct AdjustmentCoordinator {
    scores: Arc<dyn ScoreSource>,
    statistics: Arc<dyn StatisticsStore>,
    cache: GradeCache,
    locks: ConfirmLocks,
    pool: Arc<WorkerPool>,
    calculator: ThresholdCalculator,
    warning: WarningConfig,
}

impl AdjustmentCoordinator {
    pub fn new(
        scores: Arc<dyn ScoreSource>,
        statistics: Arc<dyn StatisticsStore>,
        cache: GradeCache,
        pool: Arc<WorkerPool>,
        config: &GradingConfig,
    ) -> Result<Self, GradingError> {
        Ok(Self {
            scores,
            statistics,
            cache,
            locks: ConfirmLocks::new(config.confirm.lock_ttl()),
            pool,
            calculator: ThresholdCalculator::from_config(config)?,
            warning: config.warning,
        })
    }

    /// Cached thresholds, else the stored ones (which are then cached).
    pub async fn current_thresholds(
        &self,
        key: &ThresholdKey,
    ) -> Result<Option<GradeThresholds>, GradingError> {
        if let Some(thresholds) = self.cache.thresholds(key).await {
            return Ok(Some(thresholds));
        }
        let generation = self.cache.generation(key);
        let stored = self
            .statistics
            .thresholds(key)
            .await
            .map_err(|e| GradingError::store(key, e))?;
        if let Some(thresholds) = &stored {
            self.cache.fill_thresholds(thresholds, generation).await;
        }
        Ok(stored)
    }

    pub async fn distribution(
        &self,
        key: &ThresholdKey,
    ) -> Result<Option<GradeDistribution>, GradingError> {
        if let Some(distribution) = self.cache.distribution(key).await {
            return Ok(Some(distribution));
        }
        let generation = self.cache.generation(key);
        let stored = self
            .statistics
            .distribution(key)
            .await
            .map_err(|e| GradingError::store(key, e))?;
        if let Some(distribution) = &stored {
            self.cache.fill_distribution(distribution, generation).await;
        }
        Ok(stored)
    }

    pub async fn segment_table(
        &self,
        key: &ThresholdKey,
    ) -> Result<Option<SegmentTable>, GradingError> {
        if let Some(segments) = self.cache.segments(key).await {
            return Ok(Some(segments));
        }
        let generation = self.cache.generation(key);
        let stored = self
            .statistics
            .segments(key)
            .await
            .map_err(|e| GradingError::store(key, e))?;
        if let Some(segments) = &stored {
            self.cache.fill_segments(segments, generation).await;
        }
        Ok(stored)
    }

    /// Computes thresholds from scratch for every city and for the whole
    /// population that has none stored yet, and persists them. Stored
    /// thresholds, including confirmed adjustments, are never overwritten.
    /// One key failing does not stop the rest.
    #[instrument(skip(self), fields(exam_plan = %scope.exam_plan, subject = %scope.subject))]
    pub async fn assign_initial(
        &self,
        scope: &ExamScope,
    ) -> Result<Vec<InitialAssignment>, GradingError> {
        let all = scope.all_cities();
        let range = self
            .scores
            .range(scope)
            .await
            .map_err(|e| GradingError::store(&all, e))?
            .ok_or_else(|| GradingError::EmptyPopulation(all.clone()))?;
        let cities = self
            .scores
            .cities(scope)
            .await
            .map_err(|e| GradingError::store(&all, e))?;

        let mut keys: Vec<ThresholdKey> = cities.iter().map(|city| scope.city(city)).collect();
        keys.push(all);

        let mut assignments = Vec::with_capacity(keys.len());
        for key in keys {
            let outcome = self.assign_key(&key, range).await;
            if let Err(e) = &outcome {
                warn!(key = %key, error = %e, "Initial assignment failed");
            }
            assignments.push(InitialAssignment { key, outcome });
        }
        Ok(assignments)
    }

    async fn assign_key(
        &self,
        key: &ThresholdKey,
        range: ScoreRange,
    ) -> Result<Assignment, GradingError> {
        let _guard = self
            .locks
            .try_acquire(key)
            .ok_or_else(|| GradingError::ConfirmInProgress(key.clone()))?;

        let existing = self
            .statistics
            .thresholds(key)
            .await
            .map_err(|e| GradingError::store(key, e))?;
        if let Some(existing) = existing {
            info!(key = %key, "Thresholds already stored, skipping");
            return Ok(Assignment::AlreadyAssigned(existing.cutoffs));
        }

        let scores = self.scores.rank(key).await.map_err(|e| GradingError::store(key, e))?;
        let Some(calculation) = self.calculator.calculate(&scores) else {
            info!(key = %key, "No scores, skipping");
            return Ok(Assignment::NoScores);
        };

        let snapshot = build_snapshot(
            key,
            PartialCutoffs::default(),
            calculation.cutoffs,
            calculation.counts,
            &scores,
            range,
            None,
        );
        self.statistics
            .replace_statistics(&snapshot)
            .await
            .map_err(|e| GradingError::store(key, e))?;
        self.refresh_cache(&snapshot).await;

        info!(
            key = %key,
            population = scores.len(),
            a = calculation.cutoffs.a,
            b = calculation.cutoffs.b,
            c = calculation.cutoffs.c,
            d = calculation.cutoffs.d,
            target_ranks = ?calculation.target_ranks,
            e_floor_applied = calculation.e_floor_applied,
            "Thresholds assigned"
        );
        Ok(Assignment::Assigned(calculation))
    }

    /// Merges the request's overrides onto the current thresholds and
    /// regrades everyone in memory. Writes nothing.
    #[instrument(
        skip(self, request),
        fields(exam_plan = %request.exam_plan, subject = %request.subject)
    )]
    pub async fn preview_adjustment(
        &self,
        request: &AdjustmentRequest,
    ) -> Result<AdjustmentResult, GradingError> {
        let adjustment = single_city(request)?;
        let key = request.scope().city(&adjustment.city);
        let evaluation = self
            .evaluate(&key, &adjustment.overrides, ThresholdRead::CacheFirst)
            .await?;
        Ok(evaluation.result)
    }

    /// Re-runs the preview against the statistics store under the key's
    /// confirm token, then persists thresholds, aggregate rows and detail
    /// rows in one transaction and refreshes the cache.
    ///
    /// The write only lands if the stored cutoffs still equal the ones the
    /// preview merged onto; a writer in another process that got there
    /// first turns this confirm into `ConfirmInProgress`.
    #[instrument(
        skip(self, request),
        fields(
            exam_plan = %request.exam_plan,
            subject = %request.subject,
            operator = %request.operator
        )
    )]
    pub async fn confirm_adjustment(
        &self,
        request: &AdjustmentRequest,
    ) -> Result<ConfirmOutcome, GradingError> {
        let started = Instant::now();
        let adjustment = single_city(request)?;
        let key = request.scope().city(&adjustment.city);
        debug!(key = %key, state = ?AdjustmentState::Received, "Confirm received");

        let _guard = self
            .locks
            .try_acquire(&key)
            .ok_or_else(|| GradingError::ConfirmInProgress(key.clone()))?;

        let evaluation = self
            .evaluate(&key, &adjustment.overrides, ThresholdRead::StoreOnly)
            .await?;
        let preview = match &evaluation.result {
            AdjustmentResult::Previewed(preview) => preview.clone(),
            AdjustmentResult::Rejected(rejection) => {
                warn!(key = %key, violation = %rejection.violation, "Confirm rejected");
                return Ok(ConfirmOutcome {
                    result: evaluation.result,
                    persisted: false,
                    state: AdjustmentState::Rejected,
                    affected_students: 0,
                    elapsed: started.elapsed(),
                });
            }
        };
        debug!(key = %key, state = ?AdjustmentState::Confirmed, "Preview accepted");

        let range = match self
            .scores
            .range(&key.scope())
            .await
            .map_err(|e| GradingError::store(&key, e))?
        {
            Some(range) => range,
            None => local_range(&evaluation.scores),
        };
        let audit = AdjustmentAudit {
            id: Uuid::new_v4(),
            key: key.clone(),
            operator: request.operator.clone(),
            reason: request.reason.clone(),
            before: preview.current,
            after: preview.adjusted_cutoffs,
            confirmed_at: Utc::now(),
        };
        let snapshot = build_snapshot(
            &key,
            preview.current,
            preview.adjusted_cutoffs,
            preview.adjusted,
            &evaluation.scores,
            range,
            Some(audit),
        );

        self.statistics
            .replace_statistics(&snapshot)
            .await
            .map_err(|e| GradingError::store(&key, e))?;
        debug!(key = %key, state = ?AdjustmentState::Persisted, "Statistics committed");

        let state = if self.refresh_cache(&snapshot).await {
            AdjustmentState::CacheRefreshed
        } else {
            AdjustmentState::Persisted
        };

        let affected_students = preview.diff.changed();
        info!(
            key = %key,
            affected_students,
            warning = %preview.warning,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Adjustment confirmed"
        );
        Ok(ConfirmOutcome {
            result: evaluation.result,
            persisted: true,
            state,
            affected_students,
            elapsed: started.elapsed(),
        })
    }

    /// Confirms every city in the request independently on the worker pool
    /// and waits for all of them.
    #[instrument(
        skip(self, request),
        fields(
            exam_plan = %request.exam_plan,
            subject = %request.subject,
            cities = request.cities.len()
        )
    )]
    pub async fn batch_confirm_adjustment(
        self: &Arc<Self>,
        request: &AdjustmentRequest,
    ) -> Result<BatchConfirmOutcome, GradingError> {
        let started = Instant::now();

        let mut pending = Vec::with_capacity(request.cities.len());
        for adjustment in &request.cities {
            let coordinator = Arc::clone(self);
            let single = request.for_city(adjustment);
            let span = tracing::info_span!("confirm_city", city = %adjustment.city);
            let handle = self.pool.spawn(
                async move { coordinator.confirm_adjustment(&single).await }.instrument(span),
            );
            pending.push((adjustment.city.clone(), handle));
        }

        let mut cities = Vec::with_capacity(pending.len());
        for (city, handle) in pending {
            let outcome = match handle {
                Ok(handle) => match handle.await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(pool_error)) => Err(pool_error),
                    Err(join_error) => Err(GradingError::TaskFailed(join_error.to_string())),
                },
                Err(pool_error) => Err(pool_error),
            };
            if let Err(e) = &outcome {
                warn!(city = %city, error = %e, "City confirm failed");
            }
            cities.push(CityConfirmOutcome { city, outcome });
        }

        let success_count = cities.iter().filter(|city| city.succeeded()).count();
        let failure_count = cities.len() - success_count;
        info!(success_count, failure_count, "Batch confirm finished");

        Ok(BatchConfirmOutcome {
            success_count,
            failure_count,
            cities,
            elapsed: started.elapsed(),
        })
    }

    async fn evaluate(
        &self,
        key: &ThresholdKey,
        overrides: &PartialCutoffs,
        read: ThresholdRead,
    ) -> Result<Evaluation, GradingError> {
        let current = match read {
            ThresholdRead::CacheFirst => self.current_thresholds(key).await?,
            ThresholdRead::StoreOnly => self
                .statistics
                .thresholds(key)
                .await
                .map_err(|e| GradingError::store(key, e))?,
        };
        let current = current.map(|thresholds| thresholds.cutoffs).unwrap_or_default();
        let merged = overrides.merge_onto(&current);

        let adjusted_cutoffs = match merged.validate() {
            Ok(cutoffs) => cutoffs,
            Err(violation) => {
                debug!(key = %key, violation = %violation, "Adjustment rejected");
                return Ok(Evaluation {
                    result: AdjustmentResult::Rejected(AdjustmentRejection {
                        key: key.clone(),
                        current,
                        merged,
                        violation,
                    }),
                    scores: Vec::new(),
                });
            }
        };
        debug!(key = %key, state = ?AdjustmentState::Validated, "Adjustment validated");

        let scores = self.scores.rank(key).await.map_err(|e| GradingError::store(key, e))?;
        if scores.is_empty() {
            return Err(GradingError::EmptyPopulation(key.clone()));
        }

        let shift = grade_shift(&scores, &current, &adjusted_cutoffs);
        let warning = warning_level(&shift.diff, &self.warning);
        Ok(Evaluation {
            result: AdjustmentResult::Previewed(AdjustmentPreview {
                key: key.clone(),
                current,
                adjusted_cutoffs,
                original: shift.original,
                adjusted: shift.adjusted,
                diff: shift.diff,
                warning,
            }),
            scores,
        })
    }

    /// Invalidates, then repopulates, every cached artifact for the
    /// snapshot's key. Returns false if any step failed.
    async fn refresh_cache(&self, snapshot: &StatisticsSnapshot) -> bool {
        let key = snapshot.key();
        let invalidated = self.cache.invalidate(key).await;
        let thresholds = self.cache.store_thresholds(&snapshot.thresholds).await;
        let distribution = self.cache.store_distribution(&snapshot.distribution).await;
        let segments = self.cache.store_segments(&snapshot.segments).await;

        let refreshed = invalidated && thresholds && distribution && segments;
        if !refreshed {
            warn!(key = %key, "Cache refresh incomplete, reads fall back to the store");
        }
        refreshed
    }
}

fn single_city(request: &AdjustmentRequest) -> Result<&CityAdjustment, GradingError> {
    match request.cities.as_slice() {
        [adjustment] => Ok(adjustment),
        cities => Err(GradingError::InvalidRequest(format!(
            "expected exactly one city, got {}",
            cities.len()
        ))),
    }
}

fn local_range(scores: &[RankedScore]) -> ScoreRange {
    let mut points = scores.iter().map(Scored::points);
    let first = points.next().unwrap_or_default();
    points.fold(ScoreRange::new(first, first), |range, p| {
        range.union(ScoreRange::new(p, p))
    })
}

/// Thresholds, aggregate rows and detail rows all derived from one
/// grading of `scores`, so they cannot disagree.
fn build_snapshot(
    key: &ThresholdKey,
    expected: PartialCutoffs,
    cutoffs: Cutoffs,
    counts: GradeCounts,
    scores: &[RankedScore],
    range: ScoreRange,
    audit: Option<AdjustmentAudit>,
) -> StatisticsSnapshot {
    StatisticsSnapshot {
        expected,
        thresholds: GradeThresholds {
            key: key.clone(),
            cutoffs: PartialCutoffs::from(cutoffs),
            counts,
            total: counts.total(),
        },
        distribution: build_distribution(key.clone(), &counts),
        segments: build_segment_table(key.clone(), scores, range, Some(&cutoffs)),
        audit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FailingCacheBackend, MemoryStore, RecordingCacheBackend};
    use crate::error::ThresholdViolation;
    use crate::models::{Grade, WarningLevel};

    const CITIES: [&str; 3] = ["Eastport", "Northgate", "Riverside"];

    fn scope() -> ExamScope {
        ExamScope::new("2026-spring", "math")
    }

    fn populated_store() -> Arc<MemoryStore> {
        let store = MemoryStore::new(scope());
        for city in CITIES {
            store.add_city(city, (51..=150).map(f64::from));
        }
        store
    }

    fn coordinator_with(store: &Arc<MemoryStore>, cache: GradeCache) -> Arc<AdjustmentCoordinator> {
        Arc::new(
            AdjustmentCoordinator::new(
                store.clone(),
                store.clone(),
                cache,
                Arc::new(WorkerPool::new(2)),
                &GradingConfig::default(),
            )
            .unwrap(),
        )
    }

    fn coordinator(store: &Arc<MemoryStore>) -> Arc<AdjustmentCoordinator> {
        coordinator_with(store, GradeCache::from_config(&Default::default()))
    }

    fn request(adjustments: &[(&str, &[(Grade, i32)])]) -> AdjustmentRequest {
        AdjustmentRequest {
            exam_plan: "2026-spring".to_string(),
            subject: "math".to_string(),
            cities: adjustments
                .iter()
                .map(|(city, pairs)| CityAdjustment {
                    city: city.to_string(),
                    overrides: PartialCutoffs::from_pairs(pairs).unwrap(),
                })
                .collect(),
            operator: "registrar".to_string(),
            reason: "board review".to_string(),
        }
    }

    fn scenario_cutoffs() -> Cutoffs {
        Cutoffs {
            a: 141,
            b: 121,
            c: 81,
            d: 61,
        }
    }

    async fn assigned() -> (Arc<MemoryStore>, Arc<AdjustmentCoordinator>) {
        let store = populated_store();
        let coordinator = coordinator(&store);
        coordinator.assign_initial(&scope()).await.unwrap();
        (store, coordinator)
    }

    #[tokio::test]
    async fn initial_assignment_covers_every_city_and_the_population() {
        let store = populated_store();
        store.add_city("Southbay", (80..=120).map(f64::from));
        let coordinator = coordinator(&store);

        let assignments = coordinator.assign_initial(&scope()).await.unwrap();
        assert_eq!(assignments.len(), 5);
        assert!(assignments.last().unwrap().key.city.is_all());
        assert!(assignments
            .iter()
            .all(|assignment| matches!(assignment.outcome, Ok(Assignment::Assigned(_)))));

        let north = store.stored_thresholds(&scope().city("Northgate")).unwrap();
        assert_eq!(north.cutoffs.validate().unwrap(), scenario_cutoffs());
        assert_eq!(north.counts.as_array(), [10, 20, 40, 20, 10]);

        // The narrow city still gets a table over the population-wide grid.
        let south = store.stored_segments(&scope().city("Southbay")).unwrap();
        assert_eq!(south.range, ScoreRange::new(51, 150));
        assert_eq!(south.rows.len(), 100);
        assert_eq!(south.rows[0].count, 0);

        let all = store.stored_thresholds(&scope().all_cities()).unwrap();
        assert_eq!(all.total, 341);
        assert!(store.audits().is_empty());
    }

    #[tokio::test]
    async fn initial_assignment_on_empty_exam_is_typed() {
        let store = MemoryStore::new(scope());
        let result = coordinator(&store).assign_initial(&scope()).await;
        assert!(matches!(result, Err(GradingError::EmptyPopulation(_))));
    }

    #[tokio::test]
    async fn reassigning_keeps_confirmed_cutoffs() {
        let (store, coordinator) = assigned().await;
        let key = scope().city("Northgate");
        coordinator
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::A, 146)])]))
            .await
            .unwrap();
        let writes = store.replace_calls();

        let assignments = coordinator.assign_initial(&scope()).await.unwrap();

        let north = assignments.iter().find(|assignment| assignment.key == key).unwrap();
        let Ok(Assignment::AlreadyAssigned(kept)) = &north.outcome else {
            panic!("expected the stored thresholds to be kept");
        };
        assert_eq!(kept.a, Some(146));
        assert_eq!(store.stored_thresholds(&key).unwrap().cutoffs.a, Some(146));
        assert_eq!(store.replace_calls(), writes);
        assert_eq!(store.audits().len(), 1);
        let read = coordinator.current_thresholds(&key).await.unwrap().unwrap();
        assert_eq!(read.cutoffs.a, Some(146));
    }

    #[tokio::test]
    async fn assignment_fills_in_only_the_missing_keys() {
        let (store, coordinator) = assigned().await;
        store.add_city("Southbay", (80..=120).map(f64::from));

        let assignments = coordinator.assign_initial(&scope()).await.unwrap();

        let assigned: Vec<String> = assignments
            .iter()
            .filter(|assignment| matches!(assignment.outcome, Ok(Assignment::Assigned(_))))
            .map(|assignment| assignment.key.city.label().to_string())
            .collect();
        assert_eq!(assigned, vec!["Southbay".to_string()]);
        assert!(store.stored_thresholds(&scope().city("Southbay")).is_some());
    }

    #[tokio::test]
    async fn overriding_a_keeps_the_other_cutoffs() {
        let (_store, coordinator) = assigned().await;

        let result = coordinator
            .preview_adjustment(&request(&[("Northgate", &[(Grade::A, 146)])]))
            .await
            .unwrap();
        let preview = result.preview().unwrap();

        assert_eq!(preview.adjusted_cutoffs, Cutoffs { a: 146, ..scenario_cutoffs() });
        assert_eq!(preview.original.unwrap().as_array(), [10, 20, 40, 20, 10]);
        assert_eq!(preview.adjusted.as_array(), [5, 25, 40, 20, 10]);
        assert_eq!(preview.diff.downgraded, 5);
        assert_eq!(preview.warning, WarningLevel::Normal);
    }

    #[tokio::test]
    async fn preview_is_idempotent_and_writes_nothing() {
        let (store, coordinator) = assigned().await;
        let key = scope().city("Northgate");
        let before = (store.stored_thresholds(&key), store.stored_segments(&key));
        let writes = store.replace_calls();

        let req = request(&[("Northgate", &[(Grade::C, 90), (Grade::D, 70)])]);
        let first = coordinator.preview_adjustment(&req).await.unwrap();
        let second = coordinator.preview_adjustment(&req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.replace_calls(), writes);
        assert_eq!((store.stored_thresholds(&key), store.stored_segments(&key)), before);
    }

    #[tokio::test]
    async fn misordered_merge_is_rejected_with_grades() {
        let (_store, coordinator) = assigned().await;
        let result = coordinator
            .preview_adjustment(&request(&[("Northgate", &[(Grade::B, 145)])]))
            .await
            .unwrap();

        assert_eq!(result.state(), AdjustmentState::Rejected);
        assert_eq!(result.warning(), WarningLevel::Danger);
        let AdjustmentResult::Rejected(rejection) = result else {
            panic!("expected rejection");
        };
        assert_eq!(
            rejection.violation,
            ThresholdViolation::Misordered {
                pairs: vec![(Grade::A, Grade::B)]
            }
        );
    }

    #[tokio::test]
    async fn partial_overrides_without_stored_thresholds_list_missing_grades() {
        let store = populated_store();
        let coordinator = coordinator(&store);
        let result = coordinator
            .preview_adjustment(&request(&[("Northgate", &[(Grade::A, 140), (Grade::C, 80)])]))
            .await
            .unwrap();

        let AdjustmentResult::Rejected(rejection) = result else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.violation.grades(), vec![Grade::B, Grade::D]);
    }

    #[tokio::test]
    async fn complete_overrides_without_stored_thresholds_grade_everyone_as_new() {
        let store = populated_store();
        let coordinator = coordinator(&store);
        let pairs = [(Grade::A, 141), (Grade::B, 121), (Grade::C, 81), (Grade::D, 61)];
        let result = coordinator
            .preview_adjustment(&request(&[("Northgate", &pairs)]))
            .await
            .unwrap();

        let preview = result.preview().unwrap();
        assert!(preview.original.is_none());
        assert_eq!(preview.diff.newly_graded, 100);
        assert_eq!(preview.warning, WarningLevel::Danger);
    }

    #[tokio::test]
    async fn large_swings_are_flagged() {
        let (_store, coordinator) = assigned().await;
        let warning = coordinator
            .preview_adjustment(&request(&[("Northgate", &[(Grade::D, 73)])]))
            .await
            .unwrap()
            .warning();
        assert_eq!(warning, WarningLevel::Warning);

        let danger = coordinator
            .preview_adjustment(&request(&[("Northgate", &[(Grade::C, 121), (Grade::D, 121)])]))
            .await
            .unwrap()
            .warning();
        assert_eq!(danger, WarningLevel::Danger);
    }

    #[tokio::test]
    async fn confirm_persists_consistent_aggregates_and_details() {
        let (store, coordinator) = assigned().await;
        let key = scope().city("Northgate");

        let outcome = coordinator
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::A, 146)])]))
            .await
            .unwrap();

        assert!(outcome.persisted);
        assert_eq!(outcome.state, AdjustmentState::CacheRefreshed);
        assert_eq!(outcome.affected_students, 5);

        let thresholds = store.stored_thresholds(&key).unwrap();
        assert_eq!(
            thresholds.cutoffs.validate().unwrap(),
            Cutoffs { a: 146, ..scenario_cutoffs() }
        );

        let distribution = store.stored_distribution(&key).unwrap();
        let segments = store.stored_segments(&key).unwrap();
        for row in &distribution.rows {
            let detail: usize = segments
                .rows
                .iter()
                .filter(|segment| segment.grade == Some(row.grade))
                .map(|segment| segment.count)
                .sum();
            assert_eq!(detail, row.count, "grade {}", row.grade);
        }
        assert_eq!(segments.rows.iter().find(|r| r.score == 145).unwrap().grade, Some(Grade::B));

        let audits = store.audits();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].operator, "registrar");
        assert_eq!(audits[0].before.a, Some(141));
        assert_eq!(audits[0].after.a, 146);

        // Readers see the new values through the refreshed cache.
        let cached = coordinator.current_thresholds(&key).await.unwrap().unwrap();
        assert_eq!(cached, thresholds);
    }

    #[tokio::test]
    async fn confirm_leaves_the_fact_store_alone() {
        let (store, coordinator) = assigned().await;
        store.set_grade("Northgate-0000", Grade::E);

        coordinator
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::D, 51)])]))
            .await
            .unwrap();
        assert_eq!(store.grade_of("Northgate-0000"), Some(Grade::E));
    }

    #[tokio::test]
    async fn confirming_the_same_thresholds_twice_is_stable() {
        let (store, coordinator) = assigned().await;
        let key = scope().city("Riverside");
        let req = request(&[("Riverside", &[(Grade::B, 118), (Grade::C, 85)])]);

        coordinator.confirm_adjustment(&req).await.unwrap();
        let first = (
            store.stored_thresholds(&key),
            store.stored_distribution(&key),
            store.stored_segments(&key),
        );

        let second_outcome = coordinator.confirm_adjustment(&req).await.unwrap();
        let second = (
            store.stored_thresholds(&key),
            store.stored_distribution(&key),
            store.stored_segments(&key),
        );
        assert_eq!(first, second);
        assert_eq!(second_outcome.affected_students, 0);
    }

    #[tokio::test]
    async fn rejected_confirm_persists_nothing() {
        let (store, coordinator) = assigned().await;
        let writes = store.replace_calls();
        let outcome = coordinator
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::D, 130)])]))
            .await
            .unwrap();

        assert!(!outcome.persisted);
        assert_eq!(outcome.state, AdjustmentState::Rejected);
        assert_eq!(store.replace_calls(), writes);
    }

    #[tokio::test]
    async fn confirm_in_flight_is_a_conflict() {
        let (store, coordinator) = assigned().await;
        let key = scope().city("Northgate");
        let writes = store.replace_calls();

        let _held = coordinator.locks.try_acquire(&key).unwrap();
        let result = coordinator
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::A, 146)])]))
            .await;

        assert!(matches!(result, Err(ref e) if e.is_conflict()));
        assert_eq!(store.replace_calls(), writes);
    }

    #[tokio::test]
    async fn database_lock_surfaces_as_conflict() {
        let (store, coordinator) = assigned().await;
        store.hold_lock(&scope().city("Northgate"));
        let result = coordinator
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::A, 146)])]))
            .await;
        assert!(matches!(result, Err(GradingError::ConfirmInProgress(_))));
    }

    #[tokio::test]
    async fn confirm_built_on_a_stale_read_is_refused() {
        let (store, first) = assigned().await;
        // Separate coordinators share no confirm tokens, like two processes.
        let second = coordinator(&store);
        let key = scope().city("Northgate");

        let gate = store.gate_next_threshold_read();
        let stale = tokio::spawn({
            let second = second.clone();
            let req = request(&[("Northgate", &[(Grade::C, 90)])]);
            async move { second.confirm_adjustment(&req).await }
        });
        // `second` has read A=141 and is paused before writing.
        gate.wait_for_read().await;

        let outcome = first
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::A, 146)])]))
            .await
            .unwrap();
        assert!(outcome.persisted);

        gate.release();
        let result = stale.await.unwrap();
        assert!(matches!(result, Err(GradingError::ConfirmInProgress(_))));

        let stored = store.stored_thresholds(&key).unwrap().cutoffs;
        assert_eq!(stored.a, Some(146));
        assert_eq!(stored.c, Some(81));
        assert_eq!(store.audits().len(), 1);

        // Retrying merges onto the committed cutoffs.
        let retried = second
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::C, 90)])]))
            .await
            .unwrap();
        assert!(retried.persisted);
        let stored = store.stored_thresholds(&key).unwrap().cutoffs;
        assert_eq!((stored.a, stored.c), (Some(146), Some(90)));
    }

    #[tokio::test]
    async fn reader_that_read_before_a_confirm_does_not_refill_the_cache() {
        let (store, coordinator) = assigned().await;
        let key = scope().city("Northgate");
        coordinator.cache.invalidate(&key).await;

        let gate = store.gate_next_threshold_read();
        let reader = tokio::spawn({
            let coordinator = coordinator.clone();
            let key = key.clone();
            async move { coordinator.current_thresholds(&key).await }
        });
        // The reader missed the cache and has fetched A=141 from the store.
        gate.wait_for_read().await;

        coordinator
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::A, 146)])]))
            .await
            .unwrap();
        gate.release();

        let read = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(read.cutoffs.a, Some(141));
        let cached = coordinator.cache.thresholds(&key).await.unwrap();
        assert_eq!(cached.cutoffs.a, Some(146));
    }

    #[tokio::test]
    async fn confirm_merges_onto_the_store_not_a_stale_cache() {
        let (store, coordinator) = assigned().await;
        let key = scope().city("Northgate");

        // Warm the cache, then change the store behind its back.
        coordinator.current_thresholds(&key).await.unwrap();
        let mut changed = store.stored_thresholds(&key).unwrap();
        changed.cutoffs.b = Some(125);
        store.put_thresholds(changed);

        let outcome = coordinator
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::A, 146)])]))
            .await
            .unwrap();
        let preview = outcome.result.preview().unwrap();
        assert_eq!(preview.current.b, Some(125));
        assert_eq!(preview.adjusted_cutoffs.b, 125);
    }

    #[tokio::test]
    async fn cache_failures_never_fail_a_confirm() {
        let store = populated_store();
        let coordinator = coordinator_with(&store, GradeCache::new(Arc::new(FailingCacheBackend)));
        coordinator.assign_initial(&scope()).await.unwrap();

        let outcome = coordinator
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::A, 146)])]))
            .await
            .unwrap();
        assert!(outcome.persisted);
        assert_eq!(outcome.state, AdjustmentState::Persisted);

        let read = coordinator
            .current_thresholds(&scope().city("Northgate"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.cutoffs.a, Some(146));
    }

    #[tokio::test]
    async fn cache_is_invalidated_before_it_is_repopulated() {
        let store = populated_store();
        let backend = Arc::new(RecordingCacheBackend::new());
        let coordinator = coordinator_with(&store, GradeCache::new(backend.clone()));
        coordinator.assign_initial(&scope()).await.unwrap();
        let skip = backend.log().len();

        coordinator
            .confirm_adjustment(&request(&[("Northgate", &[(Grade::A, 146)])]))
            .await
            .unwrap();

        let log: Vec<String> = backend.log().into_iter().skip(skip).collect();
        assert_eq!(log.len(), 6);
        assert!(log[..3].iter().all(|entry| entry.starts_with("delete ")));
        assert!(log[3..].iter().all(|entry| entry.starts_with("set ")));
    }

    #[tokio::test]
    async fn readers_fall_back_to_the_store_and_repopulate() {
        let (store, coordinator) = assigned().await;
        let key = scope().city("Eastport");
        coordinator.cache.invalidate(&key).await;

        let segments = coordinator.segment_table(&key).await.unwrap().unwrap();
        assert_eq!(Some(segments.clone()), store.stored_segments(&key));
        assert_eq!(coordinator.cache.segments(&key).await, Some(segments));

        let distribution = coordinator.distribution(&key).await.unwrap().unwrap();
        assert_eq!(distribution.total, 100);
    }

    #[tokio::test]
    async fn batch_confirm_isolates_a_rejected_city() {
        let (store, coordinator) = assigned().await;
        let req = request(&[
            ("Eastport", &[(Grade::A, 146)]),
            ("Northgate", &[(Grade::B, 145)]),
            ("Riverside", &[(Grade::D, 55)]),
        ]);

        let outcome = coordinator.batch_confirm_adjustment(&req).await.unwrap();

        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.failure_count, 1);
        assert!(!outcome.is_success());
        assert_eq!(outcome.cities.len(), 3);
        assert_eq!(outcome.cities[1].city, "Northgate");
        assert!(!outcome.cities[1].succeeded());

        let stored = |city: &str| store.stored_thresholds(&scope().city(city)).unwrap().cutoffs;
        assert_eq!(stored("Eastport").a, Some(146));
        assert_eq!(stored("Riverside").d, Some(55));
        assert_eq!(stored("Northgate").b, Some(121));
    }

    #[tokio::test]
    async fn batch_confirm_survives_a_failed_write() {
        let (store, coordinator) = assigned().await;
        store.fail_writes_for("Northgate");
        let req = request(&[
            ("Eastport", &[(Grade::A, 146)]),
            ("Northgate", &[(Grade::A, 146)]),
            ("Riverside", &[(Grade::A, 146)]),
        ]);

        let outcome = coordinator.batch_confirm_adjustment(&req).await.unwrap();

        assert_eq!((outcome.success_count, outcome.failure_count), (2, 1));
        assert!(matches!(outcome.cities[1].outcome, Err(GradingError::Store { .. })));
        let north = store.stored_thresholds(&scope().city("Northgate")).unwrap();
        assert_eq!(north.cutoffs.a, Some(141));
        assert_eq!(store.audits().len(), 2);
    }

    #[tokio::test]
    async fn batch_confirm_after_shutdown_reports_every_city() {
        let (_store, coordinator) = assigned().await;
        coordinator.pool.shutdown();
        let req = request(&[("Eastport", &[(Grade::A, 146)]), ("Riverside", &[(Grade::A, 146)])]);

        let outcome = coordinator.batch_confirm_adjustment(&req).await.unwrap();
        assert_eq!(outcome.failure_count, 2);
        assert!(outcome
            .cities
            .iter()
            .all(|city| matches!(city.outcome, Err(GradingError::PoolClosed))));
    }

    #[tokio::test]
    async fn single_city_entry_points_reject_multi_city_requests() {
        let (_store, coordinator) = assigned().await;
        let req = request(&[("Eastport", &[(Grade::A, 146)]), ("Riverside", &[(Grade::A, 146)])]);
        assert!(matches!(
            coordinator.confirm_adjustment(&req).await,
            Err(GradingError::InvalidRequest(_))
        ));
    }
}
