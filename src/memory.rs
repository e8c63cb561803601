//! In-memory stores and cache backends for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::cache::{BoxFuture, CacheBackend, CacheError, MemoryCacheBackend};
use crate::error::StoreError;
use crate::models::{
    round_half_up, AdjustmentAudit, ExamScope, Grade, GradeDistribution, GradeThresholds,
    RankedScore, ScoreRange, SegmentTable, ThresholdKey,
};
use crate::store::{FactRow, FactStore, ScoreSource, StatisticsSnapshot, StatisticsStore};

#[derive(Debug, Clone)]
struct FactEntry {
    student_id: String,
    city: String,
    score: f64,
    present: bool,
    grade: Option<Grade>,
}

#[derive(Default)]
struct State {
    facts: Vec<FactEntry>,
    thresholds: HashMap<ThresholdKey, GradeThresholds>,
    distributions: HashMap<ThresholdKey, GradeDistribution>,
    segments: HashMap<ThresholdKey, SegmentTable>,
    audits: Vec<AdjustmentAudit>,
    failing_cities: HashSet<String>,
    locked: HashSet<ThresholdKey>,
    updates_allowed: Option<usize>,
    replace_calls: usize,
}

/// Holds the next thresholds read open until the test releases it.
#[derive(Default)]
pub struct ReadGate {
    read: Notify,
    release: Notify,
}

impl ReadGate {
    /// Resolves once the gated read has fetched its value.
    pub async fn wait_for_read(&self) {
        self.read.notified().await;
    }

    /// Lets the gated read return what it fetched.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Score source, statistics store and fact store for a single exam scope.
pub struct MemoryStore {
    scope: ExamScope,
    state: Mutex<State>,
    gate: Mutex<Option<Arc<ReadGate>>>,
}

impl MemoryStore {
    pub fn new(scope: ExamScope) -> Arc<Self> {
        Arc::new(Self {
            scope,
            state: Mutex::new(State::default()),
            gate: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory store poisoned")
    }

    pub fn add_student(&self, city: &str, student_id: &str, score: f64) {
        self.push(city, student_id, score, true);
    }

    pub fn add_absent(&self, city: &str, student_id: &str) {
        self.push(city, student_id, 0.0, false);
    }

    fn push(&self, city: &str, student_id: &str, score: f64, present: bool) {
        self.state().facts.push(FactEntry {
            student_id: student_id.to_string(),
            city: city.to_string(),
            score,
            present,
            grade: None,
        });
    }

    /// Adds one student per score, ids `{city}-{index:04}`.
    pub fn add_city(&self, city: &str, scores: impl IntoIterator<Item = f64>) {
        for (index, score) in scores.into_iter().enumerate() {
            self.add_student(city, &format!("{city}-{index:04}"), score);
        }
    }

    pub fn put_thresholds(&self, thresholds: GradeThresholds) {
        self.state().thresholds.insert(thresholds.key.clone(), thresholds);
    }

    pub fn stored_thresholds(&self, key: &ThresholdKey) -> Option<GradeThresholds> {
        self.state().thresholds.get(key).cloned()
    }

    pub fn stored_distribution(&self, key: &ThresholdKey) -> Option<GradeDistribution> {
        self.state().distributions.get(key).cloned()
    }

    pub fn stored_segments(&self, key: &ThresholdKey) -> Option<SegmentTable> {
        self.state().segments.get(key).cloned()
    }

    pub fn audits(&self) -> Vec<AdjustmentAudit> {
        self.state().audits.clone()
    }

    pub fn replace_calls(&self) -> usize {
        self.state().replace_calls
    }

    pub fn grade_of(&self, student_id: &str) -> Option<Grade> {
        self.state()
            .facts
            .iter()
            .find(|entry| entry.student_id == student_id)
            .and_then(|entry| entry.grade)
    }

    pub fn set_grade(&self, student_id: &str, grade: Grade) {
        if let Some(entry) = self
            .state()
            .facts
            .iter_mut()
            .find(|entry| entry.student_id == student_id)
        {
            entry.grade = Some(grade);
        }
    }

    /// Every statistics write for this city fails before touching anything.
    pub fn fail_writes_for(&self, city: &str) {
        self.state().failing_cities.insert(city.to_string());
    }

    /// Simulates another writer holding the database lock for `key`.
    pub fn hold_lock(&self, key: &ThresholdKey) {
        self.state().locked.insert(key.clone());
    }

    /// The next `StatisticsStore::thresholds` call fetches its value, then
    /// waits for `ReadGate::release` before returning it.
    pub fn gate_next_threshold_read(&self) -> Arc<ReadGate> {
        let gate = Arc::new(ReadGate::default());
        *self.gate.lock().expect("read gate poisoned") = Some(gate.clone());
        gate
    }

    /// Fact-store chunk updates fail once `chunks` of them have succeeded.
    pub fn allow_updates(&self, chunks: usize) {
        self.state().updates_allowed = Some(chunks);
    }

    fn in_scope(&self, key: &ThresholdKey) -> bool {
        key.scope() == self.scope
    }
}

#[async_trait]
impl ScoreSource for MemoryStore {
    async fn rank(&self, key: &ThresholdKey) -> Result<Vec<RankedScore>, StoreError> {
        if !self.in_scope(key) {
            return Ok(Vec::new());
        }
        let state = self.state();
        let mut ranked: Vec<RankedScore> = state
            .facts
            .iter()
            .filter(|entry| entry.present)
            .filter(|entry| key.city.as_filter().map_or(true, |city| entry.city == city))
            .map(|entry| RankedScore::new(entry.student_id.clone(), entry.score))
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.student_id.cmp(&b.student_id))
        });
        Ok(ranked)
    }

    async fn range(&self, scope: &ExamScope) -> Result<Option<ScoreRange>, StoreError> {
        if *scope != self.scope {
            return Ok(None);
        }
        let state = self.state();
        let mut present = state.facts.iter().filter(|entry| entry.present);
        let Some(first) = present.next() else {
            return Ok(None);
        };
        let (min, max) = present.fold((first.score, first.score), |(min, max), entry| {
            (min.min(entry.score), max.max(entry.score))
        });
        Ok(Some(ScoreRange::new(round_half_up(min), round_half_up(max))))
    }

    async fn cities(&self, scope: &ExamScope) -> Result<Vec<String>, StoreError> {
        if *scope != self.scope {
            return Ok(Vec::new());
        }
        let mut cities: Vec<String> =
            self.state().facts.iter().map(|entry| entry.city.clone()).collect();
        cities.sort();
        cities.dedup();
        Ok(cities)
    }
}

#[async_trait]
impl StatisticsStore for MemoryStore {
    async fn thresholds(&self, key: &ThresholdKey) -> Result<Option<GradeThresholds>, StoreError> {
        let stored = self.stored_thresholds(key);
        let gate = self.gate.lock().expect("read gate poisoned").take();
        if let Some(gate) = gate {
            gate.read.notify_one();
            gate.release.notified().await;
        }
        Ok(stored)
    }

    async fn distribution(
        &self,
        key: &ThresholdKey,
    ) -> Result<Option<GradeDistribution>, StoreError> {
        Ok(self.stored_distribution(key))
    }

    async fn segments(&self, key: &ThresholdKey) -> Result<Option<SegmentTable>, StoreError> {
        Ok(self.stored_segments(key))
    }

    async fn replace_statistics(&self, snapshot: &StatisticsSnapshot) -> Result<(), StoreError> {
        let key = snapshot.key().clone();
        let mut state = self.state();
        state.replace_calls += 1;
        if state.locked.contains(&key) {
            return Err(StoreError::Conflict(key.to_string()));
        }
        if state.failing_cities.contains(key.city.label()) {
            return Err(StoreError::Unavailable(format!("writes disabled for {key}")));
        }
        let stored = state
            .thresholds
            .get(&key)
            .map(|thresholds| thresholds.cutoffs)
            .unwrap_or_default();
        if stored != snapshot.expected {
            return Err(StoreError::Conflict(key.to_string()));
        }
        state.thresholds.insert(key.clone(), snapshot.thresholds.clone());
        state.distributions.insert(key.clone(), snapshot.distribution.clone());
        state.segments.insert(key, snapshot.segments.clone());
        if let Some(audit) = &snapshot.audit {
            state.audits.push(audit.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl FactStore for MemoryStore {
    async fn cities(&self, scope: &ExamScope) -> Result<Vec<String>, StoreError> {
        ScoreSource::cities(self, scope).await
    }

    async fn students_after(
        &self,
        key: &ThresholdKey,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FactRow>, StoreError> {
        if !self.in_scope(key) {
            return Ok(Vec::new());
        }
        let state = self.state();
        let mut rows: Vec<FactRow> = state
            .facts
            .iter()
            .filter(|entry| entry.present && Some(entry.city.as_str()) == key.city.as_filter())
            .filter(|entry| after.map_or(true, |after| entry.student_id.as_str() > after))
            .map(|entry| FactRow {
                student_id: entry.student_id.clone(),
                score: entry.score,
                grade: entry.grade,
            })
            .collect();
        rows.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn update_grades(
        &self,
        key: &ThresholdKey,
        grades: &[(String, Grade)],
    ) -> Result<usize, StoreError> {
        let mut state = self.state();
        if let Some(remaining) = state.updates_allowed.as_mut() {
            if *remaining == 0 {
                return Err(StoreError::Unavailable(format!(
                    "fact store rejected chunk for {key}"
                )));
            }
            *remaining -= 1;
        }
        let city = key.city.as_filter();
        let mut updated = 0;
        for (student_id, grade) in grades {
            if let Some(entry) = state
                .facts
                .iter_mut()
                .find(|entry| &entry.student_id == student_id && Some(entry.city.as_str()) == city)
            {
                entry.grade = Some(*grade);
                updated += 1;
            }
        }
        Ok(updated)
    }
}

/// A backend whose every call fails.
pub struct FailingCacheBackend;

impl CacheBackend for FailingCacheBackend {
    fn get(&self, _key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, CacheError>> {
        Box::pin(async { Err(CacheError::Unavailable("backend offline".to_string())) })
    }

    fn set(&self, _key: &str, _value: Vec<u8>) -> BoxFuture<'_, Result<(), CacheError>> {
        Box::pin(async { Err(CacheError::Unavailable("backend offline".to_string())) })
    }

    fn delete(&self, _key: &str) -> BoxFuture<'_, Result<bool, CacheError>> {
        Box::pin(async { Err(CacheError::Unavailable("backend offline".to_string())) })
    }
}

/// A working backend that records every mutating call in order.
pub struct RecordingCacheBackend {
    inner: MemoryCacheBackend,
    log: Mutex<Vec<String>>,
}

impl RecordingCacheBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryCacheBackend::new(1_000, std::time::Duration::from_secs(60)),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("cache log poisoned").clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().expect("cache log poisoned").push(entry);
    }
}

impl CacheBackend for RecordingCacheBackend {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, CacheError>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> BoxFuture<'_, Result<(), CacheError>> {
        self.record(format!("set {key}"));
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, CacheError>> {
        self.record(format!("delete {key}"));
        self.inner.delete(key)
    }
}
