//! Keeping the scoring models fresh.
//!
//! The updater buffers recent records. Once enough are buffered and the
//! update interval has elapsed it evaluates the live models, then either
//! folds the buffer into them or, if quality has degraded, refits them from
//! scratch. Updated models are persisted before they replace the live set,
//! so a failed cycle leaves both the live models and the buffer untouched.

pub mod evaluate;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::VectorCache;
use crate::config::UpdaterConfig;
use crate::detect::ErrorKind;
use crate::record::{tokenize, LogRecord};
use crate::scoring::{model_path, FeatureVector, FeatureVectorizer, NamedModel, SharedModels};

pub use evaluate::{Evaluator, LabelAgreementEvaluator, PerformanceSample};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("evaluation of model '{model}' failed: {reason}")]
    Evaluation { model: String, reason: String },
    #[error("fitting model '{model}' failed: {reason}")]
    Fit { model: String, reason: String },
    #[error("failed to persist model '{model}' to {}: {reason}", .path.display())]
    Persist {
        model: String,
        path: PathBuf,
        reason: String,
    },
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Persist { .. } => ErrorKind::Persistence,
            UpdateError::Evaluation { .. } | UpdateError::Fit { .. } => ErrorKind::UpdateCycle,
        }
    }
}

/// A record kept for evaluation and retraining. `flagged` is set when the
/// rule detector hit the record.
#[derive(Debug, Clone)]
pub struct BufferedRecord {
    pub record: LogRecord,
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum UpdateOutcome {
    /// Not enough data or not due yet.
    Buffered,
    /// Models were folded forward and persisted.
    Updated(PerformanceSample),
    /// Quality was below threshold; models were refit and persisted.
    Retrained(PerformanceSample),
}

/// Per-metric history of cross-model means, one entry per cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceHistory {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub f1: Vec<f64>,
    pub auc: Vec<f64>,
}

impl PerformanceHistory {
    fn push(&mut self, s: &PerformanceSample) {
        self.precision.push(s.precision);
        self.recall.push(s.recall);
        self.f1.push(s.f1);
        self.auc.push(s.auc);
    }

    pub fn len(&self) -> usize {
        self.precision.len()
    }

    pub fn is_empty(&self) -> bool {
        self.precision.is_empty()
    }
}

pub struct ModelUpdater {
    config: UpdaterConfig,
    buffer: VecDeque<BufferedRecord>,
    last_update: DateTime<Utc>,
    history: PerformanceHistory,
    models: SharedModels,
    vectorizer: Arc<dyn FeatureVectorizer>,
    cache: Option<Arc<VectorCache>>,
    evaluator: Box<dyn Evaluator>,
}

impl ModelUpdater {
    pub fn new(
        config: UpdaterConfig,
        models: SharedModels,
        vectorizer: Arc<dyn FeatureVectorizer>,
        cache: Option<Arc<VectorCache>>,
        evaluator: Box<dyn Evaluator>,
    ) -> Self {
        Self {
            buffer: VecDeque::with_capacity(config.capacity.min(4096)),
            config,
            last_update: Utc::now(),
            history: PerformanceHistory::default(),
            models,
            vectorizer,
            cache,
            evaluator,
        }
    }

    /// Pretend the last cycle ran at `at`.
    pub fn with_last_update(mut self, at: DateTime<Utc>) -> Self {
        self.last_update = at;
        self
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn history(&self) -> &PerformanceHistory {
        &self.history
    }

    pub fn update(&mut self, records: Vec<BufferedRecord>) -> Result<UpdateOutcome, UpdateError> {
        self.update_at(records, Utc::now())
    }

    /// Buffer `records` and run a cycle if one is due at `now`.
    pub fn update_at(
        &mut self,
        records: Vec<BufferedRecord>,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.buffer.extend(records);
        while self.buffer.len() > self.config.capacity {
            self.buffer.pop_front();
        }

        let interval = self.config.interval().unwrap_or(Duration::MAX);
        if self.buffer.len() < self.config.min_samples || now - self.last_update < interval {
            return Ok(UpdateOutcome::Buffered);
        }
        self.run_cycle(now)
    }

    /// True when the mean of the four metric means is below the threshold.
    pub fn should_retrain(&self, samples: &[PerformanceSample]) -> bool {
        if samples.is_empty() {
            return false;
        }
        let overall = PerformanceSample::mean_of(samples).overall();
        if overall < self.config.performance_threshold {
            warn!(
                overall,
                threshold = self.config.performance_threshold,
                "model performance below threshold, retraining"
            );
            return true;
        }
        false
    }

    fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<UpdateOutcome, UpdateError> {
        let records: Vec<BufferedRecord> = self.buffer.iter().cloned().collect();
        let vectors = self.prepare(&records);

        // Work on copies; the live set keeps serving until the swap.
        let mut working: Vec<NamedModel> = self.models.read().clone();

        let mut samples = Vec::with_capacity(working.len());
        for m in &working {
            let scores = m.model.score_batch(&vectors);
            let sample = self
                .evaluator
                .evaluate(&scores, &records)
                .map_err(|e| UpdateError::Evaluation {
                    model: m.name.clone(),
                    reason: format!("{:#}", e),
                })?;
            debug!(model = %m.name, ?sample, "evaluated model");
            samples.push(sample);
        }
        let cycle_mean = PerformanceSample::mean_of(&samples);
        let retrain = self.should_retrain(&samples);

        for m in &mut working {
            let result = if retrain || !m.model.supports_incremental() {
                m.model.fit(&vectors)
            } else {
                m.model.partial_fit(&vectors)
            };
            result.map_err(|e| UpdateError::Fit {
                model: m.name.clone(),
                reason: format!("{:#}", e),
            })?;
        }

        for m in &working {
            let path = model_path(&self.config.model_dir, &m.name);
            m.model.save(&path).map_err(|e| UpdateError::Persist {
                model: m.name.clone(),
                path: path.clone(),
                reason: format!("{:#}", e),
            })?;
        }

        let count = working.len();
        *self.models.write() = working;
        self.history.push(&cycle_mean);
        self.last_update = now;

        info!(
            models = count,
            samples = records.len(),
            retrained = retrain,
            overall = cycle_mean.overall(),
            "model update cycle complete"
        );
        Ok(if retrain {
            UpdateOutcome::Retrained(cycle_mean)
        } else {
            UpdateOutcome::Updated(cycle_mean)
        })
    }

    /// Vectorize the buffer, reusing cached vectors where possible.
    fn prepare(&self, records: &[BufferedRecord]) -> Vec<FeatureVector> {
        records
            .iter()
            .map(|r| {
                let tokens = tokenize(&r.record);
                if let Some(v) = self.cache.as_ref().and_then(|c| c.get(&tokens)) {
                    return v;
                }
                let v = self
                    .vectorizer
                    .transform(std::slice::from_ref(&tokens))
                    .pop()
                    .unwrap_or_else(|| vec![0.0; self.vectorizer.dimension()]);
                if let Some(c) = &self.cache {
                    c.put(&tokens, v.clone());
                }
                v
            })
            .collect()
    }
}

/// Feed records from the ingestion path into the updater, running each
/// update attempt on a blocking worker so fitting and model I/O never stall
/// the runtime. Returns when the sending side is dropped.
pub async fn run_update_loop(
    updater: Arc<Mutex<ModelUpdater>>,
    mut rx: mpsc::Receiver<BufferedRecord>,
    poll: StdDuration,
) {
    info!(poll_secs = poll.as_secs(), "model update loop started");
    let mut interval = tokio::time::interval(poll);
    let mut pending = Vec::new();

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(record) => pending.push(record),
                None => break,
            },
            _ = interval.tick() => {
                let batch = std::mem::take(&mut pending);
                run_attempt(&updater, batch).await;
            }
        }
    }

    if !pending.is_empty() {
        run_attempt(&updater, pending).await;
    }
    info!("model update loop stopped");
}

async fn run_attempt(updater: &Arc<Mutex<ModelUpdater>>, batch: Vec<BufferedRecord>) {
    let updater = updater.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut guard = updater.lock();
        guard.update(batch)
    })
    .await;
    match result {
        Ok(Ok(UpdateOutcome::Buffered)) => {}
        Ok(Ok(outcome)) => debug!(?outcome, "update attempt finished"),
        Ok(Err(e)) => error!(kind = ?e.kind(), error = %e, "model update cycle failed, will retry"),
        Err(e) => error!(error = %e, "model update worker panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{load_model, CentroidModel, HashingVectorizer, ZScoreModel};
    use parking_lot::RwLock;

    fn record(i: usize, attack: bool) -> BufferedRecord {
        let message = if attack {
            format!("union select password from users {}", i)
        } else {
            format!("get index page {}", i % 3)
        };
        BufferedRecord {
            record: LogRecord {
                request_uri: Some(format!("/page/{}", i)),
                message: Some(message),
                ..Default::default()
            },
            flagged: attack,
        }
    }

    fn batch(n: usize) -> Vec<BufferedRecord> {
        (0..n).map(|i| record(i, i % 5 == 0)).collect()
    }

    fn shared_models() -> SharedModels {
        Arc::new(RwLock::new(vec![
            NamedModel::new("zscore", Box::new(ZScoreModel::new())),
            NamedModel::new("centroid", Box::new(CentroidModel::new())),
        ]))
    }

    fn updater(dir: &std::path::Path, threshold: f64, models: SharedModels) -> ModelUpdater {
        let config = UpdaterConfig {
            model_dir: dir.to_path_buf(),
            capacity: 50,
            min_samples: 10,
            update_interval_secs: 3600,
            performance_threshold: threshold,
            ..Default::default()
        };
        ModelUpdater::new(
            config,
            models,
            Arc::new(HashingVectorizer::new(16)),
            None,
            Box::new(LabelAgreementEvaluator::new(0.5)),
        )
    }

    fn sample(v: f64) -> PerformanceSample {
        PerformanceSample {
            precision: v,
            recall: v,
            f1: v,
            auc: v,
        }
    }

    #[test]
    fn test_should_retrain_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let u = updater(dir.path(), 0.8, shared_models());
        assert!(u.should_retrain(&[sample(0.5), sample(0.6)]));
        assert!(!u.should_retrain(&[sample(0.9), sample(0.85)]));
        assert!(!u.should_retrain(&[]));
    }

    #[test]
    fn test_buffer_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut u = updater(dir.path(), 0.8, shared_models());
        let out = u.update(batch(80)).unwrap();
        assert_eq!(out, UpdateOutcome::Buffered);
        assert_eq!(u.buffered(), 50);
    }

    #[test]
    fn test_not_due_before_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut u = updater(dir.path(), 0.8, shared_models());
        let now = u.last_update() + Duration::seconds(10);
        assert_eq!(u.update_at(batch(20), now).unwrap(), UpdateOutcome::Buffered);
        assert!(u.history().is_empty());
    }

    #[test]
    fn test_not_due_below_min_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut u = updater(dir.path(), 0.8, shared_models());
        let now = u.last_update() + Duration::hours(2);
        assert_eq!(u.update_at(batch(5), now).unwrap(), UpdateOutcome::Buffered);
    }

    #[test]
    fn test_degraded_models_are_retrained_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let models = shared_models();
        // Unfitted models score everything 0.0, so recall on flagged records is 0.
        let mut u = updater(dir.path(), 0.99, models.clone());
        let now = u.last_update() + Duration::hours(2);

        let out = u.update_at(batch(20), now).unwrap();
        assert!(matches!(out, UpdateOutcome::Retrained(_)));
        assert_eq!(u.last_update(), now);
        assert_eq!(u.history().len(), 1);

        for name in ["zscore", "centroid"] {
            let path = model_path(dir.path(), name);
            assert!(path.exists(), "{} not saved", name);
            assert!(load_model(&path).is_ok());
        }
        // The live set now holds fitted models.
        let live = models.read();
        let point = HashingVectorizer::new(16).vectorize(&["/admin".to_string(), "drop".to_string()]);
        assert!(live[1].model.score(&point) > 0.0);
    }

    #[test]
    fn test_healthy_models_take_update_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut u = updater(dir.path(), 0.0, shared_models());
        let now = u.last_update() + Duration::hours(2);
        assert!(matches!(u.update_at(batch(20), now).unwrap(), UpdateOutcome::Updated(_)));

        // Next cycle is gated by the interval again.
        let soon = now + Duration::seconds(60);
        assert_eq!(u.update_at(batch(1), soon).unwrap(), UpdateOutcome::Buffered);
    }

    #[test]
    fn test_out_of_range_interval_is_never_due() {
        let dir = tempfile::tempdir().unwrap();
        let mut u = updater(dir.path(), 0.0, shared_models());
        u.config.update_interval_secs = u64::MAX;
        let now = u.last_update() + Duration::days(3650);
        assert_eq!(u.update_at(batch(20), now).unwrap(), UpdateOutcome::Buffered);
        assert!(u.history().is_empty());
    }

    #[test]
    fn test_persistence_failure_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the model directory should be.
        let blocker = dir.path().join("models");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let models = shared_models();
        let mut u = updater(&blocker, 0.0, models.clone());
        let start = u.last_update();
        let now = start + Duration::hours(2);

        let err = u.update_at(batch(20), now).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert!(matches!(err, UpdateError::Persist { .. }));
        assert_eq!(u.buffered(), 20);
        assert_eq!(u.last_update(), start);
        assert!(u.history().is_empty());

        // Live models were not replaced by the unsaved fits.
        let live = models.read();
        assert_eq!(live[1].model.score(&[1.0; 16]), 0.0);
    }

    struct FailingEvaluator;

    impl Evaluator for FailingEvaluator {
        fn evaluate(&self, _scores: &[f64], _records: &[BufferedRecord]) -> anyhow::Result<PerformanceSample> {
            anyhow::bail!("labels unavailable")
        }
    }

    #[test]
    fn test_evaluation_failure_is_update_cycle_error() {
        let dir = tempfile::tempdir().unwrap();
        let models = shared_models();
        let mut u = updater(dir.path(), 0.0, models);
        u.evaluator = Box::new(FailingEvaluator);
        let start = u.last_update();
        let now = start + Duration::hours(2);

        let err = u.update_at(batch(20), now).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpdateCycle);
        assert!(matches!(err, UpdateError::Evaluation { .. }));
        assert!(err.to_string().contains("labels unavailable"));
        assert_eq!(u.buffered(), 20);
        assert_eq!(u.last_update(), start);
        assert!(u.history().is_empty());
        assert!(!model_path(dir.path(), "zscore").exists());
    }

    #[tokio::test]
    async fn test_update_loop_drains_channel() {
        let dir = tempfile::tempdir().unwrap();
        let u = Arc::new(Mutex::new(updater(dir.path(), 0.8, shared_models())));
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(run_update_loop(u.clone(), rx, StdDuration::from_millis(10)));

        for r in batch(12) {
            tx.send(r).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(u.lock().buffered(), 12);
    }
}
