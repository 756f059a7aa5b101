//! The per-record pipeline: vectorize, score, combine, detect, alert.
//!
//! Records in a batch are processed strictly in order. Each component guards
//! its own state and no lock is held while another component is entered.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::realtime::{DetectionResult, DetectorStats, RealTimeDetector};
use super::rules::{RuleBasedDetector, RuleHit, RuleSpec};
use super::DetectError;
use crate::alert::{AlertManager, AlertSummary};
use crate::cache::{CacheStats, VectorCache};
use crate::record::{tokenize, AnomalyEvent, LogRecord, Origin};
use crate::scoring::{score_all, CombineOp, FeatureVector, FeatureVectorizer, ScoreCombiner, SharedModels};
use crate::update::BufferedRecord;

/// Lifetime counters for one engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub records: u64,
    /// Records that produced a fused score.
    pub scored: u64,
    pub statistical_anomalies: u64,
    pub rule_hits: u64,
    /// Updates where the detector's ratio condition held.
    pub ratio_alerts: u64,
    pub alerts_fired: u64,
    /// Records not handed to the updater because its queue was full.
    pub update_backlog_drops: u64,
}

/// Everything an operator might want to see at once.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub engine: EngineStats,
    pub cache: CacheStats,
    pub detector: DetectorStats,
    pub rules: usize,
    pub pending_alerts: usize,
}

/// Result of feeding one record through the pipeline.
#[derive(Debug, Clone)]
pub struct RecordVerdict {
    pub detection: Option<DetectionResult>,
    pub hits: Vec<RuleHit>,
    pub events: Vec<AnomalyEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub events: Vec<AnomalyEvent>,
    pub alert: Option<AlertSummary>,
}

pub struct DetectionEngine {
    cache: Arc<VectorCache>,
    vectorizer: Arc<dyn FeatureVectorizer>,
    models: SharedModels,
    combiner: RwLock<ScoreCombiner>,
    detector: Mutex<RealTimeDetector>,
    rules: RwLock<RuleBasedDetector>,
    alerts: Arc<AlertManager>,
    updates: Option<mpsc::Sender<BufferedRecord>>,
    stats: Mutex<EngineStats>,
}

impl DetectionEngine {
    pub fn new(
        cache: Arc<VectorCache>,
        vectorizer: Arc<dyn FeatureVectorizer>,
        models: SharedModels,
        combiner: ScoreCombiner,
        detector: RealTimeDetector,
        rules: RuleBasedDetector,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            cache,
            vectorizer,
            models,
            combiner: RwLock::new(combiner),
            detector: Mutex::new(detector),
            rules: RwLock::new(rules),
            alerts,
            updates: None,
            stats: Mutex::new(EngineStats::default()),
        }
    }

    /// Forward every processed record to the model updater.
    pub fn with_update_sender(mut self, tx: mpsc::Sender<BufferedRecord>) -> Self {
        self.updates = Some(tx);
        self
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn cache(&self) -> &Arc<VectorCache> {
        &self.cache
    }

    /// Process a batch in arrival order, then hand its anomalies to the
    /// alert manager.
    pub async fn process_batch(&self, records: &[LogRecord]) -> BatchReport {
        let mut events = Vec::new();
        for record in records {
            events.extend(self.process_record(record).events);
        }

        let alert = self.alerts.check_anomalies(&events).await;
        if alert.is_some() {
            self.stats.lock().alerts_fired += 1;
        }
        BatchReport { events, alert }
    }

    /// Run one record through both detectors without touching alerts.
    pub fn process_record(&self, record: &LogRecord) -> RecordVerdict {
        let vector = self.vectorize(record);
        let scores = {
            let models = self.models.read();
            score_all(&models, &vector)
        };

        let fused = match self.combiner.read().combine(&scores) {
            Ok(score) => Some(score),
            Err(e) => {
                debug!(error = %e, "no fused score for record");
                None
            }
        };
        let detection = fused.and_then(|score| self.detector.lock().update(score, record.timestamp));
        let hits = self.rules.read().detect(record);

        let mut events = Vec::with_capacity(1 + hits.len());
        if let Some(d) = detection.as_ref().filter(|d| d.is_anomaly) {
            events.push(AnomalyEvent::from_record(record, d.score, Origin::Statistical));
        }
        for hit in &hits {
            let origin = Origin::Rule {
                rule: hit.rule_name.clone(),
                severity: hit.severity,
            };
            events.push(AnomalyEvent::from_record(record, fused.unwrap_or(0.0), origin));
        }

        {
            let mut stats = self.stats.lock();
            stats.records += 1;
            stats.rule_hits += hits.len() as u64;
            if let Some(d) = &detection {
                stats.scored += 1;
                if d.is_anomaly {
                    stats.statistical_anomalies += 1;
                }
                if d.alert_triggered {
                    stats.ratio_alerts += 1;
                }
            }
        }
        if let Some(d) = detection.as_ref().filter(|d| d.alert_triggered && d.is_anomaly) {
            warn!(
                ratio = d.stats.current_anomaly_ratio,
                threshold = d.threshold,
                "anomaly ratio at or above minimum"
            );
        }

        self.forward_to_updater(record, !hits.is_empty());

        RecordVerdict {
            detection,
            hits,
            events,
        }
    }

    fn vectorize(&self, record: &LogRecord) -> FeatureVector {
        let tokens = tokenize(record);
        if let Some(v) = self.cache.get(&tokens) {
            return v;
        }
        let v = self
            .vectorizer
            .transform(std::slice::from_ref(&tokens))
            .pop()
            .unwrap_or_else(|| vec![0.0; self.vectorizer.dimension()]);
        self.cache.put(&tokens, v.clone());
        v
    }

    fn forward_to_updater(&self, record: &LogRecord, flagged: bool) {
        let Some(tx) = &self.updates else {
            return;
        };
        let buffered = BufferedRecord {
            record: record.clone(),
            flagged,
        };
        if tx.try_send(buffered).is_err() {
            self.stats.lock().update_backlog_drops += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Runtime control
    // -----------------------------------------------------------------------

    pub fn add_rule(&self, spec: RuleSpec) -> Result<(), DetectError> {
        self.rules.write().add_rule(spec)
    }

    pub fn reload_rules(&self, path: &Path) -> Result<usize, DetectError> {
        self.rules.write().load_rules(path)
    }

    pub fn clear_rules(&self) {
        self.rules.write().clear_rules();
    }

    pub fn set_combiner_operation(&self, operation: CombineOp) {
        self.combiner.write().set_operation(operation);
        info!(%operation, "combiner operation changed");
    }

    pub fn set_combiner_weights(&self, weights: std::collections::BTreeMap<String, f64>) {
        self.combiner.write().set_weights(weights);
    }

    pub fn reset_detector(&self) {
        self.detector.lock().reset();
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            engine: self.stats.lock().clone(),
            cache: self.cache.stats(),
            detector: self.detector.lock().stats(),
            rules: self.rules.read().len(),
            pending_alerts: self.alerts.pending(),
        }
    }

    pub fn log_stats(&self) {
        let s = self.snapshot();
        info!(
            records = s.engine.records,
            scored = s.engine.scored,
            anomalies = s.engine.statistical_anomalies,
            rule_hits = s.engine.rule_hits,
            alerts = s.engine.alerts_fired,
            cache_entries = s.cache.entries,
            cache_hits = s.cache.hits,
            cache_misses = s.cache.misses,
            threshold = s.detector.current_threshold,
            ratio = s.detector.current_anomaly_ratio,
            "engine stats"
        );
    }
}
