//! wafwatch: streaming anomaly detection and alerting for WAF logs.
//!
//! Parsed log records arrive as JSON lines. Each record is vectorized,
//! scored by every loaded model, fused into one score, and judged by an
//! adaptive detector and a regex rule set. Anomalies feed a sliding-window
//! alert manager, and a background updater keeps the models fresh.

pub mod alert;
pub mod cache;
pub mod config;
pub mod detect;
pub mod record;
pub mod scoring;
pub mod update;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::alert::notify::build_sink;
use crate::alert::AlertManager;
use crate::cache::VectorCache;
use crate::config::WafwatchConfig;
use crate::detect::engine::DetectionEngine;
use crate::detect::realtime::RealTimeDetector;
use crate::detect::rules::RuleBasedDetector;
use crate::record::LogRecord;
use crate::scoring::{load_default_models, FeatureVectorizer, HashingVectorizer, ScoreCombiner};
use crate::update::evaluate::LabelAgreementEvaluator;
use crate::update::{run_update_loop, BufferedRecord, ModelUpdater};

/// Records queued for the updater before the ingestion path starts dropping.
const UPDATE_QUEUE_DEPTH: usize = 4096;

/// A fully wired pipeline. The updater half is `None` when disabled.
pub struct Pipeline {
    pub engine: Arc<DetectionEngine>,
    pub updater: Option<(Arc<Mutex<ModelUpdater>>, mpsc::Receiver<BufferedRecord>)>,
}

/// Build every component from `config` and connect them.
pub fn build_pipeline(config: &WafwatchConfig) -> Result<Pipeline> {
    let cache = Arc::new(VectorCache::open(&config.cache));
    let vectorizer: Arc<dyn FeatureVectorizer> =
        Arc::new(HashingVectorizer::new(config.vectorizer.dimension));
    let models = Arc::new(RwLock::new(load_default_models(&config.updater.model_dir)));
    let combiner = ScoreCombiner::new(config.combiner.operation, config.combiner.weights.clone());
    let detector = RealTimeDetector::new(config.detector.clone());
    let rules = match &config.rules.path {
        Some(path) => RuleBasedDetector::from_file(path),
        None => RuleBasedDetector::new(),
    };
    let sink = build_sink(&config.notify).context("failed to configure notifications")?;
    let alerts = Arc::new(AlertManager::new(config.alerts.clone(), sink));

    let engine = DetectionEngine::new(
        cache.clone(),
        vectorizer.clone(),
        models.clone(),
        combiner,
        detector,
        rules,
        alerts,
    );

    if !config.updater.enabled {
        info!("model updater disabled");
        return Ok(Pipeline {
            engine: Arc::new(engine),
            updater: None,
        });
    }

    let (tx, rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);
    let updater = ModelUpdater::new(
        config.updater.clone(),
        models,
        vectorizer,
        Some(cache),
        Box::new(LabelAgreementEvaluator::new(config.updater.score_cutoff)),
    );
    Ok(Pipeline {
        engine: Arc::new(engine.with_update_sender(tx)),
        updater: Some((Arc::new(Mutex::new(updater)), rx)),
    })
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub lines: u64,
    pub records: u64,
    pub malformed: u64,
    pub anomalies: u64,
    pub alerts: u64,
}

/// Read JSON-lines records from `reader` and push them through `engine` in
/// batches of `batch_size`. Blank lines are ignored; lines that are not a
/// record are logged and skipped. Invalid UTF-8 is replaced rather than
/// treated as a read failure, so one mangled payload cannot end the run.
pub async fn ingest<R>(engine: &DetectionEngine, mut reader: R, batch_size: usize) -> Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let batch_size = batch_size.max(1);
    let mut summary = IngestSummary::default();
    let mut batch: Vec<LogRecord> = Vec::with_capacity(batch_size);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .await
            .context("failed to read input")?;
        if read == 0 {
            break;
        }
        summary.lines += 1;

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => batch.push(record),
            Err(e) => {
                summary.malformed += 1;
                warn!(line = summary.lines, error = %e, "skipping malformed record");
                continue;
            }
        }
        if batch.len() >= batch_size {
            flush_batch(engine, &mut batch, &mut summary).await;
        }
    }
    if !batch.is_empty() {
        flush_batch(engine, &mut batch, &mut summary).await;
    }
    Ok(summary)
}

async fn flush_batch(engine: &DetectionEngine, batch: &mut Vec<LogRecord>, summary: &mut IngestSummary) {
    let report = engine.process_batch(batch).await;
    summary.records += batch.len() as u64;
    summary.anomalies += report.events.len() as u64;
    if report.alert.is_some() {
        summary.alerts += 1;
    }
    batch.clear();
}

/// Run the daemon until the input ends or Ctrl-C arrives.
///
/// Records come from `input` when given, stdin otherwise.
pub async fn serve(config: WafwatchConfig, input: Option<PathBuf>) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let Pipeline { engine, updater } = build_pipeline(&config)?;
    info!(
        batch_size = config.ingest.batch_size,
        updater = updater.is_some(),
        "wafwatch starting"
    );

    let update_task = updater.map(|(updater, rx)| {
        let poll = Duration::from_secs(config.updater.poll_secs.max(1));
        tokio::spawn(run_update_loop(updater, rx, poll))
    });

    let stats_task = {
        let engine = engine.clone();
        let every = Duration::from_secs(config.ingest.stats_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                engine.log_stats();
            }
        })
    };

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open input: {}", path.display()))?;
            info!(path = %path.display(), "reading records from file");
            Box::new(BufReader::new(file))
        }
        None => {
            info!("reading records from stdin");
            Box::new(BufReader::new(tokio::io::stdin()))
        }
    };

    tokio::select! {
        result = ingest(&engine, reader, config.ingest.batch_size) => {
            let summary = result?;
            info!(
                lines = summary.lines,
                records = summary.records,
                malformed = summary.malformed,
                anomalies = summary.anomalies,
                alerts = summary.alerts,
                "input exhausted"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    stats_task.abort();
    let _ = stats_task.await;
    engine.log_stats();
    engine.cache().flush();

    // Dropping the last engine handle closes the update channel, which lets
    // the loop run one final attempt and exit.
    drop(engine);
    if let Some(task) = update_task {
        if tokio::time::timeout(Duration::from_secs(30), task).await.is_err() {
            warn!("model updater did not stop in time");
        }
    }

    info!("wafwatch stopped");
    Ok(())
}
