//! Time-windowed aggregation of anomalies into summarized alerts.
//!
//! Anomalies accumulate in a history bounded by `window_secs`. Once the
//! history holds `threshold` entries a single summary is built, the history
//! is cleared, and the summary is dispatched to the configured sink.

pub mod notify;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::detect::Severity;
use crate::record::AnomalyEvent;

pub use notify::{build_sink, ChatSink, NotificationSink, WebhookSink};

const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    #[default]
    New,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub count: usize,
}

/// What gets sent when the alert threshold is crossed.
#[derive(Debug, Clone, Serialize)]
pub struct AlertSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub count: usize,
    pub distinct_sources: usize,
    pub mean_score: f64,
    pub severity: Severity,
    /// Most frequent sources, most frequent first.
    pub top_sources: Vec<SourceCount>,
    /// Latest anomalies, oldest first.
    pub recent: Vec<AnomalyEvent>,
}

impl AlertSummary {
    pub fn subject(&self) -> String {
        format!(
            "[{}] {} anomalies detected",
            self.severity.to_string().to_uppercase(),
            self.count
        )
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "Anomaly summary\n- total anomalies: {}\n- distinct sources: {}\n- mean score: {:.2}\n",
            self.count, self.distinct_sources, self.mean_score
        );
        out.push_str(&format!("\nTop {} sources:\n", self.top_sources.len()));
        for s in &self.top_sources {
            out.push_str(&format!("  {} ({})\n", s.source, s.count));
        }
        out.push_str("\nMost recent anomalies:\n");
        for ev in &self.recent {
            out.push_str(&format!(
                "  {} {} {} score={:.3} {}\n",
                ev.timestamp.to_rfc3339(),
                display_source(&ev.client_ip),
                ev.request_uri,
                ev.score,
                ev.message
            ));
        }
        out
    }

    fn extra(&self) -> serde_json::Value {
        serde_json::json!({
            "alert_id": self.id,
            "severity": self.severity,
            "count": self.count,
            "distinct_sources": self.distinct_sources,
            "mean_score": self.mean_score,
            "top_sources": self.top_sources,
        })
    }
}

/// A summary that fired, kept for querying and triage.
#[derive(Debug, Clone, Serialize)]
pub struct FiredAlert {
    pub summary: AlertSummary,
    pub status: AlertStatus,
    /// Whether a sink accepted the summary.
    pub delivered: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    /// Matches alerts listing this source among their top sources.
    pub source: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AlertFilter {
    fn matches(&self, alert: &FiredAlert) -> bool {
        let s = &alert.summary;
        self.severity.map_or(true, |sev| s.severity == sev)
            && self
                .source
                .as_ref()
                .map_or(true, |src| s.top_sources.iter().any(|t| &t.source == src))
            && self.since.map_or(true, |t| s.created_at >= t)
            && self.until.map_or(true, |t| s.created_at <= t)
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    received_at: DateTime<Utc>,
    event: AnomalyEvent,
}

pub struct AlertManager {
    config: AlertConfig,
    sink: Option<Arc<dyn NotificationSink>>,
    history: Mutex<Vec<HistoryEntry>>,
    fired: Mutex<VecDeque<FiredAlert>>,
}

impl AlertManager {
    pub fn new(config: AlertConfig, sink: Option<Arc<dyn NotificationSink>>) -> Self {
        Self {
            config,
            sink,
            history: Mutex::new(Vec::new()),
            fired: Mutex::new(VecDeque::new()),
        }
    }

    /// Anomalies currently inside the window.
    pub fn pending(&self) -> usize {
        self.history.lock().len()
    }

    pub async fn check_anomalies(&self, events: &[AnomalyEvent]) -> Option<AlertSummary> {
        self.check_anomalies_at(events, Utc::now()).await
    }

    /// Record `events` as received at `now`, drop history older than the
    /// window, and fire if the threshold is reached. Returns the summary
    /// when an alert fired.
    pub async fn check_anomalies_at(
        &self,
        events: &[AnomalyEvent],
        now: DateTime<Utc>,
    ) -> Option<AlertSummary> {
        if events.is_empty() {
            return None;
        }

        let summary = {
            let mut history = self.history.lock();
            history.extend(events.iter().map(|event| HistoryEntry {
                received_at: now,
                event: event.clone(),
            }));
            let window = self.config.window().unwrap_or(Duration::MAX);
            if let Some(cutoff) = now.checked_sub_signed(window) {
                history.retain(|e| e.received_at > cutoff);
            }

            if history.len() < self.config.threshold.max(1) {
                debug!(pending = history.len(), threshold = self.config.threshold, "below alert threshold");
                return None;
            }
            let summary = summarize(&history, &self.config, now);
            history.clear();
            summary
        };

        info!(
            alert_id = %summary.id,
            count = summary.count,
            sources = summary.distinct_sources,
            severity = %summary.severity,
            "alert triggered"
        );
        let delivered = self.dispatch(&summary).await;
        self.record_fired(summary.clone(), delivered);
        Some(summary)
    }

    async fn dispatch(&self, summary: &AlertSummary) -> bool {
        let Some(sink) = &self.sink else {
            return false;
        };
        if summary.severity < self.config.min_severity {
            debug!(
                severity = %summary.severity,
                min = %self.config.min_severity,
                "alert below notification severity, not dispatched"
            );
            return false;
        }
        let extra = summary.extra();
        match sink.send(&summary.subject(), &summary.render(), Some(&extra)).await {
            Ok(()) => true,
            Err(e) => {
                error!(alert_id = %summary.id, sink = sink.name(), error = %e, "failed to dispatch alert");
                false
            }
        }
    }

    fn record_fired(&self, summary: AlertSummary, delivered: bool) {
        let mut fired = self.fired.lock();
        fired.push_back(FiredAlert {
            summary,
            status: AlertStatus::New,
            delivered,
        });
        while fired.len() > self.config.history_size {
            fired.pop_front();
        }
    }

    /// Fired alerts matching `filter`, oldest first.
    pub fn alerts(&self, filter: &AlertFilter) -> Vec<FiredAlert> {
        self.fired
            .lock()
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect()
    }

    /// Returns `false` when no fired alert has that id.
    pub fn update_status(&self, id: Uuid, status: AlertStatus) -> bool {
        let mut fired = self.fired.lock();
        match fired.iter_mut().find(|a| a.summary.id == id) {
            Some(alert) => {
                info!(alert_id = %id, from = ?alert.status, to = ?status, "alert status updated");
                alert.status = status;
                true
            }
            None => {
                warn!(alert_id = %id, "no such alert");
                false
            }
        }
    }
}

fn display_source(ip: &str) -> &str {
    if ip.is_empty() {
        UNKNOWN_SOURCE
    } else {
        ip
    }
}

fn summarize(history: &[HistoryEntry], config: &AlertConfig, now: DateTime<Utc>) -> AlertSummary {
    let count = history.len();

    let mut per_source: HashMap<&str, usize> = HashMap::new();
    for e in history {
        *per_source.entry(display_source(&e.event.client_ip)).or_default() += 1;
    }
    let distinct_sources = per_source.len();

    let mut ranked: Vec<(&str, usize)> = per_source.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let top_sources = ranked
        .into_iter()
        .take(config.top_sources)
        .map(|(source, count)| SourceCount {
            source: source.to_string(),
            count,
        })
        .collect();

    let scores: f64 = history.iter().map(|e| e.event.score).filter(|s| s.is_finite()).sum();
    let mean_score = if count == 0 { 0.0 } else { scores / count as f64 };

    let severity = history
        .iter()
        .map(|e| e.event.origin.severity())
        .max()
        .unwrap_or(Severity::Low);

    let recent = history[count.saturating_sub(config.recent_entries)..]
        .iter()
        .map(|e| e.event.clone())
        .collect();

    AlertSummary {
        id: Uuid::new_v4(),
        created_at: now,
        count,
        distinct_sources,
        mean_score,
        severity,
        top_sources,
        recent,
    }
}
