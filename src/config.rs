//! TOML configuration for the wafwatch daemon.
//!
//! Every section has compiled-in defaults, so a partial file (or none at all)
//! is valid. The file path can be overridden with `WAFWATCH_CONFIG`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::Severity;
use crate::scoring::CombineOp;

pub use crate::detect::realtime::{DetectorConfig, ThresholdMode};

pub const CONFIG_ENV: &str = "WAFWATCH_CONFIG";
pub const NOTIFY_URL_ENV: &str = "WAFWATCH_NOTIFY_URL";
pub const SMTP_PASSWORD_ENV: &str = "WAFWATCH_SMTP_PASSWORD";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/wafwatch/wafwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WafwatchConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub combiner: CombinerConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub updater: UpdaterConfig,
    #[serde(default)]
    pub vectorizer: VectorizerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WafwatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded wafwatch configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `WAFWATCH_CONFIG`.
    /// 2. `/etc/wafwatch/wafwatch.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "WAFWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values that would make a component misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.cache.capacity == 0 {
            bail!("[cache] capacity must be at least 1");
        }
        if self.cache.ttl().is_none() {
            bail!("[cache] ttl_hours is out of range: {}", self.cache.ttl_hours);
        }
        if self.detector.window_size == 0 {
            bail!("[detector] window_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.detector.min_anomaly_ratio) {
            bail!(
                "[detector] min_anomaly_ratio must be within [0, 1], got {}",
                self.detector.min_anomaly_ratio
            );
        }
        if !self.detector.flat_margin.is_finite() || self.detector.flat_margin < 0.0 {
            bail!("[detector] flat_margin must be a non-negative number");
        }
        if let Some((name, w)) = self.combiner.weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            bail!("[combiner] weight for '{}' must be a non-negative number, got {}", name, w);
        }
        if !self.combiner.weights.is_empty() && self.combiner.weights.values().sum::<f64>() <= 0.0 {
            bail!("[combiner] weights must sum to a positive value");
        }
        if self.alerts.threshold == 0 {
            bail!("[alerts] threshold must be at least 1");
        }
        if self.alerts.window().is_none() {
            bail!("[alerts] window_secs is out of range: {}", self.alerts.window_secs);
        }
        if self.updater.capacity == 0 {
            bail!("[updater] capacity must be at least 1");
        }
        if self.updater.min_samples > self.updater.capacity {
            bail!(
                "[updater] min_samples ({}) exceeds capacity ({})",
                self.updater.min_samples,
                self.updater.capacity
            );
        }
        if self.updater.interval().is_none() {
            bail!(
                "[updater] update_interval_secs is out of range: {}",
                self.updater.update_interval_secs
            );
        }
        if self.vectorizer.dimension == 0 {
            bail!("[vectorizer] dimension must be at least 1");
        }
        if self.ingest.batch_size == 0 {
            bail!("[ingest] batch_size must be at least 1");
        }
        match self.notify.kind {
            NotifyKind::None => {}
            NotifyKind::Webhook | NotifyKind::Chat => {
                if self.notify.resolved_url().is_none() {
                    bail!("[notify] kind is {:?} but no url is configured", self.notify.kind);
                }
            }
            NotifyKind::Email => self.notify.email.validate()?,
        }
        Ok(())
    }
}

/// `value` units as a chrono span, or `None` when it does not fit.
fn span(value: u64, per: fn(i64) -> Option<Duration>) -> Option<Duration> {
    i64::try_from(value).ok().and_then(per)
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Snapshot file. No persistence when unset.
    pub path: Option<PathBuf>,
    pub capacity: usize,
    pub ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            capacity: 10_000,
            ttl_hours: 24,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        span(self.ttl_hours, Duration::try_hours)
    }
}

// ---------------------------------------------------------------------------
// Combiner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinerConfig {
    pub operation: CombineOp,
    /// Per-model weights for `weighted_mean`. Empty means uniform.
    pub weights: BTreeMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Anomalies inside the window needed to fire.
    pub threshold: usize,
    pub window_secs: u64,
    /// Summaries below this severity are not dispatched.
    pub min_severity: Severity,
    pub top_sources: usize,
    pub recent_entries: usize,
    /// Fired summaries kept for querying.
    pub history_size: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_secs: 300,
            min_severity: Severity::Low,
            top_sources: 3,
            recent_entries: 3,
            history_size: 1000,
        }
    }
}

impl AlertConfig {
    pub fn window(&self) -> Option<Duration> {
        span(self.window_secs, Duration::try_seconds)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    #[default]
    None,
    Webhook,
    Chat,
    Email,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub kind: NotifyKind,
    pub url: Option<String>,
    /// Chat channel, for `kind = "chat"`.
    pub channel: Option<String>,
    /// HTTP method, for `kind = "webhook"`.
    pub method: String,
    pub timeout_secs: u64,
    pub headers: BTreeMap<String, String>,
    /// SMTP settings, for `kind = "email"`.
    pub email: EmailConfig,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            kind: NotifyKind::None,
            url: None,
            channel: None,
            method: "POST".to_string(),
            timeout_secs: 10,
            headers: BTreeMap::new(),
            email: EmailConfig::default(),
        }
    }
}

impl NotifyConfig {
    /// The endpoint, preferring `WAFWATCH_NOTIFY_URL` over the file.
    pub fn resolved_url(&self) -> Option<String> {
        std::env::var(NOTIFY_URL_ENV)
            .ok()
            .filter(|u| !u.is_empty())
            .or_else(|| self.url.clone())
    }
}

/// `[notify.email]`: STARTTLS submission to an SMTP relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub server: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    /// Never written back out; prefer `WAFWATCH_SMTP_PASSWORD`.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Sender address. Falls back to `username`.
    pub from: Option<String>,
    pub to: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: 587,
            username: None,
            password: None,
            from: None,
            to: Vec::new(),
        }
    }
}

impl EmailConfig {
    /// The SMTP password, preferring `WAFWATCH_SMTP_PASSWORD` over the file.
    pub fn resolved_password(&self) -> Option<String> {
        std::env::var(SMTP_PASSWORD_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| self.password.clone())
    }

    pub fn sender(&self) -> Option<&str> {
        self.from.as_deref().or(self.username.as_deref())
    }

    fn validate(&self) -> Result<()> {
        if self.server.as_deref().map_or(true, str::is_empty) {
            bail!("[notify.email] server is required");
        }
        if self.sender().is_none() {
            bail!("[notify.email] from (or username) is required");
        }
        if self.to.is_empty() {
            bail!("[notify.email] at least one recipient is required");
        }
        if self.username.is_some() && self.resolved_password().is_none() {
            bail!("[notify.email] username is set but no password is configured");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Updater
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub enabled: bool,
    pub model_dir: PathBuf,
    /// Records kept in the update buffer.
    pub capacity: usize,
    pub min_samples: usize,
    pub update_interval_secs: u64,
    pub performance_threshold: f64,
    /// Scores above this count as a positive prediction during evaluation.
    pub score_cutoff: f64,
    /// How often the background loop checks whether a cycle is due.
    pub poll_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_dir: PathBuf::from("models"),
            capacity: 10_000,
            min_samples: 100,
            update_interval_secs: 3600,
            performance_threshold: 0.8,
            score_cutoff: 0.5,
            poll_secs: 30,
        }
    }
}

impl UpdaterConfig {
    pub fn interval(&self) -> Option<Duration> {
        span(self.update_interval_secs, Duration::try_seconds)
    }
}

// ---------------------------------------------------------------------------
// Vectorizer / ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorizerConfig {
    pub dimension: usize,
}

impl Default for VectorizerConfig {
    fn default() -> Self {
        Self { dimension: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Records handed to the pipeline per batch.
    pub batch_size: usize,
    pub stats_interval_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            stats_interval_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = WafwatchConfig::default();

        assert!(cfg.cache.path.is_none());
        assert_eq!(cfg.cache.capacity, 10_000);
        assert_eq!(cfg.cache.ttl_hours, 24);

        assert_eq!(cfg.detector.window_size, 1000);
        assert_eq!(cfg.detector.min_anomaly_ratio, 0.1);
        assert_eq!(cfg.detector.threshold_mode, ThresholdMode::Adaptive);

        assert_eq!(cfg.combiner.operation, CombineOp::Mean);
        assert!(cfg.combiner.weights.is_empty());

        assert_eq!(cfg.alerts.threshold, 5);
        assert_eq!(cfg.alerts.window_secs, 300);
        assert_eq!(cfg.alerts.min_severity, Severity::Low);
        assert_eq!(cfg.alerts.top_sources, 3);
        assert_eq!(cfg.alerts.recent_entries, 3);

        assert_eq!(cfg.notify.kind, NotifyKind::None);
        assert_eq!(cfg.notify.method, "POST");

        assert!(cfg.updater.enabled);
        assert_eq!(cfg.updater.model_dir, PathBuf::from("models"));
        assert_eq!(cfg.updater.capacity, 10_000);
        assert_eq!(cfg.updater.min_samples, 100);
        assert_eq!(cfg.updater.update_interval_secs, 3600);
        assert_eq!(cfg.updater.performance_threshold, 0.8);

        assert_eq!(cfg.vectorizer.dimension, 64);
        assert_eq!(cfg.ingest.batch_size, 10);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);

        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r##"
[cache]
path = "/var/lib/wafwatch/vectors.json"
capacity = 500
ttl_hours = 2

[detector]
window_size = 50
min_anomaly_ratio = 0.25
threshold_mode = "fixed"

[combiner]
operation = "weighted_mean"
weights = { zscore = 2.0, centroid = 1.0 }

[rules]
path = "/etc/wafwatch/rules.json"

[alerts]
threshold = 3
window_secs = 60
min_severity = "high"

[notify]
kind = "chat"
url = "https://chat.example.com/hooks/abc"
channel = "#soc"

[updater]
enabled = false
model_dir = "/var/lib/wafwatch/models"
min_samples = 10

[logging]
level = "debug"
json = true
"##;

        let cfg: WafwatchConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.cache.path, Some(PathBuf::from("/var/lib/wafwatch/vectors.json")));
        assert_eq!(cfg.cache.capacity, 500);
        assert_eq!(cfg.detector.window_size, 50);
        assert_eq!(cfg.detector.threshold_mode, ThresholdMode::Fixed);
        assert_eq!(cfg.combiner.operation, CombineOp::WeightedMean);
        assert_eq!(cfg.combiner.weights.get("zscore"), Some(&2.0));
        assert_eq!(cfg.rules.path, Some(PathBuf::from("/etc/wafwatch/rules.json")));
        assert_eq!(cfg.alerts.threshold, 3);
        assert_eq!(cfg.alerts.min_severity, Severity::High);
        assert_eq!(cfg.alerts.top_sources, 3);
        assert_eq!(cfg.notify.kind, NotifyKind::Chat);
        assert_eq!(cfg.notify.channel.as_deref(), Some("#soc"));
        assert!(!cfg.updater.enabled);
        assert_eq!(cfg.updater.min_samples, 10);
        assert_eq!(cfg.updater.capacity, 10_000);
        assert!(cfg.logging.json);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: WafwatchConfig = toml::from_str("[alerts]\nthreshold = 9\n").unwrap();
        assert_eq!(cfg.alerts.threshold, 9);
        assert_eq!(cfg.alerts.window_secs, 300);
        assert_eq!(cfg.detector.window_size, 1000);
        assert_eq!(cfg.updater.min_samples, 100);
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let res: Result<WafwatchConfig, _> = toml::from_str("[combiner]\noperation = \"median\"\n");
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = WafwatchConfig::default();
        cfg.detector.window_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = WafwatchConfig::default();
        cfg.detector.min_anomaly_ratio = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = WafwatchConfig::default();
        cfg.cache.capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = WafwatchConfig::default();
        cfg.combiner.weights.insert("zscore".into(), -1.0);
        assert!(cfg.validate().is_err());

        let mut cfg = WafwatchConfig::default();
        cfg.updater.min_samples = cfg.updater.capacity + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unrepresentable_durations() {
        let mut cfg = WafwatchConfig::default();
        cfg.cache.ttl_hours = 3_000_000_000_000;
        assert!(cfg.cache.ttl().is_none());
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("ttl_hours"), "{}", err);

        let mut cfg = WafwatchConfig::default();
        cfg.alerts.window_secs = u64::MAX;
        assert!(cfg.alerts.window().is_none());
        assert!(cfg.validate().unwrap_err().to_string().contains("window_secs"));

        let mut cfg = WafwatchConfig::default();
        cfg.updater.update_interval_secs = u64::MAX;
        assert!(cfg.updater.interval().is_none());
        assert!(cfg.validate().unwrap_err().to_string().contains("update_interval_secs"));

        let cfg = WafwatchConfig::default();
        assert_eq!(cfg.cache.ttl(), Some(Duration::hours(24)));
        assert_eq!(cfg.alerts.window(), Some(Duration::seconds(300)));
        assert_eq!(cfg.updater.interval(), Some(Duration::hours(1)));
    }

    #[test]
    fn test_email_section() {
        let cfg: WafwatchConfig = toml::from_str(
            r#"
[notify]
kind = "email"

[notify.email]
server = "smtp.example.com"
username = "wafwatch@example.com"
password = "secret"
to = ["soc@example.com"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.notify.kind, NotifyKind::Email);
        assert_eq!(cfg.notify.email.port, 587);
        assert_eq!(cfg.notify.email.sender(), Some("wafwatch@example.com"));
        assert!(cfg.validate().is_ok());

        // The password stays out of rendered config.
        let rendered = toml::to_string_pretty(&cfg).unwrap();
        assert!(rendered.contains("smtp.example.com"));
        assert!(!rendered.contains("secret"));

        let mut no_rcpt = cfg.clone();
        no_rcpt.notify.email.to.clear();
        assert!(no_rcpt.validate().is_err());

        let mut no_server = cfg;
        no_server.notify.email.server = None;
        assert!(no_server.validate().unwrap_err().to_string().contains("server"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("wafwatch.toml");
        std::fs::write(&path, "[vectorizer]\ndimension = 16\n").unwrap();

        let cfg = WafwatchConfig::load(&path).unwrap();
        assert_eq!(cfg.vectorizer.dimension, 16);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = WafwatchConfig::load(Path::new("/nonexistent/path/wafwatch.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut cfg = WafwatchConfig::default();
        cfg.combiner.weights.insert("zscore".into(), 1.5);
        cfg.notify.headers.insert("X-Token".into(), "abc".into());
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: WafwatchConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(back.combiner.weights, cfg.combiner.weights);
        assert_eq!(back.notify.headers, cfg.notify.headers);
        assert_eq!(back.alerts.threshold, cfg.alerts.threshold);
        assert_eq!(back.detector.threshold_mode, cfg.detector.threshold_mode);
    }
}
