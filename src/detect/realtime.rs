//! Sliding-window detector with fixed or adaptive thresholds.
//!
//! Each incoming fused score is judged against the window as it stood before
//! the score arrived, then appended. With fewer than two scores of history
//! the threshold is +inf, so nothing is flagged while the window warms up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::window::{percentile, ScoreWindow};

/// Multiplier on the standard deviation in fixed mode.
const FIXED_SIGMA: f64 = 2.0;
/// Percentile of absolute z-scores used as the adaptive multiplier.
const ADAPTIVE_PERCENTILE: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    /// `mean + 2 * stddev`
    Fixed,
    /// `mean + p95(|z|) * stddev`
    #[default]
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub window_size: usize,
    pub min_anomaly_ratio: f64,
    pub threshold_mode: ThresholdMode,
    /// Margin over the mean used by adaptive mode when the window has zero
    /// spread.
    pub flat_margin: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            min_anomaly_ratio: 0.1,
            threshold_mode: ThresholdMode::Adaptive,
            flat_margin: 1.0,
        }
    }
}

/// Snapshot of detector state after an update. Every field describes the
/// window with the latest score appended, so `current_threshold` is the one
/// the next score will be judged against. The threshold applied to the score
/// itself is `DetectionResult::threshold`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectorStats {
    pub total_seen: u64,
    pub total_anomalies: u64,
    pub running_mean: f64,
    pub running_std_dev: f64,
    pub current_threshold: f64,
    pub current_anomaly_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    pub threshold: f64,
    pub is_anomaly: bool,
    /// Window is full and the lifetime anomaly ratio meets the minimum.
    /// Advisory only; nothing is reset.
    pub alert_triggered: bool,
    pub stats: DetectorStats,
}

pub struct RealTimeDetector {
    config: DetectorConfig,
    window: ScoreWindow,
    total_seen: u64,
    total_anomalies: u64,
    last_threshold: f64,
}

impl RealTimeDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let window = ScoreWindow::new(config.window_size);
        Self {
            config,
            window,
            total_seen: 0,
            total_anomalies: 0,
            last_threshold: 0.0,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Feed one fused score. Returns `None` when the score or the resulting
    /// statistics are not finite; such events are not counted.
    pub fn update(&mut self, score: f64, timestamp: Option<DateTime<Utc>>) -> Option<DetectionResult> {
        if !score.is_finite() {
            warn!(score, "ignoring non-finite score");
            return None;
        }

        let threshold = self.threshold();
        if threshold.is_nan() {
            warn!("threshold computation failed, skipping event");
            return None;
        }

        let displaced = self.window.push(score);
        let mean = self.window.mean();
        let std_dev = self.window.std_dev();
        let next_threshold = self.threshold();
        if !mean.is_finite() || !std_dev.is_finite() || next_threshold.is_nan() {
            warn!(score, "window statistics overflowed, skipping event");
            self.window.undo_push(displaced);
            return None;
        }

        let is_anomaly = score > threshold;
        self.total_seen += 1;
        if is_anomaly {
            self.total_anomalies += 1;
        }
        self.last_threshold = next_threshold;

        let stats = DetectorStats {
            total_seen: self.total_seen,
            total_anomalies: self.total_anomalies,
            running_mean: mean,
            running_std_dev: std_dev,
            current_threshold: next_threshold,
            current_anomaly_ratio: self.ratio(),
        };

        let alert_triggered =
            self.window.is_full() && stats.current_anomaly_ratio >= self.config.min_anomaly_ratio;

        if is_anomaly {
            debug!(score, threshold, ratio = stats.current_anomaly_ratio, "score above threshold");
        }

        Some(DetectionResult {
            timestamp: timestamp.unwrap_or_else(Utc::now),
            score,
            threshold,
            is_anomaly,
            alert_triggered,
            stats,
        })
    }

    /// Threshold derived from the current window contents.
    pub fn threshold(&self) -> f64 {
        if self.window.len() < 2 {
            return f64::INFINITY;
        }
        let mean = self.window.mean();
        let std_dev = self.window.std_dev();
        match self.config.threshold_mode {
            ThresholdMode::Fixed => mean + FIXED_SIGMA * std_dev,
            ThresholdMode::Adaptive => {
                if is_flat(mean, std_dev) {
                    return mean + self.config.flat_margin;
                }
                let z = self.window.abs_z_scores();
                match percentile(&z, ADAPTIVE_PERCENTILE) {
                    Some(multiplier) => mean + multiplier * std_dev,
                    None => f64::INFINITY,
                }
            }
        }
    }

    fn ratio(&self) -> f64 {
        if self.total_seen == 0 {
            0.0
        } else {
            self.total_anomalies as f64 / self.total_seen as f64
        }
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            total_seen: self.total_seen,
            total_anomalies: self.total_anomalies,
            running_mean: self.window.mean(),
            running_std_dev: self.window.std_dev(),
            current_threshold: self.last_threshold,
            current_anomaly_ratio: self.ratio(),
        }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Clear the window and every counter.
    pub fn reset(&mut self) {
        self.window.clear();
        self.total_seen = 0;
        self.total_anomalies = 0;
        self.last_threshold = 0.0;
    }
}

/// Zero spread, allowing for rounding noise in the mean of identical scores.
fn is_flat(mean: f64, std_dev: f64) -> bool {
    std_dev <= f64::EPSILON * mean.abs().max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(window_size: usize, min_anomaly_ratio: f64, mode: ThresholdMode) -> RealTimeDetector {
        RealTimeDetector::new(DetectorConfig {
            window_size,
            min_anomaly_ratio,
            threshold_mode: mode,
            ..Default::default()
        })
    }

    #[test]
    fn test_initial_stats_are_zero() {
        let d = RealTimeDetector::new(DetectorConfig::default());
        assert_eq!(d.stats(), DetectorStats::default());
    }

    #[test]
    fn test_fixed_mode_spike_raises_alert_condition() {
        let mut d = detector(5, 0.2, ThresholdMode::Fixed);
        let mut last = None;
        for s in [0.1, 0.1, 0.1, 0.1] {
            let r = d.update(s, None).unwrap();
            assert!(!r.is_anomaly);
            assert!(!r.alert_triggered);
            last = Some(r);
        }
        assert!(last.unwrap().threshold > 0.0);

        let r = d.update(5.0, None).unwrap();
        assert!(r.is_anomaly);
        assert!(r.alert_triggered);
        assert_eq!(r.stats.total_seen, 5);
        assert_eq!(r.stats.total_anomalies, 1);
        assert!((r.stats.current_anomaly_ratio - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_adaptive_threshold_flags_outlier() {
        let mut d = detector(3, 0.1, ThresholdMode::Adaptive);
        for _ in 0..3 {
            let r = d.update(0.2, None).unwrap();
            assert!(!r.is_anomaly);
            assert!(r.threshold > 0.0);
        }
        let r = d.update(10.0, None).unwrap();
        assert!(r.is_anomaly);
    }

    #[test]
    fn test_constant_scores_use_flat_margin() {
        let mut d = detector(10, 0.1, ThresholdMode::Adaptive);
        let mut results = Vec::new();
        for _ in 0..6 {
            results.push(d.update(0.5, None).unwrap());
        }
        assert!(results[0].threshold.is_infinite());
        assert!(results[1].threshold.is_infinite());
        for r in &results[2..] {
            assert_eq!(r.stats.running_std_dev, 0.0);
            assert_eq!(r.threshold, 1.5);
        }
        assert_eq!(d.stats().current_anomaly_ratio, 0.0);
    }

    #[test]
    fn test_rounding_noise_counts_as_flat() {
        let mut d = detector(10, 0.1, ThresholdMode::Adaptive);
        for _ in 0..5 {
            let r = d.update(0.7, None).unwrap();
            assert!(!r.is_anomaly);
        }
        assert!((d.threshold() - 1.7).abs() < 1e-9);
    }

    #[test]
    fn test_stats_describe_window_after_append() {
        let mut d = detector(8, 0.5, ThresholdMode::Fixed);
        d.update(1.0, None).unwrap();
        d.update(3.0, None).unwrap();
        let before = d.threshold();

        let r = d.update(5.0, None).unwrap();
        assert_eq!(r.threshold, before);
        assert!((r.stats.running_mean - 3.0).abs() < 1e-12);
        assert_eq!(r.stats.current_threshold, d.threshold());
        assert!(r.stats.current_threshold > r.threshold);
        assert_eq!(d.stats(), r.stats);
    }

    #[test]
    fn test_constant_scores_fixed_mode_never_flag() {
        let mut d = detector(8, 0.1, ThresholdMode::Fixed);
        for _ in 0..8 {
            let r = d.update(0.4, None).unwrap();
            assert!(!r.is_anomaly);
        }
        assert_eq!(d.stats().total_anomalies, 0);
    }

    #[test]
    fn test_alert_needs_full_window() {
        let mut d = detector(6, 0.0, ThresholdMode::Fixed);
        for i in 0..6 {
            let r = d.update(0.1, None).unwrap();
            assert_eq!(r.alert_triggered, i == 5);
        }
    }

    #[test]
    fn test_ratio_bounds_hold() {
        let mut d = detector(4, 0.5, ThresholdMode::Adaptive);
        for s in [0.1, 3.0, 0.2, 8.0, 0.1, 0.1, 12.0, 0.3, 40.0] {
            let r = d.update(s, None).unwrap();
            assert!(r.stats.current_anomaly_ratio >= 0.0);
            assert!(r.stats.current_anomaly_ratio <= 1.0);
            assert!(r.stats.total_anomalies <= r.stats.total_seen);
            assert!(d.window_len() <= 4);
        }
    }

    #[test]
    fn test_non_finite_score_is_skipped() {
        let mut d = detector(4, 0.5, ThresholdMode::Adaptive);
        d.update(0.1, None).unwrap();
        assert!(d.update(f64::NAN, None).is_none());
        assert!(d.update(f64::INFINITY, None).is_none());
        assert_eq!(d.stats().total_seen, 1);
        assert_eq!(d.window_len(), 1);
    }

    #[test]
    fn test_overflowing_stats_are_rolled_back() {
        let mut d = detector(4, 0.5, ThresholdMode::Fixed);
        d.update(f64::MAX, None).unwrap();
        assert!(d.update(f64::MAX, None).is_none());
        assert_eq!(d.window_len(), 1);
        assert_eq!(d.stats().total_seen, 1);
    }

    #[test]
    fn test_reset() {
        let mut d = detector(4, 0.5, ThresholdMode::Adaptive);
        for s in [0.1, 0.2, 0.9] {
            d.update(s, None);
        }
        d.reset();
        assert_eq!(d.stats(), DetectorStats::default());
        assert_eq!(d.window_len(), 0);
    }
}
