//! Statistical and rule-based anomaly detection, and the pipeline that feeds
//! them.

pub mod engine;
pub mod realtime;
pub mod rules;
pub mod window;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad failure categories shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected synchronously: bad weights, operation, or rule.
    Configuration,
    /// Cache, rule-file, or notification I/O. Logged and absorbed.
    TransientIo,
    /// Degenerate statistics. Handled with fallback values.
    StateInconsistency,
    /// Model persistence during an update cycle. Propagated.
    Persistence,
    /// Evaluation or refitting failed during an update cycle. Propagated;
    /// the cycle is abandoned and retried on the next interval.
    UpdateCycle,
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("no scores to combine")]
    EmptyScores,
    #[error("missing weights for models: {}", .0.join(", "))]
    MissingWeights(Vec<String>),
    #[error("weights must sum to a positive value, got {0}")]
    InvalidWeights(f64),
    #[error("unknown combine operation '{0}' (expected mean, max, min or weighted_mean)")]
    UnknownOperation(String),
    #[error("model '{model}' produced {got} scores, expected {expected}")]
    ScoreLengthMismatch {
        model: String,
        expected: usize,
        got: usize,
    },
    #[error("invalid rule '{name}': {reason}")]
    InvalidRule { name: String, reason: String },
    #[error("rule file {path}: {source}")]
    RuleFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl DetectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DetectError::RuleFile { .. } => ErrorKind::TransientIo,
            _ => ErrorKind::Configuration,
        }
    }
}

/// Severity attached to rules, rule hits, and alert summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}
