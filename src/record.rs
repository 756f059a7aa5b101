//! Log records, anomaly events, and record tokenization.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use crate::detect::Severity;

/// A single parsed WAF log entry, as produced by the external parser.
///
/// The named fields are the ones the pipeline needs for alert summaries;
/// everything else the parser extracted lives in `fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl LogRecord {
    /// Builder-style setter for an arbitrary field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), Value::String(value.into()));
        self
    }

    /// Look up a field by name. Named fields shadow entries in `fields`.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "timestamp" => self.timestamp.map(|t| t.to_rfc3339()),
            "client_ip" => self.client_ip.clone(),
            "request_uri" => self.request_uri.clone(),
            "message" => self.message.clone(),
            other => self.fields.get(other).and_then(value_text),
        }
    }

    /// All present field values in a stable order: the named fields first,
    /// then the extra fields sorted by key.
    pub fn values(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(4 + self.fields.len());
        if let Some(ts) = self.timestamp {
            out.push(ts.to_rfc3339());
        }
        out.extend(self.client_ip.iter().cloned());
        out.extend(self.request_uri.iter().cloned());
        out.extend(self.message.iter().cloned());
        out.extend(self.fields.values().filter_map(value_text));
        out
    }

    /// Space-joined concatenation of every field value.
    pub fn text(&self) -> String {
        self.values().join(" ")
    }
}

/// Strings are taken as-is, other values in their JSON form. Nulls are absent.
fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Which detector produced an anomaly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    #[default]
    Statistical,
    Rule { rule: String, severity: Severity },
}

impl Origin {
    /// Severity used when ranking alert summaries.
    pub fn severity(&self) -> Severity {
        match self {
            Origin::Statistical => Severity::Medium,
            Origin::Rule { severity, .. } => *severity,
        }
    }
}

/// An anomaly raised by either detector and handed to the alert manager.
///
/// Deserialization is lenient: missing numbers become `0.0` and missing
/// strings become empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyEvent {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub request_uri: String,
    pub score: f64,
    pub message: String,
    pub origin: Origin,
}

impl Default for AnomalyEvent {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            client_ip: String::new(),
            request_uri: String::new(),
            score: 0.0,
            message: String::new(),
            origin: Origin::Statistical,
        }
    }
}

impl AnomalyEvent {
    pub fn from_record(record: &LogRecord, score: f64, origin: Origin) -> Self {
        Self {
            timestamp: record.timestamp.unwrap_or_else(Utc::now),
            client_ip: record.client_ip.clone().unwrap_or_default(),
            request_uri: record.request_uri.clone().unwrap_or_default(),
            score,
            message: record.message.clone().unwrap_or_default(),
            origin,
        }
    }
}

fn numeric_segment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/\d+").expect("static regex"))
}

fn word() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\w.]+|[^\w\s]").expect("static regex"))
}

/// Collapse numeric path segments so `/user/42/edit` and `/user/7/edit`
/// share a pattern.
pub fn uri_pattern(uri: &str) -> String {
    let path = uri.split('?').next().unwrap_or(uri);
    numeric_segment().replace_all(path, "/*").into_owned()
}

/// Token sequence for a record: the URI pattern followed by the lowercased
/// words and punctuation of the message. This sequence is the vector cache key.
pub fn tokenize(record: &LogRecord) -> Vec<String> {
    let mut tokens = Vec::new();
    if let Some(uri) = record.request_uri.as_deref() {
        tokens.push(uri_pattern(uri));
    }
    if let Some(message) = record.message.as_deref() {
        let lowered = message.to_lowercase();
        tokens.extend(word().find_iter(&lowered).map(|m| m.as_str().to_string()));
    }
    tokens
}
