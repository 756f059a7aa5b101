//! Deterministic pattern rules evaluated against raw log records.
//!
//! Rules are kept in their compiled form; the pattern strings are
//! retained so a rule set round-trips through `load_rules` / `save_rules`.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{DetectError, Severity};
use crate::record::LogRecord;

/// A rule as it appears in the rule file. Required fields are optional here
/// so that a single bad entry can be rejected without failing the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditions: BTreeMap<String, String>,
}

impl RuleSpec {
    pub fn new(name: &str, pattern: &str, severity: Severity) -> Self {
        Self {
            name: Some(name.to_string()),
            pattern: Some(pattern.to_string()),
            severity: Some(severity.to_string()),
            ..Default::default()
        }
    }

    pub fn with_condition(mut self, field: &str, pattern: &str) -> Self {
        self.conditions.insert(field.to_string(), pattern.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuleDocument {
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

/// A validated rule with compiled patterns.
#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    pattern: Regex,
    conditions: Vec<(String, Regex)>,
    severity: Severity,
    description: String,
}

impl Rule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Every condition must hold before the primary pattern is tried against
    /// the whole record text.
    pub fn matches(&self, record: &LogRecord) -> bool {
        for (field, re) in &self.conditions {
            match record.field(field) {
                Some(value) if re.is_match(&value) => {}
                _ => return false,
            }
        }
        self.pattern.is_match(&record.text())
    }

    fn to_spec(&self) -> RuleSpec {
        RuleSpec {
            name: Some(self.name.clone()),
            pattern: Some(self.pattern.as_str().to_string()),
            severity: Some(self.severity.to_string()),
            description: if self.description.is_empty() {
                None
            } else {
                Some(self.description.clone())
            },
            conditions: self
                .conditions
                .iter()
                .map(|(f, re)| (f.clone(), re.as_str().to_string()))
                .collect(),
        }
    }
}

impl TryFrom<RuleSpec> for Rule {
    type Error = DetectError;

    fn try_from(spec: RuleSpec) -> Result<Self, Self::Error> {
        let name = spec.name.filter(|n| !n.trim().is_empty()).ok_or_else(|| {
            DetectError::InvalidRule {
                name: "<unnamed>".into(),
                reason: "missing name".into(),
            }
        })?;
        let invalid = |reason: String| DetectError::InvalidRule {
            name: name.clone(),
            reason,
        };

        let pattern = spec.pattern.ok_or_else(|| invalid("missing pattern".into()))?;
        let severity = spec
            .severity
            .ok_or_else(|| invalid("missing severity".into()))?
            .parse::<Severity>()
            .map_err(&invalid)?;

        let pattern =
            Regex::new(&pattern).map_err(|e| invalid(format!("pattern does not compile: {}", e)))?;

        let mut conditions = Vec::with_capacity(spec.conditions.len());
        for (field, cond) in spec.conditions {
            let re = Regex::new(&cond)
                .map_err(|e| invalid(format!("condition on '{}' does not compile: {}", field, e)))?;
            conditions.push((field, re));
        }

        Ok(Rule {
            name,
            pattern,
            conditions,
            severity,
            description: spec.description.unwrap_or_default(),
        })
    }
}

/// One rule firing on one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleHit {
    pub rule_name: String,
    pub severity: Severity,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RuleBasedDetector {
    rules: Vec<Rule>,
}

impl RuleBasedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a detector from a rule file. An unreadable file yields an empty
    /// rule set.
    pub fn from_file(path: &Path) -> Self {
        let mut detector = Self::new();
        if let Err(e) = detector.load_rules(path) {
            error!(path = %path.display(), error = %e, "failed to load rules");
        }
        detector
    }

    /// Validate and activate a rule. Rejected rules are logged and returned
    /// as an error; the active set is untouched.
    pub fn add_rule(&mut self, spec: RuleSpec) -> Result<(), DetectError> {
        match Rule::try_from(spec) {
            Ok(rule) => {
                info!(rule = %rule.name, severity = %rule.severity, "added rule");
                self.rules.push(rule);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "rejected rule");
                Err(e)
            }
        }
    }

    /// Replace the active rule set with the valid rules from `path`.
    /// Returns how many rules were activated. A missing file leaves the
    /// current set in place.
    pub fn load_rules(&mut self, path: &Path) -> Result<usize, DetectError> {
        if !path.exists() {
            warn!(path = %path.display(), "rules file not found");
            return Ok(0);
        }
        let content = std::fs::read_to_string(path).map_err(|source| DetectError::RuleFile {
            path: path.display().to_string(),
            source,
        })?;
        let doc: RuleDocument =
            serde_json::from_str(&content).map_err(|e| DetectError::RuleFile {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;

        let mut rules = Vec::with_capacity(doc.rules.len());
        for spec in doc.rules {
            match Rule::try_from(spec) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid rule"),
            }
        }
        self.rules = rules;
        info!(path = %path.display(), count = self.rules.len(), "loaded rules");
        Ok(self.rules.len())
    }

    pub fn save_rules(&self, path: &Path) -> Result<(), DetectError> {
        let doc = RuleDocument {
            rules: self.rules.iter().map(Rule::to_spec).collect(),
        };
        let json = serde_json::to_string_pretty(&doc).map_err(|e| DetectError::RuleFile {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        std::fs::write(path, json).map_err(|source| DetectError::RuleFile {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), count = self.rules.len(), "saved rules");
        Ok(())
    }

    /// Every rule that fully matches the record.
    pub fn detect(&self, record: &LogRecord) -> Vec<RuleHit> {
        let now = Utc::now();
        self.rules
            .iter()
            .filter(|rule| rule.matches(record))
            .map(|rule| RuleHit {
                rule_name: rule.name.clone(),
                severity: rule.severity,
                description: rule.description.clone(),
                timestamp: now,
            })
            .collect()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn clear_rules(&mut self) {
        self.rules.clear();
        info!("cleared all rules");
    }
}
