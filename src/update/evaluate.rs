use anyhow::{bail, Result};
use serde::Serialize;

use super::BufferedRecord;

/// Quality metrics for one model, or the cross-model mean for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub auc: f64,
}

impl PerformanceSample {
    /// Element-wise mean over several samples.
    pub fn mean_of(samples: &[PerformanceSample]) -> PerformanceSample {
        if samples.is_empty() {
            return PerformanceSample::default();
        }
        let n = samples.len() as f64;
        let sum = samples.iter().fold(PerformanceSample::default(), |acc, s| PerformanceSample {
            precision: acc.precision + s.precision,
            recall: acc.recall + s.recall,
            f1: acc.f1 + s.f1,
            auc: acc.auc + s.auc,
        });
        PerformanceSample {
            precision: sum.precision / n,
            recall: sum.recall / n,
            f1: sum.f1 / n,
            auc: sum.auc / n,
        }
    }

    /// Mean of the four metrics.
    pub fn overall(&self) -> f64 {
        (self.precision + self.recall + self.f1 + self.auc) / 4.0
    }
}

/// Judges a model's scores over the buffered records.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, scores: &[f64], records: &[BufferedRecord]) -> Result<PerformanceSample>;
}

/// Treats `score > cutoff` as a positive prediction and the record's
/// `flagged` bit as ground truth.
///
/// Degenerate cases fall back to fixed values instead of NaN: precision with
/// no predicted positives is 1.0 if nothing was missed and 0.0 otherwise,
/// recall with no actual positives is 1.0, and AUC over a single class is
/// the accuracy.
#[derive(Debug, Clone)]
pub struct LabelAgreementEvaluator {
    cutoff: f64,
}

impl LabelAgreementEvaluator {
    pub fn new(cutoff: f64) -> Self {
        Self { cutoff }
    }
}

impl Evaluator for LabelAgreementEvaluator {
    fn evaluate(&self, scores: &[f64], records: &[BufferedRecord]) -> Result<PerformanceSample> {
        if scores.len() != records.len() {
            bail!("{} scores for {} records", scores.len(), records.len());
        }
        if scores.is_empty() {
            bail!("nothing to evaluate");
        }

        let (mut tp, mut fp, mut fneg, mut tn) = (0usize, 0usize, 0usize, 0usize);
        for (score, rec) in scores.iter().zip(records) {
            match (*score > self.cutoff, rec.flagged) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, true) => fneg += 1,
                (false, false) => tn += 1,
            }
        }

        let precision = if tp + fp == 0 {
            if fneg == 0 { 1.0 } else { 0.0 }
        } else {
            tp as f64 / (tp + fp) as f64
        };
        let recall = if tp + fneg == 0 {
            1.0
        } else {
            tp as f64 / (tp + fneg) as f64
        };
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        let labels: Vec<bool> = records.iter().map(|r| r.flagged).collect();
        let auc = rank_auc(scores, &labels)
            .unwrap_or_else(|| (tp + tn) as f64 / scores.len() as f64);

        Ok(PerformanceSample {
            precision,
            recall,
            f1,
            auc,
        })
    }
}

/// Mann-Whitney AUC with average ranks for ties. `None` when only one class
/// is present.
fn rank_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    let positives = labels.iter().filter(|l| **l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based average rank of the tie group i..=j
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = ranks.iter().zip(labels).filter(|(_, l)| **l).map(|(r, _)| r).sum();
    let p = positives as f64;
    Some((pos_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}
