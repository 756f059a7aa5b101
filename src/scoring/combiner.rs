use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::detect::DetectError;

/// How per-model scores are fused into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineOp {
    #[default]
    Mean,
    Max,
    Min,
    WeightedMean,
}

impl CombineOp {
    pub fn description(&self) -> &'static str {
        match self {
            CombineOp::Mean => "arithmetic mean of all model scores",
            CombineOp::Max => "highest model score",
            CombineOp::Min => "lowest model score",
            CombineOp::WeightedMean => "weighted mean using per-model weights",
        }
    }
}

impl fmt::Display for CombineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CombineOp::Mean => "mean",
            CombineOp::Max => "max",
            CombineOp::Min => "min",
            CombineOp::WeightedMean => "weighted_mean",
        };
        f.write_str(s)
    }
}

impl FromStr for CombineOp {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean" => Ok(CombineOp::Mean),
            "max" => Ok(CombineOp::Max),
            "min" => Ok(CombineOp::Min),
            "weighted_mean" => Ok(CombineOp::WeightedMean),
            other => Err(DetectError::UnknownOperation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoreCombiner {
    operation: CombineOp,
    weights: BTreeMap<String, f64>,
}

impl ScoreCombiner {
    pub fn new(operation: CombineOp, weights: BTreeMap<String, f64>) -> Self {
        Self { operation, weights }
    }

    pub fn operation(&self) -> CombineOp {
        self.operation
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn set_operation(&mut self, operation: CombineOp) {
        self.operation = operation;
    }

    /// An empty map means uniform weights.
    pub fn set_weights(&mut self, weights: BTreeMap<String, f64>) {
        self.weights = weights;
    }

    /// Fuse one score per model.
    pub fn combine(&self, scores: &BTreeMap<String, f64>) -> Result<f64, DetectError> {
        let weights = self.resolve_weights(scores.keys())?;
        let values: Vec<f64> = scores.values().copied().collect();
        Ok(self.reduce(&values, &weights))
    }

    /// Element-wise fusion of equally long per-model score arrays.
    pub fn combine_batch(&self, scores: &BTreeMap<String, Vec<f64>>) -> Result<Vec<f64>, DetectError> {
        let weights = self.resolve_weights(scores.keys())?;
        let expected = scores.values().next().map(Vec::len).unwrap_or(0);
        for (model, column) in scores {
            if column.len() != expected {
                return Err(DetectError::ScoreLengthMismatch {
                    model: model.clone(),
                    expected,
                    got: column.len(),
                });
            }
        }

        let mut row = Vec::with_capacity(scores.len());
        let mut out = Vec::with_capacity(expected);
        for i in 0..expected {
            row.clear();
            row.extend(scores.values().map(|column| column[i]));
            out.push(self.reduce(&row, &weights));
        }
        Ok(out)
    }

    /// Weights aligned with `models`, or empty when the operation ignores
    /// them. A non-empty weight map must cover every model.
    fn resolve_weights<'a>(
        &self,
        models: impl ExactSizeIterator<Item = &'a String>,
    ) -> Result<Vec<f64>, DetectError> {
        let n = models.len();
        if n == 0 {
            return Err(DetectError::EmptyScores);
        }
        if self.operation != CombineOp::WeightedMean {
            return Ok(Vec::new());
        }
        if self.weights.is_empty() {
            return Ok(vec![1.0; n]);
        }

        let mut weights = Vec::with_capacity(n);
        let mut missing = Vec::new();
        for model in models {
            match self.weights.get(model) {
                Some(w) => weights.push(*w),
                None => missing.push(model.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(DetectError::MissingWeights(missing));
        }
        let total: f64 = weights.iter().sum();
        if !total.is_finite() || total <= 0.0 || weights.iter().any(|w| *w < 0.0) {
            return Err(DetectError::InvalidWeights(total));
        }
        Ok(weights)
    }

    fn reduce(&self, values: &[f64], weights: &[f64]) -> f64 {
        match self.operation {
            CombineOp::Mean => values.iter().sum::<f64>() / values.len() as f64,
            CombineOp::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            CombineOp::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            CombineOp::WeightedMean => {
                let total: f64 = weights.iter().sum();
                values.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn columns(pairs: &[(&str, &[f64])]) -> BTreeMap<String, Vec<f64>> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect()
    }

    #[test]
    fn test_max_is_element_wise() {
        let c = ScoreCombiner::new(CombineOp::Max, BTreeMap::new());
        let fused = c
            .combine_batch(&columns(&[("a", &[0.1, 0.9]), ("b", &[0.2, 0.8])]))
            .unwrap();
        assert_eq!(fused, vec![0.2, 0.9]);
    }

    #[test]
    fn test_min_and_mean() {
        let s = scores(&[("a", 0.2), ("b", 0.6)]);
        let min = ScoreCombiner::new(CombineOp::Min, BTreeMap::new());
        assert_eq!(min.combine(&s).unwrap(), 0.2);
        let mean = ScoreCombiner::default();
        assert!((mean.combine(&s).unwrap() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_equal_weights_match_mean() {
        let s = scores(&[("a", 0.3), ("b", 0.7), ("c", 0.2)]);
        let weighted = ScoreCombiner::new(
            CombineOp::WeightedMean,
            [("a", 2.0), ("b", 2.0), ("c", 2.0)]
                .iter()
                .map(|(k, w)| (k.to_string(), *w))
                .collect(),
        );
        let uniform = ScoreCombiner::new(CombineOp::WeightedMean, BTreeMap::new());
        let mean = ScoreCombiner::default().combine(&s).unwrap();
        assert!((weighted.combine(&s).unwrap() - mean).abs() < 1e-12);
        assert!((uniform.combine(&s).unwrap() - mean).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_mean_uses_weights() {
        let mut c = ScoreCombiner::new(CombineOp::WeightedMean, BTreeMap::new());
        c.set_weights(scores(&[("a", 3.0), ("b", 1.0)]));
        let fused = c.combine(&scores(&[("a", 1.0), ("b", 0.0)])).unwrap();
        assert!((fused - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_empty_input_is_configuration_error() {
        let c = ScoreCombiner::default();
        let err = c.combine(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, DetectError::EmptyScores));
        assert_eq!(err.kind(), crate::detect::ErrorKind::Configuration);
        assert!(c.combine_batch(&BTreeMap::new()).is_err());
    }

    #[test]
    fn test_partial_weights_rejected() {
        let c = ScoreCombiner::new(CombineOp::WeightedMean, scores(&[("a", 1.0)]));
        match c.combine(&scores(&[("a", 0.5), ("b", 0.5)])) {
            Err(DetectError::MissingWeights(missing)) => assert_eq!(missing, vec!["b".to_string()]),
            other => panic!("expected missing weights, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_weight_sum_rejected() {
        let c = ScoreCombiner::new(CombineOp::WeightedMean, scores(&[("a", 0.0), ("b", 0.0)]));
        assert!(matches!(
            c.combine(&scores(&[("a", 0.5), ("b", 0.5)])),
            Err(DetectError::InvalidWeights(_))
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let c = ScoreCombiner::default();
        let err = c
            .combine_batch(&columns(&[("a", &[0.1, 0.2]), ("b", &[0.3])]))
            .unwrap_err();
        assert!(matches!(err, DetectError::ScoreLengthMismatch { expected: 2, got: 1, .. }));
    }

    #[test]
    fn test_operation_parse_and_switch() {
        assert_eq!("weighted_mean".parse::<CombineOp>().unwrap(), CombineOp::WeightedMean);
        assert!(matches!(
            "median".parse::<CombineOp>(),
            Err(DetectError::UnknownOperation(op)) if op == "median"
        ));
        let mut c = ScoreCombiner::default();
        c.set_operation(CombineOp::Max);
        assert_eq!(c.operation(), CombineOp::Max);
        assert_eq!(c.operation().to_string(), "max");
    }
}
