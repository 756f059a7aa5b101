//! Reference scoring models.
//!
//! Both map a feature vector to a score in [0, 1) and persist as a tagged
//! JSON document so `load_model` can restore either kind.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{FeatureVector, ScoringModel};

/// Floor for per-feature spread so constant features do not divide by zero.
const MIN_STD: f64 = 1e-6;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredModel {
    ZScore(ZScoreModel),
    Centroid(CentroidModel),
}

impl StoredModel {
    fn into_boxed(self) -> Box<dyn ScoringModel> {
        match self {
            StoredModel::ZScore(m) => Box::new(m),
            StoredModel::Centroid(m) => Box::new(m),
        }
    }
}

/// Restore a model written by `ScoringModel::save`.
pub fn load_model(path: &Path) -> Result<Box<dyn ScoringModel>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model {}", path.display()))?;
    let stored: StoredModel = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse model {}", path.display()))?;
    info!(path = %path.display(), "loaded model");
    Ok(stored.into_boxed())
}

fn write_model(path: &Path, stored: &StoredModel) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(stored)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;
    Ok(())
}

fn check_dimensions(expected: usize, vectors: &[FeatureVector]) -> Result<()> {
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        bail!("feature vector length mismatch: expected {}, got {}", expected, bad.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ZScoreModel
// ---------------------------------------------------------------------------

/// Per-feature running mean and variance (Welford). The score is the RMS
/// z-score squashed as `z / (1 + z)`. Supports incremental updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZScoreModel {
    count: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl ZScoreModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> u64 {
        self.count
    }

    fn absorb(&mut self, vectors: &[FeatureVector]) -> Result<()> {
        let Some(first) = vectors.first() else {
            return Ok(());
        };
        if self.mean.is_empty() {
            self.mean = vec![0.0; first.len()];
            self.m2 = vec![0.0; first.len()];
        }
        check_dimensions(self.mean.len(), vectors)?;

        for v in vectors {
            self.count += 1;
            let n = self.count as f64;
            for (i, &x) in v.iter().enumerate() {
                let delta = x - self.mean[i];
                self.mean[i] += delta / n;
                self.m2[i] += delta * (x - self.mean[i]);
            }
        }
        Ok(())
    }
}

impl ScoringModel for ZScoreModel {
    fn kind(&self) -> &'static str {
        "z_score"
    }

    fn score(&self, vector: &[f64]) -> f64 {
        if self.count < 2 || vector.len() != self.mean.len() || vector.is_empty() {
            return 0.0;
        }
        let n = self.count as f64;
        let sum_sq: f64 = vector
            .iter()
            .zip(self.mean.iter().zip(&self.m2))
            .map(|(&x, (&mean, &m2))| {
                let std = (m2 / n).sqrt().max(MIN_STD);
                ((x - mean) / std).powi(2)
            })
            .sum();
        let z = (sum_sq / vector.len() as f64).sqrt();
        if z.is_finite() {
            z / (1.0 + z)
        } else {
            1.0 - f64::EPSILON
        }
    }

    fn fit(&mut self, vectors: &[FeatureVector]) -> Result<()> {
        if vectors.is_empty() {
            bail!("no training data");
        }
        let mut fresh = ZScoreModel::new();
        fresh.absorb(vectors)?;
        *self = fresh;
        Ok(())
    }

    fn supports_incremental(&self) -> bool {
        true
    }

    fn partial_fit(&mut self, vectors: &[FeatureVector]) -> Result<()> {
        self.absorb(vectors)
    }

    fn save(&self, path: &Path) -> Result<()> {
        write_model(path, &StoredModel::ZScore(self.clone()))
    }

    fn boxed_clone(&self) -> Box<dyn ScoringModel> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// CentroidModel
// ---------------------------------------------------------------------------

/// Distance to the training centroid, relative to the mean training distance:
/// `d / (d + mean_d)`. Refit only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CentroidModel {
    centroid: Vec<f64>,
    mean_distance: f64,
}

impl CentroidModel {
    pub fn new() -> Self {
        Self::default()
    }
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

impl ScoringModel for CentroidModel {
    fn kind(&self) -> &'static str {
        "centroid"
    }

    fn score(&self, vector: &[f64]) -> f64 {
        if self.centroid.is_empty() || vector.len() != self.centroid.len() {
            return 0.0;
        }
        let d = distance(vector, &self.centroid);
        let scale = self.mean_distance.max(MIN_STD);
        d / (d + scale)
    }

    fn fit(&mut self, vectors: &[FeatureVector]) -> Result<()> {
        let Some(first) = vectors.first() else {
            bail!("no training data");
        };
        let dim = first.len();
        check_dimensions(dim, vectors)?;

        let n = vectors.len() as f64;
        let mut centroid = vec![0.0; dim];
        for v in vectors {
            for (c, x) in centroid.iter_mut().zip(v) {
                *c += x / n;
            }
        }
        let mean_distance = vectors.iter().map(|v| distance(v, &centroid)).sum::<f64>() / n;

        self.centroid = centroid;
        self.mean_distance = mean_distance;
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        write_model(path, &StoredModel::Centroid(self.clone()))
    }

    fn boxed_clone(&self) -> Box<dyn ScoringModel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> Vec<FeatureVector> {
        vec![
            vec![0.0, 1.0],
            vec![0.1, 0.9],
            vec![-0.1, 1.1],
            vec![0.05, 0.95],
        ]
    }

    #[test]
    fn test_unfitted_models_score_zero() {
        assert_eq!(ZScoreModel::new().score(&[1.0, 2.0]), 0.0);
        assert_eq!(CentroidModel::new().score(&[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_outlier_scores_higher() {
        let mut z = ZScoreModel::new();
        z.fit(&cluster()).unwrap();
        let mut c = CentroidModel::new();
        c.fit(&cluster()).unwrap();

        for model in [&z as &dyn ScoringModel, &c as &dyn ScoringModel] {
            let normal = model.score(&[0.0, 1.0]);
            let outlier = model.score(&[5.0, -3.0]);
            assert!(outlier > normal, "{}: {} <= {}", model.kind(), outlier, normal);
            assert!((0.0..1.0).contains(&outlier));
        }
    }

    #[test]
    fn test_partial_fit_matches_full_fit() {
        let data = cluster();
        let mut full = ZScoreModel::new();
        full.fit(&data).unwrap();
        let mut incremental = ZScoreModel::new();
        incremental.partial_fit(&data[..2]).unwrap();
        incremental.partial_fit(&data[2..]).unwrap();
        let point = [0.3, 0.7];
        assert!((full.score(&point) - incremental.score(&point)).abs() < 1e-12);
        assert_eq!(incremental.samples(), 4);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut z = ZScoreModel::new();
        z.fit(&cluster()).unwrap();
        assert!(z.partial_fit(&[vec![1.0, 2.0, 3.0]]).is_err());
        let mut c = CentroidModel::new();
        assert!(c.fit(&[vec![1.0], vec![1.0, 2.0]]).is_err());
        assert!(c.fit(&[]).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = CentroidModel::new();
        c.fit(&cluster()).unwrap();
        let path = dir.path().join("models").join("centroid.json");
        c.save(&path).unwrap();

        let restored = load_model(&path).unwrap();
        assert_eq!(restored.kind(), "centroid");
        let point = [2.0, 2.0];
        assert!((restored.score(&point) - c.score(&point)).abs() < 1e-12);
    }

    #[test]
    fn test_load_missing_model_fails() {
        assert!(load_model(Path::new("/nonexistent/model.json")).is_err());
    }
}
