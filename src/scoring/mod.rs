//! Scoring capabilities consumed by the pipeline, and the combiner that fuses
//! their output.

pub mod combiner;
pub mod models;
pub mod vectorizer;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{info, warn};

pub use combiner::{CombineOp, ScoreCombiner};
pub use models::{load_model, CentroidModel, ZScoreModel};
pub use vectorizer::HashingVectorizer;

pub type FeatureVector = Vec<f64>;

/// A fitted model mapping a feature vector to an anomaly score.
pub trait ScoringModel: Send + Sync {
    fn kind(&self) -> &'static str;

    fn score(&self, vector: &[f64]) -> f64;

    fn score_batch(&self, vectors: &[FeatureVector]) -> Vec<f64> {
        vectors.iter().map(|v| self.score(v)).collect()
    }

    /// Discard learned state and refit on `vectors`.
    fn fit(&mut self, vectors: &[FeatureVector]) -> Result<()>;

    fn supports_incremental(&self) -> bool {
        false
    }

    /// Fold `vectors` into the current state. Models without incremental
    /// support refit.
    fn partial_fit(&mut self, vectors: &[FeatureVector]) -> Result<()> {
        self.fit(vectors)
    }

    fn save(&self, path: &Path) -> Result<()>;

    fn boxed_clone(&self) -> Box<dyn ScoringModel>;
}

/// Turns token sequences into fixed-length vectors.
pub trait FeatureVectorizer: Send + Sync {
    fn dimension(&self) -> usize;

    fn transform(&self, token_sequences: &[Vec<String>]) -> Vec<FeatureVector>;
}

pub struct NamedModel {
    pub name: String,
    pub model: Box<dyn ScoringModel>,
}

impl NamedModel {
    pub fn new(name: impl Into<String>, model: Box<dyn ScoringModel>) -> Self {
        Self {
            name: name.into(),
            model,
        }
    }
}

impl Clone for NamedModel {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            model: self.model.boxed_clone(),
        }
    }
}

/// Model set read by the ingestion path and replaced by the updater.
pub type SharedModels = Arc<RwLock<Vec<NamedModel>>>;

/// Score one vector with every model in the set.
pub fn score_all(models: &[NamedModel], vector: &[f64]) -> BTreeMap<String, f64> {
    models
        .iter()
        .map(|m| (m.name.clone(), m.model.score(vector)))
        .collect()
}

pub fn model_path(model_dir: &Path, name: &str) -> std::path::PathBuf {
    model_dir.join(format!("{}.json", name))
}

/// The reference model set, restored from `model_dir` where a saved copy
/// exists and unfitted otherwise.
pub fn load_default_models(model_dir: &Path) -> Vec<NamedModel> {
    let defaults: [(&str, fn() -> Box<dyn ScoringModel>); 2] = [
        ("zscore", || Box::new(ZScoreModel::new()) as Box<dyn ScoringModel>),
        ("centroid", || Box::new(CentroidModel::new()) as Box<dyn ScoringModel>),
    ];

    let mut out = Vec::with_capacity(defaults.len());
    for (name, fresh) in defaults {
        let path = model_path(model_dir, name);
        let model = if path.exists() {
            match load_model(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(model = name, error = %e, "falling back to unfitted model");
                    fresh()
                }
            }
        } else {
            info!(model = name, "no saved model, starting unfitted");
            fresh()
        };
        out.push(NamedModel::new(name, model));
    }
    out
}
