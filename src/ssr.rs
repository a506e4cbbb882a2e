//! Semantic similarity rating.
//!
//! Text is embedded and compared (cosine) against every anchor statement of
//! every anchor set. Each set yields one pmf over the ratings; the pmfs are
//! averaged with equal weight and renormalized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::anchors::{AnchorBank, AnchorBankCache, AnchorError};
use crate::gateway::{Embedder, ProviderError};

/// Added to every floored similarity so a set never yields an all-zero row.
pub const DEFAULT_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum RaterError {
    #[error(transparent)]
    Anchor(#[from] AnchorError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),

    #[error("embedding shape mismatch: {0}")]
    Shape(String),
}

/// Anchor embeddings for one set, one row per rating (ascending).
#[derive(Debug, Clone)]
struct AnchorMatrix {
    set_id: String,
    rows: DMatrix<f64>,
}

pub struct SemanticSimilarityRater {
    bank: Arc<AnchorBank>,
    embedder: Arc<dyn Embedder>,
    epsilon: f64,
    ratings: Vec<i32>,
    sets: Vec<AnchorMatrix>,
}

impl std::fmt::Debug for SemanticSimilarityRater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticSimilarityRater")
            .field("intent", &self.bank.intent)
            .field("model", &self.embedder.model())
            .field("ratings", &self.ratings)
            .field("sets", &self.sets.iter().map(|s| &s.set_id).collect::<Vec<_>>())
            .finish()
    }
}

impl SemanticSimilarityRater {
    pub async fn new(
        bank: Arc<AnchorBank>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, RaterError> {
        Self::with_epsilon(bank, embedder, DEFAULT_EPSILON).await
    }

    /// Embeds every anchor statement in a single batch call and splits the
    /// result back into one matrix per anchor set.
    pub async fn with_epsilon(
        bank: Arc<AnchorBank>,
        embedder: Arc<dyn Embedder>,
        epsilon: f64,
    ) -> Result<Self, RaterError> {
        let ratings = bank.ratings();
        let texts: Vec<String> = bank
            .anchor_sets
            .iter()
            .flat_map(|set| set.statements().map(str::to_string))
            .collect();

        let vectors = embedder.embed_batch(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(RaterError::Shape(format!(
                "asked for {} anchor embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        let dim = vectors.first().map(Vec::len).unwrap_or(0);
        if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
            return Err(RaterError::Shape(
                "anchor embeddings are empty or differ in dimension".to_string(),
            ));
        }

        let mut offset = 0;
        let mut sets = Vec::with_capacity(bank.anchor_sets.len());
        for set in &bank.anchor_sets {
            let n = set.anchors.len();
            let rows = DMatrix::from_fn(n, dim, |r, c| vectors[offset + r][c]);
            offset += n;
            sets.push(AnchorMatrix {
                set_id: set.id.clone(),
                rows,
            });
        }

        tracing::debug!(
            intent = %bank.intent,
            sets = sets.len(),
            anchors = texts.len(),
            dim,
            "embedded anchor bank"
        );

        Ok(Self {
            bank,
            embedder,
            epsilon,
            ratings,
            sets,
        })
    }

    pub fn ratings(&self) -> &[i32] {
        &self.ratings
    }

    pub fn bank(&self) -> &AnchorBank {
        &self.bank
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model()
    }

    /// Embeds `text` and returns its pmf over `ratings()`.
    pub async fn score_text(&self, text: &str) -> Result<Vec<f64>, RaterError> {
        let vector = self.embedder.embed(text).await?;
        self.score_vector(&vector)
    }

    /// Scores several texts with one batch embedding call.
    pub async fn score_many(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, RaterError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.embedder.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(RaterError::Shape(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        vectors.iter().map(|v| self.score_vector(v)).collect()
    }

    /// Pmf for an already embedded text.
    pub fn score_vector(&self, vector: &[f64]) -> Result<Vec<f64>, RaterError> {
        let k = self.ratings.len();
        let mut averaged = vec![0.0; k];

        for set in &self.sets {
            if vector.len() != set.rows.ncols() {
                return Err(RaterError::Shape(format!(
                    "text embedding has dimension {}, anchors have {}",
                    vector.len(),
                    set.rows.ncols()
                )));
            }
            let sims = cosine_similarity(vector, &set.rows);
            let smoothed: Vec<f64> = sims.iter().map(|s| s.max(0.0) + self.epsilon).collect();
            let total: f64 = smoothed.iter().sum();
            for (acc, s) in averaged.iter_mut().zip(&smoothed) {
                *acc += s / total;
            }
        }

        let n_sets = self.sets.len().max(1) as f64;
        for p in averaged.iter_mut() {
            *p /= n_sets;
        }
        let total: f64 = averaged.iter().sum();
        if total > 0.0 {
            for p in averaged.iter_mut() {
                *p /= total;
            }
        }
        Ok(averaged)
    }
}

/// Cosine similarity of `vector` against each row of `rows`. A zero-norm
/// vector yields all zeros.
fn cosine_similarity(vector: &[f64], rows: &DMatrix<f64>) -> Vec<f64> {
    let v = DVector::from_column_slice(vector);
    let v_norm = v.norm();
    if v_norm == 0.0 {
        return vec![0.0; rows.nrows()];
    }
    let dots = rows * &v;
    (0..rows.nrows())
        .map(|i| {
            let denom = (v_norm * rows.row(i).norm()).max(1e-8);
            dots[i] / denom
        })
        .collect()
}

/// Pmf-weighted mean rating and top-2-box mass (ratings >= max - 1).
pub fn likert_metrics(pmf: &[f64], ratings: &[i32]) -> (f64, f64) {
    let mean = pmf
        .iter()
        .zip(ratings)
        .map(|(p, r)| p * f64::from(*r))
        .sum();
    let Some(max_rating) = ratings.iter().copied().max() else {
        return (mean, 0.0);
    };
    let top2 = pmf
        .iter()
        .zip(ratings)
        .filter(|(_, r)| **r >= max_rating - 1)
        .map(|(p, _)| p)
        .sum();
    (mean, top2)
}

/// Expected rating under a pmf.
pub fn expected_rating(pmf: &[f64], ratings: &[i32]) -> f64 {
    likert_metrics(pmf, ratings).0
}

/// Raters keyed by anchor file and embedding model, built on first use.
#[derive(Default)]
pub struct RaterCache {
    raters: Mutex<HashMap<(String, String), Arc<SemanticSimilarityRater>>>,
}

impl RaterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(
        &self,
        anchor_file: &str,
        banks: &AnchorBankCache,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<SemanticSimilarityRater>, RaterError> {
        let key = (anchor_file.to_string(), embedder.model().to_string());
        if let Some(rater) = self.lock().get(&key) {
            return Ok(Arc::clone(rater));
        }

        let bank = banks.get(anchor_file)?;
        let rater = Arc::new(SemanticSimilarityRater::new(bank, embedder).await?);
        self.lock().insert(key, Arc::clone(&rater));
        Ok(rater)
    }

    /// Drops every rater built from `anchor_file`, for any model.
    pub fn invalidate(&self, anchor_file: &str) {
        self.lock().retain(|(file, _), _| file != anchor_file);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String), Arc<SemanticSimilarityRater>>> {
        self.raters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn likert_metrics_on_four_point_scale() {
        let (mean, top2) = likert_metrics(&[0.1, 0.2, 0.3, 0.4], &[1, 2, 3, 4]);
        assert!((mean - 3.0).abs() < 1e-9);
        assert!((top2 - 0.7).abs() < 1e-9);
    }

    #[test]
    fn cosine_handles_zero_vector() {
        let rows = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &rows), vec![0.0, 0.0]);
        let sims = cosine_similarity(&[2.0, 0.0], &rows);
        assert!((sims[0] - 1.0).abs() < 1e-12);
        assert!(sims[1].abs() < 1e-12);
    }
}
