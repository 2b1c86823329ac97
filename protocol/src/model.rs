use serde::{Deserialize, Serialize};

/// Parameters of a linear classifier, independent of whatever produced them.
///
/// `coefficients` has one row per class (a single row for binary problems),
/// `intercepts` one entry per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub coefficients: Vec<Vec<f64>>,
    pub intercepts: Vec<f64>,
    pub classes: Vec<i64>,
    #[serde(default)]
    pub feature_names: Vec<String>,
}

impl ModelParams {
    /// Zero-initialised parameters for `n_features` inputs.
    pub fn zeros(classes: Vec<i64>, feature_names: Vec<String>, n_features: usize) -> Self {
        let rows = if classes.len() == 2 { 1 } else { classes.len() };
        Self {
            coefficients: vec![vec![0.0; n_features]; rows],
            intercepts: vec![0.0; rows],
            classes,
            feature_names,
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// (rows, features) of the coefficient matrix
    pub fn shape(&self) -> (usize, usize) {
        let cols = self.coefficients.first().map(|r| r.len()).unwrap_or(0);
        (self.coefficients.len(), cols)
    }

    pub fn n_features(&self) -> usize {
        self.shape().1
    }

    /// Rectangular matrix with one intercept per row.
    pub fn is_well_formed(&self) -> bool {
        let (rows, cols) = self.shape();
        rows > 0
            && self.coefficients.iter().all(|r| r.len() == cols)
            && self.intercepts.len() == rows
    }

    /// Class probabilities in the order of `classes`.
    pub fn predict_proba(&self, x: &[f64]) -> Vec<f64> {
        let scores: Vec<f64> = self
            .coefficients
            .iter()
            .zip(&self.intercepts)
            .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + b)
            .collect();

        if scores.len() == 1 && self.classes.len() == 2 {
            let p = sigmoid(scores[0]);
            return vec![1.0 - p, p];
        }
        softmax(&scores)
    }

    pub fn predict(&self, x: &[f64]) -> Option<i64> {
        let proba = self.predict_proba(x);
        let best = proba
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)?;
        self.classes.get(best).copied()
    }
}

pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

pub fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}
