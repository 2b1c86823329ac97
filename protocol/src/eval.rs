use thiserror::Error;

use crate::dataset::Dataset;
use crate::model::ModelParams;
use crate::types::Metrics;

const PROBA_EPS: f64 = 1e-15;

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("no reference dataset loaded")]
    NoReferenceData,
    #[error("model is malformed")]
    Malformed,
    #[error("model expects {found} features, dataset has {expected}")]
    FeatureMismatch { expected: usize, found: usize },
    #[error("model has {rows} coefficient rows for {classes} classes")]
    ClassMismatch { rows: usize, classes: usize },
}

/// Scores model parameters against held-out data
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, params: &ModelParams) -> Result<Metrics, EvalError>;
}

/// Evaluator over the coordinator's held-out reference set
pub struct ReferenceEvaluator {
    dataset: Option<Dataset>,
}

impl ReferenceEvaluator {
    pub fn new(dataset: Dataset) -> Self {
        Self { dataset: Some(dataset) }
    }

    /// Every evaluation fails with [`EvalError::NoReferenceData`].
    pub fn empty() -> Self {
        Self { dataset: None }
    }
}

impl Evaluator for ReferenceEvaluator {
    fn evaluate(&self, params: &ModelParams) -> Result<Metrics, EvalError> {
        let ds = self.dataset.as_ref().ok_or(EvalError::NoReferenceData)?;
        score(params, &ds.features, &ds.labels)
    }
}

/// Accuracy, log-loss and macro precision/recall/F1 of `params` on
/// `(features, labels)`.
pub fn score(params: &ModelParams, features: &[Vec<f64>], labels: &[i64]) -> Result<Metrics, EvalError> {
    if features.is_empty() {
        return Err(EvalError::NoReferenceData);
    }
    if !params.is_well_formed() {
        return Err(EvalError::Malformed);
    }
    let expected = features[0].len();
    if params.n_features() != expected {
        return Err(EvalError::FeatureMismatch { expected, found: params.n_features() });
    }
    let rows = params.coefficients.len();
    let binary = rows == 1 && params.classes.len() == 2;
    if !binary && rows != params.classes.len() {
        return Err(EvalError::ClassMismatch { rows, classes: params.classes.len() });
    }

    let mut predicted = Vec::with_capacity(labels.len());
    let mut loss = 0.0;
    for (x, y) in features.iter().zip(labels) {
        let proba = params.predict_proba(x);
        let p_true = params
            .classes
            .iter()
            .position(|c| c == y)
            .map(|i| proba[i])
            .unwrap_or(0.0)
            .clamp(PROBA_EPS, 1.0 - PROBA_EPS);
        loss -= p_true.ln();

        let best = proba
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| params.classes[i])
            .ok_or(EvalError::Malformed)?;
        predicted.push(best);
    }

    let n = labels.len() as f64;
    let correct = predicted.iter().zip(labels).filter(|(p, y)| p == y).count();
    let (precision, recall, f1) = macro_scores(labels, &predicted);

    Ok(Metrics {
        accuracy: correct as f64 / n,
        loss: loss / n,
        precision,
        recall,
        f1,
    })
}

/// Macro-averaged over the union of true and predicted labels; a class with
/// an undefined ratio contributes zero.
fn macro_scores(truth: &[i64], predicted: &[i64]) -> (f64, f64, f64) {
    let mut labels: Vec<i64> = truth.iter().chain(predicted).copied().collect();
    labels.sort_unstable();
    labels.dedup();

    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    let (mut p_sum, mut r_sum, mut f_sum) = (0.0, 0.0, 0.0);
    for label in &labels {
        let mut tp = 0;
        let mut fp = 0;
        let mut fn_ = 0;
        for (y, p) in truth.iter().zip(predicted) {
            match (y == label, p == label) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (true, false) => fn_ += 1,
                (false, false) => {}
            }
        }
        p_sum += ratio(tp, tp + fp);
        r_sum += ratio(tp, tp + fn_);
        f_sum += ratio(2 * tp, 2 * tp + fp + fn_);
    }
    let k = labels.len().max(1) as f64;
    (p_sum / k, r_sum / k, f_sum / k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold_model() -> ModelParams {
        // p(1) = sigmoid(10 * x)
        ModelParams {
            coefficients: vec![vec![10.0]],
            intercepts: vec![0.0],
            classes: vec![0, 1],
            feature_names: vec!["x".into()],
        }
    }

    #[test]
    fn test_perfect_classifier() {
        let features = vec![vec![-1.0], vec![-2.0], vec![1.0], vec![2.0]];
        let labels = vec![0, 0, 1, 1];
        let m = score(&threshold_model(), &features, &labels).unwrap();
        assert_eq!(m.accuracy, 1.0);
        assert_eq!(m.precision, 1.0);
        assert_eq!(m.recall, 1.0);
        assert_eq!(m.f1, 1.0);
        assert!(m.loss < 1e-3);
    }

    #[test]
    fn test_macro_scores_with_one_error() {
        let features = vec![vec![-1.0], vec![1.0], vec![1.0], vec![2.0]];
        let labels = vec![0, 0, 1, 1];
        let m = score(&threshold_model(), &features, &labels).unwrap();
        assert_eq!(m.accuracy, 0.75);
        // class 0: p=1, r=0.5 ; class 1: p=2/3, r=1
        assert!((m.precision - (1.0 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
        assert!((m.recall - 0.75).abs() < 1e-12);
        // f1: class 0 = 2/3, class 1 = 0.8
        assert!((m.f1 - (2.0 / 3.0 + 0.8) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_uninformative_model_loss_is_ln2() {
        let flat = ModelParams {
            coefficients: vec![vec![0.0]],
            intercepts: vec![0.0],
            classes: vec![0, 1],
            feature_names: vec![],
        };
        let m = score(&flat, &[vec![1.0], vec![2.0]], &[0, 1]).unwrap();
        assert!((m.loss - std::f64::consts::LN_2).abs() < 1e-12);
    }

    #[test]
    fn test_feature_mismatch() {
        let err = score(&threshold_model(), &[vec![1.0, 2.0]], &[1]).unwrap_err();
        assert_eq!(err, EvalError::FeatureMismatch { expected: 2, found: 1 });
    }

    #[test]
    fn test_class_mismatch() {
        let mut m = threshold_model();
        m.classes = vec![0, 1, 2];
        assert_eq!(
            score(&m, &[vec![1.0]], &[1]).unwrap_err(),
            EvalError::ClassMismatch { rows: 1, classes: 3 }
        );
    }

    #[test]
    fn test_empty_reference_evaluator() {
        assert_eq!(
            ReferenceEvaluator::empty().evaluate(&threshold_model()).unwrap_err(),
            EvalError::NoReferenceData
        );
    }
}
