//! Local training. The agent only needs parameters and an accuracy figure
//! back, so anything implementing [`Trainer`] can be plugged in.

use ledgerfl_protocol::eval::{self, EvalError};
use ledgerfl_protocol::{Dataset, ModelParams};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("need at least two classes, found {0}")]
    SingleClass(usize),
    #[error("need at least {min} rows, found {found}")]
    TooFewRows { min: usize, found: usize },
    #[error("local evaluation failed: {0}")]
    Eval(#[from] EvalError),
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub params: ModelParams,
    /// Accuracy on the locally held-out split
    pub accuracy: f64,
}

pub trait Trainer: Send + Sync {
    fn train(&self, data: &Dataset, warm_start: Option<&ModelParams>) -> Result<TrainOutcome, TrainError>;
}

/// Full-batch gradient descent on the logistic (binary) or softmax
/// (multiclass) loss, validated on a shuffled 80/20 split.
#[derive(Debug, Clone)]
pub struct LogisticTrainer {
    pub epochs: usize,
    pub learning_rate: f64,
    pub test_fraction: f64,
    pub seed: Option<u64>,
}

impl Default for LogisticTrainer {
    fn default() -> Self {
        Self {
            epochs: 1000,
            learning_rate: 0.1,
            test_fraction: 0.2,
            seed: None,
        }
    }
}

impl LogisticTrainer {
    fn split(&self, n: usize) -> (Vec<usize>, Vec<usize>) {
        let mut rng = match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let mut idx: Vec<usize> = (0..n).collect();
        idx.shuffle(&mut rng);
        let n_test = ((n as f64 * self.test_fraction).round() as usize).clamp(1, n - 1);
        let train = idx.split_off(n_test);
        (train, idx)
    }

    fn initial_params(data: &Dataset, warm_start: Option<&ModelParams>) -> ModelParams {
        let fresh = ModelParams::zeros(data.classes(), data.feature_names.clone(), data.n_features());
        match warm_start {
            Some(global) if global.is_well_formed() && global.shape() == fresh.shape() && global.classes == fresh.classes => {
                tracing::info!("Warm start from global model");
                global.clone()
            }
            Some(_) => {
                tracing::warn!("Global model does not fit the local data, starting from zeros");
                fresh
            }
            None => fresh,
        }
    }

    fn descend(&self, params: &mut ModelParams, data: &Dataset) {
        let n = data.len() as f64;
        let rows = params.coefficients.len();
        let binary = rows == 1;
        for _ in 0..self.epochs {
            let mut grad_w = vec![vec![0.0; data.n_features()]; rows];
            let mut grad_b = vec![0.0; rows];
            for (x, y) in data.features.iter().zip(&data.labels) {
                let proba = params.predict_proba(x);
                for k in 0..rows {
                    // Binary: the single row models the second class
                    let (p, class) = if binary { (proba[1], params.classes[1]) } else { (proba[k], params.classes[k]) };
                    let err = p - if *y == class { 1.0 } else { 0.0 };
                    for (g, v) in grad_w[k].iter_mut().zip(x) {
                        *g += err * v;
                    }
                    grad_b[k] += err;
                }
            }
            for k in 0..rows {
                for (w, g) in params.coefficients[k].iter_mut().zip(&grad_w[k]) {
                    *w -= self.learning_rate * g / n;
                }
                params.intercepts[k] -= self.learning_rate * grad_b[k] / n;
            }
        }
    }
}

impl Trainer for LogisticTrainer {
    fn train(&self, data: &Dataset, warm_start: Option<&ModelParams>) -> Result<TrainOutcome, TrainError> {
        let classes = data.classes();
        if classes.len() < 2 {
            return Err(TrainError::SingleClass(classes.len()));
        }
        if data.len() < 2 {
            return Err(TrainError::TooFewRows { min: 2, found: data.len() });
        }

        let (train_idx, test_idx) = self.split(data.len());
        let train = data.subset(&train_idx);
        let test = data.subset(&test_idx);

        let mut params = Self::initial_params(data, warm_start);
        self.descend(&mut params, &train);
        let metrics = eval::score(&params, &test.features, &test.labels)?;
        tracing::info!(
            train_rows = train.len(),
            test_rows = test.len(),
            accuracy = metrics.accuracy,
            loss = metrics.loss,
            "Local training done"
        );
        Ok(TrainOutcome { params, accuracy: metrics.accuracy })
    }
}
