//! FedAvg over verified participant models.
//!
//! Unweighted element-wise mean: no correction for local sample counts or
//! staleness. Each element is summed in sorted order so that any permutation
//! of the same inputs produces a bit-identical result.

use thiserror::Error;

use crate::model::ModelParams;

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("no models to aggregate")]
    Empty,
    #[error("model {index} is malformed (ragged coefficients or intercept count mismatch)")]
    Malformed { index: usize },
    #[error("model {index} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// Averages coefficient matrices and intercept vectors of `models`.
///
/// Class labels and feature names are copied from the first model; the
/// training pipeline guarantees they are identical across participants.
pub fn fed_avg(models: &[ModelParams]) -> Result<ModelParams, AggregateError> {
    let reference = models.first().ok_or(AggregateError::Empty)?;
    let expected = reference.shape();

    for (index, m) in models.iter().enumerate() {
        if !m.is_well_formed() {
            return Err(AggregateError::Malformed { index });
        }
        if m.shape() != expected {
            return Err(AggregateError::ShapeMismatch {
                index,
                expected,
                found: m.shape(),
            });
        }
        if m.classes != reference.classes || m.feature_names != reference.feature_names {
            tracing::warn!(index, "Model metadata differs from the reference model");
        }
    }

    let (rows, cols) = expected;
    let mut column = Vec::with_capacity(models.len());

    let coefficients: Vec<Vec<f64>> = (0..rows)
        .map(|r| {
            (0..cols)
                .map(|c| {
                    column.clear();
                    column.extend(models.iter().map(|m| m.coefficients[r][c]));
                    ordered_mean(&mut column)
                })
                .collect::<Vec<f64>>()
        })
        .collect();

    let intercepts: Vec<f64> = (0..rows)
        .map(|r| {
            column.clear();
            column.extend(models.iter().map(|m| m.intercepts[r]));
            ordered_mean(&mut column)
        })
        .collect();

    Ok(ModelParams {
        coefficients,
        intercepts,
        classes: reference.classes.clone(),
        feature_names: reference.feature_names.clone(),
    })
}

fn ordered_mean(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(coef: Vec<Vec<f64>>, intercepts: Vec<f64>) -> ModelParams {
        let cols = coef.first().map(|r| r.len()).unwrap_or(0);
        ModelParams {
            coefficients: coef,
            intercepts,
            classes: vec![0, 1],
            feature_names: (0..cols).map(|i| format!("f{i}")).collect(),
        }
    }

    #[test]
    fn test_fedavg_unweighted() {
        let models = vec![
            model(vec![vec![1.0, 2.0]], vec![0.0]),
            model(vec![vec![3.0, 4.0]], vec![1.0]),
        ];
        let avg = fed_avg(&models).unwrap();
        assert_eq!(avg.coefficients, vec![vec![2.0, 3.0]]);
        assert_eq!(avg.intercepts, vec![0.5]);
        assert_eq!(avg.classes, vec![0, 1]);
        assert_eq!(avg.feature_names, vec!["f0", "f1"]);
    }

    #[test]
    fn test_fedavg_single_model_is_identity() {
        let only = model(vec![vec![42.0, 7.0]], vec![-1.5]);
        assert_eq!(fed_avg(std::slice::from_ref(&only)).unwrap(), only);
    }

    #[test]
    fn test_fedavg_multirow_mean() {
        let models = vec![
            model(vec![vec![1.0], vec![10.0], vec![100.0]], vec![1.0, 2.0, 3.0]),
            model(vec![vec![3.0], vec![30.0], vec![300.0]], vec![3.0, 4.0, 5.0]),
            model(vec![vec![5.0], vec![50.0], vec![500.0]], vec![5.0, 6.0, 7.0]),
        ];
        let avg = fed_avg(&models).unwrap();
        assert_eq!(avg.coefficients, vec![vec![3.0], vec![30.0], vec![300.0]]);
        assert_eq!(avg.intercepts, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_fedavg_is_order_independent() {
        // Values chosen so naive left-to-right float summation differs by order
        let a = model(vec![vec![1e16, 0.1]], vec![0.3]);
        let b = model(vec![vec![1.0, 0.2]], vec![1e-17]);
        let c = model(vec![vec![-1e16, 0.7]], vec![0.6]);
        let orders = [
            vec![a.clone(), b.clone(), c.clone()],
            vec![c.clone(), b.clone(), a.clone()],
            vec![b.clone(), a.clone(), c.clone()],
            vec![c.clone(), a.clone(), b.clone()],
        ];
        let first = fed_avg(&orders[0]).unwrap();
        for order in &orders[1..] {
            let out = fed_avg(order).unwrap();
            for (x, y) in out.coefficients[0].iter().zip(&first.coefficients[0]) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
            assert_eq!(out.intercepts[0].to_bits(), first.intercepts[0].to_bits());
        }
    }

    #[test]
    fn test_fedavg_empty() {
        assert_eq!(fed_avg(&[]), Err(AggregateError::Empty));
    }

    #[test]
    fn test_fedavg_shape_mismatch() {
        let models = vec![
            model(vec![vec![1.0, 2.0]], vec![0.0]),
            model(vec![vec![1.0, 2.0, 3.0]], vec![0.0]),
        ];
        assert_eq!(
            fed_avg(&models),
            Err(AggregateError::ShapeMismatch { index: 1, expected: (1, 2), found: (1, 3) })
        );
    }

    #[test]
    fn test_fedavg_rejects_ragged_input() {
        let models = vec![
            model(vec![vec![1.0, 2.0]], vec![0.0]),
            model(vec![vec![1.0, 2.0]], vec![0.0, 1.0]),
        ];
        assert_eq!(fed_avg(&models), Err(AggregateError::Malformed { index: 1 }));
    }
}
