use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset: {0}")]
    Io(#[from] std::io::Error),
    #[error("dataset has no header row")]
    NoHeader,
    #[error("label column '{0}' not found")]
    MissingLabel(String),
    #[error("line {line}: expected {expected} fields, found {found}")]
    Ragged { line: usize, expected: usize, found: usize },
    #[error("line {line}, column '{column}': cannot parse '{value}'")]
    Parse { line: usize, column: String, value: String },
    #[error("dataset has no rows")]
    Empty,
}

/// Labelled numeric samples loaded from a CSV file
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<i64>,
}

impl Dataset {
    pub async fn from_csv(path: &Path, label_column: &str, drop_columns: &[String]) -> Result<Self, DatasetError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_csv_str(&text, label_column, drop_columns)
    }

    /// Parses a header + rows CSV. Every column except the label and the
    /// dropped ones must be numeric.
    pub fn from_csv_str(text: &str, label_column: &str, drop_columns: &[String]) -> Result<Self, DatasetError> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let (_, header) = lines.next().ok_or(DatasetError::NoHeader)?;
        let headers: Vec<String> = header.split(',').map(|s| s.trim().to_string()).collect();

        let label_idx = headers
            .iter()
            .position(|h| h == label_column)
            .ok_or_else(|| DatasetError::MissingLabel(label_column.to_string()))?;
        let feature_idx: Vec<usize> = (0..headers.len())
            .filter(|&i| i != label_idx && !drop_columns.contains(&headers[i]))
            .collect();

        let mut features = Vec::new();
        let mut labels = Vec::new();
        for (n, line) in lines {
            let line_no = n + 1;
            let vals: Vec<&str> = line.split(',').map(str::trim).collect();
            if vals.len() != headers.len() {
                return Err(DatasetError::Ragged { line: line_no, expected: headers.len(), found: vals.len() });
            }
            let row = feature_idx
                .iter()
                .map(|&i| {
                    vals[i].parse::<f64>().map_err(|_| DatasetError::Parse {
                        line: line_no,
                        column: headers[i].clone(),
                        value: vals[i].to_string(),
                    })
                })
                .collect::<Result<Vec<f64>, _>>()?;
            let label = parse_label(vals[label_idx]).ok_or_else(|| DatasetError::Parse {
                line: line_no,
                column: label_column.to_string(),
                value: vals[label_idx].to_string(),
            })?;
            features.push(row);
            labels.push(label);
        }

        if features.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(Self {
            feature_names: feature_idx.iter().map(|&i| headers[i].clone()).collect(),
            features,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    /// Sorted distinct labels
    pub fn classes(&self) -> Vec<i64> {
        let mut classes = self.labels.clone();
        classes.sort_unstable();
        classes.dedup();
        classes
    }

    /// Z-score every column in place. Constant columns are only centred.
    pub fn standardize(&mut self) {
        let n = self.len() as f64;
        for c in 0..self.n_features() {
            let mean = self.features.iter().map(|r| r[c]).sum::<f64>() / n;
            let var = self.features.iter().map(|r| (r[c] - mean).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            for row in &mut self.features {
                row[c] -= mean;
                if std > 0.0 {
                    row[c] /= std;
                }
            }
        }
    }

    /// Rows at `indices`, in that order
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            feature_names: self.feature_names.clone(),
            features: indices.iter().map(|&i| self.features[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

fn parse_label(raw: &str) -> Option<i64> {
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.fract() == 0.0 => Some(f as i64),
        _ => match raw.to_ascii_lowercase().as_str() {
            "yes" | "true" => Some(1),
            "no" | "false" => Some(0),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "customerID,tenure,charges,Churn\n\
                       a1,1,10.0,0\n\
                       a2,3,30.0,1\n\
                       \n\
                       a3,5,50.0,Yes\n";

    #[test]
    fn test_parse_drops_columns_and_reads_labels() {
        let ds = Dataset::from_csv_str(CSV, "Churn", &["customerID".to_string()]).unwrap();
        assert_eq!(ds.feature_names, vec!["tenure", "charges"]);
        assert_eq!(ds.features, vec![vec![1.0, 10.0], vec![3.0, 30.0], vec![5.0, 50.0]]);
        assert_eq!(ds.labels, vec![0, 1, 1]);
        assert_eq!(ds.classes(), vec![0, 1]);
    }

    #[test]
    fn test_missing_label_column() {
        let err = Dataset::from_csv_str(CSV, "Target", &[]).unwrap_err();
        assert!(matches!(err, DatasetError::MissingLabel(c) if c == "Target"));
    }

    #[test]
    fn test_non_numeric_feature_is_reported() {
        // customerID not dropped -> unparseable feature
        let err = Dataset::from_csv_str(CSV, "Churn", &[]).unwrap_err();
        assert!(matches!(err, DatasetError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_ragged_row() {
        let err = Dataset::from_csv_str("a,b\n1,2\n3\n", "b", &[]).unwrap_err();
        assert!(matches!(err, DatasetError::Ragged { line: 3, expected: 2, found: 1 }));
    }

    #[test]
    fn test_standardize() {
        let mut ds = Dataset::from_csv_str("x,k,y\n1,4,0\n3,4,1\n", "y", &[]).unwrap();
        ds.standardize();
        assert_eq!(ds.features, vec![vec![-1.0, 0.0], vec![1.0, 0.0]]);
    }

    #[test]
    fn test_subset() {
        let ds = Dataset::from_csv_str(CSV, "Churn", &["customerID".to_string()]).unwrap();
        let sub = ds.subset(&[2, 0]);
        assert_eq!(sub.labels, vec![1, 0]);
        assert_eq!(sub.features[0], vec![5.0, 50.0]);
    }
}
