//! Model-fitting boundary and two built-in models.

use ac_types::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pluggable model fitting.
///
/// `x` and `y` hold one row per accumulated observation. Rows may have any
/// number of columns, but every row of a matrix must have the same width.
pub trait ModelFitter: Send {
    type Model: Clone + fmt::Debug + Send + Sync + 'static;

    fn fit(&mut self, x: &[Vec<f64>], y: &[Vec<f64>]) -> Result<Self::Model, ModelError>;

    fn predict(&self, model: &Self::Model, x: &[Vec<f64>]) -> Result<Vec<f64>, ModelError>;

    /// Human-readable summary of a fitted model.
    fn report(&self, model: &Self::Model) -> String {
        format!("{model:?}")
    }

    fn name(&self) -> &str;
}

/// Width shared by every row, or an error for ragged or empty input.
fn column_count(rows: &[Vec<f64>]) -> Result<usize, ModelError> {
    let first = rows.first().ok_or_else(|| ModelError::InsufficientData {
        message: "no rows to fit".into(),
    })?;
    let width = first.len();
    if width == 0 {
        return Err(ModelError::InsufficientData {
            message: "rows have no columns".into(),
        });
    }
    if let Some(row) = rows.iter().find(|r| r.len() != width) {
        return Err(ModelError::ShapeMismatch {
            expected: width,
            actual: row.len(),
        });
    }
    Ok(width)
}

/// First column of `y`, checked against the row count of `x`.
fn target(x: &[Vec<f64>], y: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
    if x.len() != y.len() {
        return Err(ModelError::InsufficientData {
            message: format!("{} input rows but {} target rows", x.len(), y.len()),
        });
    }
    column_count(y)?;
    Ok(y.iter().map(|row| row[0]).collect())
}

// ---- Mean ----

/// Predicts the mean of the observed targets everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanModel;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanFit {
    pub mean: f64,
}

impl MeanModel {
    pub fn new() -> Self {
        Self
    }
}

impl ModelFitter for MeanModel {
    type Model = MeanFit;

    fn fit(&mut self, x: &[Vec<f64>], y: &[Vec<f64>]) -> Result<MeanFit, ModelError> {
        let values = target(x, y)?;
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Ok(MeanFit { mean })
    }

    fn predict(&self, model: &MeanFit, x: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        Ok(vec![model.mean; x.len()])
    }

    fn report(&self, model: &MeanFit) -> String {
        format!("y = {:.4}", model.mean)
    }

    fn name(&self) -> &str {
        "mean"
    }
}

// ---- Ordinary least squares ----

/// Ordinary least squares with an intercept.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearRegression;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LinearFit {
    /// `y = a x + b` for a single input, `y = a1 x1 + a2 x2 + b` otherwise.
    pub fn report(&self) -> String {
        let terms: Vec<String> = if self.coefficients.len() == 1 {
            vec![format!("{:.4} x", self.coefficients[0])]
        } else {
            self.coefficients
                .iter()
                .enumerate()
                .map(|(i, a)| format!("{a:.4} x{}", i + 1))
                .collect()
        };
        format!("y = {} + {:.4}", terms.join(" + "), self.intercept)
    }

    fn evaluate(&self, row: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(row)
                .map(|(a, x)| a * x)
                .sum::<f64>()
    }
}

impl LinearRegression {
    pub fn new() -> Self {
        Self
    }
}

impl ModelFitter for LinearRegression {
    type Model = LinearFit;

    fn fit(&mut self, x: &[Vec<f64>], y: &[Vec<f64>]) -> Result<LinearFit, ModelError> {
        let values = target(x, y)?;
        let width = column_count(x)?;
        let dim = width + 1;
        if x.len() < dim {
            return Err(ModelError::InsufficientData {
                message: format!("{} rows cannot determine {dim} parameters", x.len()),
            });
        }

        // Normal equations over [1, x1, .., xp].
        let mut a = vec![vec![0.0; dim]; dim];
        let mut b = vec![0.0; dim];
        for (row, yi) in x.iter().zip(&values) {
            let augmented: Vec<f64> = std::iter::once(1.0).chain(row.iter().copied()).collect();
            for i in 0..dim {
                b[i] += augmented[i] * yi;
                for j in 0..dim {
                    a[i][j] += augmented[i] * augmented[j];
                }
            }
        }

        let solution = solve(a, b)?;
        Ok(LinearFit {
            intercept: solution[0],
            coefficients: solution[1..].to_vec(),
        })
    }

    fn predict(&self, model: &LinearFit, x: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        if x.is_empty() {
            return Ok(Vec::new());
        }
        let width = column_count(x)?;
        if width != model.coefficients.len() {
            return Err(ModelError::ShapeMismatch {
                expected: model.coefficients.len(),
                actual: width,
            });
        }
        Ok(x.iter().map(|row| model.evaluate(row)).collect())
    }

    fn report(&self, model: &LinearFit) -> String {
        model.report()
    }

    fn name(&self) -> &str {
        "linear_regression"
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, ModelError> {
    const PIVOT_EPSILON: f64 = 1e-12;
    let n = b.len();

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return Err(ModelError::Singular);
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}
