//! Dollar-space regression metrics used to evaluate a predictor on held-out rows.

use ndarray::ArrayView1;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

const EPSILON: f64 = 1e-8;

#[derive(Error, Debug, PartialEq)]
pub enum MetricsError {
    #[error("Cannot score {actual} actual values against {predicted} predictions.")]
    LengthMismatch { actual: usize, predicted: usize },
    #[error("Cannot compute metrics on an empty set.")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub r2: f64,
    /// Mean absolute percentage error, in percent.
    pub mape: f64,
    /// Symmetric mean absolute percentage error, in percent.
    pub smape: f64,
    pub rows: usize,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rows   {}", self.rows)?;
        writeln!(f, "R²     {:.4}", self.r2)?;
        writeln!(f, "MAPE   {:.2}%", self.mape)?;
        write!(f, "SMAPE  {:.2}%", self.smape)
    }
}

/// Computes R², MAPE and SMAPE. Percentage denominators are guarded with 1e-8.
pub fn evaluate(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<Metrics, MetricsError> {
    if actual.len() != predicted.len() {
        return Err(MetricsError::LengthMismatch {
            actual: actual.len(),
            predicted: predicted.len(),
        });
    }
    let n = actual.len();
    if n == 0 {
        return Err(MetricsError::Empty);
    }

    let mean = actual.sum() / n as f64;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    let mut ape = 0.0;
    let mut sape = 0.0;
    for (&y, &p) in actual.iter().zip(predicted.iter()) {
        let err = y - p;
        ss_res += err * err;
        ss_tot += (y - mean) * (y - mean);
        ape += err.abs() / y.abs().max(EPSILON);
        sape += err.abs() / (y.abs() + p.abs() + EPSILON);
    }

    // A constant target gives R² of 1 for a perfect fit and 0 otherwise.
    let r2 = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };

    Ok(Metrics {
        r2,
        mape: 100.0 * ape / n as f64,
        smape: 100.0 * sape / n as f64,
        rows: n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn perfect_predictions() {
        let y = array![100.0, 200.0, 300.0];
        let m = evaluate(y.view(), y.view()).unwrap();
        assert_abs_diff_eq!(m.r2, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m.mape, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m.smape, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn known_values() {
        let y = array![100.0, 200.0];
        let p = array![110.0, 180.0];
        let m = evaluate(y.view(), p.view()).unwrap();
        // ss_res = 100 + 400, ss_tot = 2 * 50^2
        assert_abs_diff_eq!(m.r2, 1.0 - 500.0 / 5000.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m.mape, 10.0, epsilon = 1e-9);
        let smape = 100.0 * (10.0 / 210.0 + 20.0 / 380.0) / 2.0;
        assert_abs_diff_eq!(m.smape, smape, epsilon = 1e-6);
    }

    #[test]
    fn zero_actuals_do_not_divide_by_zero() {
        let y = array![0.0, 0.0];
        let p = array![0.0, 1.0];
        let m = evaluate(y.view(), p.view()).unwrap();
        assert!(m.mape.is_finite());
        assert_eq!(m.r2, 0.0);
    }

    #[test]
    fn mismatched_or_empty_inputs_fail() {
        let y = array![1.0, 2.0];
        let p = array![1.0];
        assert_eq!(
            evaluate(y.view(), p.view()),
            Err(MetricsError::LengthMismatch {
                actual: 2,
                predicted: 1
            })
        );
        let empty = ndarray::Array1::<f64>::zeros(0);
        assert_eq!(evaluate(empty.view(), empty.view()), Err(MetricsError::Empty));
    }
}
