//! # Predictor Boundary
//!
//! The core never owns a model. It calls an injected `Predictor` on the
//! transformed feature matrix and, when the predictor declares the capability,
//! an exact attribution hook. Which attribution path runs is decided by that
//! declared capability alone.
//!
//! `LinearPredictor` is a small reference implementation backed by a TOML
//! artifact. Its exact attribution is the closed-form Shapley value of a linear
//! model relative to a reference point.

use crate::artifact::{self, ArtifactError};
use crate::attribution::ContributionValues;
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const LINEAR_ARTIFACT_KIND: &str = "linear_predictor";
pub const LINEAR_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error("Predictor expects {expected} feature columns, but received {found}.")]
    WidthMismatch { expected: usize, found: usize },
    #[error("Predictor returned {found} values for {expected} input rows.")]
    RowCount { expected: usize, found: usize },
    #[error(
        "Predictor feature order does not match the transformer: expected {expected:?}, found {found:?}"
    )]
    FeatureOrder {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("Predictor failed: {0}")]
    Failed(String),
}

/// Contributions over the transformed feature space plus the attribution baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAttribution {
    pub values: ContributionValues,
    pub baseline: f64,
}

/// Exact, model-specific attribution (tree paths, linear weights, ...).
pub trait ExactAttribution {
    fn attribute(&self, features: ArrayView2<f64>) -> Result<RawAttribution, PredictorError>;
}

pub trait Predictor: Send + Sync {
    /// Raw model output, one value per row, in the transformed target space.
    fn predict(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, PredictorError>;

    /// The exact attribution hook, if this predictor was built with one.
    fn exact_attribution(&self) -> Option<&dyn ExactAttribution> {
        None
    }

    /// Identifier reported back to callers alongside estimates.
    fn version(&self) -> Option<&str> {
        None
    }
}

/// `y = intercept + coefficients · x` over named transformed features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPredictor {
    pub intercept: f64,
    pub feature_names: Vec<String>,
    pub coefficients: Vec<f64>,
    /// Expected feature values; the exact attribution baseline is the prediction here.
    pub reference: Vec<f64>,
    /// Whether callers may use the closed-form attribution hook.
    #[serde(default)]
    pub exact_attribution: bool,
    #[serde(default)]
    pub version: Option<String>,
}

impl LinearPredictor {
    pub fn new(
        intercept: f64,
        feature_names: Vec<String>,
        coefficients: Vec<f64>,
        reference: Vec<f64>,
    ) -> Result<Self, PredictorError> {
        let predictor = Self {
            intercept,
            feature_names,
            coefficients,
            reference,
            exact_attribution: true,
            version: None,
        };
        predictor.check_shape()?;
        Ok(predictor)
    }

    /// Switches the exact attribution capability on or off.
    pub fn with_exact_attribution(mut self, enabled: bool) -> Self {
        self.exact_attribution = enabled;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Confirms the predictor was trained on exactly these columns, in this order.
    pub fn check_features(&self, columns: &[String]) -> Result<(), PredictorError> {
        if self.feature_names.as_slice() != columns {
            return Err(PredictorError::FeatureOrder {
                expected: columns.to_vec(),
                found: self.feature_names.clone(),
            });
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), PredictorError> {
        artifact::save(path, LINEAR_ARTIFACT_KIND, LINEAR_FORMAT_VERSION, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, PredictorError> {
        let predictor: Self = artifact::load(path, LINEAR_ARTIFACT_KIND, LINEAR_FORMAT_VERSION)?;
        predictor.check_shape()?;
        Ok(predictor)
    }

    fn check_shape(&self) -> Result<(), PredictorError> {
        let expected = self.feature_names.len();
        for found in [self.coefficients.len(), self.reference.len()] {
            if found != expected {
                return Err(PredictorError::WidthMismatch { expected, found });
            }
        }
        Ok(())
    }

    fn check_width(&self, features: ArrayView2<f64>) -> Result<(), PredictorError> {
        if features.ncols() != self.coefficients.len() {
            return Err(PredictorError::WidthMismatch {
                expected: self.coefficients.len(),
                found: features.ncols(),
            });
        }
        Ok(())
    }
}

impl Predictor for LinearPredictor {
    fn predict(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, PredictorError> {
        self.check_width(features)?;
        let weights = Array1::from_vec(self.coefficients.clone());
        Ok(features.dot(&weights) + self.intercept)
    }

    fn exact_attribution(&self) -> Option<&dyn ExactAttribution> {
        if self.exact_attribution {
            Some(self)
        } else {
            None
        }
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

impl ExactAttribution for LinearPredictor {
    fn attribute(&self, features: ArrayView2<f64>) -> Result<RawAttribution, PredictorError> {
        self.check_width(features)?;
        let mut contributions = Array2::zeros(features.raw_dim());
        for (mut out, row) in contributions.rows_mut().into_iter().zip(features.rows()) {
            for (j, cell) in out.iter_mut().enumerate() {
                *cell = self.coefficients[j] * (row[j] - self.reference[j]);
            }
        }
        let baseline = self.intercept
            + self
                .coefficients
                .iter()
                .zip(&self.reference)
                .map(|(w, r)| w * r)
                .sum::<f64>();
        Ok(RawAttribution {
            values: ContributionValues::Matrix(contributions),
            baseline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::tempdir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn toy() -> LinearPredictor {
        LinearPredictor::new(
            2.0,
            names(&["a", "b", "c"]),
            vec![1.0, -0.5, 3.0],
            vec![0.0, 2.0, 1.0],
        )
        .unwrap()
    }

    #[test]
    fn predicts_affine_combination() {
        let x = array![[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]];
        let y = toy().predict(x.view()).unwrap();
        assert_abs_diff_eq!(y[0], 2.0 + 1.0 - 1.0 + 9.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn exact_attribution_is_locally_accurate() {
        let predictor = toy();
        let x = array![[4.0, -1.0, 0.5]];
        let hook = predictor.exact_attribution().expect("capability enabled");
        let attribution = hook.attribute(x.view()).unwrap();
        let ContributionValues::Matrix(values) = &attribution.values else {
            panic!("linear attribution should be a matrix");
        };
        let prediction = predictor.predict(x.view()).unwrap()[0];
        assert_abs_diff_eq!(
            values.sum() + attribution.baseline,
            prediction,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(values[[0, 0]], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn capability_flag_controls_the_hook() {
        assert!(toy().exact_attribution().is_some());
        assert!(toy().with_exact_attribution(false).exact_attribution().is_none());
    }

    #[test]
    fn width_mismatch_is_reported() {
        let x = array![[1.0, 2.0]];
        assert!(matches!(
            toy().predict(x.view()),
            Err(PredictorError::WidthMismatch {
                expected: 3,
                found: 2
            })
        ));
        assert!(matches!(
            LinearPredictor::new(0.0, names(&["a"]), vec![1.0, 2.0], vec![0.0]),
            Err(PredictorError::WidthMismatch { .. })
        ));
    }

    #[test]
    fn feature_order_is_checked() {
        let predictor = toy();
        assert!(predictor.check_features(&names(&["a", "b", "c"])).is_ok());
        assert!(matches!(
            predictor.check_features(&names(&["b", "a", "c"])),
            Err(PredictorError::FeatureOrder { .. })
        ));
    }

    #[test]
    fn artifact_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("model.toml");
        let predictor = toy().with_version("linear-v1");
        predictor.save(&path)?;
        let loaded = LinearPredictor::load(&path)?;
        assert_eq!(loaded, predictor);
        assert_eq!(Predictor::version(&loaded), Some("linear-v1"));
        Ok(())
    }
}
