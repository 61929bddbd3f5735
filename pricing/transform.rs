//! # Feature and Target Transformer
//!
//! `TransformState` is the fitted, persisted contract between training and
//! inference. It is created once by `TransformState::fit` over a training split,
//! saved as a TOML artifact, and loaded read-only by every estimate afterwards.
//! Nothing in this module mutates a state after `fit` returns.
//!
//! Feature pipeline, applied identically at fit and inference time:
//! 1. Winsorize raw numeric columns that have fitted bounds (`bmi`).
//! 2. Encode `sex` and `smoker` to {0, 1}; one-hot `region` over the fitted levels.
//! 3. Add the interaction terms `smoker_bmi` and `age_bmi`.
//! 4. Select `feature_columns` in their fitted order.
//! 5. Standardize `scale_feature_columns` (`age`, `bmi`) only.
//!
//! Target pipeline: winsorize `charges`, `log1p`, then optionally standardize.
//! `inverse_transform_target` undoes the last two steps exactly.

use crate::artifact::{self, ArtifactError};
use crate::schema::{
    AGE, BMI, CHARGES, CHILDREN, NUMERIC_FEATURES, RAW_FEATURES, RawFrame, RawInput, SEX, SMOKER,
    SchemaError,
};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub const ARTIFACT_KIND: &str = "feature_transformer";
pub const FORMAT_VERSION: u32 = 1;

pub const IQR_MULTIPLIER: f64 = 1.5;
pub const WINSORIZE_COLUMNS: [&str; 2] = [BMI, CHARGES];
pub const SCALE_FEATURE_COLUMNS: [&str; 2] = [AGE, BMI];

pub const REGION_PREFIX: &str = "region_";
pub const SMOKER_BMI: &str = "smoker_bmi";
pub const AGE_BMI: &str = "age_bmi";

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("Cannot fit the transformer on an empty training set.")]
    EmptyTrainingSet,
    #[error("Non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFinite(String),
    #[error("Column '{column}' contains '{value}', which has no fitted encoding.")]
    UnknownCategory { column: String, value: String },
    #[error("Fitted transformer is internally inconsistent: {0}")]
    Inconsistent(String),
}

/// Options that shape a fit. They are baked into the resulting state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    pub iqr_multiplier: f64,
    /// Fit a standard scaler on the log target.
    pub scale_target: bool,
    /// Apply `log1p` to the winsorized target.
    pub target_log: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            iqr_multiplier: IQR_MULTIPLIER,
            scale_target: true,
            target_log: true,
        }
    }
}

/// Column-wise z-score standardization with population variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
    /// `sqrt(var)`, with near-zero scales replaced by 1.0 so constant columns map to 0.
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(x: ArrayView2<f64>) -> Result<Self, TransformError> {
        let mean = x
            .mean_axis(Axis(0))
            .ok_or(TransformError::EmptyTrainingSet)?;
        let var = x.var_axis(Axis(0), 0.0);
        let scale = var
            .iter()
            .map(|&v| {
                let s = v.sqrt();
                if s < 10.0 * f64::EPSILON { 1.0 } else { s }
            })
            .collect();
        Ok(Self {
            mean: mean.to_vec(),
            var: var.to_vec(),
            scale,
        })
    }

    fn identity(width: usize) -> Self {
        Self {
            mean: vec![0.0; width],
            var: vec![1.0; width],
            scale: vec![1.0; width],
        }
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn transform_value(&self, column: usize, value: f64) -> f64 {
        (value - self.mean[column]) / self.scale[column]
    }

    pub fn inverse_value(&self, column: usize, value: f64) -> f64 {
        value * self.scale[column] + self.mean[column]
    }
}

/// Fitted categorical encodings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeMappings {
    pub binary_sex: BTreeMap<String, f64>,
    pub binary_smoker: BTreeMap<String, f64>,
    /// Sorted distinct region levels observed in training.
    pub region_levels: Vec<String>,
    /// One-hot column name for each entry of `region_levels`, in the same order.
    pub region_columns: Vec<String>,
}

impl EncodeMappings {
    fn fit(regions: &[String]) -> Self {
        let mut region_levels: Vec<String> = regions.to_vec();
        region_levels.sort();
        region_levels.dedup();
        let region_columns = region_levels
            .iter()
            .map(|level| format!("{REGION_PREFIX}{level}"))
            .collect();

        Self {
            binary_sex: BTreeMap::from([("female".to_string(), 0.0), ("male".to_string(), 1.0)]),
            binary_smoker: BTreeMap::from([("no".to_string(), 0.0), ("yes".to_string(), 1.0)]),
            region_levels,
            region_columns,
        }
    }

    /// Whether `level` was observed while fitting.
    pub fn has_region(&self, level: &str) -> bool {
        self.region_levels.iter().any(|l| l == level)
    }

    fn region_level_for_column(&self, column: &str) -> Option<&str> {
        self.region_columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.region_levels[i].as_str())
    }
}

/// Model-ready rows: `values[[i, j]]` is row `i` of feature `columns[j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|j| self.values.column(j))
    }
}

/// The complete fitted transform. Persisted as a unit and never mutated after fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformState {
    /// Clamp bounds per column (`bmi`, `charges`), applied before encoding.
    pub winsorize_bounds: BTreeMap<String, (f64, f64)>,
    pub encode_mappings: EncodeMappings,
    /// The predictor's input contract. The order is fixed at fit time.
    pub feature_columns: Vec<String>,
    pub scale_feature_columns: Vec<String>,
    pub feature_scaler: StandardScaler,
    pub target_scaler: Option<StandardScaler>,
    pub target_log: bool,
    /// Unclamped training (min, max) of each raw numeric feature. Only used to
    /// warn about extrapolation; never used for clamping.
    pub raw_feature_ranges: BTreeMap<String, (f64, f64)>,
    pub schema_features: Vec<String>,
    pub schema_target: String,
}

impl TransformState {
    /// Fits every transform parameter on a training frame that carries `charges`.
    pub fn fit(frame: &RawFrame, options: FitOptions) -> Result<Self, TransformError> {
        frame.check_lengths()?;
        if frame.is_empty() {
            return Err(TransformError::EmptyTrainingSet);
        }
        let charges = frame.charges.as_ref().ok_or_else(missing_target)?;

        for column in NUMERIC_FEATURES.iter().chain([CHARGES].iter()) {
            let values = numeric_column(frame, column)?;
            if values.iter().any(|v| !v.is_finite()) {
                return Err(TransformError::NonFinite(column.to_string()));
            }
        }

        let mut winsorize_bounds = BTreeMap::new();
        for column in WINSORIZE_COLUMNS {
            let values = numeric_column(frame, column)?;
            winsorize_bounds.insert(
                column.to_string(),
                iqr_bounds(values.view(), options.iqr_multiplier),
            );
        }

        let mut raw_feature_ranges = BTreeMap::new();
        for column in NUMERIC_FEATURES {
            let values = numeric_column(frame, column)?;
            raw_feature_ranges.insert(column.to_string(), observed_range(values.view()));
        }

        let encode_mappings = EncodeMappings::fit(&frame.region);
        let feature_columns = feature_columns_after_encode(&encode_mappings);
        let scale_feature_columns: Vec<String> =
            SCALE_FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect();

        let mut state = Self {
            winsorize_bounds,
            encode_mappings,
            feature_columns,
            feature_scaler: StandardScaler::identity(scale_feature_columns.len()),
            scale_feature_columns,
            target_scaler: None,
            target_log: options.target_log,
            raw_feature_ranges,
            schema_features: RAW_FEATURES.iter().map(|c| c.to_string()).collect(),
            schema_target: CHARGES.to_string(),
        };

        let encoded = state.encode(frame)?;
        let scale_block = encoded.select(Axis(1), &state.scale_indices()?);
        state.feature_scaler = StandardScaler::fit(scale_block.view())?;

        if options.scale_target {
            let log_target = state.log_target(charges.view()).insert_axis(Axis(1));
            state.target_scaler = Some(StandardScaler::fit(log_target.view())?);
        }

        info!(
            "Fitted feature transformer on {} rows: {} feature columns, region levels {:?}",
            frame.len(),
            state.feature_columns.len(),
            state.encode_mappings.region_levels
        );
        Ok(state)
    }

    /// Produces the model-ready matrix for a frame, in `feature_columns` order.
    pub fn transform(&self, frame: &RawFrame) -> Result<FeatureMatrix, TransformError> {
        let mut values = self.encode(frame)?;
        for (k, j) in self.scale_indices()?.into_iter().enumerate() {
            values
                .column_mut(j)
                .mapv_inplace(|v| self.feature_scaler.transform_value(k, v));
        }
        debug!(
            "Transformed {} rows into {} feature columns",
            values.nrows(),
            values.ncols()
        );
        Ok(FeatureMatrix {
            columns: self.feature_columns.clone(),
            values,
        })
    }

    /// Single-row convenience over `transform`.
    pub fn transform_input(&self, input: &RawInput) -> Result<FeatureMatrix, TransformError> {
        self.transform(&RawFrame::from_inputs(std::slice::from_ref(input)))
    }

    /// Features plus the forward-transformed target. Training use only.
    pub fn transform_with_target(
        &self,
        frame: &RawFrame,
    ) -> Result<(FeatureMatrix, Array1<f64>), TransformError> {
        let charges = frame.charges.as_ref().ok_or_else(missing_target)?;
        let features = self.transform(frame)?;
        Ok((features, self.forward_target(charges.view())))
    }

    /// Winsorize, optionally `log1p`, optionally standardize.
    pub fn forward_target(&self, charges: ArrayView1<f64>) -> Array1<f64> {
        let mut y = self.log_target(charges);
        if let Some(scaler) = &self.target_scaler {
            y.mapv_inplace(|v| scaler.transform_value(0, v));
        }
        y
    }

    /// Maps model output back to dollars: inverse standardization (when a target
    /// scaler was fit), then `expm1` (when the target was log-transformed).
    pub fn inverse_transform_target(&self, values: ArrayView1<f64>) -> Array1<f64> {
        let mut y = values.to_owned();
        if let Some(scaler) = &self.target_scaler {
            y.mapv_inplace(|v| scaler.inverse_value(0, v));
        }
        if self.target_log {
            y.mapv_inplace(f64::exp_m1);
        }
        y
    }

    pub fn save(&self, path: &Path) -> Result<(), TransformError> {
        artifact::save(path, ARTIFACT_KIND, FORMAT_VERSION, self)?;
        info!("Feature transformer saved to {}", path.display());
        Ok(())
    }

    /// Loads a transformer artifact. Any other artifact kind or format version is
    /// rejected with `ArtifactError::Type`.
    pub fn load(path: &Path) -> Result<Self, TransformError> {
        let state: Self = artifact::load(path, ARTIFACT_KIND, FORMAT_VERSION)?;
        state.check_consistency()?;
        info!(
            "Loaded feature transformer from {} ({} feature columns)",
            path.display(),
            state.feature_columns.len()
        );
        Ok(state)
    }

    fn check_consistency(&self) -> Result<(), TransformError> {
        let mappings = &self.encode_mappings;
        if mappings.region_levels.len() != mappings.region_columns.len() {
            return Err(TransformError::Inconsistent(format!(
                "{} region levels but {} region columns",
                mappings.region_levels.len(),
                mappings.region_columns.len()
            )));
        }
        let scaler = &self.feature_scaler;
        if scaler.width() != self.scale_feature_columns.len()
            || scaler.var.len() != scaler.width()
            || scaler.scale.len() != scaler.width()
        {
            return Err(TransformError::Inconsistent(format!(
                "feature scaler has {} columns, expected {}",
                scaler.width(),
                self.scale_feature_columns.len()
            )));
        }
        if let Some(target) = &self.target_scaler {
            if target.width() != 1 {
                return Err(TransformError::Inconsistent(format!(
                    "target scaler has {} columns, expected 1",
                    target.width()
                )));
            }
        }
        self.scale_indices()?;
        Ok(())
    }

    fn scale_indices(&self) -> Result<Vec<usize>, TransformError> {
        self.scale_feature_columns
            .iter()
            .map(|name| {
                self.feature_columns
                    .iter()
                    .position(|c| c == name)
                    .ok_or_else(|| {
                        TransformError::Inconsistent(format!(
                            "scaled column '{name}' is not a feature column"
                        ))
                    })
            })
            .collect()
    }

    fn clamp_values(&self, column: &str, values: ArrayView1<f64>) -> Array1<f64> {
        match self.winsorize_bounds.get(column) {
            Some(&(low, high)) => values.mapv(|v| v.clamp(low, high)),
            None => values.to_owned(),
        }
    }

    fn log_target(&self, charges: ArrayView1<f64>) -> Array1<f64> {
        let clamped = self.clamp_values(CHARGES, charges);
        if self.target_log {
            clamped.mapv(f64::ln_1p)
        } else {
            clamped
        }
    }

    /// Clamp, encode and add interactions. The result is unscaled.
    fn encode(&self, frame: &RawFrame) -> Result<Array2<f64>, TransformError> {
        frame.check_lengths()?;
        let mappings = &self.encode_mappings;

        let age = self.clamp_values(AGE, frame.age.view());
        let bmi = self.clamp_values(BMI, frame.bmi.view());
        let children = self.clamp_values(CHILDREN, frame.children.view());
        let sex = encode_binary(SEX, &frame.sex, &mappings.binary_sex)?;
        let smoker = encode_binary(SMOKER, &frame.smoker, &mappings.binary_smoker)?;

        let mut matrix = Array2::zeros((frame.len(), self.feature_columns.len()));
        for (j, name) in self.feature_columns.iter().enumerate() {
            let mut target = matrix.column_mut(j);
            match name.as_str() {
                AGE => target.assign(&age),
                SEX => target.assign(&sex),
                BMI => target.assign(&bmi),
                CHILDREN => target.assign(&children),
                SMOKER => target.assign(&smoker),
                SMOKER_BMI => target.assign(&(&smoker * &bmi)),
                AGE_BMI => target.assign(&(&age * &bmi)),
                other => {
                    let level = mappings.region_level_for_column(other).ok_or_else(|| {
                        TransformError::Inconsistent(format!(
                            "feature column '{other}' has no encoding rule"
                        ))
                    })?;
                    for (cell, region) in target.iter_mut().zip(&frame.region) {
                        *cell = if region == level { 1.0 } else { 0.0 };
                    }
                }
            }
        }
        Ok(matrix)
    }
}

/// The expanded column order: base columns, one-hot regions, then interactions.
pub fn feature_columns_after_encode(mappings: &EncodeMappings) -> Vec<String> {
    let mut columns: Vec<String> = [AGE, SEX, BMI, CHILDREN, SMOKER]
        .iter()
        .map(|c| c.to_string())
        .collect();
    columns.extend(mappings.region_columns.iter().cloned());
    columns.push(SMOKER_BMI.to_string());
    columns.push(AGE_BMI.to_string());
    columns
}

/// Tukey fences clamped to the observed data range: `[max(min, q1 - m*iqr), min(max, q3 + m*iqr)]`.
pub fn iqr_bounds(values: ArrayView1<f64>, multiplier: f64) -> (f64, f64) {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let (min, max) = (sorted[0], sorted[sorted.len() - 1]);
    let q1 = quantile_sorted(&sorted, 0.25);
    let q3 = quantile_sorted(&sorted, 0.75);
    let iqr = q3 - q1;
    (min.max(q1 - multiplier * iqr), max.min(q3 + multiplier * iqr))
}

/// Quantile with linear interpolation between closest ranks.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

fn observed_range(values: ArrayView1<f64>) -> (f64, f64) {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (min, max)
}

fn numeric_column<'a>(frame: &'a RawFrame, column: &str) -> Result<&'a Array1<f64>, TransformError> {
    frame.numeric(column).ok_or_else(|| {
        if column == CHARGES {
            missing_target().into()
        } else {
            TransformError::Inconsistent(format!("'{column}' is not a raw numeric column"))
        }
    })
}

fn encode_binary(
    column: &str,
    values: &[String],
    mapping: &BTreeMap<String, f64>,
) -> Result<Array1<f64>, TransformError> {
    values
        .iter()
        .map(|value| {
            mapping
                .get(value)
                .copied()
                .ok_or_else(|| TransformError::UnknownCategory {
                    column: column.to_string(),
                    value: value.clone(),
                })
        })
        .collect()
}

fn missing_target() -> SchemaError {
    let mut expected: Vec<String> = RAW_FEATURES.iter().map(|c| c.to_string()).collect();
    expected.push(CHARGES.to_string());
    SchemaError::Columns {
        expected,
        missing: vec![CHARGES.to_string()],
        unexpected: Vec::new(),
    }
}
