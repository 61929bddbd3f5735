//! # Attribution Aggregation
//!
//! Attribution procedures score the *expanded* feature space: one value per
//! entry of `TransformState::feature_columns`. Callers want answers in terms of
//! the six raw inputs, so `aggregate` folds the expanded scores back:
//!
//! * a column named after a raw feature goes straight into that bucket,
//! * `region_*` one-hot columns go into `region`,
//! * `smoker_bmi` is split evenly between `smoker` and `bmi`,
//! * `age_bmi` is split evenly between `age` and `bmi`,
//! * anything else keeps its own bucket with a `derived` value marker.
//!
//! Every input value lands in exactly one place, so the bucket totals always
//! sum to the sum of the incoming vector.

pub mod sampling;

use crate::predictor::PredictorError;
use crate::schema::{AGE, BMI, CHILDREN, RAW_FEATURES, REGION, RawInput, SEX, SMOKER};
use crate::transform::{AGE_BMI, REGION_PREFIX, SMOKER_BMI, TransformError};
use log::debug;
use ndarray::{Array1, Array2, ArrayD};
use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Placeholder value reported for buckets that have no single raw value.
pub const DERIVED: &str = "derived";

#[derive(Error, Debug)]
pub enum AttributionError {
    #[error(
        "Contribution values of shape {found:?} cannot be read as one row of {expected} feature contributions."
    )]
    Shape { expected: usize, found: Vec<usize> },
    #[error("The background set is empty, so no attribution baseline can be computed.")]
    EmptyBackground,
    #[error("Predictor failed during attribution: {0}")]
    Predictor(#[from] PredictorError),
    #[error("Transform failed during attribution: {0}")]
    Transform(#[from] TransformError),
}

/// Contribution scores in whatever shape the attribution procedure produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ContributionValues {
    /// Already a single row.
    Vector(Array1<f64>),
    /// One row per explained sample; the first is used.
    Matrix(Array2<f64>),
    /// Arbitrary rank, e.g. per-output stacks.
    Tensor(ArrayD<f64>),
    /// A list of per-output rows; the first is used.
    Rows(Vec<Array1<f64>>),
}

impl ContributionValues {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            ContributionValues::Vector(v) => vec![v.len()],
            ContributionValues::Matrix(m) => m.shape().to_vec(),
            ContributionValues::Tensor(t) => t.shape().to_vec(),
            ContributionValues::Rows(rows) => {
                let mut shape = vec![rows.len()];
                if let Some(first) = rows.first() {
                    shape.push(first.len());
                }
                shape
            }
        }
    }

    /// Resolves the values to one row of exactly `width` contributions.
    ///
    /// Rank-2 input yields its first row. Rank 3 and above is read in logical
    /// order as rows of `width` values, and the first of those is taken.
    pub fn first_row(&self, width: usize) -> Result<Array1<f64>, AttributionError> {
        let shape_error = || AttributionError::Shape {
            expected: width,
            found: self.shape(),
        };

        let row = match self {
            ContributionValues::Vector(v) => v.clone(),
            ContributionValues::Matrix(m) if m.nrows() > 0 => m.row(0).to_owned(),
            ContributionValues::Matrix(_) => return Err(shape_error()),
            ContributionValues::Rows(rows) => rows.first().cloned().ok_or_else(shape_error)?,
            ContributionValues::Tensor(t) => match t.ndim() {
                0 => return Err(shape_error()),
                1 => t.iter().copied().collect(),
                2 if t.shape()[0] > 0 => t.iter().copied().take(t.shape()[1]).collect(),
                _ => {
                    if width == 0 || t.len() == 0 || t.len() % width != 0 {
                        return Err(shape_error());
                    }
                    t.iter().copied().take(width).collect()
                }
            },
        };

        if row.len() != width {
            return Err(shape_error());
        }
        Ok(row)
    }
}

/// The observed raw value shown next to a contribution.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Integer(i64),
    Float(f64),
    Text(String),
    /// No single raw value exists (unrecognised expanded columns).
    Derived,
}

impl FeatureValue {
    fn of(input: &RawInput, feature: &str) -> Self {
        match feature {
            AGE => FeatureValue::Integer(i64::from(input.age)),
            SEX => FeatureValue::Text(input.sex.as_str().to_string()),
            BMI => FeatureValue::Float(input.bmi),
            CHILDREN => FeatureValue::Integer(i64::from(input.children)),
            SMOKER => FeatureValue::Text(input.smoker.as_str().to_string()),
            REGION => FeatureValue::Text(input.region.as_str().to_string()),
            _ => FeatureValue::Derived,
        }
    }
}

/// Integral floats print without decimals, others with one.
impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Integer(v) => write!(f, "{v}"),
            FeatureValue::Float(v) if v.fract() == 0.0 => write!(f, "{v:.0}"),
            FeatureValue::Float(v) => write!(f, "{v:.1}"),
            FeatureValue::Text(v) => f.write_str(v),
            FeatureValue::Derived => f.write_str(DERIVED),
        }
    }
}

impl Serialize for FeatureValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FeatureValue::Integer(v) => serializer.serialize_i64(*v),
            FeatureValue::Float(v) => serializer.serialize_f64(*v),
            FeatureValue::Text(v) => serializer.serialize_str(v),
            FeatureValue::Derived => serializer.serialize_str(DERIVED),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureContribution {
    pub feature: String,
    pub value: FeatureValue,
    pub contribution: f64,
    pub abs_contribution: f64,
}

/// Raw-feature contributions, strongest first, plus the attribution baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionResult {
    pub baseline: f64,
    pub contributions: Vec<FeatureContribution>,
}

impl AttributionResult {
    /// Sum of the signed contributions that survived truncation.
    pub fn total_contribution(&self) -> f64 {
        self.contributions.iter().map(|c| c.contribution).sum()
    }
}

enum Route {
    Bucket(&'static str),
    Split(&'static str, &'static str),
    Extra,
}

fn route(column: &str) -> Route {
    if let Some(feature) = RAW_FEATURES.iter().copied().find(|f| *f == column) {
        return Route::Bucket(feature);
    }
    if column.starts_with(REGION_PREFIX) {
        return Route::Bucket(REGION);
    }
    match column {
        SMOKER_BMI => Route::Split(SMOKER, BMI),
        AGE_BMI => Route::Split(AGE, BMI),
        _ => Route::Extra,
    }
}

fn credit(buckets: &mut [(&'static str, f64)], feature: &str, amount: f64) {
    if let Some((_, total)) = buckets.iter_mut().find(|(name, _)| *name == feature) {
        *total += amount;
    }
}

/// Folds expanded-space contributions onto the raw features of `input`.
///
/// `feature_names` is the expanded column order the values were computed in.
/// The result is sorted by absolute contribution, ties keeping raw schema order
/// followed by extras in column order, and truncated to `top_k` entries.
pub fn aggregate(
    input: &RawInput,
    feature_names: &[String],
    values: &ContributionValues,
    baseline: f64,
    top_k: usize,
) -> Result<AttributionResult, AttributionError> {
    let row = values.first_row(feature_names.len())?;

    let mut buckets: Vec<(&'static str, f64)> = RAW_FEATURES.iter().map(|f| (*f, 0.0)).collect();
    let mut extras: Vec<(String, f64)> = Vec::new();

    for (column, &value) in feature_names.iter().zip(row.iter()) {
        match route(column) {
            Route::Bucket(feature) => credit(&mut buckets, feature, value),
            Route::Split(first, second) => {
                credit(&mut buckets, first, 0.5 * value);
                credit(&mut buckets, second, 0.5 * value);
            }
            Route::Extra => match extras.iter_mut().find(|(name, _)| name == column) {
                Some((_, total)) => *total += value,
                None => extras.push((column.clone(), value)),
            },
        }
    }

    if !extras.is_empty() {
        debug!(
            "Attribution kept {} unrecognised expanded columns as derived buckets",
            extras.len()
        );
    }

    let mut contributions: Vec<FeatureContribution> = buckets
        .into_iter()
        .map(|(feature, total)| (feature.to_string(), FeatureValue::of(input, feature), total))
        .chain(
            extras
                .into_iter()
                .map(|(name, total)| (name, FeatureValue::Derived, total)),
        )
        .map(|(feature, value, contribution)| FeatureContribution {
            feature,
            value,
            contribution,
            abs_contribution: contribution.abs(),
        })
        .collect();

    contributions.sort_by(|a, b| b.abs_contribution.total_cmp(&a.abs_contribution));
    contributions.truncate(top_k);

    Ok(AttributionResult {
        baseline,
        contributions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{fitted_state, sample_input};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, IxDyn, array};

    fn contribution<'a>(result: &'a AttributionResult, feature: &str) -> &'a FeatureContribution {
        result
            .contributions
            .iter()
            .find(|c| c.feature == feature)
            .unwrap_or_else(|| panic!("no bucket for {feature}"))
    }

    #[test]
    fn buckets_conserve_the_vector_sum() {
        let state = fitted_state();
        let width = state.feature_columns.len();
        let vector = Array1::from_iter((0..width).map(|i| (i as f64 - 4.0) * 0.37));
        let result = aggregate(
            &sample_input(),
            &state.feature_columns,
            &ContributionValues::Vector(vector.clone()),
            12.5,
            8,
        )
        .unwrap();

        assert_eq!(result.contributions.len(), RAW_FEATURES.len());
        assert_abs_diff_eq!(result.total_contribution(), vector.sum(), epsilon = 1e-12);
        assert_eq!(result.baseline, 12.5);
    }

    #[test]
    fn interaction_is_split_evenly() {
        let state = fitted_state();
        let vector = Array1::from_iter(
            state
                .feature_columns
                .iter()
                .map(|c| if c == SMOKER_BMI { 10.0 } else { 0.0 }),
        );
        let result = aggregate(
            &sample_input(),
            &state.feature_columns,
            &ContributionValues::Vector(vector),
            0.0,
            8,
        )
        .unwrap();

        assert_eq!(contribution(&result, SMOKER).contribution, 5.0);
        assert_eq!(contribution(&result, BMI).contribution, 5.0);
        assert_eq!(contribution(&result, AGE).contribution, 0.0);
    }

    #[test]
    fn region_one_hots_collapse_into_region() {
        let names: Vec<String> = ["region_northwest", "region_southeast", "age_bmi"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = aggregate(
            &sample_input(),
            &names,
            &ContributionValues::Vector(array![1.5, -4.0, 3.0]),
            0.0,
            8,
        )
        .unwrap();

        let region = contribution(&result, REGION);
        assert_abs_diff_eq!(region.contribution, -2.5, epsilon = 1e-12);
        assert_eq!(region.value, FeatureValue::Text("southeast".to_string()));
        assert_abs_diff_eq!(contribution(&result, AGE).contribution, 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(contribution(&result, BMI).contribution, 1.5, epsilon = 1e-12);
    }

    #[test]
    fn unrecognised_columns_keep_a_derived_bucket() {
        let names: Vec<String> = ["age", "bmi_squared", "bmi_squared"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = aggregate(
            &sample_input(),
            &names,
            &ContributionValues::Vector(array![1.0, 2.0, 4.0]),
            0.0,
            8,
        )
        .unwrap();

        let extra = contribution(&result, "bmi_squared");
        assert_eq!(extra.contribution, 6.0);
        assert_eq!(extra.value, FeatureValue::Derived);
        assert_eq!(result.contributions[0].feature, "bmi_squared");
        assert_abs_diff_eq!(result.total_contribution(), 7.0, epsilon = 1e-12);
    }

    #[test]
    fn ties_keep_schema_order_and_top_k_truncates() {
        let state = fitted_state();
        let zeros = Array1::zeros(state.feature_columns.len());
        let result = aggregate(
            &sample_input(),
            &state.feature_columns,
            &ContributionValues::Vector(zeros),
            0.0,
            4,
        )
        .unwrap();
        let order: Vec<&str> = result.contributions.iter().map(|c| c.feature.as_str()).collect();
        assert_eq!(order, vec!["age", "sex", "bmi", "children"]);
    }

    #[test]
    fn sorted_by_magnitude_regardless_of_sign() {
        let names: Vec<String> = RAW_FEATURES.iter().map(|s| s.to_string()).collect();
        let result = aggregate(
            &sample_input(),
            &names,
            &ContributionValues::Vector(array![1.0, -9.0, 3.0, 0.5, 7.0, -2.0]),
            0.0,
            3,
        )
        .unwrap();
        let order: Vec<&str> = result.contributions.iter().map(|c| c.feature.as_str()).collect();
        assert_eq!(order, vec!["sex", "smoker", "bmi"]);
        assert_eq!(result.contributions[0].abs_contribution, 9.0);
    }

    #[test]
    fn higher_rank_values_use_their_first_row() {
        let matrix = ContributionValues::Matrix(array![[1.0, 2.0, 3.0], [9.0, 9.0, 9.0]]);
        assert_eq!(matrix.first_row(3).unwrap(), array![1.0, 2.0, 3.0]);

        let rows = ContributionValues::Rows(vec![array![4.0, 5.0], array![0.0, 0.0]]);
        assert_eq!(rows.first_row(2).unwrap(), array![4.0, 5.0]);

        let tensor = Array::from_iter((0..12).map(f64::from))
            .into_shape_with_order(IxDyn(&[2, 2, 3]))
            .unwrap();
        let tensor = ContributionValues::Tensor(tensor);
        assert_eq!(tensor.first_row(3).unwrap(), array![0.0, 1.0, 2.0]);
        assert_eq!(tensor.first_row(6).unwrap(), array![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn width_mismatch_is_a_shape_error() {
        let state = fitted_state();
        let short = ContributionValues::Vector(array![1.0, 2.0]);
        match aggregate(&sample_input(), &state.feature_columns, &short, 0.0, 8) {
            Err(AttributionError::Shape { expected, found }) => {
                assert_eq!(expected, state.feature_columns.len());
                assert_eq!(found, vec![2]);
            }
            other => panic!("expected a shape error, got {other:?}"),
        }

        let tensor = ContributionValues::Tensor(ArrayD::zeros(IxDyn(&[2, 2, 5])));
        assert!(matches!(
            tensor.first_row(3),
            Err(AttributionError::Shape { .. })
        ));
        assert!(matches!(
            ContributionValues::Rows(Vec::new()).first_row(3),
            Err(AttributionError::Shape { .. })
        ));
    }

    #[test]
    fn values_render_and_serialize_for_callers() {
        assert_eq!(FeatureValue::Float(30.0).to_string(), "30");
        assert_eq!(FeatureValue::Float(27.94).to_string(), "27.9");
        assert_eq!(FeatureValue::Integer(40).to_string(), "40");
        assert_eq!(
            serde_json::to_value(FeatureValue::Derived).unwrap(),
            serde_json::json!("derived")
        );
        assert_eq!(
            serde_json::to_value(FeatureValue::Integer(40)).unwrap(),
            serde_json::json!(40)
        );
    }
}
