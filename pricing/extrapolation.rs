//! Out-of-distribution reporting against the fitted training statistics.
//!
//! This check only reports. Clamping happens separately and silently inside
//! `TransformState::transform`, against the winsorize bounds rather than the raw
//! ranges used here.

use crate::schema::{NUMERIC_FEATURES, REGION, RawInput};
use crate::transform::TransformState;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Below,
    Above,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Below => "below",
            Side::Above => "above",
        })
    }
}

/// One structured warning. Serialized with a `kind` tag for the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtrapolationWarning {
    OutOfRange {
        feature: String,
        value: f64,
        low: f64,
        high: f64,
        direction: Side,
    },
    UnseenCategory {
        feature: String,
        value: String,
    },
}

impl ExtrapolationWarning {
    pub fn feature(&self) -> &str {
        match self {
            ExtrapolationWarning::OutOfRange { feature, .. }
            | ExtrapolationWarning::UnseenCategory { feature, .. } => feature,
        }
    }
}

impl fmt::Display for ExtrapolationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtrapolationWarning::OutOfRange {
                feature,
                value,
                low,
                high,
                direction,
            } => write!(
                f,
                "{feature}={value} is {direction} the training range [{low:.2}, {high:.2}]"
            ),
            ExtrapolationWarning::UnseenCategory { feature, value } => {
                write!(f, "{feature}='{value}' was not observed in training data")
            }
        }
    }
}

/// Flags raw values outside the observed training ranges and region levels that
/// were never seen while fitting. Warnings always come out in the order age, bmi,
/// children, region. Values exactly on a bound are in range.
pub fn check_extrapolation(input: &RawInput, state: &TransformState) -> Vec<ExtrapolationWarning> {
    let mut warnings = Vec::new();

    for feature in NUMERIC_FEATURES {
        let (Some(value), Some(&(low, high))) =
            (input.numeric(feature), state.raw_feature_ranges.get(feature))
        else {
            continue;
        };
        let direction = if value < low {
            Side::Below
        } else if value > high {
            Side::Above
        } else {
            continue;
        };
        warnings.push(ExtrapolationWarning::OutOfRange {
            feature: feature.to_string(),
            value,
            low,
            high,
            direction,
        });
    }

    let region = input.region.as_str();
    if !state.encode_mappings.has_region(region) {
        warnings.push(ExtrapolationWarning::UnseenCategory {
            feature: REGION.to_string(),
            value: region.to_string(),
        });
    }

    warnings
}
