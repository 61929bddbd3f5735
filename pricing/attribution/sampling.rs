//! Model-agnostic attribution by permutation sampling.
//!
//! Used whenever the predictor has no exact attribution hook. Each sample draws
//! a feature permutation and one background row, then walks from the background
//! row to the explained row one transformed column at a time, crediting each
//! column with the change in the dollar-space prediction. Averaging over samples
//! estimates Shapley values.
//!
//! All randomness is drawn up front from one seeded generator, and the
//! per-sample walks are evaluated in parallel but summed in sample order, so the
//! same seed always yields bit-identical contributions.

use super::{AttributionError, ContributionValues};
use crate::predictor::{Predictor, PredictorError, RawAttribution};
use crate::schema::{AGE, BMI, CHILDREN, RawFrame, RawInput, Sex, Smoker};
use crate::transform::{TransformError, TransformState};
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

pub const DEFAULT_SAMPLES: usize = 100;
pub const DEFAULT_SEED: u64 = 42;
/// Upper bound on background rows.
pub const MAX_BACKGROUND_ROWS: usize = 8;

/// A small synthetic background: the mid-point of each fitted numeric range,
/// crossed with the first two fitted regions, both sexes and both smoker levels.
pub fn background_frame(state: &TransformState) -> Result<RawFrame, AttributionError> {
    let midpoint = |feature: &str| {
        state
            .raw_feature_ranges
            .get(feature)
            .map(|&(low, high)| 0.5 * (low + high))
            .ok_or_else(|| {
                TransformError::Inconsistent(format!("no fitted range for '{feature}'"))
            })
    };
    let age = midpoint(AGE)?;
    let bmi = midpoint(BMI)?;
    let children = midpoint(CHILDREN)?.round();

    let mut rows: Vec<(&str, &str, &str)> = Vec::new();
    for region in state.encode_mappings.region_levels.iter().take(2) {
        for &sex in Sex::LEVELS {
            for &smoker in Smoker::LEVELS {
                rows.push((region.as_str(), sex, smoker));
            }
        }
    }
    rows.truncate(MAX_BACKGROUND_ROWS);
    if rows.is_empty() {
        return Err(AttributionError::EmptyBackground);
    }

    let n = rows.len();
    Ok(RawFrame {
        age: Array1::from_elem(n, age),
        sex: rows.iter().map(|(_, sex, _)| sex.to_string()).collect(),
        bmi: Array1::from_elem(n, bmi),
        children: Array1::from_elem(n, children),
        smoker: rows.iter().map(|(_, _, smoker)| smoker.to_string()).collect(),
        region: rows.iter().map(|(region, _, _)| region.to_string()).collect(),
        charges: None,
    })
}

/// One sample's random draws.
struct Walk {
    order: Vec<usize>,
    background_row: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingAttributor {
    pub samples: usize,
    pub seed: u64,
}

impl Default for SamplingAttributor {
    fn default() -> Self {
        Self {
            samples: DEFAULT_SAMPLES,
            seed: DEFAULT_SEED,
        }
    }
}

impl SamplingAttributor {
    pub fn new(samples: usize, seed: u64) -> Self {
        Self {
            samples: samples.max(1),
            seed,
        }
    }

    /// Contributions of each transformed column to the dollar estimate for
    /// `input`. The baseline is the mean dollar prediction over the background
    /// rows drawn, so contributions plus baseline equal the estimate.
    pub fn attribute(
        &self,
        state: &TransformState,
        predictor: &dyn Predictor,
        input: &RawInput,
    ) -> Result<RawAttribution, AttributionError> {
        let explained = state.transform_input(input)?;
        let background = state.transform(&background_frame(state)?)?;
        let target = explained.values.row(0);
        let width = target.len();

        let walks = self.draw_walks(width, background.nrows());
        let per_sample: Vec<(Array1<f64>, f64)> = walks
            .par_iter()
            .map(|walk| walk_contributions(state, predictor, target, background.values.view(), walk))
            .collect::<Result<_, _>>()?;

        let mut totals = Array1::<f64>::zeros(width);
        let mut baseline_total = 0.0;
        for (contributions, start) in &per_sample {
            totals += contributions;
            baseline_total += start;
        }
        let count = per_sample.len() as f64;
        debug!(
            "Sampling attribution: {} samples over {} background rows",
            per_sample.len(),
            background.nrows()
        );

        Ok(RawAttribution {
            values: ContributionValues::Vector(totals / count),
            baseline: baseline_total / count,
        })
    }

    fn draw_walks(&self, width: usize, background_rows: usize) -> Vec<Walk> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..self.samples.max(1))
            .map(|_| {
                let mut order: Vec<usize> = (0..width).collect();
                order.shuffle(&mut rng);
                Walk {
                    order,
                    background_row: rng.gen_range(0..background_rows),
                }
            })
            .collect()
    }
}

/// Evaluates one walk with a single batched predict call. Returns the per-column
/// marginal changes and the dollar prediction at the starting background row.
fn walk_contributions(
    state: &TransformState,
    predictor: &dyn Predictor,
    target: ArrayView1<f64>,
    background: ArrayView2<f64>,
    walk: &Walk,
) -> Result<(Array1<f64>, f64), AttributionError> {
    let width = target.len();
    let mut steps = Array2::<f64>::zeros((width + 1, width));
    let mut current = background.row(walk.background_row).to_owned();
    steps.row_mut(0).assign(&current);
    for (step, &column) in walk.order.iter().enumerate() {
        current[column] = target[column];
        steps.row_mut(step + 1).assign(&current);
    }

    let raw = predictor.predict(steps.view())?;
    if raw.len() != steps.nrows() {
        return Err(PredictorError::RowCount {
            expected: steps.nrows(),
            found: raw.len(),
        }
        .into());
    }
    let dollars = state.inverse_transform_target(raw.view());

    let mut contributions = Array1::<f64>::zeros(width);
    for (step, &column) in walk.order.iter().enumerate() {
        contributions[column] = dollars[step + 1] - dollars[step];
    }
    Ok((contributions, dollars[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{fitted_state, linear_predictor, sample_input, three_region_frame};
    use crate::transform::FitOptions;
    use approx::assert_relative_eq;

    #[test]
    fn background_crosses_two_regions_sexes_and_smokers() {
        let state = fitted_state();
        let frame = background_frame(&state).unwrap();
        assert_eq!(frame.len(), MAX_BACKGROUND_ROWS);
        assert!(frame.age.iter().all(|&a| a == 41.0));
        assert!(frame.children.iter().all(|&c| c == 2.0));
        assert_eq!(frame.region[0], "northeast");
        assert_eq!(frame.region[7], "northwest");
        assert_eq!(frame.sex[..4], ["female", "female", "male", "male"]);
        assert_eq!(frame.smoker[..2], ["no", "yes"]);
    }

    #[test]
    fn contributions_plus_baseline_equal_the_estimate() {
        let state = fitted_state();
        let predictor = linear_predictor(&state);
        let input = sample_input();

        let attribution = SamplingAttributor::default()
            .attribute(&state, &predictor, &input)
            .unwrap();
        let ContributionValues::Vector(values) = &attribution.values else {
            panic!("sampling should produce a vector");
        };
        assert_eq!(values.len(), state.feature_columns.len());

        let features = state.transform_input(&input).unwrap();
        let raw = predictor.predict(features.values.view()).unwrap();
        let estimate = state.inverse_transform_target(raw.view())[0];
        assert_relative_eq!(
            values.sum() + attribution.baseline,
            estimate,
            max_relative = 1e-9
        );
    }

    #[test]
    fn same_seed_gives_identical_contributions() {
        let state = fitted_state();
        let predictor = linear_predictor(&state);
        let attributor = SamplingAttributor::new(25, 7);
        let first = attributor.attribute(&state, &predictor, &sample_input()).unwrap();
        let second = attributor.attribute(&state, &predictor, &sample_input()).unwrap();
        assert_eq!(first, second);
    }

    struct SingleValue;

    impl Predictor for SingleValue {
        fn predict(&self, _: ArrayView2<f64>) -> Result<Array1<f64>, PredictorError> {
            Ok(Array1::from_elem(1, 0.1))
        }
    }

    #[test]
    fn short_predictor_output_is_an_error() {
        let state = fitted_state();
        let result = SamplingAttributor::new(3, DEFAULT_SEED).attribute(
            &state,
            &SingleValue,
            &sample_input(),
        );
        let width = state.feature_columns.len();
        match result {
            Err(AttributionError::Predictor(PredictorError::RowCount { expected, found })) => {
                assert_eq!(expected, width + 1);
                assert_eq!(found, 1);
            }
            other => panic!("expected a row count error, got {other:?}"),
        }
    }

    #[test]
    fn zero_samples_still_draws_one_walk() {
        let attributor = SamplingAttributor::new(0, DEFAULT_SEED);
        assert_eq!(attributor.samples, 1);
    }

    #[test]
    fn background_uses_the_first_fitted_regions() {
        let state = TransformState::fit(&three_region_frame(), FitOptions::default()).unwrap();
        let frame = background_frame(&state).unwrap();
        assert!(frame.region.iter().all(|r| r == "northwest" || r == "southeast"));
    }
}
