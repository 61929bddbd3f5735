//! Deterministic raw frames shared by the unit tests.

use crate::predictor::LinearPredictor;
use crate::schema::{RawFrame, RawInput, Region, Sex, Smoker};
use crate::transform::{FitOptions, TransformState};
use ndarray::Array1;

const ALL_REGIONS: [&str; 4] = ["northeast", "northwest", "southeast", "southwest"];

/// 64 rows covering every region. Ages span exactly [18, 64] and children [0, 4].
/// The last row carries a bmi far above the upper fence and the one before it a
/// charge far above the target fence, so winsorization is exercised.
pub(crate) fn training_frame() -> RawFrame {
    synthetic_frame(64, &ALL_REGIONS)
}

/// Same generator without any `northeast` rows.
pub(crate) fn three_region_frame() -> RawFrame {
    synthetic_frame(64, &ALL_REGIONS[1..])
}

pub(crate) fn fitted_state() -> TransformState {
    TransformState::fit(&training_frame(), FitOptions::default())
        .expect("fixture frame should always fit")
}

/// A linear model over the fitted columns with plausible signs: older, heavier
/// and smoking applicants cost more. Outputs live in the scaled log-target space.
pub(crate) fn linear_predictor(state: &TransformState) -> LinearPredictor {
    let coefficients = state
        .feature_columns
        .iter()
        .map(|column| match column.as_str() {
            "age" => 0.45,
            "bmi" => 0.1,
            "children" => 0.05,
            "smoker" => 1.2,
            "smoker_bmi" => 0.01,
            "age_bmi" => 0.0005,
            _ => 0.02,
        })
        .collect();
    let reference = vec![0.0; state.feature_columns.len()];
    LinearPredictor::new(-0.6, state.feature_columns.clone(), coefficients, reference)
        .expect("fixture coefficients match the fitted columns")
        .with_version("fixture-linear")
}

/// The reference applicant: 40, male, bmi 30, one child, smoker, southeast.
pub(crate) fn sample_input() -> RawInput {
    RawInput {
        age: 40,
        sex: Sex::Male,
        bmi: 30.0,
        children: 1,
        smoker: Smoker::Yes,
        region: Region::Southeast,
    }
}

fn synthetic_frame(rows: usize, regions: &[&str]) -> RawFrame {
    let mut age = Vec::with_capacity(rows);
    let mut sex = Vec::with_capacity(rows);
    let mut bmi = Vec::with_capacity(rows);
    let mut children = Vec::with_capacity(rows);
    let mut smoker = Vec::with_capacity(rows);
    let mut region = Vec::with_capacity(rows);
    let mut charges = Vec::with_capacity(rows);

    for i in 0..rows {
        // 7 is coprime with 47, so the first 47 rows visit every age in 18..=64.
        let a = 18.0 + ((i * 7) % 47) as f64;
        let b = 18.0 + ((i * 13) % 29) as f64 + 0.25 * (i % 4) as f64;
        let c = (i % 5) as f64;
        let smokes = i % 4 == 1;

        age.push(a);
        sex.push(if i % 2 == 0 { "female" } else { "male" }.to_string());
        bmi.push(b);
        children.push(c);
        smoker.push(if smokes { "yes" } else { "no" }.to_string());
        region.push(regions[i % regions.len()].to_string());
        charges.push(
            1_200.0
                + 240.0 * a
                + 180.0 * (b - 18.0)
                + 450.0 * c
                + if smokes { 21_000.0 } else { 0.0 },
        );
    }

    bmi[rows - 1] = 95.0;
    charges[rows - 2] = 400_000.0;

    RawFrame {
        age: Array1::from_vec(age),
        sex,
        bmi: Array1::from_vec(bmi),
        children: Array1::from_vec(children),
        smoker,
        region,
        charges: Some(Array1::from_vec(charges)),
    }
}
