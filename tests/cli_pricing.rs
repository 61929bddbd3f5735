use std::fs;
use std::path::Path;
use std::process::Command;

use insurance_pricing::predictor::LinearPredictor;
use insurance_pricing::transform::TransformState;
use tempfile::tempdir;

const SCRUBBED_ENV: [&str; 10] = [
    "TRANSFORMER_PATH",
    "TRANSFORM_PARAMS_PATH",
    "MODEL_PATH",
    "SOURCE_DATA_PATH",
    "TRAIN_DATA_PATH",
    "TEST_DATA_PATH",
    "EXPLAIN_TOP_K",
    "ATTRIBUTION_SAMPLES",
    "ATTRIBUTION_SEED",
    "RUST_LOG",
];

const REGIONS: [&str; 4] = ["northeast", "northwest", "southeast", "southwest"];

fn write_source(path: &Path) {
    let mut text = String::from("age,sex,bmi,children,smoker,region,charges\n");
    for i in 0..60usize {
        let age = 18 + (i * 11) % 47;
        let bmi = 19.0 + ((i * 5) % 23) as f64;
        let children = i % 4;
        let smokes = i % 5 == 2;
        let charges = 2_000.0
            + 230.0 * age as f64
            + 150.0 * (bmi - 19.0)
            + 350.0 * children as f64
            + if smokes { 18_000.0 } else { 0.0 };
        text.push_str(&format!(
            "{age},{},{bmi},{children},{},{},{charges}\n",
            if i % 2 == 0 { "male" } else { "female" },
            if smokes { "yes" } else { "no" },
            REGIONS[(i / 3) % 4],
        ));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create data directory");
    }
    fs::write(path, text).expect("write source data");
}

fn pricing(dir: &Path, args: &[&str]) -> std::process::Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_pricing"));
    for name in SCRUBBED_ENV {
        command.env_remove(name);
    }
    command
        .current_dir(dir)
        .args(["--config", "settings.toml"])
        .args(args)
        .output()
        .expect("run pricing cli")
}

#[test]
fn prepare_check_predict_and_evaluate() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();
    write_source(&dir.join("data").join("raw").join("insurance.csv"));
    fs::write(
        dir.join("settings.toml"),
        "explain_top_k = 4\nattribution_samples = 16\n",
    )
    .expect("write settings");

    let prepared = pricing(dir, &["prepare"]);
    assert!(prepared.status.success(), "prepare failed: {prepared:?}");
    assert!(dir.join("models/feature_transformer.toml").exists());
    let train = fs::read_to_string(dir.join("data/processed/train.csv")).expect("train csv");
    assert!(train.lines().next().is_some_and(|h| h.ends_with(",charges")));
    let test = fs::read_to_string(dir.join("data/processed/test.csv")).expect("test csv");
    assert_eq!(train.lines().count() + test.lines().count() - 2, 60);
    assert!(test.lines().count() > 1);

    let state = TransformState::load(&dir.join("models/feature_transformer.toml"))
        .expect("load transformer");
    let coefficients = vec![0.1; state.feature_columns.len()];
    let reference = vec![0.0; state.feature_columns.len()];
    LinearPredictor::new(0.0, state.feature_columns.clone(), coefficients, reference)
        .expect("predictor")
        .save(&dir.join("models/linear_predictor.toml"))
        .expect("save predictor");

    let applicant = [
        "--age", "95", "--sex", "female", "--bmi", "28.5", "--children", "2", "--smoker", "no",
        "--region", "northwest",
    ];

    let checked = pricing(dir, &[&["check"][..], &applicant[..]].concat());
    assert!(checked.status.success(), "check failed: {checked:?}");
    let stdout = String::from_utf8_lossy(&checked.stdout);
    assert!(stdout.contains("age=95 is above the training range"), "{stdout}");

    let predicted = pricing(dir, &[&["predict"][..], &applicant[..]].concat());
    assert!(predicted.status.success(), "predict failed: {predicted:?}");
    let estimate: serde_json::Value =
        serde_json::from_slice(&predicted.stdout).expect("estimate json");
    assert!(estimate["charges"].as_f64().is_some_and(|c| c > 0.0));
    assert_eq!(estimate["extrapolation_warnings"].as_array().map(Vec::len), Some(1));
    assert_eq!(
        estimate["attribution"]["contributions"].as_array().map(Vec::len),
        Some(4)
    );
    assert_eq!(estimate["narrative_source"], "fallback");

    let batch = pricing(dir, &["predict", "--batch", "data/raw/insurance.csv"]);
    assert!(batch.status.success(), "batch predict failed: {batch:?}");
    assert_eq!(String::from_utf8_lossy(&batch.stdout).lines().count(), 60);

    let evaluated = pricing(dir, &["evaluate"]);
    assert!(evaluated.status.success(), "evaluate failed: {evaluated:?}");
    assert!(String::from_utf8_lossy(&evaluated.stdout).contains("SMAPE"));
}

#[test]
fn invalid_applicant_is_rejected() {
    let tmp = tempdir().expect("temporary directory");
    fs::write(tmp.path().join("settings.toml"), "").expect("write settings");

    let out = pricing(
        tmp.path(),
        &[
            "check", "--age", "30", "--sex", "other", "--bmi", "25", "--children", "0",
            "--smoker", "no", "--region", "northeast",
        ],
    );
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("sex"));
}
