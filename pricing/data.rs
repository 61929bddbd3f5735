//! # Tabular Data Loading and Preparation
//!
//! Reads raw insurance records from CSV into a `RawFrame`, splits them into
//! train and test sets, and writes prepared (transformed) matrices back out.
//!
//! - Strict Schema: the source file for training must hold exactly the six raw
//!   features plus `charges`. Files read for inference may carry extra columns,
//!   which are ignored.
//! - Column order in the file never matters; columns are looked up by name.
//! - Nulls, non-numeric values in numeric columns and non-finite numbers are
//!   rejected with the offending column named.

use crate::schema::{
    AGE, BMI, CHARGES, CHILDREN, REGION, RawFrame, SEX, SMOKER, SchemaError, validate_columns,
};
use crate::transform::{FeatureMatrix, TransformError};
use log::info;
use ndarray::Array1;
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;
use thiserror::Error;

pub const TEST_FRACTION: f64 = 0.2;
pub const SPLIT_SEED: u64 = 42;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write CSV output: {0}")]
    Csv(#[from] csv::Error),
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),
    #[error(
        "The column '{column}' could not be read as {expected_type}. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the column '{0}'.")]
    MissingValues(String),
    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFinite(String),
    #[error("Test fraction must lie strictly between 0 and 1, got {0}.")]
    InvalidFraction(f64),
    #[error("Prepared matrix has {rows} rows but {targets} target values.")]
    TargetLength { rows: usize, targets: usize },
}

/// Loads the training source: exactly the raw schema plus `charges`.
pub fn load_source(path: &Path) -> Result<RawFrame, DataError> {
    let df = read_csv(path)?;
    let frame = raw_frame_from_dataframe(&df, true, true)?;
    info!("Loaded {} source rows from '{}'", frame.len(), path.display());
    Ok(frame)
}

/// Loads raw rows for inference or evaluation. Extra columns are ignored and
/// `charges` is read when present.
pub fn load_raw(path: &Path) -> Result<RawFrame, DataError> {
    let df = read_csv(path)?;
    let frame = raw_frame_from_dataframe(&df, false, false)?;
    info!("Loaded {} raw rows from '{}'", frame.len(), path.display());
    Ok(frame)
}

fn read_csv(path: &Path) -> Result<DataFrame, DataError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b',')),
        )
        .finish()?;
    Ok(df)
}

/// Validates the columns of `df` and converts them into a `RawFrame`.
pub fn raw_frame_from_dataframe(
    df: &DataFrame,
    require_target: bool,
    strict: bool,
) -> Result<RawFrame, DataError> {
    let names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    validate_columns(&names, require_target, strict)?;

    let charges = if names.iter().any(|n| n == CHARGES) {
        Some(numeric_column(df, CHARGES)?)
    } else {
        None
    };

    let frame = RawFrame {
        age: numeric_column(df, AGE)?,
        sex: text_column(df, SEX)?,
        bmi: numeric_column(df, BMI)?,
        children: numeric_column(df, CHILDREN)?,
        smoker: text_column(df, SMOKER)?,
        region: text_column(df, REGION)?,
        charges,
    };
    frame.check_lengths()?;
    Ok(frame)
}

fn numeric_column(df: &DataFrame, name: &str) -> Result<Array1<f64>, DataError> {
    let column = df.column(name)?;
    if column.null_count() > 0 {
        return Err(DataError::MissingValues(name.to_string()));
    }

    let wrong_type = || DataError::ColumnWrongType {
        column: name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: format!("{:?}", column.dtype()),
    };
    let casted = column.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let chunked = casted.f64()?.rechunk();
    let values: Array1<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFinite(name.to_string()));
    }
    Ok(values)
}

fn text_column(df: &DataFrame, name: &str) -> Result<Vec<String>, DataError> {
    let column = df.column(name)?;
    if column.null_count() > 0 {
        return Err(DataError::MissingValues(name.to_string()));
    }
    let values = column.str().map_err(|_| DataError::ColumnWrongType {
        column: name.to_string(),
        expected_type: "text",
        found_type: format!("{:?}", column.dtype()),
    })?;
    Ok(values
        .into_iter()
        .flatten()
        .map(|v| v.trim().to_string())
        .collect())
}

/// Train/test split stratified on the `smoker` and `region` combination.
///
/// Each stratum is shuffled with a generator seeded from `seed` and contributes
/// `round(len * test_fraction)` rows to the test set. Both outputs keep source
/// row order.
pub fn stratified_split(
    frame: &RawFrame,
    test_fraction: f64,
    seed: u64,
) -> Result<(RawFrame, RawFrame), DataError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(DataError::InvalidFraction(test_fraction));
    }
    frame.check_lengths()?;

    let mut strata: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for i in 0..frame.len() {
        let key = format!("{}_{}", frame.smoker[i], frame.region[i]);
        strata.entry(key).or_default().push(i);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(frame.len());
    let mut test = Vec::new();
    for rows in strata.values_mut() {
        rows.shuffle(&mut rng);
        let n_test = (rows.len() as f64 * test_fraction).round() as usize;
        test.extend_from_slice(&rows[..n_test]);
        train.extend_from_slice(&rows[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();

    info!(
        "Stratified split over {} strata: {} train rows, {} test rows",
        strata.len(),
        train.len(),
        test.len()
    );
    Ok((frame.select(&train), frame.select(&test)))
}

/// Writes a prepared matrix: one column per feature, in fitted order, then the
/// transformed `charges`.
pub fn write_prepared(
    path: &Path,
    features: &FeatureMatrix,
    target: &Array1<f64>,
) -> Result<(), DataError> {
    if features.nrows() != target.len() {
        return Err(DataError::TargetLength {
            rows: features.nrows(),
            targets: target.len(),
        });
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(path)?;
    let mut header: Vec<&str> = features.columns.iter().map(String::as_str).collect();
    header.push(CHARGES);
    writer.write_record(&header)?;

    for (row, y) in features.values.rows().into_iter().zip(target.iter()) {
        let record: Vec<String> = row
            .iter()
            .chain(std::iter::once(y))
            .map(|v| v.to_string())
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    info!(
        "Wrote {} prepared rows to '{}'",
        features.nrows(),
        path.display()
    );
    Ok(())
}
