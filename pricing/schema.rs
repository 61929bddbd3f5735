//! # Raw Input Schema
//!
//! The six raw attributes every estimate starts from, plus the `charges` target
//! used while fitting. Column names are fixed: the transformer, the extrapolation
//! detector and the attribution aggregator all address features by these names.
//!
//! Two shapes of raw data exist:
//! - `RawInput`: one typed request row. Immutable, lives for a single estimate.
//! - `RawFrame`: columnar rows as read from disk. Categorical columns are kept as
//!   plain strings so training data is never rejected for carrying a level the
//!   request enums do not know about.

use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const AGE: &str = "age";
pub const SEX: &str = "sex";
pub const BMI: &str = "bmi";
pub const CHILDREN: &str = "children";
pub const SMOKER: &str = "smoker";
pub const REGION: &str = "region";
pub const CHARGES: &str = "charges";

/// The raw feature schema, in its canonical order. Ties in attribution ranking
/// and the order of extrapolation warnings both follow this order.
pub const RAW_FEATURES: [&str; 6] = [AGE, SEX, BMI, CHILDREN, SMOKER, REGION];

/// Raw numeric features whose observed training range is tracked.
pub const NUMERIC_FEATURES: [&str; 3] = [AGE, BMI, CHILDREN];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error(
        "Raw columns do not match the expected schema {expected:?}: missing {missing:?}, unexpected {unexpected:?}"
    )]
    Columns {
        expected: Vec<String>,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("Column '{column}' has {found} rows, but the frame has {expected}.")]
    RowCount {
        column: String,
        expected: usize,
        found: usize,
    },
}

/// Request-side validation failures. The core never requires these checks; they
/// exist for callers that accept untrusted input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("{field}={value} is outside the accepted range [{low}, {high}]")]
    OutOfBounds {
        field: &'static str,
        value: f64,
        low: f64,
        high: f64,
    },
    #[error("{field}={value} must be a whole number")]
    NotInteger { field: &'static str, value: f64 },
    #[error("'{value}' is not a valid {field}; expected one of {expected:?}")]
    UnknownLevel {
        field: &'static str,
        value: String,
        expected: &'static [&'static str],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Smoker {
    No,
    Yes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Northeast,
    Northwest,
    Southeast,
    Southwest,
}

impl Sex {
    pub const LEVELS: &'static [&'static str] = &["female", "male"];

    pub fn as_str(self) -> &'static str {
        match self {
            Sex::Female => "female",
            Sex::Male => "male",
        }
    }
}

impl Smoker {
    pub const LEVELS: &'static [&'static str] = &["no", "yes"];

    pub fn as_str(self) -> &'static str {
        match self {
            Smoker::No => "no",
            Smoker::Yes => "yes",
        }
    }
}

impl Region {
    pub const LEVELS: &'static [&'static str] =
        &["northeast", "northwest", "southeast", "southwest"];

    pub fn as_str(self) -> &'static str {
        match self {
            Region::Northeast => "northeast",
            Region::Northwest => "northwest",
            Region::Southeast => "southeast",
            Region::Southwest => "southwest",
        }
    }
}

impl FromStr for Sex {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "female" => Ok(Sex::Female),
            "male" => Ok(Sex::Male),
            _ => Err(InputError::UnknownLevel {
                field: SEX,
                value: s.to_string(),
                expected: Sex::LEVELS,
            }),
        }
    }
}

impl FromStr for Smoker {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "no" => Ok(Smoker::No),
            "yes" => Ok(Smoker::Yes),
            _ => Err(InputError::UnknownLevel {
                field: SMOKER,
                value: s.to_string(),
                expected: Smoker::LEVELS,
            }),
        }
    }
}

impl FromStr for Region {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "northeast" => Ok(Region::Northeast),
            "northwest" => Ok(Region::Northwest),
            "southeast" => Ok(Region::Southeast),
            "southwest" => Ok(Region::Southwest),
            _ => Err(InputError::UnknownLevel {
                field: REGION,
                value: s.to_string(),
                expected: Region::LEVELS,
            }),
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Smoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request row: the six raw attributes of a single applicant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    pub age: u32,
    pub sex: Sex,
    pub bmi: f64,
    pub children: u32,
    pub smoker: Smoker,
    pub region: Region,
}

impl RawInput {
    /// Value of a raw numeric feature, or `None` for categorical and unknown names.
    pub fn numeric(&self, feature: &str) -> Option<f64> {
        match feature {
            AGE => Some(f64::from(self.age)),
            BMI => Some(self.bmi),
            CHILDREN => Some(f64::from(self.children)),
            _ => None,
        }
    }

    /// Checks the request bounds: age in [0, 120], bmi in [0, 100], children in [0, 20].
    pub fn validate(&self) -> Result<(), InputError> {
        check_bounds(AGE, f64::from(self.age), 0.0, 120.0)?;
        check_bounds(BMI, self.bmi, 0.0, 100.0)?;
        check_bounds(CHILDREN, f64::from(self.children), 0.0, 20.0)?;
        Ok(())
    }
}

fn check_bounds(field: &'static str, value: f64, low: f64, high: f64) -> Result<(), InputError> {
    // NaN fails both comparisons, so test the accepted interval directly.
    if (low..=high).contains(&value) {
        Ok(())
    } else {
        Err(InputError::OutOfBounds {
            field,
            value,
            low,
            high,
        })
    }
}

fn whole_number(field: &'static str, value: f64, high: f64) -> Result<u32, InputError> {
    if value.fract() != 0.0 {
        return Err(InputError::NotInteger { field, value });
    }
    check_bounds(field, value, 0.0, high)?;
    Ok(value as u32)
}

/// Columnar raw rows. Numeric columns are `f64`; categorical columns are kept as
/// the strings found in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub age: Array1<f64>,
    pub sex: Vec<String>,
    pub bmi: Array1<f64>,
    pub children: Array1<f64>,
    pub smoker: Vec<String>,
    pub region: Vec<String>,
    /// The target column. Present for training data only.
    pub charges: Option<Array1<f64>>,
}

impl RawFrame {
    /// Builds a frame from typed request rows. The frame carries no target.
    pub fn from_inputs(inputs: &[RawInput]) -> Self {
        Self {
            age: inputs.iter().map(|r| f64::from(r.age)).collect(),
            sex: inputs.iter().map(|r| r.sex.as_str().to_string()).collect(),
            bmi: inputs.iter().map(|r| r.bmi).collect(),
            children: inputs.iter().map(|r| f64::from(r.children)).collect(),
            smoker: inputs.iter().map(|r| r.smoker.as_str().to_string()).collect(),
            region: inputs.iter().map(|r| r.region.as_str().to_string()).collect(),
            charges: None,
        }
    }

    /// Attaches a target column. The length must match the frame.
    pub fn with_charges(mut self, charges: Array1<f64>) -> Result<Self, SchemaError> {
        if charges.len() != self.len() {
            return Err(SchemaError::RowCount {
                column: CHARGES.to_string(),
                expected: self.len(),
                found: charges.len(),
            });
        }
        self.charges = Some(charges);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.age.len()
    }

    pub fn is_empty(&self) -> bool {
        self.age.is_empty()
    }

    /// A new frame holding `rows`, in the given order.
    pub fn select(&self, rows: &[usize]) -> Self {
        let pick = |values: &[String]| -> Vec<String> { rows.iter().map(|&i| values[i].clone()).collect() };
        Self {
            age: self.age.select(Axis(0), rows),
            sex: pick(&self.sex),
            bmi: self.bmi.select(Axis(0), rows),
            children: self.children.select(Axis(0), rows),
            smoker: pick(&self.smoker),
            region: pick(&self.region),
            charges: self.charges.as_ref().map(|c| c.select(Axis(0), rows)),
        }
    }

    /// Borrow a raw numeric column by name.
    pub fn numeric(&self, column: &str) -> Option<&Array1<f64>> {
        match column {
            AGE => Some(&self.age),
            BMI => Some(&self.bmi),
            CHILDREN => Some(&self.children),
            CHARGES => self.charges.as_ref(),
            _ => None,
        }
    }

    /// Verifies every column has the same number of rows as `age`.
    pub fn check_lengths(&self) -> Result<(), SchemaError> {
        let expected = self.len();
        let mut lengths: Vec<(&str, usize)> = vec![
            (SEX, self.sex.len()),
            (BMI, self.bmi.len()),
            (CHILDREN, self.children.len()),
            (SMOKER, self.smoker.len()),
            (REGION, self.region.len()),
        ];
        if let Some(charges) = &self.charges {
            lengths.push((CHARGES, charges.len()));
        }
        for (column, found) in lengths {
            if found != expected {
                return Err(SchemaError::RowCount {
                    column: column.to_string(),
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Converts every row into a typed `RawInput`, applying the request bounds.
    pub fn to_inputs(&self) -> Result<Vec<RawInput>, InputError> {
        (0..self.len())
            .map(|i| {
                let input = RawInput {
                    age: whole_number(AGE, self.age[i], 120.0)?,
                    sex: self.sex[i].parse()?,
                    bmi: self.bmi[i],
                    children: whole_number(CHILDREN, self.children[i], 20.0)?,
                    smoker: self.smoker[i].parse()?,
                    region: self.region[i].parse()?,
                };
                input.validate()?;
                Ok(input)
            })
            .collect()
    }
}

/// Compares a set of column names against the raw schema.
///
/// `require_target` adds `charges` to the required set. With `strict` set, any
/// column outside the schema is reported as unexpected; otherwise extra columns
/// are tolerated and ignored by the caller.
pub fn validate_columns<S: AsRef<str>>(
    present: &[S],
    require_target: bool,
    strict: bool,
) -> Result<(), SchemaError> {
    let mut expected: Vec<&str> = RAW_FEATURES.to_vec();
    if require_target {
        expected.push(CHARGES);
    }

    let missing: Vec<String> = expected
        .iter()
        .filter(|name| !present.iter().any(|p| p.as_ref() == **name))
        .map(|name| name.to_string())
        .collect();

    let unexpected: Vec<String> = if strict {
        present
            .iter()
            .map(|p| p.as_ref())
            .filter(|p: &&str| !expected.contains(p))
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::Columns {
            expected: expected.into_iter().map(str::to_string).collect(),
            missing,
            unexpected,
        })
    }
}
