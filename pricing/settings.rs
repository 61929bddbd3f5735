//! Runtime settings as an explicit value.
//!
//! Settings come from an optional TOML file and are then overridden by
//! environment variables. The variable lookup is passed in, so nothing here
//! reads process state on its own; the binary hands over `std::env::var`.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_EXPLAIN_TOP_K: usize = 8;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse settings TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Environment variable {name}='{value}' is not a valid {expected}.")]
    InvalidOverride {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub transformer_path: PathBuf,
    pub model_path: PathBuf,
    pub source_data_path: PathBuf,
    pub train_data_path: PathBuf,
    pub test_data_path: PathBuf,
    /// Raw-feature contributions kept per explanation; never below 1.
    pub explain_top_k: usize,
    pub attribution_samples: usize,
    pub attribution_seed: u64,
    pub test_fraction: f64,
    pub split_seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transformer_path: PathBuf::from("models/feature_transformer.toml"),
            model_path: PathBuf::from("models/linear_predictor.toml"),
            source_data_path: PathBuf::from("data/raw/insurance.csv"),
            train_data_path: PathBuf::from("data/processed/train.csv"),
            test_data_path: PathBuf::from("data/processed/test.csv"),
            explain_top_k: DEFAULT_EXPLAIN_TOP_K,
            attribution_samples: 100,
            attribution_seed: 42,
            test_fraction: 0.2,
            split_seed: 42,
        }
    }
}

impl Settings {
    /// Reads `path` when given (defaults otherwise), then applies `lookup` overrides.
    pub fn load<F>(path: Option<&Path>, lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        base.with_overrides(lookup)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let mut settings: Self = toml::from_str(text)?;
        settings.explain_top_k = settings.explain_top_k.max(1);
        Ok(settings)
    }

    /// Applies environment overrides. Blank values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        // TRANSFORM_PARAMS_PATH is the older name and loses to TRANSFORMER_PATH.
        if let Some(value) = get("TRANSFORMER_PATH").or_else(|| get("TRANSFORM_PARAMS_PATH")) {
            self.transformer_path = PathBuf::from(value.trim());
        }
        for (name, target) in [
            ("MODEL_PATH", &mut self.model_path),
            ("SOURCE_DATA_PATH", &mut self.source_data_path),
            ("TRAIN_DATA_PATH", &mut self.train_data_path),
            ("TEST_DATA_PATH", &mut self.test_data_path),
        ] {
            if let Some(value) = get(name) {
                *target = PathBuf::from(value.trim());
            }
        }

        if let Some(top_k) = parse_override::<usize>("EXPLAIN_TOP_K", get("EXPLAIN_TOP_K"))? {
            self.explain_top_k = top_k;
        }
        if let Some(samples) =
            parse_override::<usize>("ATTRIBUTION_SAMPLES", get("ATTRIBUTION_SAMPLES"))?
        {
            self.attribution_samples = samples;
        }
        if let Some(seed) = parse_override::<u64>("ATTRIBUTION_SEED", get("ATTRIBUTION_SEED"))? {
            self.attribution_seed = seed;
        }

        self.explain_top_k = self.explain_top_k.max(1);
        Ok(self)
    }
}

fn parse_override<T: FromStr>(
    name: &'static str,
    value: Option<String>,
) -> Result<Option<T>, SettingsError> {
    let Some(value) = value else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| SettingsError::InvalidOverride {
            name,
            value,
            expected: "non-negative integer",
        })
}
