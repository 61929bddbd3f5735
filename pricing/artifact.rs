//! Versioned TOML envelopes for persisted artifacts.
//!
//! Every artifact is written as
//!
//! ```toml
//! artifact_kind = "feature_transformer"
//! format_version = 1
//!
//! [payload]
//! ...
//! ```
//!
//! Loading reads the envelope header first, so handing the loader a file of the
//! wrong kind fails fast with `ArtifactError::Type` before any payload parsing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read or write artifact file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse artifact payload: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize artifact to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Artifact type mismatch: expected {expected}, found {found}.")]
    Type { expected: String, found: String },
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    artifact_kind: &'a str,
    format_version: u32,
    payload: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    artifact_kind: Option<String>,
    format_version: Option<u32>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    payload: T,
}

fn describe(kind: &str, version: u32) -> String {
    format!("{kind} v{version}")
}

/// Writes `payload` under a typed envelope, creating parent directories as needed.
pub fn save<T: Serialize>(
    path: &Path,
    kind: &str,
    version: u32,
    payload: &T,
) -> Result<(), ArtifactError> {
    let envelope = EnvelopeRef {
        artifact_kind: kind,
        format_version: version,
        payload,
    };
    let toml_string = toml::to_string_pretty(&envelope)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Reads an artifact, insisting on the given kind and format version.
pub fn load<T: DeserializeOwned>(path: &Path, kind: &str, version: u32) -> Result<T, ArtifactError> {
    let text = fs::read_to_string(path)?;
    parse(&text, kind, version)
}

/// Parses artifact text already held in memory.
pub fn parse<T: DeserializeOwned>(text: &str, kind: &str, version: u32) -> Result<T, ArtifactError> {
    let expected = describe(kind, version);
    let header: EnvelopeHeader = toml::from_str(text).map_err(|_| ArtifactError::Type {
        expected: expected.clone(),
        found: "unrecognised content".to_string(),
    })?;

    match (header.artifact_kind.as_deref(), header.format_version) {
        (Some(found_kind), Some(found_version)) if found_kind == kind && found_version == version => {}
        (Some(found_kind), Some(found_version)) => {
            return Err(ArtifactError::Type {
                expected,
                found: describe(found_kind, found_version),
            });
        }
        (Some(found_kind), None) => {
            return Err(ArtifactError::Type {
                expected,
                found: format!("{found_kind} without a format version"),
            });
        }
        (None, _) => {
            return Err(ArtifactError::Type {
                expected,
                found: "an untyped document".to_string(),
            });
        }
    }

    let envelope: Envelope<T> = toml::from_str(text)?;
    Ok(envelope.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Fixture {
        name: String,
        values: Vec<f64>,
    }

    fn fixture() -> Fixture {
        Fixture {
            name: "fixture".to_string(),
            values: vec![0.1, -2.5e-7, 1.0 / 3.0],
        }
    }

    #[test]
    fn payload_round_trips_exactly() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("fixture.toml");
        save(&path, "fixture", 1, &fixture())?;
        let loaded: Fixture = load(&path, "fixture", 1)?;
        assert_eq!(loaded, fixture());
        Ok(())
    }

    #[test]
    fn wrong_kind_is_a_type_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("fixture.toml");
        save(&path, "fixture", 1, &fixture())?;
        match load::<Fixture>(&path, "feature_transformer", 1) {
            Err(ArtifactError::Type { expected, found }) => {
                assert_eq!(expected, "feature_transformer v1");
                assert_eq!(found, "fixture v1");
            }
            other => panic!("expected a type mismatch, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn version_mismatch_is_a_type_error() {
        let text = "artifact_kind = \"fixture\"\nformat_version = 7\n";
        assert!(matches!(
            parse::<Fixture>(text, "fixture", 1),
            Err(ArtifactError::Type { .. })
        ));
    }

    #[test]
    fn non_toml_content_is_a_type_error() {
        assert!(matches!(
            parse::<Fixture>("\u{0}\u{1}binary", "fixture", 1),
            Err(ArtifactError::Type { .. })
        ));
        assert!(matches!(
            parse::<Fixture>("name = \"plain\"\n", "fixture", 1),
            Err(ArtifactError::Type { .. })
        ));
    }
}
