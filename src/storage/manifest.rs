//! Stage manifests.
//!
//! A manifest records the settings a completed stage ran with. It is written
//! last, into the same staging directory as the stage output, so a committed
//! output always carries its manifest.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use sha2::{Digest, Sha256};

use crate::concat::Exclusion;
use crate::config::{IsolationImage, Sorter, StepSpec};
use crate::error::{ConsistencyError, PipelineError};
use crate::layout::{UnitScope, PREPROCESSING_MANIFEST, SORTING_MANIFEST};
use crate::tree::RunKey;

/// Version recorded in every manifest.
pub const SPIKEFLOW_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A persisted record of a completed stage.
pub trait Manifest: Serialize + DeserializeOwned {
    /// File name inside the stage output directory.
    const FILE_NAME: &'static str;

    /// Settings that differ between this (stored) manifest and `current`.
    fn drift(&self, current: &Self) -> Vec<String>;
}

/// Record of a preprocessing run, stored as `preprocessed/preprocessing_info.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingManifest {
    pub subject: String,
    pub session: String,
    pub run: String,
    pub config_name: String,
    pub step_chain: Vec<StepSpec>,
    /// Key of the materialized step, also its directory name.
    pub final_step: String,
    pub config_hash: String,
    pub spikeflow_version: String,
    pub created_at: DateTime<Utc>,
}

impl PreprocessingManifest {
    pub fn run_key(&self) -> RunKey {
        RunKey::new(&self.session, &self.run)
    }
}

impl Manifest for PreprocessingManifest {
    const FILE_NAME: &'static str = PREPROCESSING_MANIFEST;

    fn drift(&self, current: &Self) -> Vec<String> {
        let mut drift = Vec::new();
        if self.config_hash != current.config_hash {
            drift.push(format!(
                "step chain differs (stored '{}' [{}], requested '{}' [{}])",
                self.config_name,
                short_hash(&self.config_hash),
                current.config_name,
                short_hash(&current.config_hash)
            ));
        }
        drift
    }
}

/// Provenance of one concatenated segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub run: RunKey,
    pub final_step: String,
    pub config_hash: String,
}

/// Record of a sorter invocation, stored as `<sorter>/sorting_info.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortingManifest {
    pub subject: String,
    pub unit: UnitScope,
    pub sorter: Sorter,
    pub sorter_options: Mapping,
    pub image: IsolationImage,
    pub concat_runs: bool,
    pub concat_sessions: bool,
    pub segments: Vec<SegmentRecord>,
    #[serde(default)]
    pub excluded: Vec<Exclusion>,
    pub spikeflow_version: String,
    pub created_at: DateTime<Utc>,
}

impl Manifest for SortingManifest {
    const FILE_NAME: &'static str = SORTING_MANIFEST;

    fn drift(&self, current: &Self) -> Vec<String> {
        let mut drift = Vec::new();
        if self.sorter_options != current.sorter_options {
            drift.push("sorter options differ".to_string());
        }
        let stored: Vec<&RunKey> = self.segments.iter().map(|s| &s.run).collect();
        let requested: Vec<&RunKey> = current.segments.iter().map(|s| &s.run).collect();
        if stored != requested {
            drift.push(format!(
                "segments differ (stored {}, requested {})",
                join_runs(&stored),
                join_runs(&requested)
            ));
        } else if self
            .segments
            .iter()
            .zip(&current.segments)
            .any(|(a, b)| a.config_hash != b.config_hash)
        {
            drift.push("segments were preprocessed with a different step chain".to_string());
        }
        if self.image != current.image {
            drift.push(format!("image differs (stored {}, requested {})", self.image, current.image));
        }
        drift
    }
}

fn join_runs(runs: &[&RunKey]) -> String {
    runs.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// SHA-256 of the canonical JSON form of a step chain.
pub fn config_hash(steps: &[StepSpec]) -> Result<String, PipelineError> {
    let canonical = serde_json::to_vec(steps)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Writes `manifest` into `dir` (temp file + rename).
pub fn write_manifest<M: Manifest>(dir: &Path, manifest: &M) -> Result<PathBuf, PipelineError> {
    let path = dir.join(M::FILE_NAME);
    let yaml = serde_yaml::to_string(manifest)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PipelineError::io(dir, e))?;
    tmp.write_all(yaml.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PipelineError::io(tmp.path(), e))?;
    tmp.persist(&path)
        .map_err(|e| PipelineError::io(&path, e.error))?;

    Ok(path)
}

/// Reads the manifest stored in `dir`.
///
/// # Errors
///
/// `MissingManifest` when the output exists without its manifest, and
/// `CorruptManifest` when it cannot be parsed.
pub fn read_manifest<M: Manifest>(dir: &Path) -> Result<M, ConsistencyError> {
    let path = dir.join(M::FILE_NAME);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConsistencyError::MissingManifest {
                path: dir.to_path_buf(),
                manifest: M::FILE_NAME.to_string(),
            })
        }
        Err(e) => {
            return Err(ConsistencyError::CorruptManifest {
                path,
                reason: e.to_string(),
            })
        }
    };
    serde_yaml::from_str(&text).map_err(|e| ConsistencyError::CorruptManifest {
        path,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preprocessing(steps: Vec<StepSpec>) -> PreprocessingManifest {
        PreprocessingManifest {
            subject: "S1".to_string(),
            session: "ses-1".to_string(),
            run: "r1".to_string(),
            config_name: "default".to_string(),
            config_hash: config_hash(&steps).unwrap(),
            step_chain: steps,
            final_step: "1-raw-bandpass_filter".to_string(),
            spikeflow_version: SPIKEFLOW_VERSION.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_config_hash_is_stable_and_sensitive() {
        let a = vec![StepSpec::new("bandpass_filter").with_param("freq_min", 300)];
        let b = vec![StepSpec::new("bandpass_filter").with_param("freq_min", 600)];
        assert_eq!(config_hash(&a).unwrap(), config_hash(&a.clone()).unwrap());
        assert_ne!(config_hash(&a).unwrap(), config_hash(&b).unwrap());
        assert_eq!(config_hash(&a).unwrap().len(), 64);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = preprocessing(vec![StepSpec::new("bandpass_filter")]);

        let path = write_manifest(dir.path(), &manifest).unwrap();
        assert_eq!(path, dir.path().join("preprocessing_info.yaml"));

        let loaded: PreprocessingManifest = read_manifest(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        // no temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_manifest::<SortingManifest>(dir.path()).unwrap_err();
        assert!(matches!(err, ConsistencyError::MissingManifest { .. }));
    }

    #[test]
    fn test_corrupt_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("preprocessing_info.yaml"), "subject: [").unwrap();
        let err = read_manifest::<PreprocessingManifest>(dir.path()).unwrap_err();
        assert!(matches!(err, ConsistencyError::CorruptManifest { .. }));
    }

    #[test]
    fn test_preprocessing_drift() {
        let stored = preprocessing(vec![StepSpec::new("bandpass_filter")]);
        let same = preprocessing(vec![StepSpec::new("bandpass_filter")]);
        let changed = preprocessing(vec![StepSpec::new("common_reference")]);

        assert!(stored.drift(&same).is_empty());
        assert_eq!(stored.drift(&changed).len(), 1);
    }
}
