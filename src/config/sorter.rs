//! Supported sorters and the isolation they run under.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Container registry namespace the sorter images are published under.
const IMAGE_NAMESPACE: &str = "spikeinterface";

/// A spike sorter the pipeline knows how to run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Sorter {
    Kilosort2,
    #[serde(rename = "kilosort2_5")]
    Kilosort2_5,
    Kilosort3,
    Mountainsort5,
    Spykingcircus,
    Tridesclous,
}

impl Sorter {
    pub const ALL: [Sorter; 6] = [
        Self::Kilosort2,
        Self::Kilosort2_5,
        Self::Kilosort3,
        Self::Mountainsort5,
        Self::Spykingcircus,
        Self::Tridesclous,
    ];

    /// Canonical name, also the name of the sorter's output directory.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kilosort2 => "kilosort2",
            Self::Kilosort2_5 => "kilosort2_5",
            Self::Kilosort3 => "kilosort3",
            Self::Mountainsort5 => "mountainsort5",
            Self::Spykingcircus => "spykingcircus",
            Self::Tridesclous => "tridesclous",
        }
    }

    pub fn is_kilosort(&self) -> bool {
        matches!(self, Self::Kilosort2 | Self::Kilosort2_5 | Self::Kilosort3)
    }

    /// Python-based sorters that can run in the host environment.
    pub fn can_run_locally(&self) -> bool {
        matches!(self, Self::Mountainsort5 | Self::Tridesclous)
    }

    /// Image name without registry namespace or tag.
    pub fn image_name(&self) -> String {
        match self {
            Self::Spykingcircus => "spyking-circus-base".to_string(),
            s if s.is_kilosort() => format!("{}-compiled-base", s.as_str()),
            s => format!("{}-base", s.as_str()),
        }
    }

    /// Fully qualified container image, e.g. `spikeinterface/kilosort3-compiled-base:latest`.
    pub fn docker_image(&self, tag: &str) -> String {
        format!("{IMAGE_NAMESPACE}/{}:{tag}", self.image_name())
    }

    /// File name of the sorter's Singularity image.
    pub fn singularity_file_name(&self) -> String {
        format!("{}.sif", self.image_name())
    }

    fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(Sorter::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Sorter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sorter {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sorter| sorter.as_str() == s)
            .ok_or_else(|| ConfigurationError::UnknownSorter {
                name: s.to_string(),
                supported: Self::supported_list(),
            })
    }
}

/// User-facing choice of how the sorter is isolated.
///
/// At most one of Docker and Singularity may be requested. With neither set,
/// the isolation is chosen from the sorter and the host platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationOptions {
    /// Run under Singularity, using the stored image for the sorter.
    #[serde(default)]
    pub singularity: bool,
    /// Run under Singularity with this exact image file.
    #[serde(default)]
    pub singularity_image: Option<PathBuf>,
    /// Run under Docker.
    #[serde(default)]
    pub docker: bool,
}

impl IsolationOptions {
    pub fn docker() -> Self {
        Self {
            docker: true,
            ..Default::default()
        }
    }

    pub fn singularity_image(path: impl Into<PathBuf>) -> Self {
        Self {
            singularity_image: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn wants_singularity(&self) -> bool {
        self.singularity || self.singularity_image.is_some()
    }

    /// Rejects mutually exclusive image sources.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.docker && self.wants_singularity() {
            return Err(ConfigurationError::ConflictingImageSources(
                "docker and singularity image were both requested; choose one".to_string(),
            ));
        }
        Ok(())
    }
}

/// The resolved isolation a sorter runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IsolationImage {
    /// Host environment, no container.
    Local,
    /// Docker image reference, pulled by the daemon if absent.
    Docker { image: String },
    /// Singularity image file; pulled from `source` if the file is missing.
    Singularity { image: PathBuf, source: String },
}

impl fmt::Display for IsolationImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Docker { image } => write!(f, "docker:{image}"),
            Self::Singularity { image, .. } => write!(f, "singularity:{}", image.display()),
        }
    }
}
