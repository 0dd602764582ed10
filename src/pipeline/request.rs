//! Pipeline request: the user inputs of one pipeline invocation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{IsolationOptions, Sorter, DEFAULT_CONFIG_NAME};
use crate::error::ConfigurationError;
use crate::layout::{validate_subject_name, PathResolver};
use crate::policy::ExistingOutputMode;
use crate::scheduler::SlurmOptions;
use crate::tree::selection::validate_selections;
use crate::tree::SessionSelection;

/// Sorter byproducts that can be removed once a unit is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum IntermediateFile {
    #[serde(rename = "recording.dat")]
    #[value(name = "recording.dat")]
    RecordingDat,
    #[serde(rename = "temp_wh.dat")]
    #[value(name = "temp_wh.dat")]
    TempWhDat,
}

impl IntermediateFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            IntermediateFile::RecordingDat => "recording.dat",
            IntermediateFile::TempWhDat => "temp_wh.dat",
        }
    }
}

impl fmt::Display for IntermediateFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

impl FromStr for IntermediateFile {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recording.dat" => Ok(IntermediateFile::RecordingDat),
            "temp_wh.dat" => Ok(IntermediateFile::TempWhDat),
            other => Err(ConfigurationError::InvalidValue {
                key: "delete_intermediate".to_string(),
                message: format!("'{other}' is not one of recording.dat, temp_wh.dat"),
            }),
        }
    }
}

/// Batch submission settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Block until the job is terminal.
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub slurm: SlurmOptions,
}

/// Inputs of one pipeline invocation.
///
/// A request is plain data so it can be shipped to a batch worker unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub base_path: PathBuf,
    pub subject: String,
    pub sessions: Vec<SessionSelection>,
    /// Name of the processing config, or a path to a YAML file.
    pub config_name: String,
    pub sorter: Sorter,
    /// Overrides merged over the config's sorter options.
    #[serde(default)]
    pub sorter_options: BTreeMap<String, serde_yaml::Value>,
    pub existing_preprocessed: ExistingOutputMode,
    pub existing_sorting: ExistingOutputMode,
    pub existing_quality: ExistingOutputMode,
    pub concat_runs: bool,
    pub concat_sessions: bool,
    #[serde(default)]
    pub isolation: IsolationOptions,
    #[serde(default)]
    pub delete_intermediate: Vec<IntermediateFile>,
    /// Submit to the batch scheduler instead of running here.
    #[serde(default)]
    pub batch: Option<BatchOptions>,
}

impl PipelineRequest {
    pub fn new(
        base_path: impl Into<PathBuf>,
        subject: impl Into<String>,
        sessions: Vec<SessionSelection>,
        sorter: Sorter,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            subject: subject.into(),
            sessions,
            config_name: DEFAULT_CONFIG_NAME.to_string(),
            sorter,
            sorter_options: BTreeMap::new(),
            existing_preprocessed: ExistingOutputMode::FailIfExists,
            existing_sorting: ExistingOutputMode::FailIfExists,
            existing_quality: ExistingOutputMode::LoadIfExists,
            concat_runs: false,
            concat_sessions: false,
            isolation: IsolationOptions::default(),
            delete_intermediate: Vec::new(),
            batch: None,
        }
    }

    pub fn with_config_name(mut self, name: impl Into<String>) -> Self {
        self.config_name = name.into();
        self
    }

    pub fn with_sorter_options(mut self, options: BTreeMap<String, serde_yaml::Value>) -> Self {
        self.sorter_options = options;
        self
    }

    pub fn with_existing_preprocessed(mut self, mode: ExistingOutputMode) -> Self {
        self.existing_preprocessed = mode;
        self
    }

    pub fn with_existing_sorting(mut self, mode: ExistingOutputMode) -> Self {
        self.existing_sorting = mode;
        self
    }

    pub fn with_existing_quality(mut self, mode: ExistingOutputMode) -> Self {
        self.existing_quality = mode;
        self
    }

    pub fn with_concat_runs(mut self, concat: bool) -> Self {
        self.concat_runs = concat;
        self
    }

    pub fn with_concat_sessions(mut self, concat: bool) -> Self {
        self.concat_sessions = concat;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationOptions) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_delete_intermediate(mut self, files: Vec<IntermediateFile>) -> Self {
        self.delete_intermediate = files;
        self
    }

    pub fn with_batch(mut self, batch: BatchOptions) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn resolver(&self) -> PathResolver {
        PathResolver::new(&self.base_path, &self.subject)
    }

    /// Checks everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_subject_name(&self.subject)?;
        validate_selections(&self.sessions)?;
        self.isolation.validate()?;
        Ok(())
    }
}
