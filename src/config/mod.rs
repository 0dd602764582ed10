//! Runtime configuration.
//!
//! `PipelineConfig` holds settings about *where and how* the external tools
//! run (commands, image stores, polling). What the pipeline computes is
//! described by a named [`ProcessingConfig`].

pub mod processing;
pub mod sorter;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigurationError;

pub use processing::{parse_overrides, ProcessingConfig, StepSpec, DEFAULT_CONFIG_NAME};
pub use sorter::{IsolationImage, IsolationOptions, Sorter};

/// Runtime settings for the orchestrator and its external collaborators.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory searched for named processing configs.
    pub configs_dir: PathBuf,

    // External commands
    /// Command that materializes a preprocessing chain.
    pub preprocess_command: Vec<String>,
    /// Command run (inside the isolation image) to execute a sorter.
    pub sorter_command: Vec<String>,
    /// Command that computes quality metrics for a sorter output.
    pub quality_command: Vec<String>,

    // Sorter images
    /// Per-user store of Singularity images.
    pub local_images_dir: PathBuf,
    /// Shared cluster store, laid out as `<dir>/<sorter>/<tag>/<image>.sif`.
    pub hpc_images_dir: Option<PathBuf>,
    /// Tag of the sorter images.
    pub image_tag: String,

    // Batch settings
    /// Interval between scheduler polls while waiting on a job.
    pub poll_interval: Duration,
    /// Executable batch workers re-enter through. Defaults to the current binary.
    pub worker_executable: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            configs_dir: PathBuf::from("./configs"),

            preprocess_command: vec!["spikeflow-preprocess".to_string()],
            sorter_command: vec!["spikeflow-sort".to_string()],
            quality_command: vec!["spikeflow-quality".to_string()],

            local_images_dir: default_local_images_dir(),
            hpc_images_dir: None,
            image_tag: "latest".to_string(),

            poll_interval: Duration::from_secs(30),
            worker_executable: None,
        }
    }
}

fn default_local_images_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".spikeflow")
        .join("sorter_images")
}

impl PipelineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SPIKEFLOW_CONFIGS_DIR`: Directory of named processing configs (default: ./configs)
    /// - `SPIKEFLOW_PREPROCESS_CMD`: Preprocessing command, whitespace separated
    /// - `SPIKEFLOW_SORTER_CMD`: Sorter entry command, whitespace separated
    /// - `SPIKEFLOW_QUALITY_CMD`: Quality-metric command, whitespace separated
    /// - `SPIKEFLOW_IMAGES_DIR`: Local Singularity image store (default: ~/.spikeflow/sorter_images)
    /// - `SPIKEFLOW_HPC_IMAGES_DIR`: Shared cluster image store
    /// - `SPIKEFLOW_IMAGE_TAG`: Sorter image tag (default: latest)
    /// - `SPIKEFLOW_POLL_INTERVAL_SECS`: Batch poll interval (default: 30)
    /// - `SPIKEFLOW_WORKER_EXE`: Executable for batch workers
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidValue` for unparsable values.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SPIKEFLOW_CONFIGS_DIR") {
            config.configs_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SPIKEFLOW_PREPROCESS_CMD") {
            config.preprocess_command = parse_command(&val, "SPIKEFLOW_PREPROCESS_CMD")?;
        }

        if let Ok(val) = std::env::var("SPIKEFLOW_SORTER_CMD") {
            config.sorter_command = parse_command(&val, "SPIKEFLOW_SORTER_CMD")?;
        }

        if let Ok(val) = std::env::var("SPIKEFLOW_QUALITY_CMD") {
            config.quality_command = parse_command(&val, "SPIKEFLOW_QUALITY_CMD")?;
        }

        if let Ok(val) = std::env::var("SPIKEFLOW_IMAGES_DIR") {
            config.local_images_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SPIKEFLOW_HPC_IMAGES_DIR") {
            config.hpc_images_dir = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("SPIKEFLOW_IMAGE_TAG") {
            config.image_tag = val;
        }

        if let Ok(val) = std::env::var("SPIKEFLOW_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "SPIKEFLOW_POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("SPIKEFLOW_WORKER_EXE") {
            config.worker_executable = Some(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (key, command) in [
            ("preprocess_command", &self.preprocess_command),
            ("sorter_command", &self.sorter_command),
            ("quality_command", &self.quality_command),
        ] {
            if command.is_empty() {
                return Err(ConfigurationError::ValidationFailed(format!(
                    "{key} must not be empty"
                )));
            }
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigurationError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.image_tag.trim().is_empty() {
            return Err(ConfigurationError::ValidationFailed(
                "image_tag must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    // Builder methods

    pub fn with_configs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.configs_dir = dir.into();
        self
    }

    pub fn with_preprocess_command(mut self, command: Vec<String>) -> Self {
        self.preprocess_command = command;
        self
    }

    pub fn with_sorter_command(mut self, command: Vec<String>) -> Self {
        self.sorter_command = command;
        self
    }

    pub fn with_quality_command(mut self, command: Vec<String>) -> Self {
        self.quality_command = command;
        self
    }

    pub fn with_local_images_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_images_dir = dir.into();
        self
    }

    pub fn with_hpc_images_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.hpc_images_dir = Some(dir.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_worker_executable(mut self, exe: impl Into<PathBuf>) -> Self {
        self.worker_executable = Some(exe.into());
        self
    }
}

fn parse_command(value: &str, key: &str) -> Result<Vec<String>, ConfigurationError> {
    let parts: Vec<String> = value.split_whitespace().map(String::from).collect();
    if parts.is_empty() {
        return Err(ConfigurationError::InvalidValue {
            key: key.to_string(),
            message: "command is empty".to_string(),
        });
    }
    Ok(parts)
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigurationError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigurationError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert!(config.local_images_dir.ends_with(".spikeflow/sorter_images"));
    }

    #[test]
    fn test_builder_methods() {
        let config = PipelineConfig::new()
            .with_configs_dir("/etc/spikeflow")
            .with_sorter_command(vec!["python".to_string(), "-m".to_string(), "sort".to_string()])
            .with_poll_interval(Duration::from_secs(5))
            .with_hpc_images_dir("/ceph/images");

        assert_eq!(config.configs_dir, PathBuf::from("/etc/spikeflow"));
        assert_eq!(config.sorter_command.len(), 3);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.hpc_images_dir, Some(PathBuf::from("/ceph/images")));
    }

    #[test]
    fn test_validation_rejects_empty_command() {
        let config = PipelineConfig::new().with_quality_command(Vec::new());
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_poll_interval() {
        let config = PipelineConfig::new().with_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("SPIKEFLOW_SORTER_CMD", "python -m sorter_entry");
        std::env::set_var("SPIKEFLOW_POLL_INTERVAL_SECS", "7");
        let config = PipelineConfig::from_env().unwrap();
        std::env::remove_var("SPIKEFLOW_SORTER_CMD");
        std::env::remove_var("SPIKEFLOW_POLL_INTERVAL_SECS");

        assert_eq!(config.sorter_command, ["python", "-m", "sorter_entry"]);
        assert_eq!(config.poll_interval, Duration::from_secs(7));
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_number() {
        std::env::set_var("SPIKEFLOW_POLL_INTERVAL_SECS", "soon");
        let result = PipelineConfig::from_env();
        std::env::remove_var("SPIKEFLOW_POLL_INTERVAL_SECS");

        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }
}
