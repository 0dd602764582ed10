//! Named processing configs: the preprocessing step chain and sorter options.
//!
//! A config is a YAML file `<configs_dir>/<name>.yaml` (or a direct path to a
//! `.yaml`/`.yml` file). The `default` config ships with the binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::config::sorter::Sorter;
use crate::error::ConfigurationError;

/// Name of the config embedded in the binary.
pub const DEFAULT_CONFIG_NAME: &str = "default";

const DEFAULT_CONFIG_YAML: &str = include_str!("../../configs/default.yaml");

/// One preprocessing operator and its keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub params: Mapping,
}

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Mapping::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(Value::String(key.into()), value.into());
        self
    }
}

/// On-disk shape of a processing config.
#[derive(Debug, Deserialize)]
struct RawProcessingConfig {
    #[serde(default)]
    preprocessing: BTreeMap<String, (String, Option<Value>)>,
    #[serde(default)]
    sorting: BTreeMap<String, Option<Value>>,
}

/// A validated processing config.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingConfig {
    /// Name the config was requested by.
    pub name: String,
    /// Step chain in execution order (step 1 first).
    pub steps: Vec<StepSpec>,
    /// Per-sorter options.
    pub sorting: BTreeMap<Sorter, Mapping>,
}

impl ProcessingConfig {
    /// Loads a config by name or path.
    ///
    /// `name` is treated as a path when it ends in `.yaml`/`.yml`; otherwise it
    /// is looked up in `configs_dir`, falling back to the built-in `default`.
    pub fn load(name: &str, configs_dir: &Path) -> Result<Self, ConfigurationError> {
        let path = Self::locate(name, configs_dir);

        if path.is_file() {
            debug!(config = name, path = %path.display(), "Loading processing config");
            let text = std::fs::read_to_string(&path).map_err(|e| {
                ConfigurationError::InvalidProcessingConfig {
                    name: name.to_string(),
                    reason: format!("cannot read {}: {e}", path.display()),
                }
            })?;
            return Self::from_yaml(name, &text);
        }

        if name == DEFAULT_CONFIG_NAME {
            debug!("Using built-in default processing config");
            return Self::builtin_default();
        }

        Err(ConfigurationError::ConfigNotFound {
            name: name.to_string(),
            path,
        })
    }

    /// The config embedded in the binary.
    pub fn builtin_default() -> Result<Self, ConfigurationError> {
        Self::from_yaml(DEFAULT_CONFIG_NAME, DEFAULT_CONFIG_YAML)
    }

    fn locate(name: &str, configs_dir: &Path) -> PathBuf {
        let as_path = Path::new(name);
        match as_path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => as_path.to_path_buf(),
            _ => configs_dir.join(format!("{name}.yaml")),
        }
    }

    /// Parses and validates config text.
    pub fn from_yaml(name: &str, text: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidProcessingConfig {
            name: name.to_string(),
            reason,
        };

        let raw: RawProcessingConfig =
            serde_yaml::from_str(text).map_err(|e| invalid(e.to_string()))?;

        let mut numbered = Vec::with_capacity(raw.preprocessing.len());
        for (key, (step_name, params)) in raw.preprocessing {
            let number: usize = key
                .parse()
                .map_err(|_| invalid(format!("step key '{key}' is not a number")))?;
            if step_name.trim().is_empty() || step_name.contains('-') {
                return Err(invalid(format!(
                    "step {key} has invalid operator name '{step_name}'"
                )));
            }
            numbered.push((number, StepSpec {
                name: step_name,
                params: as_mapping(params).map_err(|r| invalid(format!("step {key}: {r}")))?,
            }));
        }
        numbered.sort_by_key(|(number, _)| *number);

        for (index, (number, _)) in numbered.iter().enumerate() {
            if *number != index + 1 {
                return Err(invalid(format!(
                    "preprocessing steps must be numbered 1..{} without gaps or duplicates",
                    numbered.len()
                )));
            }
        }

        let mut sorting = BTreeMap::new();
        for (sorter_name, options) in raw.sorting {
            let sorter: Sorter = sorter_name.parse()?;
            let options = as_mapping(options)
                .map_err(|r| invalid(format!("sorter '{sorter_name}': {r}")))?;
            sorting.insert(sorter, options);
        }

        Ok(Self {
            name: name.to_string(),
            steps: numbered.into_iter().map(|(_, step)| step).collect(),
            sorting,
        })
    }

    /// Options for `sorter`, merged with user overrides.
    ///
    /// Kilosort sorters keep their temporary files unless told otherwise,
    /// because intermediate deletion is handled after quality checks.
    pub fn sorter_options(&self, sorter: Sorter, overrides: &BTreeMap<String, Value>) -> Mapping {
        let mut options = self.sorting.get(&sorter).cloned().unwrap_or_default();

        if sorter.is_kilosort() {
            let key = Value::String("delete_tmp_files".to_string());
            if !options.contains_key(&key) {
                options.insert(key, Value::Bool(false));
            }
        }

        for (key, value) in overrides {
            options.insert(Value::String(key.clone()), value.clone());
        }
        options
    }
}

fn as_mapping(value: Option<Value>) -> Result<Mapping, String> {
    match value {
        None | Some(Value::Null) => Ok(Mapping::new()),
        Some(Value::Mapping(map)) => Ok(map),
        Some(other) => Err(format!("expected a mapping of options, found {other:?}")),
    }
}

/// Parses `key=value` overrides, reading values as YAML scalars.
pub fn parse_overrides(pairs: &[String]) -> Result<BTreeMap<String, Value>, ConfigurationError> {
    let mut overrides = BTreeMap::new();
    for pair in pairs {
        let (key, raw) = pair.split_once('=').ok_or_else(|| ConfigurationError::InvalidValue {
            key: pair.clone(),
            message: "expected key=value".to_string(),
        })?;
        let value: Value =
            serde_yaml::from_str(raw).map_err(|e| ConfigurationError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        overrides.insert(key.trim().to_string(), value);
    }
    Ok(overrides)
}
