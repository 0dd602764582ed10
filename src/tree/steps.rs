//! Preprocessing artifact chains.
//!
//! Each run owns one artifact per preprocessing step, keyed
//! `"<step_number>-<cumulative step name>"`: `0-raw`, `1-raw-phase_shift`,
//! `2-raw-phase_shift-bandpass_filter`, ... Step numbers are unique within a
//! run and contiguous from 0, which is what makes "the last step" well defined.

use serde::{Deserialize, Serialize};

use crate::error::ConsistencyError;

/// Name of step 0.
pub const RAW_STEP_NAME: &str = "raw";

/// One entry of an [`ArtifactChain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepArtifact {
    pub number: usize,
    pub key: String,
}

/// Ordered artifacts of one run, keyed by step number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactChain {
    unit: String,
    artifacts: Vec<StepArtifact>,
}

impl ArtifactChain {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            artifacts: Vec::new(),
        }
    }

    /// Chain for raw data followed by the named steps.
    pub fn from_step_names<'a>(
        unit: impl Into<String>,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, ConsistencyError> {
        let mut chain = Self::new(unit);
        let mut cumulative = RAW_STEP_NAME.to_string();
        chain.insert(&format!("0-{cumulative}"))?;
        for (index, name) in names.into_iter().enumerate() {
            cumulative = format!("{cumulative}-{name}");
            chain.insert(&format!("{}-{cumulative}", index + 1))?;
        }
        Ok(chain)
    }

    /// Adds an artifact by key.
    ///
    /// # Errors
    ///
    /// `MalformedStepKey` if the key has no numeric prefix and
    /// `DuplicateStepKey` if its step number is already present.
    pub fn insert(&mut self, key: &str) -> Result<(), ConsistencyError> {
        let number = parse_step_number(key).ok_or_else(|| ConsistencyError::MalformedStepKey {
            unit: self.unit.clone(),
            key: key.to_string(),
        })?;

        if let Some(existing) = self.artifacts.iter().find(|a| a.number == number) {
            return Err(ConsistencyError::DuplicateStepKey {
                unit: self.unit.clone(),
                number,
                existing: existing.key.clone(),
                duplicate: key.to_string(),
            });
        }

        self.artifacts.push(StepArtifact {
            number,
            key: key.to_string(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn get(&self, number: usize) -> Option<&StepArtifact> {
        self.artifacts.iter().find(|a| a.number == number)
    }

    /// The most recent step.
    ///
    /// Takes the highest step number present and requires it to equal
    /// `len() - 1`; anything else means steps are missing.
    pub fn last(&self) -> Result<&StepArtifact, ConsistencyError> {
        let last = self
            .artifacts
            .iter()
            .max_by_key(|a| a.number)
            .ok_or_else(|| ConsistencyError::NoArtifacts {
                unit: self.unit.clone(),
            })?;

        if last.number != self.artifacts.len() - 1 {
            return Err(ConsistencyError::StepNumbering {
                unit: self.unit.clone(),
                last: last.number,
                count: self.artifacts.len(),
            });
        }
        Ok(last)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.artifacts.iter().map(|a| a.key.as_str())
    }
}

fn parse_step_number(key: &str) -> Option<usize> {
    let (number, rest) = key.split_once('-')?;
    if rest.is_empty() {
        return None;
    }
    number.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cumulative_keys() {
        let chain =
            ArtifactChain::from_step_names("ses-1/r1", ["phase_shift", "bandpass_filter"]).unwrap();
        let keys: Vec<_> = chain.keys().collect();
        assert_eq!(
            keys,
            ["0-raw", "1-raw-phase_shift", "2-raw-phase_shift-bandpass_filter"]
        );
        assert_eq!(chain.last().unwrap().key, "2-raw-phase_shift-bandpass_filter");
    }

    #[test]
    fn test_raw_only_chain() {
        let chain = ArtifactChain::from_step_names("ses-1/r1", std::iter::empty()).unwrap();
        assert_eq!(chain.last().unwrap().key, "0-raw");
    }

    #[test]
    fn test_duplicate_step_number_is_consistency_error() {
        let mut chain = ArtifactChain::new("ses-1/r1");
        chain.insert("0-raw").unwrap();
        chain.insert("1-raw-a").unwrap();
        let err = chain.insert("1-raw-b").unwrap_err();
        assert!(matches!(err, ConsistencyError::DuplicateStepKey { number: 1, .. }));
    }

    #[test]
    fn test_gap_breaks_last() {
        let mut chain = ArtifactChain::new("ses-1/r1");
        chain.insert("0-raw").unwrap();
        chain.insert("2-raw-a-b").unwrap();
        assert!(matches!(
            chain.last(),
            Err(ConsistencyError::StepNumbering { last: 2, count: 2, .. })
        ));
    }

    #[test]
    fn test_empty_chain_has_no_last() {
        let chain = ArtifactChain::new("ses-1/r1");
        assert!(matches!(chain.last(), Err(ConsistencyError::NoArtifacts { .. })));
    }

    #[test]
    fn test_malformed_key() {
        let mut chain = ArtifactChain::new("ses-1/r1");
        assert!(chain.insert("raw").is_err());
        assert!(chain.insert("x-raw").is_err());
        assert!(chain.insert("3-").is_err());
    }
}
