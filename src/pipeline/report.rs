//! Summary of one pipeline invocation.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::concat::Exclusion;
use crate::stage::{StageKind, StageResult, UnitState};

/// Every stage result of an invocation, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub results: Vec<StageResult>,
    /// Runs left out of sorting.
    pub excluded: Vec<Exclusion>,
    /// Intermediate files removed after the quality checks.
    pub deleted: Vec<PathBuf>,
}

impl PipelineReport {
    pub fn push(&mut self, result: StageResult) {
        self.results.push(result);
    }

    pub fn stage(&self, stage: StageKind) -> impl Iterator<Item = &StageResult> {
        self.results.iter().filter(move |r| r.stage == stage)
    }

    pub fn count(&self, stage: StageKind, state: UnitState) -> usize {
        self.stage(stage).filter(|r| r.state == state).count()
    }

    /// Number of external stage calls made (completed units).
    pub fn completed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.state == UnitState::Completed)
            .count()
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            writeln!(
                f,
                "{:<14} {:<30} {:<10} {}",
                result.stage,
                result.unit,
                result.state,
                result.artifact.display()
            )?;
        }
        for exclusion in &self.excluded {
            writeln!(f, "excluded       {:<30} {}", exclusion.run.to_string(), exclusion.reason)?;
        }
        for path in &self.deleted {
            writeln!(f, "deleted        {}", path.display())?;
        }
        Ok(())
    }
}
