//! Staged stage outputs.
//!
//! A stage writes into a hidden sibling `.<name>.partial-<id>` of its target
//! and the directory is renamed onto the target only once output and manifest
//! are complete. An uncommitted staging directory is removed on drop, which
//! also covers cancellation of the task that owned it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PipelineError;

const PARTIAL_MARKER: &str = ".partial-";

/// A directory being produced for `target`.
#[derive(Debug)]
pub struct StagedOutput {
    target: PathBuf,
    staging: PathBuf,
    committed: bool,
}

impl StagedOutput {
    /// Creates a fresh staging directory next to `target`.
    ///
    /// Leftover staging directories of the same target, from invocations
    /// that crashed, are removed first.
    pub fn begin(target: &Path) -> Result<Self, PipelineError> {
        let (parent, name) = split_target(target)?;
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        remove_stale(target)?;

        let staging = parent.join(format!(".{name}{PARTIAL_MARKER}{}", Uuid::new_v4().simple()));
        fs::create_dir(&staging).map_err(|e| PipelineError::io(&staging, e))?;
        debug!(staging = %staging.display(), "Created staging directory");

        Ok(Self {
            target: target.to_path_buf(),
            staging,
            committed: false,
        })
    }

    /// Where the stage should write its output.
    pub fn path(&self) -> &Path {
        &self.staging
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Moves the staged directory onto the target.
    pub fn commit(mut self) -> Result<PathBuf, PipelineError> {
        fs::rename(&self.staging, &self.target).map_err(|e| PipelineError::io(&self.target, e))?;
        self.committed = true;
        Ok(self.target.clone())
    }
}

impl Drop for StagedOutput {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_dir_all(&self.staging) {
            Ok(()) => debug!(staging = %self.staging.display(), "Discarded uncommitted output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                staging = %self.staging.display(),
                error = %e,
                "Failed to remove uncommitted output"
            ),
        }
    }
}

fn split_target(target: &Path) -> Result<(&Path, String), PipelineError> {
    let parent = target.parent();
    let name = target.file_name().map(|n| n.to_string_lossy().into_owned());
    match (parent, name) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(PipelineError::io(
            target,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "target has no parent directory"),
        )),
    }
}

/// Removes staging directories left behind for `target`.
pub fn remove_stale(target: &Path) -> Result<usize, PipelineError> {
    let (parent, name) = split_target(target)?;
    let prefix = format!(".{name}{PARTIAL_MARKER}");
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(PipelineError::io(parent, e)),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(parent, e))?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            let path = entry.path();
            warn!(path = %path.display(), "Removing incomplete output from an interrupted run");
            fs::remove_dir_all(&path).map_err(|e| PipelineError::io(&path, e))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Removes a committed output (directory or file).
pub fn remove_output(target: &Path) -> Result<(), PipelineError> {
    let result = if target.is_dir() {
        fs::remove_dir_all(target)
    } else {
        fs::remove_file(target)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(target, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_moves_output_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("unit").join("kilosort2_5");

        let staged = StagedOutput::begin(&target).unwrap();
        fs::write(staged.path().join("spikes.npy"), b"data").unwrap();
        assert!(!target.exists());

        let committed = staged.commit().unwrap();
        assert_eq!(committed, target);
        assert!(target.join("spikes.npy").exists());
        assert_eq!(fs::read_dir(dir.path().join("unit")).unwrap().count(), 1);
    }

    #[test]
    fn test_drop_without_commit_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("preprocessed");
        {
            let staged = StagedOutput::begin(&target).unwrap();
            fs::write(staged.path().join("partial.bin"), b"half").unwrap();
        }
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_stale_staging_is_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("preprocessed");
        fs::create_dir(dir.path().join(".preprocessed.partial-deadbeef")).unwrap();
        fs::create_dir(dir.path().join(".other.partial-deadbeef")).unwrap();

        assert_eq!(remove_stale(&target).unwrap(), 1);
        assert!(dir.path().join(".other.partial-deadbeef").exists());
    }

    #[test]
    fn test_remove_output_handles_files_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("quality_metrics.csv");
        fs::write(&file, "unit_id\n").unwrap();

        remove_output(&file).unwrap();
        assert!(!file.exists());
        remove_output(&file).unwrap();
    }
}
