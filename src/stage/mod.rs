//! Stage execution for a single unit.
//!
//! Every stage goes through the same steps:
//!
//! ```text
//! target = PathResolver(task)
//! action = decide(target.exists(), mode)
//!   Fail         -> ConfigurationError::OutputExists, nothing touched
//!   Skip         -> Skipped
//!   LoadExisting -> manifest read + drift check -> Loaded
//!   ProceedFresh -> (Overwrite: remove target) -> stage -> external call
//!                   -> manifest -> commit -> Completed
//! ```
//!
//! Output and manifest become visible together through [`StagedOutput`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use tracing::{debug, info, warn};

use crate::concat::SortingUnit;
use crate::config::{IsolationImage, Sorter};
use crate::engine::{LazyRecording, PreprocessingEngine, QualityEngine, SorterInvocation, SorterRuntime};
use crate::error::{ConfigurationError, ConsistencyError, PipelineError};
use crate::layout::PathResolver;
use crate::policy::{decide, requires_removal, ExistingOutputMode, OutputAction};
use crate::storage::{
    read_manifest, remove_output, write_manifest, write_metrics_csv, Manifest, PreprocessingManifest,
    SortingManifest, StagedOutput,
};
use crate::tree::ArtifactChain;

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Preprocess,
    Sort,
    QualityCheck,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Preprocess => write!(f, "preprocess"),
            StageKind::Sort => write!(f, "sort"),
            StageKind::QualityCheck => write!(f, "quality-check"),
        }
    }
}

/// Per-unit state within one invocation.
///
/// `NotStarted` is the only non-terminal state; a later invocation starts
/// over from the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    NotStarted,
    Skipped,
    Loaded,
    Failed,
    Completed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UnitState::NotStarted)
    }

    /// Whether downstream stages can use the output.
    pub fn is_usable(&self) -> bool {
        matches!(self, UnitState::Loaded | UnitState::Completed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::NotStarted => write!(f, "not started"),
            UnitState::Skipped => write!(f, "skipped"),
            UnitState::Loaded => write!(f, "loaded"),
            UnitState::Failed => write!(f, "failed"),
            UnitState::Completed => write!(f, "completed"),
        }
    }
}

/// Outcome of one stage for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub unit: String,
    /// Output location the decision was made on.
    pub target: PathBuf,
    /// The usable artifact inside `target` (the final step directory for
    /// preprocessing).
    pub artifact: PathBuf,
    pub action: OutputAction,
    pub state: UnitState,
}

/// Preprocess one run.
#[derive(Debug, Clone)]
pub struct PreprocessTask {
    pub recording: LazyRecording,
    pub manifest: PreprocessingManifest,
}

/// Sort one sorting unit.
#[derive(Debug, Clone)]
pub struct SortTask {
    pub unit: SortingUnit,
    pub sorter: Sorter,
    /// Preprocessed artifacts of the unit's segments, in segment order.
    pub segments: Vec<PathBuf>,
    pub options: Mapping,
    pub image: IsolationImage,
    pub manifest: SortingManifest,
}

/// Compute quality metrics for a sorted unit.
#[derive(Debug, Clone)]
pub struct QualityTask {
    pub unit: SortingUnit,
    pub sorter: Sorter,
}

#[derive(Debug, Clone)]
pub enum StageTask {
    Preprocess(PreprocessTask),
    Sort(SortTask),
    QualityCheck(QualityTask),
}

impl StageTask {
    pub fn kind(&self) -> StageKind {
        match self {
            StageTask::Preprocess(_) => StageKind::Preprocess,
            StageTask::Sort(_) => StageKind::Sort,
            StageTask::QualityCheck(_) => StageKind::QualityCheck,
        }
    }

    /// Label of the run or sorting unit, as used in errors.
    pub fn label(&self) -> String {
        match self {
            StageTask::Preprocess(task) => task.recording.raw.run.to_string(),
            StageTask::Sort(task) => task.unit.label(),
            StageTask::QualityCheck(task) => task.unit.label(),
        }
    }
}

/// Runs stages against the derivatives tree.
#[derive(Clone)]
pub struct StageExecutor {
    resolver: PathResolver,
    preprocessor: Arc<dyn PreprocessingEngine>,
    sorter: Arc<dyn SorterRuntime>,
    quality: Arc<dyn QualityEngine>,
}

impl StageExecutor {
    pub fn new(
        resolver: PathResolver,
        preprocessor: Arc<dyn PreprocessingEngine>,
        sorter: Arc<dyn SorterRuntime>,
        quality: Arc<dyn QualityEngine>,
    ) -> Self {
        Self {
            resolver,
            preprocessor,
            sorter,
            quality,
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Output location of `task`.
    pub fn target(&self, task: &StageTask) -> PathBuf {
        match task {
            StageTask::Preprocess(task) => {
                let run = &task.recording.raw.run;
                self.resolver.preprocessed_dir(&run.session, &run.run)
            }
            StageTask::Sort(task) => self.resolver.sorter_dir(&task.unit.scope, task.sorter),
            StageTask::QualityCheck(task) => self.resolver.quality_metrics_path(&task.unit.scope, task.sorter),
        }
    }

    /// The decision `execute` would take right now, without doing anything.
    ///
    /// # Errors
    ///
    /// `ConfigurationError::OutputExists` when the decision is `Fail`.
    pub fn preflight(&self, task: &StageTask, mode: ExistingOutputMode) -> Result<OutputAction, ConfigurationError> {
        preflight(task.kind(), &self.target(task), mode)
    }

    /// Executes `task` under `mode`.
    pub async fn execute(&self, task: &StageTask, mode: ExistingOutputMode) -> Result<StageResult, PipelineError> {
        let stage = task.kind();
        let unit = task.label();
        let target = self.target(task);
        let exists = target.exists();
        let action = decide(exists, mode);
        debug!(%stage, %unit, %mode, %action, target = %target.display(), "Stage decision");

        let (state, artifact) = match action {
            OutputAction::Fail => return Err(output_exists(stage, &target, mode).into()),
            OutputAction::Skip => {
                info!(%stage, %unit, path = %target.display(), "Output exists, skipping");
                (UnitState::Skipped, target.clone())
            }
            OutputAction::LoadExisting => {
                let artifact = self.load(task, &target)?;
                info!(%stage, %unit, path = %artifact.display(), "Loaded existing output");
                (UnitState::Loaded, artifact)
            }
            OutputAction::ProceedFresh => {
                if requires_removal(exists, mode) {
                    warn!(%stage, %unit, path = %target.display(), "Overwriting existing output");
                    remove_output(&target)?;
                }
                let artifact = self.produce(task, &target).await?;
                info!(%stage, %unit, path = %artifact.display(), "Stage completed");
                (UnitState::Completed, artifact)
            }
        };

        Ok(StageResult {
            stage,
            unit,
            target,
            artifact,
            action,
            state,
        })
    }

    fn load(&self, task: &StageTask, target: &Path) -> Result<PathBuf, PipelineError> {
        match task {
            StageTask::Preprocess(task) => {
                let stored: PreprocessingManifest = read_manifest(target)?;
                warn_drift(&task.recording.raw.run.to_string(), &stored, &task.manifest);
                stored_final_step(&stored, target)
            }
            StageTask::Sort(task) => {
                let stored: SortingManifest = read_manifest(target)?;
                warn_drift(&task.unit.label(), &stored, &task.manifest);
                Ok(target.to_path_buf())
            }
            StageTask::QualityCheck(_) => Ok(target.to_path_buf()),
        }
    }

    async fn produce(&self, task: &StageTask, target: &Path) -> Result<PathBuf, PipelineError> {
        match task {
            StageTask::Preprocess(task) => {
                let final_key = task.recording.final_step()?.key.clone();
                let staged = StagedOutput::begin(target)?;
                let step_dir = staged.path().join(&final_key);
                std::fs::create_dir(&step_dir).map_err(|e| PipelineError::io(&step_dir, e))?;

                self.preprocessor.materialize(&task.recording, &step_dir).await?;
                write_manifest(staged.path(), &task.manifest)?;
                Ok(staged.commit()?.join(final_key))
            }
            StageTask::Sort(task) => {
                let staged = StagedOutput::begin(target)?;
                let invocation = SorterInvocation {
                    sorter: task.sorter,
                    unit: task.unit.label(),
                    segments: task.segments.clone(),
                    output_dir: staged.path().to_path_buf(),
                    options: task.options.clone(),
                    image: task.image.clone(),
                    working_dir: self.resolver.unit_dir(&task.unit.scope),
                    data_root: self.resolver.base().to_path_buf(),
                };

                self.sorter.run(&invocation).await?;
                write_manifest(staged.path(), &task.manifest)?;
                staged.commit()
            }
            StageTask::QualityCheck(task) => {
                let sorter_dir = self.resolver.sorter_dir(&task.unit.scope, task.sorter);
                let table = self.quality.compute(&sorter_dir, &task.unit.label()).await?;
                write_metrics_csv(target, &table)?;
                Ok(target.to_path_buf())
            }
        }
    }
}

/// Decision for `target` under `mode`, with `Fail` turned into an error.
pub fn preflight(stage: StageKind, target: &Path, mode: ExistingOutputMode) -> Result<OutputAction, ConfigurationError> {
    match decide(target.exists(), mode) {
        OutputAction::Fail => Err(output_exists(stage, target, mode)),
        action => Ok(action),
    }
}

fn output_exists(stage: StageKind, target: &Path, mode: ExistingOutputMode) -> ConfigurationError {
    ConfigurationError::OutputExists {
        path: target.to_path_buf(),
        stage: stage.to_string(),
        mode,
    }
}

fn warn_drift<M: Manifest>(unit: &str, stored: &M, current: &M) {
    for difference in stored.drift(current) {
        warn!(unit, manifest = M::FILE_NAME, "Existing output differs from request: {difference}");
    }
}

/// The final step directory recorded in a preprocessing manifest.
///
/// The step chain is rebuilt from the manifest so a manifest whose final key
/// does not match its own chain is rejected.
fn stored_final_step(stored: &PreprocessingManifest, target: &Path) -> Result<PathBuf, PipelineError> {
    let chain = ArtifactChain::from_step_names(
        stored.run_key().to_string(),
        stored.step_chain.iter().map(|s| s.name.as_str()),
    )?;
    let last = chain.last()?;
    if last.key != stored.final_step {
        return Err(ConsistencyError::CorruptManifest {
            path: target.join(PreprocessingManifest::FILE_NAME),
            reason: format!(
                "final step '{}' does not match step chain ending in '{}'",
                stored.final_step, last.key
            ),
        }
        .into());
    }

    let artifact = target.join(&stored.final_step);
    if !artifact.is_dir() {
        return Err(ConsistencyError::MissingArtifact {
            manifest: target.join(PreprocessingManifest::FILE_NAME),
            artifact,
        }
        .into());
    }
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::config::StepSpec;
    use crate::engine::{MetricsTable, RawRecording};
    use crate::error::ExternalToolError;
    use crate::layout::UnitScope;
    use crate::storage::{config_hash, SPIKEFLOW_VERSION};
    use crate::tree::RunKey;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PreprocessingEngine for Counting {
        async fn materialize(&self, _: &LazyRecording, destination: &Path) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::write(destination.join("traces.bin"), b"x").unwrap();
            if self.fail {
                return Err(ExternalToolError::Failed {
                    tool: "preprocessing".to_string(),
                    unit: "ses-1/r1".to_string(),
                    status: "exit code 1".to_string(),
                    detail: String::new(),
                }
                .into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SorterRuntime for Counting {
        async fn run(&self, invocation: &SorterInvocation) -> Result<(), ExternalToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::write(invocation.output_dir.join("spike_times.npy"), b"x").unwrap();
            Ok(())
        }
    }

    #[async_trait]
    impl QualityEngine for Counting {
        async fn compute(&self, _: &Path, _: &str) -> Result<MetricsTable, ExternalToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MetricsTable::default())
        }
    }

    fn executor(base: &Path, engine: Arc<Counting>) -> StageExecutor {
        StageExecutor::new(
            PathResolver::new(base, "S1"),
            engine.clone(),
            engine.clone(),
            engine,
        )
    }

    fn preprocess_task(base: &Path) -> StageTask {
        let steps = vec![StepSpec::new("bandpass_filter")];
        let raw = RawRecording {
            run: RunKey::new("ses-1", "r1"),
            path: base.join("rawdata/S1/ses-1/ephys/r1"),
        };
        let recording = Counting::default().apply(&steps, raw).unwrap();
        let manifest = PreprocessingManifest {
            subject: "S1".to_string(),
            session: "ses-1".to_string(),
            run: "r1".to_string(),
            config_name: "default".to_string(),
            config_hash: config_hash(&steps).unwrap(),
            step_chain: steps,
            final_step: "1-raw-bandpass_filter".to_string(),
            spikeflow_version: SPIKEFLOW_VERSION.to_string(),
            created_at: Utc::now(),
        };
        StageTask::Preprocess(PreprocessTask { recording, manifest })
    }

    #[tokio::test]
    async fn test_fresh_preprocess_commits_output_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Counting::default());
        let executor = executor(dir.path(), engine.clone());
        let task = preprocess_task(dir.path());

        let result = executor.execute(&task, ExistingOutputMode::FailIfExists).await.unwrap();

        assert_eq!(result.state, UnitState::Completed);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert!(result.artifact.ends_with("preprocessed/1-raw-bandpass_filter"));
        assert!(result.artifact.join("traces.bin").exists());
        assert!(result.target.join("preprocessing_info.yaml").exists());
    }

    #[tokio::test]
    async fn test_load_makes_no_external_call() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Counting::default());
        let executor = executor(dir.path(), engine.clone());
        let task = preprocess_task(dir.path());
        executor.execute(&task, ExistingOutputMode::FailIfExists).await.unwrap();

        let result = executor.execute(&task, ExistingOutputMode::LoadIfExists).await.unwrap();

        assert_eq!(result.state, UnitState::Loaded);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_if_exists_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Counting::default());
        let executor = executor(dir.path(), engine.clone());
        let task = preprocess_task(dir.path());
        executor.execute(&task, ExistingOutputMode::FailIfExists).await.unwrap();

        let err = executor.execute(&task, ExistingOutputMode::FailIfExists).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Configuration(ConfigurationError::OutputExists { .. })
        ));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_external_call_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Counting { fail: true, ..Default::default() });
        let executor = executor(dir.path(), engine);
        let task = preprocess_task(dir.path());

        let err = executor.execute(&task, ExistingOutputMode::FailIfExists).await.unwrap_err();

        assert!(matches!(err, PipelineError::ExternalTool(_)));
        let run_dir = dir.path().join("derivatives/S1/ses-1/r1");
        assert!(!run_dir.join("preprocessed").exists());
        assert_eq!(fs::read_dir(&run_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_load_without_manifest_is_consistency_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), Arc::new(Counting::default()));
        let task = preprocess_task(dir.path());
        fs::create_dir_all(executor.target(&task).join("1-raw-bandpass_filter")).unwrap();

        let err = executor.execute(&task, ExistingOutputMode::LoadIfExists).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Consistency(ConsistencyError::MissingManifest { .. })
        ));
    }

    #[tokio::test]
    async fn test_skip_and_quality_check() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Counting::default());
        let executor = executor(dir.path(), engine.clone());
        let unit = SortingUnit {
            scope: UnitScope::Run {
                session: "ses-1".to_string(),
                run: "r1".to_string(),
            },
            segments: vec![RunKey::new("ses-1", "r1")],
        };
        let task = StageTask::QualityCheck(QualityTask {
            unit,
            sorter: Sorter::Mountainsort5,
        });
        fs::create_dir_all(executor.resolver().sorter_dir(
            &UnitScope::Run {
                session: "ses-1".to_string(),
                run: "r1".to_string(),
            },
            Sorter::Mountainsort5,
        ))
        .unwrap();

        let first = executor.execute(&task, ExistingOutputMode::SkipIfExists).await.unwrap();
        assert_eq!(first.state, UnitState::Completed);
        assert!(first.target.ends_with("mountainsort5/quality_metrics.csv"));

        let second = executor.execute(&task, ExistingOutputMode::SkipIfExists).await.unwrap();
        assert_eq!(second.state, UnitState::Skipped);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unit_state_terminal() {
        assert!(!UnitState::NotStarted.is_terminal());
        assert!(UnitState::Failed.is_terminal());
        assert!(UnitState::Loaded.is_usable());
        assert!(!UnitState::Skipped.is_usable());
    }
}
