//! Pipeline orchestrator.
//!
//! Drives preprocess → concatenate → sort → quality-check over a run tree:
//! - Plans the invocation (tree, processing config, sorter image)
//! - Preflights every preprocess and sort decision before any external call
//! - Executes the stages sequentially through the [`StageExecutor`]
//! - Removes requested intermediate files and reports every unit

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_yaml::Mapping;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use super::report::PipelineReport;
use super::request::{IntermediateFile, PipelineRequest};
use super::PipelineStage;
use crate::concat::{ConcatenationBuilder, ConcatenationPlan, SortingUnit};
use crate::config::{IsolationImage, PipelineConfig, ProcessingConfig};
use crate::engine::{
    CommandPreprocessor, CommandQualityEngine, PreprocessingEngine, QualityEngine, RawRecording, SorterRuntime,
};
use crate::error::{ConfigurationError, PipelineError};
use crate::execution::{resolve_image, IsolatedSorterRuntime};
use crate::layout::PathResolver;
use crate::policy::{decide, ExistingOutputMode, OutputAction};
use crate::scheduler::{TaskDescriptor, TaskRunner};
use crate::stage::{
    preflight, PreprocessTask, QualityTask, SortTask, StageExecutor, StageKind, StageResult, StageTask, UnitState,
};
use crate::storage::{
    config_hash, read_manifest, PreprocessingManifest, SegmentRecord, SortingManifest, SPIKEFLOW_VERSION,
};
use crate::tree::{discover, RunKey, RunTree};

/// Everything resolved about an invocation before any work starts.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub resolver: PathResolver,
    pub tree: RunTree,
    pub processing: ProcessingConfig,
    pub config_hash: String,
    /// Merged sorter options; empty for preprocess-only invocations.
    pub sorter_options: Mapping,
    /// Isolation for the sorter; `None` for preprocess-only invocations.
    pub image: Option<IsolationImage>,
}

/// An invocation that passed [`PipelineOrchestrator::preflight`].
pub struct PreparedRun {
    plan: PipelinePlan,
    executor: StageExecutor,
    preprocess_mode: ExistingOutputMode,
    preprocess_tasks: Vec<(RunKey, StageTask)>,
    concat: ConcatenationPlan,
}

impl PreparedRun {
    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    /// Sorting units and the runs excluded from them.
    pub fn concatenation(&self) -> &ConcatenationPlan {
        &self.concat
    }
}

/// Composes the pipeline stages over a whole run tree.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    preprocessor: Arc<dyn PreprocessingEngine>,
    sorter: Arc<dyn SorterRuntime>,
    quality: Arc<dyn QualityEngine>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        preprocessor: Arc<dyn PreprocessingEngine>,
        sorter: Arc<dyn SorterRuntime>,
        quality: Arc<dyn QualityEngine>,
    ) -> Self {
        Self {
            config,
            preprocessor,
            sorter,
            quality,
        }
    }

    /// Orchestrator using the configured external commands.
    pub fn from_config(config: PipelineConfig) -> Self {
        let preprocessor = Arc::new(CommandPreprocessor::new(config.preprocess_command.clone()));
        let sorter = Arc::new(IsolatedSorterRuntime::new(config.sorter_command.clone()));
        let quality = Arc::new(CommandQualityEngine::new(config.quality_command.clone()));
        Self::new(config, preprocessor, sorter, quality)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Resolves the request without running anything.
    ///
    /// Validates names and options, builds the run tree, loads the
    /// processing config and resolves the sorter image, then checks that the
    /// inputs the stage needs are on disk.
    pub fn plan(&self, request: &PipelineRequest, stage: PipelineStage) -> Result<PipelinePlan, PipelineError> {
        request.validate()?;
        let resolver = request.resolver();
        let tree = discover(&resolver, &request.sessions)?;
        let processing = ProcessingConfig::load(&request.config_name, &self.config.configs_dir)?;
        let config_hash = config_hash(&processing.steps)?;

        let (sorter_options, image) = if stage.sorts() {
            (
                processing.sorter_options(request.sorter, &request.sorter_options),
                Some(resolve_image(request.sorter, &request.isolation, &self.config)?),
            )
        } else {
            (Mapping::new(), None)
        };

        for key in tree.runs() {
            if stage.preprocesses() {
                let raw = resolver.raw_run_dir(&key.session, &key.run);
                if !raw.is_dir() {
                    return Err(ConfigurationError::MissingRawData {
                        unit: key.to_string(),
                        path: raw,
                    }
                    .into());
                }
            } else {
                let preprocessed = resolver.preprocessed_dir(&key.session, &key.run);
                if !preprocessed.is_dir() {
                    return Err(ConfigurationError::MissingPreprocessedData {
                        unit: key.to_string(),
                        path: preprocessed,
                    }
                    .into());
                }
            }
        }

        Ok(PipelinePlan {
            resolver,
            tree,
            processing,
            config_hash,
            sorter_options,
            image,
        })
    }

    /// Runs `stage` for `request` in this process.
    pub async fn run(&self, request: &PipelineRequest, stage: PipelineStage) -> Result<PipelineReport, PipelineError> {
        let mut report = PipelineReport::default();
        self.run_into(request, stage, &mut report).await?;
        Ok(report)
    }

    /// Plans the invocation and takes every existing-output decision that can
    /// fail, without touching the filesystem.
    pub fn preflight(&self, request: &PipelineRequest, stage: PipelineStage) -> Result<PreparedRun, PipelineError> {
        let plan = self.plan(request, stage)?;
        let executor = StageExecutor::new(
            plan.resolver.clone(),
            self.preprocessor.clone(),
            self.sorter.clone(),
            self.quality.clone(),
        );
        let preprocess_mode = if stage.preprocesses() {
            request.existing_preprocessed
        } else {
            ExistingOutputMode::LoadIfExists
        };

        let preprocess_tasks = self.preprocess_tasks(&plan, request)?;
        let mut skipped: HashMap<RunKey, String> = HashMap::new();
        for (key, task) in &preprocess_tasks {
            if executor.preflight(task, preprocess_mode)? == OutputAction::Skip {
                skipped.insert(
                    key.clone(),
                    format!("preprocessed output exists and mode is '{preprocess_mode}'"),
                );
            }
        }
        let concat = ConcatenationBuilder::new(request.concat_runs, request.concat_sessions)
            .build_excluding(&plan.tree, |key| skipped.get(key).cloned());
        if stage.sorts() {
            self.preflight_sorting(&plan.resolver, request, &concat)?;
        }

        Ok(PreparedRun {
            plan,
            executor,
            preprocess_mode,
            preprocess_tasks,
            concat,
        })
    }

    /// Like [`run`](Self::run), recording into `report` as stages finish.
    ///
    /// On error `report` keeps every unit that finished before the failure
    /// plus a `Failed` entry for the unit that stopped the run.
    pub async fn run_into(
        &self,
        request: &PipelineRequest,
        stage: PipelineStage,
        report: &mut PipelineReport,
    ) -> Result<(), PipelineError> {
        let PreparedRun {
            plan,
            executor,
            preprocess_mode,
            preprocess_tasks,
            concat,
        } = self.preflight(request, stage)?;
        info!(
            subject = %request.subject,
            %stage,
            runs = plan.tree.run_count(),
            config = %plan.processing.name,
            sorter = %request.sorter,
            concat_runs = request.concat_runs,
            concat_sessions = request.concat_sessions,
            "Starting pipeline"
        );

        report.excluded.extend(concat.excluded.iter().cloned());

        let mut segments: HashMap<RunKey, (PathBuf, SegmentRecord)> = HashMap::new();
        for (key, task) in &preprocess_tasks {
            let result = run_stage(&executor, task, preprocess_mode, report).await?;
            if result.state.is_usable() {
                let stored: PreprocessingManifest = read_manifest(&result.target)?;
                let record = SegmentRecord {
                    run: key.clone(),
                    final_step: stored.final_step,
                    config_hash: stored.config_hash,
                };
                segments.insert(key.clone(), (result.artifact.clone(), record));
            }
            report.push(result);
        }

        if !stage.sorts() {
            info!(subject = %request.subject, completed = report.completed(), "Preprocessing finished");
            return Ok(());
        }

        let image = plan
            .image
            .clone()
            .ok_or_else(|| ConfigurationError::ImageUnavailable {
                sorter: request.sorter.to_string(),
                reason: "no image was resolved for a sorting stage".to_string(),
            })?;

        let mut sorted = Vec::new();
        for unit in &concat.units {
            let task = self.sort_task(&plan, request, &concat, unit, &segments, &image)?;
            let result = run_stage(&executor, &task, request.existing_sorting, report).await?;
            let usable = result.state.is_usable();
            report.push(result);
            if !usable {
                continue;
            }

            let quality = StageTask::QualityCheck(QualityTask {
                unit: unit.clone(),
                sorter: request.sorter,
            });
            let result = run_stage(&executor, &quality, request.existing_quality, report).await?;
            report.push(result);
            sorted.push(unit.clone());
        }

        for unit in &sorted {
            let sorter_dir = plan.resolver.sorter_dir(&unit.scope, request.sorter);
            report
                .deleted
                .extend(delete_intermediates(&sorter_dir, &request.delete_intermediate)?);
        }

        info!(
            subject = %request.subject,
            completed = report.completed(),
            excluded = report.excluded.len(),
            "Pipeline finished"
        );
        Ok(())
    }

    fn preprocess_tasks(
        &self,
        plan: &PipelinePlan,
        request: &PipelineRequest,
    ) -> Result<Vec<(RunKey, StageTask)>, PipelineError> {
        let mut tasks = Vec::with_capacity(plan.tree.run_count());
        for key in plan.tree.runs() {
            let raw = RawRecording {
                path: plan.resolver.raw_run_dir(&key.session, &key.run),
                run: key.clone(),
            };
            let recording = self.preprocessor.apply(&plan.processing.steps, raw)?;
            let manifest = PreprocessingManifest {
                subject: request.subject.clone(),
                session: key.session.clone(),
                run: key.run.clone(),
                config_name: plan.processing.name.clone(),
                step_chain: plan.processing.steps.clone(),
                final_step: recording.final_step()?.key.clone(),
                config_hash: plan.config_hash.clone(),
                spikeflow_version: SPIKEFLOW_VERSION.to_string(),
                created_at: Utc::now(),
            };
            tasks.push((key, StageTask::Preprocess(PreprocessTask { recording, manifest })));
        }
        Ok(tasks)
    }

    /// Fails before any work when a sorting or quality output would be refused.
    ///
    /// Quality outputs are only checked where the sorter output is loaded.
    /// A fresh sort replaces the whole sorter directory and a skipped sort
    /// never reaches the quality check.
    fn preflight_sorting(
        &self,
        resolver: &PathResolver,
        request: &PipelineRequest,
        concat: &ConcatenationPlan,
    ) -> Result<(), ConfigurationError> {
        for unit in &concat.units {
            let target = resolver.sorter_dir(&unit.scope, request.sorter);
            let action = preflight(StageKind::Sort, &target, request.existing_sorting)?;
            if action == OutputAction::LoadExisting {
                let metrics = resolver.quality_metrics_path(&unit.scope, request.sorter);
                preflight(StageKind::QualityCheck, &metrics, request.existing_quality)?;
            }
        }
        Ok(())
    }

    fn sort_task(
        &self,
        plan: &PipelinePlan,
        request: &PipelineRequest,
        concat: &ConcatenationPlan,
        unit: &SortingUnit,
        segments: &HashMap<RunKey, (PathBuf, SegmentRecord)>,
        image: &IsolationImage,
    ) -> Result<StageTask, PipelineError> {
        let mut paths = Vec::with_capacity(unit.segments.len());
        let mut records = Vec::with_capacity(unit.segments.len());
        for key in &unit.segments {
            let (path, record) = segments.get(key).ok_or_else(|| ConfigurationError::MissingPreprocessedData {
                unit: key.to_string(),
                path: plan.resolver.preprocessed_dir(&key.session, &key.run),
            })?;
            paths.push(path.clone());
            records.push(record.clone());
        }

        let manifest = SortingManifest {
            subject: request.subject.clone(),
            unit: unit.scope.clone(),
            sorter: request.sorter,
            sorter_options: plan.sorter_options.clone(),
            image: image.clone(),
            concat_runs: request.concat_runs,
            concat_sessions: request.concat_sessions,
            segments: records,
            excluded: concat.exclusions_for(unit),
            spikeflow_version: SPIKEFLOW_VERSION.to_string(),
            created_at: Utc::now(),
        };

        Ok(StageTask::Sort(SortTask {
            unit: unit.clone(),
            sorter: request.sorter,
            segments: paths,
            options: plan.sorter_options.clone(),
            image: image.clone(),
            manifest,
        }))
    }
}

#[async_trait]
impl TaskRunner for PipelineOrchestrator {
    async fn run_task(&self, task: &TaskDescriptor) -> Result<PipelineReport, PipelineError> {
        self.run(&task.request, task.stage).await
    }
}

/// Executes one stage, recording a `Failed` entry in `report` on error.
async fn run_stage(
    executor: &StageExecutor,
    task: &StageTask,
    mode: ExistingOutputMode,
    report: &mut PipelineReport,
) -> Result<StageResult, PipelineError> {
    match executor.execute(task, mode).await {
        Ok(result) => Ok(result),
        Err(e) => {
            let target = executor.target(task);
            let action = decide(target.exists(), mode);
            error!(
                stage = %task.kind(),
                unit = %task.label(),
                state = %UnitState::Failed,
                %mode,
                error = %e,
                "Stage failed"
            );
            report.push(StageResult {
                stage: task.kind(),
                unit: task.label(),
                artifact: target.clone(),
                target,
                action,
                state: UnitState::Failed,
            });
            Err(e)
        }
    }
}

/// Removes the named intermediate files anywhere below `sorter_dir`.
fn delete_intermediates(sorter_dir: &Path, files: &[IntermediateFile]) -> Result<Vec<PathBuf>, PipelineError> {
    if files.is_empty() {
        return Ok(Vec::new());
    }

    let mut deleted = Vec::new();
    for entry in WalkDir::new(sorter_dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if files.iter().any(|f| f.file_name() == name) {
            let path = entry.path().to_path_buf();
            std::fs::remove_file(&path).map_err(|e| PipelineError::io(&path, e))?;
            deleted.push(path);
        }
    }

    if deleted.is_empty() {
        warn!(path = %sorter_dir.display(), "No intermediate files found to delete");
    } else {
        info!(path = %sorter_dir.display(), count = deleted.len(), "Deleted intermediate files");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_delete_intermediates_only_named_files() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("sorter_output");
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("recording.dat"), b"x").unwrap();
        fs::write(output.join("temp_wh.dat"), b"x").unwrap();
        fs::write(output.join("spike_times.npy"), b"x").unwrap();

        let deleted = delete_intermediates(dir.path(), &[IntermediateFile::TempWhDat]).unwrap();

        assert_eq!(deleted, [output.join("temp_wh.dat")]);
        assert!(output.join("recording.dat").exists());
        assert!(output.join("spike_times.npy").exists());
    }

    #[test]
    fn test_delete_nothing_requested() {
        let dir = tempfile::tempdir().unwrap();
        assert!(delete_intermediates(dir.path(), &[]).unwrap().is_empty());
    }
}
