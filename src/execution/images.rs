//! Choosing the isolation image for a sorter.
//!
//! Lookup order for Singularity images: the shared cluster store
//! (`<hpc>/<sorter>/<tag>/<image>.sif`), then the per-user store
//! (`<local>/<image>.sif`). When neither has the file, the per-user path is
//! returned and the runtime pulls into it on first use.

use std::path::PathBuf;

use tracing::debug;

use crate::config::{IsolationImage, IsolationOptions, PipelineConfig, Sorter};
use crate::error::ConfigurationError;

/// Resolves the image `sorter` runs under on this host.
pub fn resolve_image(
    sorter: Sorter,
    options: &IsolationOptions,
    config: &PipelineConfig,
) -> Result<IsolationImage, ConfigurationError> {
    resolve_for_platform(sorter, options, config, cfg!(target_os = "linux"))
}

fn resolve_for_platform(
    sorter: Sorter,
    options: &IsolationOptions,
    config: &PipelineConfig,
    linux: bool,
) -> Result<IsolationImage, ConfigurationError> {
    options.validate()?;

    if options.docker {
        return Ok(IsolationImage::Docker {
            image: sorter.docker_image(&config.image_tag),
        });
    }

    if let Some(path) = &options.singularity_image {
        if !path.is_file() {
            return Err(ConfigurationError::ImageUnavailable {
                sorter: sorter.to_string(),
                reason: format!("singularity image {} does not exist", path.display()),
            });
        }
        return Ok(IsolationImage::Singularity {
            image: path.clone(),
            source: singularity_source(sorter, config),
        });
    }

    if options.singularity {
        if !linux {
            return Err(ConfigurationError::ImageUnavailable {
                sorter: sorter.to_string(),
                reason: "singularity is only supported on Linux; use docker".to_string(),
            });
        }
        return Ok(stored_singularity_image(sorter, config));
    }

    if sorter.can_run_locally() {
        return Ok(IsolationImage::Local);
    }

    if linux {
        Ok(stored_singularity_image(sorter, config))
    } else {
        Ok(IsolationImage::Docker {
            image: sorter.docker_image(&config.image_tag),
        })
    }
}

fn singularity_source(sorter: Sorter, config: &PipelineConfig) -> String {
    format!("docker://{}", sorter.docker_image(&config.image_tag))
}

fn stored_singularity_image(sorter: Sorter, config: &PipelineConfig) -> IsolationImage {
    let file_name = sorter.singularity_file_name();
    let local = config.local_images_dir.join(&file_name);

    let candidates: Vec<PathBuf> = config
        .hpc_images_dir
        .iter()
        .map(|hpc| hpc.join(sorter.as_str()).join(&config.image_tag).join(&file_name))
        .chain(std::iter::once(local.clone()))
        .collect();

    let image = candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| {
            debug!(sorter = %sorter, path = %local.display(), "No stored image; it will be pulled");
            local
        });

    IsolationImage::Singularity {
        image,
        source: singularity_source(sorter, config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_in(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig::default()
            .with_local_images_dir(dir.join("local"))
            .with_hpc_images_dir(dir.join("hpc"))
    }

    #[test]
    fn test_local_sorter_runs_without_container() {
        let dir = tempfile::tempdir().unwrap();
        let image = resolve_for_platform(
            Sorter::Mountainsort5,
            &IsolationOptions::default(),
            &config_in(dir.path()),
            true,
        )
        .unwrap();
        assert_eq!(image, IsolationImage::Local);
    }

    #[test]
    fn test_docker_off_linux() {
        let dir = tempfile::tempdir().unwrap();
        let image = resolve_for_platform(
            Sorter::Kilosort2_5,
            &IsolationOptions::default(),
            &config_in(dir.path()),
            false,
        )
        .unwrap();
        assert_eq!(
            image,
            IsolationImage::Docker {
                image: "spikeinterface/kilosort2_5-compiled-base:latest".to_string()
            }
        );
    }

    #[test]
    fn test_hpc_store_preferred_over_local() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let hpc = dir.path().join("hpc/kilosort3/latest/kilosort3-compiled-base.sif");
        let local = dir.path().join("local/kilosort3-compiled-base.sif");
        fs::create_dir_all(hpc.parent().unwrap()).unwrap();
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(&hpc, b"sif").unwrap();
        fs::write(&local, b"sif").unwrap();

        let image =
            resolve_for_platform(Sorter::Kilosort3, &IsolationOptions::default(), &config, true).unwrap();
        assert!(matches!(image, IsolationImage::Singularity { image, .. } if image == hpc));
    }

    #[test]
    fn test_missing_image_falls_back_to_local_pull_path() {
        let dir = tempfile::tempdir().unwrap();
        let image = resolve_for_platform(
            Sorter::Kilosort2,
            &IsolationOptions::default(),
            &config_in(dir.path()),
            true,
        )
        .unwrap();
        match image {
            IsolationImage::Singularity { image, source } => {
                assert_eq!(image, dir.path().join("local/kilosort2-compiled-base.sif"));
                assert_eq!(source, "docker://spikeinterface/kilosort2-compiled-base:latest");
            }
            other => panic!("unexpected image {other:?}"),
        }
    }

    #[test]
    fn test_explicit_singularity_image_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let options = IsolationOptions::singularity_image(dir.path().join("missing.sif"));
        let err = resolve_for_platform(Sorter::Kilosort3, &options, &config_in(dir.path()), true)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::ImageUnavailable { .. }));
    }

    #[test]
    fn test_conflicting_sources_rejected_before_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let options = IsolationOptions {
            singularity: true,
            docker: true,
            ..Default::default()
        };
        let err = resolve_for_platform(Sorter::Kilosort3, &options, &config_in(dir.path()), true)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::ConflictingImageSources(_)));
    }
}
