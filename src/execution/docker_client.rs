//! Docker API wrapper using the bollard crate.
//!
//! Sorter containers are run to completion: create, start, wait, collect
//! logs, remove. A container whose run is dropped midway is force-removed
//! in the background; [`finish_pending_removals`] waits for those removals.

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use std::sync::Mutex;
use std::time::Duration;

use bollard::Docker;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors from the Docker daemon.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Container operation failed: {0}")]
    RunFailed(String),
}

/// Configuration for a sorter container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Unique container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command to run.
    pub cmd: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Bind mounts (`host:container[:mode]`).
    pub binds: Vec<String>,
    /// Request all GPUs from the daemon.
    pub gpus: bool,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: Vec::new(),
            working_dir: None,
            binds: Vec::new(),
            gpus: false,
        }
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Mounts `path` at the same location inside the container.
    pub fn with_identity_bind(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.binds.push(format!("{path}:{path}"));
        self
    }

    pub fn with_gpus(mut self, gpus: bool) -> Self {
        self.gpus = gpus;
        self
    }
}

/// Outcome of a container run.
#[derive(Debug, Clone)]
pub struct ContainerRun {
    pub exit_code: i64,
    pub logs: String,
}

/// Removals spawned by dropped [`ContainerGuard`]s.
static PENDING_REMOVALS: Mutex<Vec<JoinHandle<()>>> = Mutex::new(Vec::new());

fn track_removal(handle: JoinHandle<()>) {
    if let Ok(mut pending) = PENDING_REMOVALS.lock() {
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }
}

/// Waits up to `timeout` for containers being removed after their run was
/// dropped.
pub async fn finish_pending_removals(timeout: Duration) {
    let pending = match PENDING_REMOVALS.lock() {
        Ok(mut pending) => std::mem::take(&mut *pending),
        Err(_) => return,
    };
    if pending.is_empty() {
        return;
    }
    debug!(count = pending.len(), "Waiting for sorter container removal");
    if tokio::time::timeout(timeout, futures::future::join_all(pending)).await.is_err() {
        warn!("Timed out removing sorter containers");
    }
}

type RemoveFn = Box<dyn FnOnce(String) -> BoxFuture<'static, ()> + Send>;

/// Removes a container when dropped before [`disarm`](Self::disarm).
struct ContainerGuard {
    id: String,
    remove: Option<RemoveFn>,
}

impl ContainerGuard {
    fn new(id: impl Into<String>, remove: impl FnOnce(String) -> BoxFuture<'static, ()> + Send + 'static) -> Self {
        Self {
            id: id.into(),
            remove: Some(Box::new(remove)),
        }
    }

    fn disarm(mut self) {
        self.remove = None;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(remove) = self.remove.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(container = %self.id, "Sorter run dropped, removing its container");
                track_removal(handle.spawn(remove(self.id.clone())));
            }
            Err(_) => warn!(container = %self.id, "No runtime left to remove sorter container"),
        }
    }
}

/// Docker client wrapper.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the daemon is not accessible.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Whether the daemon answers.
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| DockerError::DaemonUnavailable(e.to_string()))
    }

    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| DockerError::PullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Pulls `image` unless it is already present.
    pub async fn ensure_image(&self, image: &str) -> Result<(), DockerError> {
        if self.image_exists(image).await {
            return Ok(());
        }
        info!(image, "Pulling sorter image");
        self.pull_image(image).await
    }

    /// Creates a container and returns its ID.
    pub async fn create_container(&self, config: &ContainerConfig) -> Result<String, DockerError> {
        let device_requests = config.gpus.then(|| {
            vec![DeviceRequest {
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            binds: (!config.binds.is_empty()).then(|| config.binds.clone()),
            device_requests,
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: Some(config.cmd.clone()),
            working_dir: config.working_dir.clone(),
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to create container: {e}")))?;

        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start container: {e}")))
    }

    /// Waits for the container to stop and returns its exit code.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as errors carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(DockerError::RunFailed(format!("Error waiting for container: {e}"))),
            None => Err(DockerError::RunFailed(
                "Container wait stream ended without a status".to_string(),
            )),
        }
    }

    /// Combined stdout and stderr of a container.
    pub async fn get_logs(&self, id: &str) -> Result<String, DockerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(DockerError::RunFailed(format!("Error reading logs: {e}")));
                }
            }
        }
        Ok(output)
    }

    pub async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to remove container: {e}")))
    }

    /// Runs a container to completion and removes it.
    pub async fn run_to_completion(&self, config: &ContainerConfig) -> Result<ContainerRun, DockerError> {
        self.ensure_image(&config.image).await?;

        let id = self.create_container(config).await?;
        debug!(container = %id, name = %config.name, "Created sorter container");

        let guard = self.removal_guard(&id);

        let outcome = self.start_and_wait(&id).await;

        let removed = self.remove_container(&id).await;
        guard.disarm();
        if let Err(e) = removed {
            warn!(container = %id, error = %e, "Failed to remove sorter container");
        }
        outcome
    }

    fn removal_guard(&self, id: &str) -> ContainerGuard {
        let docker = self.docker.clone();
        ContainerGuard::new(id, move |id| {
            async move {
                let options = RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                };
                match docker.remove_container(&id, Some(options)).await {
                    Ok(()) => info!(container = %id, "Removed sorter container"),
                    Err(e) => warn!(container = %id, error = %e, "Failed to remove sorter container"),
                }
            }
            .boxed()
        })
    }

    async fn start_and_wait(&self, id: &str) -> Result<ContainerRun, DockerError> {
        self.start_container(id).await?;
        let exit_code = self.wait_container(id).await?;
        let logs = self.get_logs(id).await.unwrap_or_else(|e| {
            warn!(container = %id, error = %e, "Could not collect container logs");
            String::new()
        });
        Ok(ContainerRun { exit_code, logs })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serial_test::serial;

    use super::*;

    #[test]
    fn test_container_config_builder() {
        let config = ContainerConfig::new("spikeflow-ks-1", "spikeinterface/kilosort3-compiled-base:latest")
            .with_cmd(vec!["spikeflow-sort".to_string(), "--sorter".to_string(), "kilosort3".to_string()])
            .with_working_dir("/data/derivatives/S1/ses-1/r1")
            .with_identity_bind("/data")
            .with_gpus(true);

        assert_eq!(config.name, "spikeflow-ks-1");
        assert_eq!(config.cmd.len(), 3);
        assert_eq!(config.binds, ["/data:/data"]);
        assert_eq!(config.working_dir.as_deref(), Some("/data/derivatives/S1/ses-1/r1"));
        assert!(config.gpus);
    }

    fn counting_guard(id: &str, removed: &Arc<Mutex<Vec<String>>>) -> ContainerGuard {
        let removed = removed.clone();
        ContainerGuard::new(id, move |id| {
            async move {
                removed.lock().unwrap().push(id);
            }
            .boxed()
        })
    }

    #[tokio::test]
    #[serial]
    async fn test_dropped_guard_removes_container() {
        let removed = Arc::new(Mutex::new(Vec::new()));

        let run = async {
            let _guard = counting_guard("abc123", &removed);
            std::future::pending::<()>().await;
        };
        // The run never finishes; the timeout drops it with the guard armed.
        let _ = tokio::time::timeout(Duration::from_millis(10), run).await;
        finish_pending_removals(Duration::from_secs(5)).await;

        assert_eq!(*removed.lock().unwrap(), ["abc123"]);
    }

    #[tokio::test]
    #[serial]
    async fn test_disarmed_guard_leaves_container() {
        let removed = Arc::new(Mutex::new(Vec::new()));

        counting_guard("abc123", &removed).disarm();
        finish_pending_removals(Duration::from_secs(5)).await;

        assert!(removed.lock().unwrap().is_empty());
        assert!(PENDING_REMOVALS.lock().unwrap().is_empty());
    }

    #[test]
    fn test_guard_dropped_outside_runtime() {
        let removed = Arc::new(Mutex::new(Vec::new()));
        drop(counting_guard("abc123", &removed));
        assert!(removed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_container_config_defaults() {
        let config = ContainerConfig::new("c", "img");
        assert!(config.cmd.is_empty());
        assert!(config.binds.is_empty());
        assert!(!config.gpus);
        assert!(config.working_dir.is_none());
    }
}
