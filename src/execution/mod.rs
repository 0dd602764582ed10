//! Sorter execution: image resolution and isolated runtimes.
//!
//! ```text
//! resolve_image ──► IsolationImage ──► IsolatedSorterRuntime
//!                    Local              tokio::process, current_dir
//!                    Singularity        singularity exec --bind --pwd
//!                    Docker             bollard, identity bind + working_dir
//! ```

pub mod docker_client;
pub mod images;
pub mod runtime;

pub use docker_client::{finish_pending_removals, ContainerConfig, DockerClient, DockerError};
pub use images::resolve_image;
pub use runtime::IsolatedSorterRuntime;
