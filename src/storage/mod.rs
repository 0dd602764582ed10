//! Durable stage outputs.
//!
//! - **Staging**: stage outputs are produced in a hidden sibling and renamed
//!   onto their target on success
//! - **Manifests**: each committed output carries a YAML record of the
//!   settings it was produced with
//! - **Metrics**: quality-metric tables written as CSV

pub mod manifest;
pub mod metrics;
pub mod staging;

pub use manifest::{
    config_hash, read_manifest, write_manifest, Manifest, PreprocessingManifest, SegmentRecord,
    SortingManifest, SPIKEFLOW_VERSION,
};
pub use metrics::write_metrics_csv;
pub use staging::{remove_output, remove_stale, StagedOutput};
