#![recursion_limit = "256"]
//! Inference for trained FCN-8s road models: checkpoint IO, per-pixel road
//! probabilities and green overlays written for the KITTI test split.

pub mod checkpoint;
pub mod overlay;
pub mod samples;
pub mod segment;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("checkpoint {path}: {msg}")]
    Checkpoint { path: PathBuf, msg: String },
    #[error("model config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot read tensor values: {0}")]
    TensorData(String),
    #[error("road class {road_class} is out of range for a {num_classes}-class model")]
    RoadClass { road_class: usize, num_classes: usize },
    #[error(transparent)]
    Dataset(#[from] road_dataset::RoadDatasetError),
    #[error(transparent)]
    Shape(#[from] models::ShapeError),
}

pub use checkpoint::{load_checkpoint, model_config_path, save_checkpoint};
pub use overlay::{blend_mask, ROAD_OVERLAY};
pub use samples::save_inference_samples;
pub use segment::RoadSegmenter;

pub mod prelude {
    pub use crate::checkpoint::{load_checkpoint, save_checkpoint};
    pub use crate::samples::save_inference_samples;
    pub use crate::segment::RoadSegmenter;
    pub use crate::InferenceError;
}
