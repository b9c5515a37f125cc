//! Core types and error definitions for road_dataset.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, RoadDatasetError>;

#[derive(Debug, Error)]
pub enum RoadDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no ground-truth label for image {image}")]
    MissingLabel { image: PathBuf },
    #[error("no training images found under {root}")]
    NoSamples { root: PathBuf },
    #[error("{0}")]
    Other(String),
}

/// Target `(height, width)` of every image and label in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub const fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn pixels(&self) -> usize {
        self.height * self.width
    }
}

impl Default for ImageShape {
    fn default() -> Self {
        Self::new(160, 576)
    }
}

/// Image/label file pair on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleIndex {
    pub image: PathBuf,
    pub label: PathBuf,
}

/// One decoded training pair, channel-first.
#[derive(Debug, Clone)]
pub struct RoadSample {
    /// `[3, H, W]` pixel values.
    pub image_chw: Vec<f32>,
    /// `[num_classes, H, W]` one-hot labels.
    pub label_chw: Vec<f32>,
    pub shape: ImageShape,
    pub num_classes: usize,
}

impl RoadSample {
    pub fn new(
        image_chw: Vec<f32>,
        label_chw: Vec<f32>,
        shape: ImageShape,
        num_classes: usize,
    ) -> DatasetResult<Self> {
        if image_chw.len() != 3 * shape.pixels() {
            return Err(RoadDatasetError::Other(format!(
                "image buffer has {} values, expected 3x{}x{}",
                image_chw.len(),
                shape.height,
                shape.width
            )));
        }
        if label_chw.len() != num_classes * shape.pixels() {
            return Err(RoadDatasetError::Other(format!(
                "label buffer has {} values, expected {}x{}x{}",
                label_chw.len(),
                num_classes,
                shape.height,
                shape.width
            )));
        }
        Ok(Self {
            image_chw,
            label_chw,
            shape,
            num_classes,
        })
    }
}

/// A training batch: images `[N, 3, H, W]` and one-hot labels `[N, C, H, W]`.
#[derive(Debug, Clone)]
pub struct RoadBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 4>,
}

impl<B: Backend> RoadBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
