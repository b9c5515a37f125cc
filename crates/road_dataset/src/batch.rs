//! Batch iteration for training.
//!
//! A [`BatchSource`] hands out a fresh [`BatchStream`] per epoch. Streams are lazy:
//! samples are decoded only when the batch that contains them is requested.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::aug::maybe_flip;
use crate::kitti::{index_split, load_sample};
use crate::types::{
    DatasetResult, ImageShape, RoadBatch, RoadDatasetError, RoadSample, SampleIndex,
};

#[derive(Debug, Clone)]
pub struct DatasetConfig {
    /// Every image and label is resized to this shape.
    pub image_shape: ImageShape,
    /// Shuffle sample order at the start of every stream.
    pub shuffle: bool,
    /// Seed for reproducible shuffling and augmentation.
    pub seed: Option<u64>,
    /// Probability of mirroring a sample left to right.
    pub flip_horizontal_prob: f32,
    /// Multiplier applied to raw 0..255 pixel values.
    pub pixel_scale: f32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            image_shape: ImageShape::default(),
            shuffle: true,
            seed: None,
            flip_horizontal_prob: 0.0,
            pixel_scale: 1.0,
        }
    }
}

/// Produces one epoch of batches per call.
pub trait BatchSource {
    type Stream: BatchStream;

    /// Opens a new pass over the data. `batch_size == 0` yields an empty stream.
    fn batches(&self, batch_size: usize) -> Self::Stream;

    /// Number of samples in one pass.
    fn num_samples(&self) -> usize;
}

pub trait BatchStream {
    /// Returns the next batch, or `None` once the pass is exhausted.
    fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<RoadBatch<B>>>;
}

/// Stacks equally shaped samples into a batch on `device`.
pub fn assemble<B: Backend>(
    samples: &[RoadSample],
    device: &B::Device,
) -> DatasetResult<RoadBatch<B>> {
    let Some(first) = samples.first() else {
        return Err(RoadDatasetError::Other("cannot assemble empty batch".into()));
    };
    let shape = first.shape;
    let classes = first.num_classes;
    let mut images_buf = Vec::with_capacity(samples.len() * first.image_chw.len());
    let mut labels_buf = Vec::with_capacity(samples.len() * first.label_chw.len());
    for sample in samples {
        if sample.shape != shape || sample.num_classes != classes {
            return Err(RoadDatasetError::Other(format!(
                "batch mixes sample shapes: {:?}/{} vs {:?}/{}",
                sample.shape, sample.num_classes, shape, classes
            )));
        }
        images_buf.extend_from_slice(&sample.image_chw);
        labels_buf.extend_from_slice(&sample.label_chw);
    }

    let n = samples.len();
    let images = Tensor::<B, 1>::from_floats(images_buf.as_slice(), device)
        .reshape([n, 3, shape.height, shape.width]);
    let labels = Tensor::<B, 1>::from_floats(labels_buf.as_slice(), device)
        .reshape([n, classes, shape.height, shape.width]);
    Ok(RoadBatch { images, labels })
}

fn stream_rng(seed: Option<u64>, epoch: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(epoch)),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

/// KITTI road training split on disk.
#[derive(Debug, Clone)]
pub struct KittiRoadDataset {
    root: PathBuf,
    indices: Vec<SampleIndex>,
    cfg: DatasetConfig,
    /// Streams opened so far; offsets the seed so each epoch shuffles differently.
    opened: Arc<AtomicU64>,
}

impl KittiRoadDataset {
    /// Indexes `split_dir` (e.g. `data/data_road/training`).
    pub fn open(split_dir: &Path, cfg: DatasetConfig) -> DatasetResult<Self> {
        let indices = index_split(split_dir)?;
        if indices.is_empty() {
            return Err(RoadDatasetError::NoSamples {
                root: split_dir.to_path_buf(),
            });
        }
        log::info!(
            "indexed {} KITTI road samples under {}",
            indices.len(),
            split_dir.display()
        );
        Ok(Self {
            root: split_dir.to_path_buf(),
            indices,
            cfg,
            opened: Arc::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn indices(&self) -> &[SampleIndex] {
        &self.indices
    }
}

impl BatchSource for KittiRoadDataset {
    type Stream = BatchIter;

    fn batches(&self, batch_size: usize) -> BatchIter {
        let epoch = self.opened.fetch_add(1, Ordering::Relaxed);
        BatchIter::new(self.indices.clone(), batch_size, self.cfg.clone(), epoch)
    }

    fn num_samples(&self) -> usize {
        self.indices.len()
    }
}

pub struct BatchIter {
    indices: Vec<SampleIndex>,
    cursor: usize,
    batch_size: usize,
    cfg: DatasetConfig,
    rng: StdRng,
    processed_batches: usize,
}

impl BatchIter {
    pub fn new(
        mut indices: Vec<SampleIndex>,
        batch_size: usize,
        cfg: DatasetConfig,
        epoch: u64,
    ) -> Self {
        let mut rng = stream_rng(cfg.seed, epoch);
        if cfg.shuffle {
            indices.shuffle(&mut rng);
        }
        Self {
            indices,
            cursor: 0,
            batch_size,
            cfg,
            rng,
            processed_batches: 0,
        }
    }
}

impl BatchStream for BatchIter {
    fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<RoadBatch<B>>> {
        if self.batch_size == 0 || self.cursor >= self.indices.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let slice = &self.indices[self.cursor..end];
        self.cursor = end;

        let t_load = Instant::now();
        let shape = self.cfg.image_shape;
        let pixel_scale = self.cfg.pixel_scale;
        let mut samples = slice
            .par_iter()
            .map(|idx| load_sample(idx, shape, pixel_scale))
            .collect::<DatasetResult<Vec<_>>>()?;
        for sample in &mut samples {
            maybe_flip(sample, self.cfg.flip_horizontal_prob, &mut self.rng);
        }
        let batch = assemble(&samples, device)?;

        self.processed_batches += 1;
        log::debug!(
            "[dataset] batch={} samples={} load_ms={:.2}",
            self.processed_batches,
            samples.len(),
            t_load.elapsed().as_secs_f64() * 1000.0
        );
        Ok(Some(batch))
    }
}

/// Decoded samples held in memory; useful for synthetic data and small sets.
#[derive(Debug, Clone)]
pub struct MemorySource {
    samples: Arc<Vec<RoadSample>>,
}

impl MemorySource {
    pub fn new(samples: Vec<RoadSample>) -> DatasetResult<Self> {
        if let Some(first) = samples.first() {
            if samples
                .iter()
                .any(|s| s.shape != first.shape || s.num_classes != first.num_classes)
            {
                return Err(RoadDatasetError::Other(
                    "memory source samples must share shape and class count".into(),
                ));
            }
        }
        Ok(Self {
            samples: Arc::new(samples),
        })
    }
}

impl BatchSource for MemorySource {
    type Stream = MemoryStream;

    fn batches(&self, batch_size: usize) -> MemoryStream {
        MemoryStream {
            samples: Arc::clone(&self.samples),
            cursor: 0,
            batch_size,
        }
    }

    fn num_samples(&self) -> usize {
        self.samples.len()
    }
}

pub struct MemoryStream {
    samples: Arc<Vec<RoadSample>>,
    cursor: usize,
    batch_size: usize,
}

impl BatchStream for MemoryStream {
    fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<RoadBatch<B>>> {
        if self.batch_size == 0 || self.cursor >= self.samples.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.samples.len());
        let batch = assemble(&self.samples[self.cursor..end], device)?;
        self.cursor = end;
        Ok(Some(batch))
    }
}
