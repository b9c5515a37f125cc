//! KITTI road dataset loading and Burn batch iteration.
//!
//! - Indexing the KITTI road layout and decoding image/label pairs
//! - One-hot label encoding and horizontal-flip augmentation
//! - Epoch-at-a-time batch streams behind the `BatchSource` trait

pub mod aug;
pub mod batch;
pub mod kitti;
pub mod types;

pub use batch::{
    assemble, BatchIter, BatchSource, BatchStream, DatasetConfig, KittiRoadDataset,
    MemorySource, MemoryStream,
};
pub use kitti::{
    index_split, load_sample, BACKGROUND_COLOR, KITTI_NUM_CLASSES, TESTING_SPLIT, TRAINING_SPLIT,
};
pub use types::*;
