#![recursion_limit = "256"]

pub mod config;
pub mod objective;
pub mod train;
pub mod util;

use burn::backend::Autodiff;

pub use config::{ConfigError, TrainConfig};
pub use objective::{
    ObjectiveError, ObjectiveOutput, SegmentationObjective, StepParams, UpdateOp,
};
pub use train::{train_nn, train_step, TrainLoopConfig, TrainReport};
pub use util::{run_infer, run_train, InferArgs, RunSummary, TrainArgs};

/// Backend alias for training/inference (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type ADBackend = Autodiff<TrainBackend>;
