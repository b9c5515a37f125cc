//! Pretrained backbone bundles.
//!
//! A bundle is a directory holding `bundle.json` (tag, weight file name, backbone
//! config) and a burn binary record with the backbone weights. Loading validates the
//! tag, the record and the shape of every feature tap once, so later code can rely on
//! the typed [`BackboneFeatures`](crate::BackboneFeatures) without further checks.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vgg::{
    Vgg16Backbone, Vgg16BackboneConfig, LAYER3_STRIDE, LAYER4_STRIDE, LAYER7_STRIDE,
};

/// Tag identifying a VGG16 backbone bundle.
pub const VGG_TAG: &str = "vgg16";
pub const MANIFEST_FILE: &str = "bundle.json";
pub const DEFAULT_WEIGHTS_FILE: &str = "vgg16.bin";

/// Side of the square probe image used to validate the feature taps.
const PROBE_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum BackboneError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bundle manifest at {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("bundle tag mismatch: expected {expected}, found {found}")]
    TagMismatch { expected: String, found: String },
    #[error("backbone weights missing at {path}")]
    MissingWeights { path: PathBuf },
    #[error("failed to read backbone record {path}: {msg}")]
    Record { path: PathBuf, msg: String },
    #[error("{layer} has shape {actual:?}, expected {expected:?}")]
    FeatureShape {
        layer: &'static str,
        expected: [usize; 4],
        actual: [usize; 4],
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneManifest {
    pub tag: String,
    /// Weight record file name, relative to the bundle directory.
    pub weights: String,
    pub config: Vgg16BackboneConfig,
}

impl BackboneManifest {
    pub fn vgg16(config: Vgg16BackboneConfig) -> Self {
        Self {
            tag: VGG_TAG.to_string(),
            weights: DEFAULT_WEIGHTS_FILE.to_string(),
            config,
        }
    }
}

/// A restored, shape-checked backbone.
#[derive(Debug)]
pub struct LoadedBackbone<B: Backend> {
    pub backbone: Vgg16Backbone<B>,
    pub config: Vgg16BackboneConfig,
    pub manifest: BackboneManifest,
}

pub fn read_manifest(bundle_dir: &Path) -> Result<BackboneManifest, BackboneError> {
    let path = bundle_dir.join(MANIFEST_FILE);
    let raw = fs::read(&path).map_err(|source| BackboneError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| BackboneError::Manifest { path, source })
}

pub fn load_backbone<B: Backend>(
    bundle_dir: &Path,
    device: &B::Device,
) -> Result<LoadedBackbone<B>, BackboneError> {
    let manifest = read_manifest(bundle_dir)?;
    if manifest.tag != VGG_TAG {
        return Err(BackboneError::TagMismatch {
            expected: VGG_TAG.to_string(),
            found: manifest.tag,
        });
    }

    let weights = bundle_dir.join(&manifest.weights);
    if !weights.exists() {
        return Err(BackboneError::MissingWeights { path: weights });
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let backbone = Vgg16Backbone::<B>::new(manifest.config, device)
        .load_file(weights.as_path(), &recorder, device)
        .map_err(|e| BackboneError::Record {
            path: weights.clone(),
            msg: e.to_string(),
        })?;

    validate_features(&backbone, &manifest.config, device)?;
    log::info!(
        "loaded {} backbone from {} (width {}, fc {})",
        manifest.tag,
        bundle_dir.display(),
        manifest.config.width,
        manifest.config.fc_channels
    );

    Ok(LoadedBackbone {
        backbone,
        config: manifest.config,
        manifest,
    })
}

/// Writes `bundle.json` and the weight record into `bundle_dir`, creating it if needed.
pub fn save_backbone_bundle<B: Backend>(
    bundle_dir: &Path,
    backbone: &Vgg16Backbone<B>,
    config: Vgg16BackboneConfig,
) -> Result<BackboneManifest, BackboneError> {
    fs::create_dir_all(bundle_dir).map_err(|source| BackboneError::Io {
        path: bundle_dir.to_path_buf(),
        source,
    })?;

    let manifest = BackboneManifest::vgg16(config);
    let weights = bundle_dir.join(&manifest.weights);
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    backbone
        .clone()
        .save_file(weights.clone(), &recorder)
        .map_err(|e| BackboneError::Record {
            path: weights,
            msg: e.to_string(),
        })?;

    let manifest_path = bundle_dir.join(MANIFEST_FILE);
    let json = serde_json::to_vec_pretty(&manifest).map_err(|source| BackboneError::Manifest {
        path: manifest_path.clone(),
        source,
    })?;
    fs::write(&manifest_path, json).map_err(|source| BackboneError::Io {
        path: manifest_path,
        source,
    })?;
    Ok(manifest)
}

/// Runs one probe image through the backbone and checks every tap's channels and stride.
pub fn validate_features<B: Backend>(
    backbone: &Vgg16Backbone<B>,
    config: &Vgg16BackboneConfig,
    device: &B::Device,
) -> Result<(), BackboneError> {
    let probe = Tensor::<B, 4>::zeros([1, config.in_channels, PROBE_SIZE, PROBE_SIZE], device);
    let features = backbone.forward(probe, 1.0);

    let expect = |channels: usize, stride: usize| {
        [1, channels, PROBE_SIZE / stride, PROBE_SIZE / stride]
    };
    for (layer, actual, expected) in [
        (
            "layer3",
            features.layer3.dims(),
            expect(config.layer3_channels(), LAYER3_STRIDE),
        ),
        (
            "layer4",
            features.layer4.dims(),
            expect(config.layer4_channels(), LAYER4_STRIDE),
        ),
        (
            "layer7",
            features.layer7.dims(),
            expect(config.layer7_channels(), LAYER7_STRIDE),
        ),
    ] {
        if actual != expected {
            return Err(BackboneError::FeatureShape {
                layer,
                expected,
                actual,
            });
        }
    }
    Ok(())
}
