//! Training configuration: built-in defaults, then an optional TOML file, then CLI flags.

use std::path::{Path, PathBuf};

use models::{Fcn8sDecoderConfig, SkipScales, Vgg16BackboneConfig};
use road_dataset::{DatasetConfig, ImageShape, TESTING_SPLIT, TRAINING_SPLIT};
use serde::Deserialize;
use thiserror::Error;

use crate::objective::StepParams;
use crate::train::TrainLoopConfig;

pub const DEFAULT_CONFIG_NAME: &str = "fcn-road.toml";
pub const CONFIG_ENV: &str = "FCN_ROAD_CONFIG";
const CHECKPOINT_NAME: &str = "fcn8s.bin";
/// Total downsampling of the backbone; image sides must be multiples of it.
const NETWORK_STRIDE: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub num_classes: usize,
    pub image_shape: ImageShape,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub keep_prob: f64,
    /// Per-layer L2 coefficient of the decoder kernels.
    pub l2_scale: f64,
    /// Weight of the summed L2 penalties in the total loss.
    pub reg_weight: f64,
    pub init_std: f64,
    pub skip_scales: SkipScales,
    pub freeze_backbone: bool,
    pub flip_horizontal_prob: f32,
    pub pixel_scale: f32,
    pub seed: Option<u64>,
    pub data_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub checkpoint_out: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            image_shape: ImageShape::new(160, 576),
            epochs: 300,
            batch_size: 25,
            learning_rate: 0.0009,
            keep_prob: 0.8,
            l2_scale: 1e-3,
            reg_weight: 1e-3,
            init_std: 0.01,
            skip_scales: SkipScales::default(),
            freeze_backbone: false,
            flip_horizontal_prob: 0.0,
            pixel_scale: 1.0,
            seed: None,
            data_dir: PathBuf::from("data"),
            runs_dir: PathBuf::from("runs"),
            checkpoint_out: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrainConfigFile {
    num_classes: Option<usize>,
    image_height: Option<usize>,
    image_width: Option<usize>,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    learning_rate: Option<f64>,
    keep_prob: Option<f64>,
    seed: Option<u64>,
    freeze_backbone: Option<bool>,
    pixel_scale: Option<f32>,
    regularization: Option<RegularizationSection>,
    skip_scales: Option<SkipScalesSection>,
    augment: Option<AugmentSection>,
    paths: Option<PathsSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RegularizationSection {
    l2_scale: Option<f64>,
    weight: Option<f64>,
    init_std: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SkipScalesSection {
    layer3: Option<f64>,
    layer4: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AugmentSection {
    flip_horizontal_prob: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PathsSection {
    data_dir: Option<String>,
    runs_dir: Option<String>,
    checkpoint_out: Option<String>,
}

impl TrainConfig {
    /// Resolves the config file (`explicit`, then `$FCN_ROAD_CONFIG`, then
    /// `./fcn-road.toml` if it exists) and layers it over the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_path(Path::new(&path));
        }
        let default = Path::new(DEFAULT_CONFIG_NAME);
        if default.exists() {
            return Self::from_path(default);
        }
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("loaded training config from {}", path.display());
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        let file: TrainConfigFile = toml::from_str(raw)?;
        Ok(Self::default().with_file(file))
    }

    fn with_file(self, file: TrainConfigFile) -> Self {
        let regularization = file.regularization.unwrap_or_default();
        let skip = file.skip_scales.unwrap_or_default();
        let augment = file.augment.unwrap_or_default();
        let paths = file.paths.unwrap_or_default();
        Self {
            num_classes: file.num_classes.unwrap_or(self.num_classes),
            image_shape: ImageShape::new(
                file.image_height.unwrap_or(self.image_shape.height),
                file.image_width.unwrap_or(self.image_shape.width),
            ),
            epochs: file.epochs.unwrap_or(self.epochs),
            batch_size: file.batch_size.unwrap_or(self.batch_size),
            learning_rate: file.learning_rate.unwrap_or(self.learning_rate),
            keep_prob: file.keep_prob.unwrap_or(self.keep_prob),
            l2_scale: regularization.l2_scale.unwrap_or(self.l2_scale),
            reg_weight: regularization.weight.unwrap_or(self.reg_weight),
            init_std: regularization.init_std.unwrap_or(self.init_std),
            skip_scales: SkipScales {
                layer3: skip.layer3.unwrap_or(self.skip_scales.layer3),
                layer4: skip.layer4.unwrap_or(self.skip_scales.layer4),
            },
            freeze_backbone: file.freeze_backbone.unwrap_or(self.freeze_backbone),
            flip_horizontal_prob: augment
                .flip_horizontal_prob
                .unwrap_or(self.flip_horizontal_prob),
            pixel_scale: file.pixel_scale.unwrap_or(self.pixel_scale),
            seed: file.seed.or(self.seed),
            data_dir: paths.data_dir.map(PathBuf::from).unwrap_or(self.data_dir),
            runs_dir: paths.runs_dir.map(PathBuf::from).unwrap_or(self.runs_dir),
            checkpoint_out: paths.checkpoint_out.map(PathBuf::from).or(self.checkpoint_out),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_classes == 0 {
            return Err(ConfigError::Invalid("num_classes must be at least 1".into()));
        }
        let ImageShape { height, width } = self.image_shape;
        if height == 0 || width == 0 || height % NETWORK_STRIDE != 0 || width % NETWORK_STRIDE != 0
        {
            return Err(ConfigError::Invalid(format!(
                "image shape {height}x{width} must be a positive multiple of {NETWORK_STRIDE}"
            )));
        }
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "keep_prob {} must be in (0, 1]",
                self.keep_prob
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "learning_rate {} must be positive",
                self.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.flip_horizontal_prob) {
            return Err(ConfigError::Invalid(format!(
                "flip_horizontal_prob {} must be in [0, 1]",
                self.flip_horizontal_prob
            )));
        }
        Ok(())
    }

    pub fn vgg_dir(&self) -> PathBuf {
        self.data_dir.join("vgg")
    }

    pub fn training_dir(&self) -> PathBuf {
        self.data_dir.join(TRAINING_SPLIT)
    }

    pub fn testing_dir(&self) -> PathBuf {
        self.data_dir.join(TESTING_SPLIT)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_out
            .clone()
            .unwrap_or_else(|| self.runs_dir.join(CHECKPOINT_NAME))
    }

    pub fn decoder_config(&self, backbone: &Vgg16BackboneConfig) -> Fcn8sDecoderConfig {
        Fcn8sDecoderConfig {
            skip_scales: self.skip_scales,
            init_std: self.init_std,
            l2_scale: self.l2_scale,
            ..Fcn8sDecoderConfig::for_backbone(backbone, self.num_classes)
        }
    }

    pub fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            image_shape: self.image_shape,
            shuffle: true,
            seed: self.seed,
            flip_horizontal_prob: self.flip_horizontal_prob,
            pixel_scale: self.pixel_scale,
        }
    }

    pub fn step_params(&self) -> StepParams {
        StepParams {
            learning_rate: self.learning_rate,
            keep_prob: self.keep_prob,
        }
    }

    pub fn loop_config(&self) -> TrainLoopConfig {
        TrainLoopConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            step: self.step_params(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_hyperparameters() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.num_classes, 2);
        assert_eq!(cfg.image_shape, ImageShape::new(160, 576));
        assert_eq!((cfg.epochs, cfg.batch_size), (300, 25));
        assert_eq!(cfg.step_params().learning_rate, 0.0009);
        assert_eq!(cfg.step_params().keep_prob, 0.8);
        assert_eq!(cfg.vgg_dir(), PathBuf::from("data/vgg"));
        assert_eq!(cfg.training_dir(), PathBuf::from("data/data_road/training"));
        assert_eq!(cfg.checkpoint_path(), PathBuf::from("runs/fcn8s.bin"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let cfg = TrainConfig::from_toml_str(
            r#"
epochs = 3
image_height = 64

[skip_scales]
layer4 = 0.5

[paths]
data_dir = "/tmp/kitti"
"#,
        )
        .unwrap();
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.image_shape, ImageShape::new(64, 576));
        assert_eq!(cfg.skip_scales.layer4, 0.5);
        assert_eq!(cfg.skip_scales.layer3, 1e-4);
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/kitti"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(TrainConfig::from_toml_str("epoch = 3").is_err());
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut cfg = TrainConfig {
            image_shape: ImageShape::new(100, 576),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        cfg.image_shape = ImageShape::new(160, 576);
        cfg.keep_prob = 0.0;
        assert!(cfg.validate().is_err());
        cfg.keep_prob = 1.0;
        cfg.num_classes = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn decoder_config_carries_regularization_settings() {
        let cfg = TrainConfig {
            l2_scale: 0.5,
            ..Default::default()
        };
        let decoder = cfg.decoder_config(&Vgg16BackboneConfig::default());
        assert_eq!(decoder.l2_scale, 0.5);
        assert_eq!(decoder.num_classes, 2);
        assert_eq!(decoder.layer7_channels, 4096);
    }
}
