use std::path::PathBuf;

use anyhow::Context;
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use inference::{load_checkpoint, save_checkpoint, save_inference_samples, RoadSegmenter};
use models::{load_backbone, Fcn8s, Fcn8sConfig};
use road_dataset::{ImageShape, KittiRoadDataset, KITTI_NUM_CLASSES};

use crate::config::{ConfigError, TrainConfig};
use crate::objective::{SegmentationObjective, UpdateOp};
use crate::train::{train_nn, TrainReport};
use crate::{ADBackend, TrainBackend};

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "train",
    about = "Train an FCN-8s road segmenter on the KITTI road benchmark"
)]
pub struct TrainArgs {
    /// TOML config file (defaults to $FCN_ROAD_CONFIG, then ./fcn-road.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
    /// Directory holding `vgg/` and `data_road/`.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Checkpoint and inference sample output root.
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long, alias = "lr")]
    pub learning_rate: Option<f64>,
    /// Dropout keep probability during training.
    #[arg(long)]
    pub keep_prob: Option<f64>,
    #[arg(long)]
    pub num_classes: Option<usize>,
    #[arg(long)]
    pub image_height: Option<usize>,
    #[arg(long)]
    pub image_width: Option<usize>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Probability of mirroring a training sample.
    #[arg(long)]
    pub flip_prob: Option<f32>,
    /// Checkpoint output path (defaults to <runs_dir>/fcn8s.bin).
    #[arg(long)]
    pub checkpoint_out: Option<PathBuf>,
    /// Train the decoder only.
    #[arg(long)]
    pub freeze_backbone: bool,
    /// Do not write test-set overlays after training.
    #[arg(long)]
    pub skip_inference: bool,
}

impl TrainArgs {
    /// Config file layered under the command-line overrides, validated.
    pub fn resolve(&self) -> Result<TrainConfig, ConfigError> {
        let mut cfg = TrainConfig::load(self.config.as_deref())?;
        if let Some(dir) = &self.data_dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(dir) = &self.runs_dir {
            cfg.runs_dir = dir.clone();
        }
        if let Some(path) = &self.checkpoint_out {
            cfg.checkpoint_out = Some(path.clone());
        }
        cfg.epochs = self.epochs.unwrap_or(cfg.epochs);
        cfg.batch_size = self.batch_size.unwrap_or(cfg.batch_size);
        cfg.learning_rate = self.learning_rate.unwrap_or(cfg.learning_rate);
        cfg.keep_prob = self.keep_prob.unwrap_or(cfg.keep_prob);
        cfg.num_classes = self.num_classes.unwrap_or(cfg.num_classes);
        cfg.image_shape = ImageShape::new(
            self.image_height.unwrap_or(cfg.image_shape.height),
            self.image_width.unwrap_or(cfg.image_shape.width),
        );
        cfg.seed = self.seed.or(cfg.seed);
        cfg.flip_horizontal_prob = self.flip_prob.unwrap_or(cfg.flip_horizontal_prob);
        cfg.freeze_backbone |= self.freeze_backbone;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub report: TrainReport,
    pub checkpoint: PathBuf,
    pub samples_dir: Option<PathBuf>,
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<RunSummary> {
    if let Some(kind) = args.backend {
        validate_backend_choice(kind)?;
    }
    let cfg = args.resolve()?;
    if cfg.num_classes != KITTI_NUM_CLASSES {
        anyhow::bail!(
            "KITTI road labels have {KITTI_NUM_CLASSES} classes, config asks for {}",
            cfg.num_classes
        );
    }

    let device = <ADBackend as Backend>::Device::default();
    let vgg_dir = cfg.vgg_dir();
    let loaded = load_backbone::<ADBackend>(&vgg_dir, &device)
        .with_context(|| format!("loading backbone bundle from {}", vgg_dir.display()))?;
    let model_config = Fcn8sConfig {
        backbone: loaded.config,
        decoder: cfg.decoder_config(&loaded.config),
    };
    let mut model = Fcn8s::new(loaded.backbone, model_config.decoder.init(&device));
    if cfg.freeze_backbone {
        if cfg.keep_prob < 1.0 {
            log::warn!(
                "backbone is frozen but keep_prob={} still drops its fc features",
                cfg.keep_prob
            );
        }
        model = model.freeze_backbone();
    }

    let training_dir = cfg.training_dir();
    let dataset = KittiRoadDataset::open(&training_dir, cfg.dataset_config())
        .with_context(|| format!("opening training split {}", training_dir.display()))?;
    let objective = SegmentationObjective::new(cfg.num_classes).with_reg_weight(cfg.reg_weight);
    let mut update = UpdateOp::new(AdamConfig::new().with_epsilon(1e-8).init());

    let (model, report) = train_nn(
        model,
        &dataset,
        &mut update,
        &objective,
        &cfg.loop_config(),
        &device,
    )?;

    let checkpoint = cfg.checkpoint_path();
    save_checkpoint(&model, &model_config, &checkpoint)
        .with_context(|| format!("saving checkpoint to {}", checkpoint.display()))?;

    let samples_dir = if args.skip_inference {
        None
    } else {
        let segmenter = RoadSegmenter::<TrainBackend>::new(model.valid(), cfg.image_shape)?
            .with_pixel_scale(cfg.pixel_scale);
        Some(write_samples(&cfg, &segmenter)?)
    };

    Ok(RunSummary {
        report,
        checkpoint,
        samples_dir,
    })
}

#[derive(Parser, Debug)]
#[command(
    name = "infer",
    about = "Write road overlays for the KITTI test split from a trained checkpoint"
)]
pub struct InferArgs {
    /// TOML config file (defaults to $FCN_ROAD_CONFIG, then ./fcn-road.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
    /// Checkpoint to load (defaults to <runs_dir>/fcn8s.bin).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,
    /// Road probability above which a pixel is painted.
    #[arg(long, default_value_t = 0.5)]
    pub threshold: f32,
}

pub fn run_infer(args: InferArgs) -> anyhow::Result<PathBuf> {
    if let Some(kind) = args.backend {
        validate_backend_choice(kind)?;
    }
    let mut cfg = TrainConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        cfg.data_dir = dir;
    }
    if let Some(dir) = args.runs_dir {
        cfg.runs_dir = dir;
    }
    cfg.validate()?;

    let device = <TrainBackend as Backend>::Device::default();
    let checkpoint = args.checkpoint.unwrap_or_else(|| cfg.checkpoint_path());
    let (model, _) = load_checkpoint::<TrainBackend>(&checkpoint, &device)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;
    let segmenter = RoadSegmenter::new(model, cfg.image_shape)?
        .with_pixel_scale(cfg.pixel_scale)
        .with_threshold(args.threshold);
    write_samples(&cfg, &segmenter)
}

fn write_samples(
    cfg: &TrainConfig,
    segmenter: &RoadSegmenter<TrainBackend>,
) -> anyhow::Result<PathBuf> {
    let device = <TrainBackend as Backend>::Device::default();
    save_inference_samples(&cfg.runs_dir, &cfg.data_dir, segmenter, &device).with_context(|| {
        format!(
            "writing inference samples for {}",
            cfg.testing_dir().display()
        )
    })
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            log::warn!("built with backend-wgpu; the WGPU backend is used despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}
