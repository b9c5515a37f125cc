//! FCN-8s decoder and the full backbone + decoder network.

use burn::module::{Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::Initializer;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vgg::{BackboneFeatures, Vgg16Backbone, Vgg16BackboneConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("{layer} has {actual} channels, decoder expects {expected}")]
    Channels {
        layer: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("skip fusion into {layer}: upsampled shape {upsampled:?} does not match {skip:?}")]
    SkipMismatch {
        layer: &'static str,
        upsampled: [usize; 4],
        skip: [usize; 4],
    },
}

/// Multipliers applied to the shallow feature maps before projection.
///
/// The pretrained VGG weights come from a network whose pool3/pool4 score layers were
/// scaled, so the skip inputs are shrunk to keep the three projections at a similar
/// magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkipScales {
    pub layer3: f64,
    pub layer4: f64,
}

impl Default for SkipScales {
    fn default() -> Self {
        Self {
            layer3: 1e-4,
            layer4: 1e-2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fcn8sDecoderConfig {
    pub num_classes: usize,
    pub layer3_channels: usize,
    pub layer4_channels: usize,
    pub layer7_channels: usize,
    pub skip_scales: SkipScales,
    /// Std of the zero-mean Gaussian used for every decoder kernel.
    pub init_std: f64,
    /// L2 coefficient of each decoder layer's penalty term.
    pub l2_scale: f64,
}

impl Default for Fcn8sDecoderConfig {
    fn default() -> Self {
        Self::for_backbone(&Vgg16BackboneConfig::default(), 2)
    }
}

impl Fcn8sDecoderConfig {
    pub fn for_backbone(backbone: &Vgg16BackboneConfig, num_classes: usize) -> Self {
        Self {
            num_classes,
            layer3_channels: backbone.layer3_channels(),
            layer4_channels: backbone.layer4_channels(),
            layer7_channels: backbone.layer7_channels(),
            skip_scales: SkipScales::default(),
            init_std: 0.01,
            l2_scale: 1e-3,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Fcn8sDecoder<B> {
        Fcn8sDecoder::new(self, device)
    }
}

#[derive(Debug, Module)]
pub struct Fcn8sDecoder<B: Backend> {
    score_layer7: Conv2d<B>,
    score_layer4: Conv2d<B>,
    score_layer3: Conv2d<B>,
    upsample_layer7: ConvTranspose2d<B>,
    upsample_layer4: ConvTranspose2d<B>,
    upsample_output: ConvTranspose2d<B>,
    layer3_scale: f64,
    layer4_scale: f64,
    l2_scale: f64,
    num_classes: usize,
    layer3_channels: usize,
    layer4_channels: usize,
    layer7_channels: usize,
}

impl<B: Backend> Fcn8sDecoder<B> {
    pub fn new(cfg: &Fcn8sDecoderConfig, device: &B::Device) -> Self {
        let classes = cfg.num_classes.max(1);
        let init = Initializer::Normal {
            mean: 0.0,
            std: cfg.init_std,
        };
        // Kernels draw from `init`; biases start at zero.
        let project = |channels: usize| {
            let mut conv = Conv2dConfig::new([channels, classes], [1, 1])
                .with_initializer(init.clone())
                .init(device);
            conv.bias = conv.bias.map(zero_param);
            conv
        };
        // Padding is chosen so each output is exactly `stride` times the input.
        let upsample = |kernel: usize, stride: usize| {
            let pad = (kernel - stride) / 2;
            let mut deconv = ConvTranspose2dConfig::new([classes, classes], [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding([pad, pad])
                .with_initializer(init.clone())
                .init(device);
            deconv.bias = deconv.bias.map(zero_param);
            deconv
        };

        Self {
            score_layer7: project(cfg.layer7_channels),
            score_layer4: project(cfg.layer4_channels),
            score_layer3: project(cfg.layer3_channels),
            upsample_layer7: upsample(4, 2),
            upsample_layer4: upsample(4, 2),
            upsample_output: upsample(16, 8),
            layer3_scale: cfg.skip_scales.layer3,
            layer4_scale: cfg.skip_scales.layer4,
            l2_scale: cfg.l2_scale,
            num_classes: classes,
            layer3_channels: cfg.layer3_channels,
            layer4_channels: cfg.layer4_channels,
            layer7_channels: cfg.layer7_channels,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Decodes backbone features into raw per-pixel class scores,
    /// `[batch, num_classes, 8 * H3, 8 * W3]` where `H3 x W3` is the `layer3` size.
    pub fn forward(&self, features: BackboneFeatures<B>) -> Result<Tensor<B, 4>, ShapeError> {
        self.check_shapes(&features)?;
        let BackboneFeatures {
            layer3,
            layer4,
            layer7,
        } = features;

        let score7 = self.score_layer7.forward(layer7);
        let score4 = self.score_layer4.forward(layer4.mul_scalar(self.layer4_scale));
        let score3 = self.score_layer3.forward(layer3.mul_scalar(self.layer3_scale));

        let fused4 = self.upsample_layer7.forward(score7) + score4;
        let fused3 = self.upsample_layer4.forward(fused4) + score3;
        Ok(self.upsample_output.forward(fused3))
    }

    /// One L2 penalty per regularized layer, `l2_scale * sum(w^2) / 2` over its kernel.
    ///
    /// Penalties are not folded into any loss here; the caller sums the returned terms.
    pub fn regularization_terms(&self) -> Vec<Tensor<B, 1>> {
        vec![
            l2_penalty(self.score_layer7.weight.val(), self.l2_scale),
            l2_penalty(self.score_layer4.weight.val(), self.l2_scale),
            l2_penalty(self.score_layer3.weight.val(), self.l2_scale),
            l2_penalty(self.upsample_layer7.weight.val(), self.l2_scale),
            l2_penalty(self.upsample_layer4.weight.val(), self.l2_scale),
            l2_penalty(self.upsample_output.weight.val(), self.l2_scale),
        ]
    }

    fn check_shapes(&self, features: &BackboneFeatures<B>) -> Result<(), ShapeError> {
        let d3 = features.layer3.dims();
        let d4 = features.layer4.dims();
        let d7 = features.layer7.dims();

        for (layer, dims, expected) in [
            ("layer3", d3, self.layer3_channels),
            ("layer4", d4, self.layer4_channels),
            ("layer7", d7, self.layer7_channels),
        ] {
            if dims[1] != expected {
                return Err(ShapeError::Channels {
                    layer,
                    expected,
                    actual: dims[1],
                });
            }
        }

        let up7 = [d7[0], self.num_classes, d7[2] * 2, d7[3] * 2];
        let skip4 = [d4[0], self.num_classes, d4[2], d4[3]];
        if up7 != skip4 {
            return Err(ShapeError::SkipMismatch {
                layer: "layer4",
                upsampled: up7,
                skip: skip4,
            });
        }
        let up4 = [d4[0], self.num_classes, d4[2] * 2, d4[3] * 2];
        let skip3 = [d3[0], self.num_classes, d3[2], d3[3]];
        if up4 != skip3 {
            return Err(ShapeError::SkipMismatch {
                layer: "layer3",
                upsampled: up4,
                skip: skip3,
            });
        }
        Ok(())
    }
}

fn zero_param<B: Backend>(bias: Param<Tensor<B, 1>>) -> Param<Tensor<B, 1>> {
    Param::from_tensor(bias.val().zeros_like())
}

fn l2_penalty<B: Backend>(weight: Tensor<B, 4>, scale: f64) -> Tensor<B, 1> {
    weight.powf_scalar(2.0).sum().mul_scalar(scale / 2.0)
}

/// Everything needed to rebuild an [`Fcn8s`] before loading a checkpoint into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fcn8sConfig {
    pub backbone: Vgg16BackboneConfig,
    pub decoder: Fcn8sDecoderConfig,
}

impl Fcn8sConfig {
    pub fn new(backbone: Vgg16BackboneConfig, num_classes: usize) -> Self {
        Self {
            backbone,
            decoder: Fcn8sDecoderConfig::for_backbone(&backbone, num_classes),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Fcn8s<B> {
        Fcn8s {
            backbone: self.backbone.init(device),
            decoder: self.decoder.init(device),
        }
    }
}

#[derive(Debug, Module)]
pub struct Fcn8s<B: Backend> {
    pub backbone: Vgg16Backbone<B>,
    pub decoder: Fcn8sDecoder<B>,
}

impl<B: Backend> Fcn8s<B> {
    pub fn new(backbone: Vgg16Backbone<B>, decoder: Fcn8sDecoder<B>) -> Self {
        Self { backbone, decoder }
    }

    pub fn forward(&self, images: Tensor<B, 4>, keep_prob: f64) -> Result<Tensor<B, 4>, ShapeError> {
        let features = self.backbone.forward(images, keep_prob);
        self.decoder.forward(features)
    }

    pub fn regularization_terms(&self) -> Vec<Tensor<B, 1>> {
        self.decoder.regularization_terms()
    }

    pub fn num_classes(&self) -> usize {
        self.decoder.num_classes()
    }

    /// Stops gradient tracking for the backbone; only the decoder is trained afterwards.
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.no_grad();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type B = burn_ndarray::NdArray<f32>;

    fn features(batch: usize, h: usize, w: usize, cfg: &Fcn8sDecoderConfig) -> BackboneFeatures<B> {
        let device = Default::default();
        BackboneFeatures {
            layer3: Tensor::ones([batch, cfg.layer3_channels, h / 8, w / 8], &device),
            layer4: Tensor::ones([batch, cfg.layer4_channels, h / 16, w / 16], &device),
            layer7: Tensor::ones([batch, cfg.layer7_channels, h / 32, w / 32], &device),
        }
    }

    fn small_config(num_classes: usize) -> Fcn8sDecoderConfig {
        let backbone = Vgg16BackboneConfig {
            width: 2,
            fc_channels: 6,
            in_channels: 3,
        };
        Fcn8sDecoderConfig::for_backbone(&backbone, num_classes)
    }

    #[test]
    fn output_matches_input_resolution_for_any_class_count() {
        let device = Default::default();
        for num_classes in 1..=4 {
            let cfg = small_config(num_classes);
            let decoder = cfg.init::<B>(&device);
            let scores = decoder
                .forward(features(2, 64, 96, &cfg))
                .expect("strides 8/16/32 compose");
            assert_eq!(scores.dims(), [2, num_classes, 64, 96]);
        }
    }

    #[test]
    fn mismatched_skip_is_reported() {
        let device = Default::default();
        let cfg = small_config(2);
        let decoder = cfg.init::<B>(&device);
        let mut feats = features(1, 64, 64, &cfg);
        feats.layer4 = Tensor::ones([1, cfg.layer4_channels, 3, 4], &device);

        let err = decoder.forward(feats).unwrap_err();
        assert!(matches!(err, ShapeError::SkipMismatch { layer: "layer4", .. }));
    }

    #[test]
    fn wrong_channel_count_is_reported() {
        let device = Default::default();
        let cfg = small_config(2);
        let decoder = cfg.init::<B>(&device);
        let mut feats = features(1, 64, 64, &cfg);
        feats.layer7 = Tensor::ones([1, cfg.layer7_channels + 1, 2, 2], &device);

        let err = decoder.forward(feats).unwrap_err();
        assert_eq!(
            err,
            ShapeError::Channels {
                layer: "layer7",
                expected: cfg.layer7_channels,
                actual: cfg.layer7_channels + 1,
            }
        );
    }

    #[test]
    fn fresh_decoder_maps_zero_features_to_zero_scores() {
        let device = Default::default();
        let cfg = small_config(2);
        let decoder = cfg.init::<B>(&device);
        let feats = BackboneFeatures {
            layer3: Tensor::zeros([1, cfg.layer3_channels, 4, 8], &device),
            layer4: Tensor::zeros([1, cfg.layer4_channels, 2, 4], &device),
            layer7: Tensor::zeros([1, cfg.layer7_channels, 1, 2], &device),
        };
        let scores = decoder.forward(feats).unwrap();
        assert_eq!(scores.dims(), [1, 2, 32, 64]);
        let values = scores.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn every_regularized_layer_contributes_a_positive_penalty() {
        let device = Default::default();
        let decoder = small_config(2).init::<B>(&device);
        let terms = decoder.regularization_terms();
        assert_eq!(terms.len(), 6);
        for term in terms {
            let value = term.into_data().to_vec::<f32>().unwrap_or_default()[0];
            assert!(value > 0.0 && value.is_finite());
        }
    }

    #[test]
    fn full_network_keeps_input_resolution() {
        let device = Default::default();
        let cfg = Fcn8sConfig::new(
            Vgg16BackboneConfig {
                width: 2,
                fc_channels: 4,
                in_channels: 3,
            },
            2,
        );
        let model = cfg.init::<B>(&device);
        let images = Tensor::<B, 4>::zeros([1, 3, 32, 64], &device);
        let scores = model.forward(images, 1.0).expect("forward");
        assert_eq!(scores.dims(), [1, 2, 32, 64]);
    }
}
