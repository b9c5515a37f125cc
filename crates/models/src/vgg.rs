//! VGG16 feature extractor in its fully convolutional form.
//!
//! The classifier head is replaced by `fc6` (7x7 conv) and `fc7` (1x1 conv) so the
//! network accepts arbitrary input sizes. Three taps are exposed for FCN skip fusion:
//! the block-3 pool (stride 8), the block-4 pool (stride 16) and the `fc7` output
//! (stride 32).

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{DropoutConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Spatial stride of `layer3` relative to the input image.
pub const LAYER3_STRIDE: usize = 8;
/// Spatial stride of `layer4` relative to the input image.
pub const LAYER4_STRIDE: usize = 16;
/// Spatial stride of `layer7` relative to the input image.
pub const LAYER7_STRIDE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vgg16BackboneConfig {
    /// Channels of the first conv block; later blocks use 2x, 4x, 8x, 8x.
    pub width: usize,
    /// Channels of the `fc6`/`fc7` convolutions.
    pub fc_channels: usize,
    pub in_channels: usize,
}

impl Default for Vgg16BackboneConfig {
    fn default() -> Self {
        Self {
            width: 64,
            fc_channels: 4096,
            in_channels: 3,
        }
    }
}

impl Vgg16BackboneConfig {
    pub fn layer3_channels(&self) -> usize {
        self.width * 4
    }

    pub fn layer4_channels(&self) -> usize {
        self.width * 8
    }

    pub fn layer7_channels(&self) -> usize {
        self.fc_channels
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg16Backbone<B> {
        Vgg16Backbone::new(*self, device)
    }
}

/// The three feature maps consumed by the decoder, channel-first.
#[derive(Debug, Clone)]
pub struct BackboneFeatures<B: Backend> {
    /// Block-3 pool output, `[batch, 4*width, H/8, W/8]`.
    pub layer3: Tensor<B, 4>,
    /// Block-4 pool output, `[batch, 8*width, H/16, W/16]`.
    pub layer4: Tensor<B, 4>,
    /// `fc7` output after dropout, `[batch, fc_channels, H/32, W/32]`.
    pub layer7: Tensor<B, 4>,
}

#[derive(Debug, Module)]
pub struct VggBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> VggBlock<B> {
    fn new(in_channels: usize, out_channels: usize, depth: usize, device: &B::Device) -> Self {
        let mut convs = Vec::with_capacity(depth);
        let mut channels = in_channels;
        for _ in 0..depth {
            convs.push(
                Conv2dConfig::new([channels, out_channels], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
            channels = out_channels;
        }
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        Self { convs, pool }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input;
        for conv in &self.convs {
            x = relu(conv.forward(x));
        }
        self.pool.forward(x)
    }
}

#[derive(Debug, Module)]
pub struct Vgg16Backbone<B: Backend> {
    block1: VggBlock<B>,
    block2: VggBlock<B>,
    block3: VggBlock<B>,
    block4: VggBlock<B>,
    block5: VggBlock<B>,
    fc6: Conv2d<B>,
    fc7: Conv2d<B>,
}

impl<B: Backend> Vgg16Backbone<B> {
    pub fn new(cfg: Vgg16BackboneConfig, device: &B::Device) -> Self {
        let w = cfg.width.max(1);
        let fc = cfg.fc_channels.max(1);
        Self {
            block1: VggBlock::new(cfg.in_channels, w, 2, device),
            block2: VggBlock::new(w, w * 2, 2, device),
            block3: VggBlock::new(w * 2, w * 4, 3, device),
            block4: VggBlock::new(w * 4, w * 8, 3, device),
            block5: VggBlock::new(w * 8, w * 8, 3, device),
            fc6: Conv2dConfig::new([w * 8, fc], [7, 7])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            fc7: Conv2dConfig::new([fc, fc], [1, 1]).init(device),
        }
    }

    /// Runs the backbone on `[batch, in_channels, H, W]` images.
    ///
    /// `keep_prob` is the dropout keep probability for `fc6`/`fc7`; dropout is a no-op
    /// on backends without autodiff, so inference callers usually pass `1.0`.
    pub fn forward(&self, images: Tensor<B, 4>, keep_prob: f64) -> BackboneFeatures<B> {
        let dropout = DropoutConfig::new((1.0 - keep_prob).clamp(0.0, 1.0)).init();

        let x = self.block1.forward(images);
        let x = self.block2.forward(x);
        let layer3 = self.block3.forward(x);
        let layer4 = self.block4.forward(layer3.clone());
        let x = self.block5.forward(layer4.clone());

        let x = dropout.forward(relu(self.fc6.forward(x)));
        let layer7 = dropout.forward(relu(self.fc7.forward(x)));

        BackboneFeatures {
            layer3,
            layer4,
            layer7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type B = burn_ndarray::NdArray<f32>;

    #[test]
    fn taps_have_expected_strides_and_channels() {
        let device = Default::default();
        let cfg = Vgg16BackboneConfig {
            width: 2,
            fc_channels: 8,
            in_channels: 3,
        };
        let backbone = cfg.init::<B>(&device);
        let images = Tensor::<B, 4>::zeros([2, 3, 64, 96], &device);

        let features = backbone.forward(images, 0.8);

        assert_eq!(features.layer3.dims(), [2, 8, 64 / LAYER3_STRIDE, 96 / LAYER3_STRIDE]);
        assert_eq!(features.layer4.dims(), [2, 16, 64 / LAYER4_STRIDE, 96 / LAYER4_STRIDE]);
        assert_eq!(features.layer7.dims(), [2, 8, 64 / LAYER7_STRIDE, 96 / LAYER7_STRIDE]);
    }

    #[test]
    fn default_config_matches_vgg16() {
        let cfg = Vgg16BackboneConfig::default();
        assert_eq!(cfg.layer3_channels(), 256);
        assert_eq!(cfg.layer4_channels(), 512);
        assert_eq!(cfg.layer7_channels(), 4096);
    }
}
