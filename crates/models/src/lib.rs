//! Burn models for FCN-8s road segmentation.
//!
//! - `Vgg16Backbone`: fully convolutional VGG16 exposing the stride 8/16/32 taps.
//! - `Fcn8sDecoder`: 1x1 score projections, learned upsampling and skip fusion.
//! - `Fcn8s`: backbone + decoder as one trainable module.
//! - `bundle`: loading and saving pretrained backbone bundles.
//!
//! These are plain Burn modules. Losses and optimizers live in the `training` crate.

pub mod bundle;
pub mod fcn;
pub mod vgg;

pub use bundle::{
    load_backbone, save_backbone_bundle, BackboneError, BackboneManifest, LoadedBackbone,
    VGG_TAG,
};
pub use fcn::{Fcn8s, Fcn8sConfig, Fcn8sDecoder, Fcn8sDecoderConfig, ShapeError, SkipScales};
pub use vgg::{BackboneFeatures, Vgg16Backbone, Vgg16BackboneConfig};

pub mod prelude {
    pub use super::{
        BackboneFeatures, Fcn8s, Fcn8sConfig, Fcn8sDecoder, Fcn8sDecoderConfig, SkipScales,
        Vgg16Backbone, Vgg16BackboneConfig,
    };
}
