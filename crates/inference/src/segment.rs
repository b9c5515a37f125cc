use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use image::imageops::FilterType;
use image::RgbImage;
use models::Fcn8s;
use road_dataset::kitti::{image_to_chw, resize_rgb};
use road_dataset::ImageShape;

use crate::overlay::{blend_mask, ROAD_OVERLAY};
use crate::InferenceError;

/// Runs a trained model on single images and marks road pixels.
#[derive(Debug)]
pub struct RoadSegmenter<B: Backend> {
    model: Fcn8s<B>,
    image_shape: ImageShape,
    pixel_scale: f32,
    threshold: f32,
    road_class: usize,
}

impl<B: Backend> RoadSegmenter<B> {
    pub fn new(model: Fcn8s<B>, image_shape: ImageShape) -> Result<Self, InferenceError> {
        let road_class = 1;
        if road_class >= model.num_classes() {
            return Err(InferenceError::RoadClass {
                road_class,
                num_classes: model.num_classes(),
            });
        }
        Ok(Self {
            model,
            image_shape,
            pixel_scale: 1.0,
            threshold: 0.5,
            road_class,
        })
    }

    /// Must match the scale the model was trained with.
    pub fn with_pixel_scale(mut self, pixel_scale: f32) -> Self {
        self.pixel_scale = pixel_scale;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn image_shape(&self) -> ImageShape {
        self.image_shape
    }

    /// Softmax road probability per pixel of `img` resized to the model shape, row-major.
    pub fn road_probabilities(
        &self,
        img: &RgbImage,
        device: &B::Device,
    ) -> Result<Vec<f32>, InferenceError> {
        let resized = resize_rgb(img, self.image_shape, FilterType::Triangle);
        self.probabilities_of_resized(&resized, device)
    }

    /// The resized image with road pixels tinted green.
    pub fn segment(&self, img: &RgbImage, device: &B::Device) -> Result<RgbImage, InferenceError> {
        let resized = resize_rgb(img, self.image_shape, FilterType::Triangle);
        let probs = self.probabilities_of_resized(&resized, device)?;
        let mask: Vec<bool> = probs.iter().map(|&p| p > self.threshold).collect();
        Ok(blend_mask(&resized, &mask, ROAD_OVERLAY))
    }

    fn probabilities_of_resized(
        &self,
        resized: &RgbImage,
        device: &B::Device,
    ) -> Result<Vec<f32>, InferenceError> {
        let ImageShape { height, width } = self.image_shape;
        let chw = image_to_chw(resized, self.pixel_scale);
        let input = Tensor::<B, 1>::from_floats(chw.as_slice(), device).reshape([1, 3, height, width]);
        let scores = self.model.forward(input, 1.0)?;
        let road = softmax(scores, 1).slice([
            0..1,
            self.road_class..self.road_class + 1,
            0..height,
            0..width,
        ]);
        tensor_values(road)
    }
}

fn tensor_values<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<Vec<f32>, InferenceError> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| InferenceError::TensorData(format!("{e:?}")))
}
