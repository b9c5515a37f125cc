//! Segmentation loss and the optimizer update.

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObjectiveError {
    #[error("scores {scores:?} and labels {labels:?} differ in shape")]
    ShapeMismatch { scores: [usize; 4], labels: [usize; 4] },
    #[error("expected {expected} class channels, got {actual}")]
    ClassCount { expected: usize, actual: usize },
}

/// Per-step hyperparameters fed to every update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    pub learning_rate: f64,
    pub keep_prob: f64,
}

impl Default for StepParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.0009,
            keep_prob: 0.8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectiveOutput<B: Backend> {
    /// Scores flattened to `[N * H * W, num_classes]`.
    pub logits: Tensor<B, 2>,
    pub loss: Tensor<B, 1>,
    pub cross_entropy: Tensor<B, 1>,
    /// Sum of the per-layer penalties, before weighting.
    pub regularization: Tensor<B, 1>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentationObjective {
    pub num_classes: usize,
    pub reg_weight: f64,
}

impl SegmentationObjective {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            reg_weight: 1e-3,
        }
    }

    pub fn with_reg_weight(mut self, reg_weight: f64) -> Self {
        self.reg_weight = reg_weight;
        self
    }

    /// Mean softmax cross-entropy over every pixel plus the weighted penalty sum.
    pub fn build<B: Backend>(
        &self,
        scores: Tensor<B, 4>,
        labels: Tensor<B, 4>,
        penalties: Vec<Tensor<B, 1>>,
    ) -> Result<ObjectiveOutput<B>, ObjectiveError> {
        let (score_dims, label_dims) = (scores.dims(), labels.dims());
        if score_dims[1] != self.num_classes {
            return Err(ObjectiveError::ClassCount {
                expected: self.num_classes,
                actual: score_dims[1],
            });
        }
        if score_dims != label_dims {
            return Err(ObjectiveError::ShapeMismatch {
                scores: score_dims,
                labels: label_dims,
            });
        }

        let device = scores.device();
        let logits = flatten_class_scores(scores);
        let targets = flatten_class_scores(labels);
        let cross_entropy = softmax_cross_entropy(logits.clone(), targets);
        let regularization = if penalties.is_empty() {
            Tensor::zeros([1], &device)
        } else {
            Tensor::cat(penalties, 0).sum()
        };
        let loss = cross_entropy.clone() + regularization.clone().mul_scalar(self.reg_weight);
        Ok(ObjectiveOutput {
            logits,
            loss,
            cross_entropy,
            regularization,
        })
    }
}

/// `[N, C, H, W]` -> `[N * H * W, C]`, one row per pixel.
pub fn flatten_class_scores<B: Backend>(tensor: Tensor<B, 4>) -> Tensor<B, 2> {
    let [n, c, h, w] = tensor.dims();
    tensor.permute([0, 2, 3, 1]).reshape([n * h * w, c])
}

/// Mean over rows of `-sum(target * log_softmax(logits))`.
pub fn softmax_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 1);
    (targets * log_probs).sum_dim(1).neg().mean()
}

pub fn scalar_value<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(f32::NAN)
}

/// Backpropagates a loss and applies one optimizer step to the model.
pub struct UpdateOp<O> {
    optimizer: O,
    steps: usize,
}

impl<O> UpdateOp<O> {
    pub fn new(optimizer: O) -> Self {
        Self { optimizer, steps: 0 }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn apply<B, M>(&mut self, model: M, loss: Tensor<B, 1>, learning_rate: f64) -> M
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        self.steps += 1;
        self.optimizer.step(learning_rate, model, grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type B = burn_ndarray::NdArray<f32>;

    fn one_hot_road(n: usize, h: usize, w: usize) -> Tensor<B, 4> {
        let device = Default::default();
        let background = Tensor::<B, 4>::zeros([n, 1, h, w], &device);
        let road = Tensor::<B, 4>::ones([n, 1, h, w], &device);
        Tensor::cat(vec![background, road], 1)
    }

    #[test]
    fn flattened_logits_and_labels_share_leading_dims() {
        let device = Default::default();
        let scores = Tensor::<B, 4>::zeros([2, 2, 3, 5], &device);
        let labels = one_hot_road(2, 3, 5);
        let out = SegmentationObjective::new(2)
            .build(scores, labels.clone(), Vec::new())
            .unwrap();
        assert_eq!(out.logits.dims(), [30, 2]);
        assert_eq!(flatten_class_scores(labels).dims(), [30, 2]);
    }

    #[test]
    fn uniform_scores_give_log_two_cross_entropy() {
        let device = Default::default();
        let scores = Tensor::<B, 4>::zeros([1, 2, 2, 2], &device);
        let out = SegmentationObjective::new(2)
            .build(scores, one_hot_road(1, 2, 2), Vec::new())
            .unwrap();
        let ce = scalar_value(out.cross_entropy);
        assert!((ce - std::f32::consts::LN_2).abs() < 1e-5, "{ce}");
        assert_eq!(scalar_value(out.regularization), 0.0);
    }

    #[test]
    fn penalties_are_summed_and_weighted() {
        let device = Default::default();
        let scores = Tensor::<B, 4>::zeros([1, 2, 2, 2], &device);
        let penalties = vec![
            Tensor::<B, 1>::from_floats([3.0], &device),
            Tensor::<B, 1>::from_floats([7.0], &device),
        ];
        let out = SegmentationObjective::new(2)
            .build(scores, one_hot_road(1, 2, 2), penalties)
            .unwrap();
        let ce = scalar_value(out.cross_entropy);
        let loss = scalar_value(out.loss);
        assert_eq!(scalar_value(out.regularization), 10.0);
        assert!((loss - ce - 0.01).abs() < 1e-5);
        assert!(loss >= 0.0);
    }

    #[test]
    fn confident_correct_scores_have_small_loss() {
        let device = Default::default();
        let background = Tensor::<B, 4>::full([1, 1, 2, 2], -10.0, &device);
        let road = Tensor::<B, 4>::full([1, 1, 2, 2], 10.0, &device);
        let scores = Tensor::cat(vec![background, road], 1);
        let out = SegmentationObjective::new(2)
            .build(scores, one_hot_road(1, 2, 2), Vec::new())
            .unwrap();
        assert!(scalar_value(out.loss) < 1e-3);
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let device = Default::default();
        let objective = SegmentationObjective::new(2);

        let three_class = Tensor::<B, 4>::zeros([1, 3, 2, 2], &device);
        let err = objective
            .build(three_class, one_hot_road(1, 2, 2), Vec::new())
            .unwrap_err();
        assert_eq!(err, ObjectiveError::ClassCount { expected: 2, actual: 3 });

        let scores = Tensor::<B, 4>::zeros([1, 2, 4, 4], &device);
        let err = objective
            .build(scores, one_hot_road(1, 2, 2), Vec::new())
            .unwrap_err();
        assert!(matches!(err, ObjectiveError::ShapeMismatch { .. }));
    }
}
