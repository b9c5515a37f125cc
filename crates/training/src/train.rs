use std::time::Instant;

use anyhow::Context;
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use models::Fcn8s;
use road_dataset::{BatchSource, BatchStream, RoadBatch};

use crate::objective::{scalar_value, SegmentationObjective, StepParams, UpdateOp};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainLoopConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub step: StepParams,
}

impl Default for TrainLoopConfig {
    fn default() -> Self {
        Self {
            epochs: 300,
            batch_size: 25,
            step: StepParams::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    /// Update steps executed across all epochs.
    pub steps: usize,
    /// Mean batch loss per epoch; epochs without batches are skipped.
    pub epoch_mean_losses: Vec<f32>,
    pub last_loss: Option<f32>,
}

/// Runs `cfg.epochs` passes over `source`, one update per batch.
pub fn train_nn<B, S, O>(
    mut model: Fcn8s<B>,
    source: &S,
    update: &mut UpdateOp<O>,
    objective: &SegmentationObjective,
    cfg: &TrainLoopConfig,
    device: &B::Device,
) -> anyhow::Result<(Fcn8s<B>, TrainReport)>
where
    B: AutodiffBackend,
    S: BatchSource,
    O: Optimizer<Fcn8s<B>, B>,
{
    let mut report = TrainReport::default();
    if cfg.epochs == 0 || cfg.batch_size == 0 {
        log::warn!(
            "nothing to train: epochs={} batch_size={}",
            cfg.epochs,
            cfg.batch_size
        );
        return Ok((model, report));
    }

    log::info!(
        "training for {} epochs, batch size {}, {} samples per epoch",
        cfg.epochs,
        cfg.batch_size,
        source.num_samples()
    );
    for epoch in 0..cfg.epochs {
        let t_epoch = Instant::now();
        let mut stream = source.batches(cfg.batch_size);
        let mut losses = Vec::new();
        while let Some(batch) = stream
            .next_batch::<B>(device)
            .with_context(|| format!("loading batch {} of epoch {epoch}", losses.len()))?
        {
            let (next, loss) = train_step(model, batch, update, objective, &cfg.step)
                .with_context(|| format!("step {} of epoch {epoch}", losses.len()))?;
            model = next;
            report.steps += 1;
            report.last_loss = Some(loss);
            log::info!("epoch {epoch} step {} loss {loss:.6}", losses.len());
            losses.push(loss);
        }
        if !losses.is_empty() {
            let mean = losses.iter().sum::<f32>() / losses.len() as f32;
            log::info!(
                "epoch {epoch}: mean loss {mean:.6} over {} batches ({:.1}s)",
                losses.len(),
                t_epoch.elapsed().as_secs_f64()
            );
            report.epoch_mean_losses.push(mean);
        }
    }
    Ok((model, report))
}

/// Forward, loss, backward and optimizer step on one batch. Returns the loss value.
pub fn train_step<B, O>(
    model: Fcn8s<B>,
    batch: RoadBatch<B>,
    update: &mut UpdateOp<O>,
    objective: &SegmentationObjective,
    step: &StepParams,
) -> anyhow::Result<(Fcn8s<B>, f32)>
where
    B: AutodiffBackend,
    O: Optimizer<Fcn8s<B>, B>,
{
    let scores = model.forward(batch.images, step.keep_prob)?;
    let output = objective.build(scores, batch.labels, model.regularization_terms())?;
    let loss_value = scalar_value(output.loss.clone().detach());
    if !loss_value.is_finite() {
        log::warn!("non-finite loss {loss_value}; applying the update anyway");
    }
    let model = update.apply(model, output.loss, step.learning_rate);
    Ok((model, loss_value))
}
