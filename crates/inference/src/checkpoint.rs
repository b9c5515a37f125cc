//! Trained model checkpoints: a Burn record plus a JSON sidecar holding the
//! [`Fcn8sConfig`] needed to rebuild the module before loading it.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use models::{Fcn8s, Fcn8sConfig};

use crate::InferenceError;

/// `runs/fcn8s.bin` -> `runs/fcn8s.json`.
pub fn model_config_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("json")
}

pub fn save_checkpoint<B: Backend>(
    model: &Fcn8s<B>,
    config: &Fcn8sConfig,
    path: &Path,
) -> Result<(), InferenceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| InferenceError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let config_path = model_config_path(path);
    let json = serde_json::to_vec_pretty(config).map_err(|source| InferenceError::Config {
        path: config_path.clone(),
        source,
    })?;
    fs::write(&config_path, json).map_err(|source| InferenceError::Io {
        path: config_path.clone(),
        source,
    })?;

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path, &recorder)
        .map_err(|e| InferenceError::Checkpoint {
            path: path.to_path_buf(),
            msg: format!("failed to save: {e}"),
        })?;
    log::info!("saved checkpoint to {}", path.display());
    Ok(())
}

pub fn load_checkpoint<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(Fcn8s<B>, Fcn8sConfig), InferenceError> {
    let config_path = model_config_path(path);
    let raw = fs::read(&config_path).map_err(|source| InferenceError::Io {
        path: config_path.clone(),
        source,
    })?;
    let config: Fcn8sConfig =
        serde_json::from_slice(&raw).map_err(|source| InferenceError::Config {
            path: config_path.clone(),
            source,
        })?;
    if !path.exists() {
        return Err(InferenceError::Checkpoint {
            path: path.to_path_buf(),
            msg: "record file not found".into(),
        });
    }

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model = config
        .init::<B>(device)
        .load_file(path, &recorder, device)
        .map_err(|e| InferenceError::Checkpoint {
            path: path.to_path_buf(),
            msg: format!("failed to load: {e}"),
        })?;
    log::info!(
        "loaded {}-class checkpoint from {}",
        config.decoder.num_classes,
        path.display()
    );
    Ok((model, config))
}
