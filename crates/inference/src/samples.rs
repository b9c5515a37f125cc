use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use burn::tensor::backend::Backend;
use road_dataset::kitti::{list_pngs, open_rgb, IMAGE_DIR};
use road_dataset::TESTING_SPLIT;

use crate::segment::RoadSegmenter;
use crate::InferenceError;

/// Segments every test image under `data_dir` and writes the overlays to
/// `runs_dir/<unix seconds>/`. Returns that directory.
pub fn save_inference_samples<B: Backend>(
    runs_dir: &Path,
    data_dir: &Path,
    segmenter: &RoadSegmenter<B>,
    device: &B::Device,
) -> Result<PathBuf, InferenceError> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let output_dir = runs_dir.join(stamp.to_string());
    let images_dir = data_dir.join(TESTING_SPLIT).join(IMAGE_DIR);
    let written = write_overlays(&images_dir, &output_dir, segmenter, device)?;
    log::info!(
        "saved {written} inference samples to {}",
        output_dir.display()
    );
    Ok(output_dir)
}

/// Writes one overlay per `.png` in `images_dir`, keeping file names.
pub fn write_overlays<B: Backend>(
    images_dir: &Path,
    output_dir: &Path,
    segmenter: &RoadSegmenter<B>,
    device: &B::Device,
) -> Result<usize, InferenceError> {
    let images = list_pngs(images_dir)?;
    fs::create_dir_all(output_dir).map_err(|source| InferenceError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    for path in &images {
        let Some(name) = path.file_name() else {
            continue;
        };
        let overlay = segmenter.segment(&open_rgb(path)?, device)?;
        let out = output_dir.join(name);
        overlay.save(&out).map_err(|source| InferenceError::Image {
            path: out.clone(),
            source,
        })?;
        log::debug!("wrote {}", out.display());
    }
    Ok(images.len())
}
