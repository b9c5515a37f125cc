//! KITTI road benchmark layout: indexing and per-sample decoding.
//!
//! A split directory contains `image_2/<name>.png` inputs and
//! `gt_image_2/<prefix>_road_<id>.png` ground truth. Ground-truth pixels painted in
//! [`BACKGROUND_COLOR`] are background; everything else is road.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::RgbImage;

use crate::types::{DatasetResult, ImageShape, RoadDatasetError, RoadSample, SampleIndex};

/// Training split, relative to the data directory.
pub const TRAINING_SPLIT: &str = "data_road/training";
/// Test split, relative to the data directory.
pub const TESTING_SPLIT: &str = "data_road/testing";
pub const IMAGE_DIR: &str = "image_2";
pub const LABEL_DIR: &str = "gt_image_2";
pub const BACKGROUND_COLOR: [u8; 3] = [255, 0, 0];
/// Background and road.
pub const KITTI_NUM_CLASSES: usize = 2;

/// Maps a ground-truth file name to the image it labels:
/// `um_road_000000.png` -> `um_000000.png`.
pub fn label_key(label_name: &str) -> Option<String> {
    ["_road_", "_lane_"]
        .iter()
        .find(|infix| label_name.contains(*infix))
        .map(|infix| label_name.replacen(infix, "_", 1))
}

/// Sorted `.png` files directly under `dir`.
pub fn list_pngs(dir: &Path) -> DatasetResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|source| RoadDatasetError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| RoadDatasetError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("png") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Pairs every image in `split_dir/image_2` with its road label.
pub fn index_split(split_dir: &Path) -> DatasetResult<Vec<SampleIndex>> {
    let mut labels: HashMap<String, PathBuf> = HashMap::new();
    for path in list_pngs(&split_dir.join(LABEL_DIR))? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // Lane annotations share the directory; only road masks are used.
        if !name.contains("_road_") {
            continue;
        }
        if let Some(key) = label_key(name) {
            labels.insert(key, path);
        }
    }

    let mut indices = Vec::new();
    for image in list_pngs(&split_dir.join(IMAGE_DIR))? {
        let name = image
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        match labels.get(&name) {
            Some(label) => indices.push(SampleIndex {
                image,
                label: label.clone(),
            }),
            None => return Err(RoadDatasetError::MissingLabel { image }),
        }
    }
    Ok(indices)
}

pub fn open_rgb(path: &Path) -> DatasetResult<RgbImage> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| RoadDatasetError::Image {
            path: path.to_path_buf(),
            source,
        })
}

/// Channel-first pixel values multiplied by `pixel_scale`.
pub fn image_to_chw(img: &RgbImage, pixel_scale: f32) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut buf = Vec::with_capacity(3 * (width * height) as usize);
    for c in 0..3 {
        for y in 0..height {
            for x in 0..width {
                buf.push(img.get_pixel(x, y)[c] as f32 * pixel_scale);
            }
        }
    }
    buf
}

/// One-hot `[2, H, W]` encoding: channel 0 is background, channel 1 is road.
pub fn encode_label(gt: &RgbImage) -> Vec<f32> {
    let (width, height) = gt.dimensions();
    let pixels = (width * height) as usize;
    let mut buf = vec![0.0f32; KITTI_NUM_CLASSES * pixels];
    for (i, pixel) in gt.pixels().enumerate() {
        let background = pixel.0 == BACKGROUND_COLOR;
        buf[if background { i } else { pixels + i }] = 1.0;
    }
    buf
}

pub fn resize_rgb(img: &RgbImage, shape: ImageShape, filter: FilterType) -> RgbImage {
    let (w, h) = (shape.width as u32, shape.height as u32);
    if img.dimensions() == (w, h) {
        return img.clone();
    }
    image::imageops::resize(img, w, h, filter)
}

/// Loads an image/label pair resized to `shape`.
pub fn load_sample(
    index: &SampleIndex,
    shape: ImageShape,
    pixel_scale: f32,
) -> DatasetResult<RoadSample> {
    let image = resize_rgb(&open_rgb(&index.image)?, shape, FilterType::Triangle);
    // Nearest keeps label colors exact.
    let gt = resize_rgb(&open_rgb(&index.label)?, shape, FilterType::Nearest);
    RoadSample::new(
        image_to_chw(&image, pixel_scale),
        encode_label(&gt),
        shape,
        KITTI_NUM_CLASSES,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_names_map_to_images() {
        assert_eq!(label_key("um_road_000000.png").as_deref(), Some("um_000000.png"));
        assert_eq!(label_key("umm_lane_000012.png").as_deref(), Some("umm_000012.png"));
        assert_eq!(label_key("uu_000001.png"), None);
    }

    #[test]
    fn background_pixels_are_class_zero() {
        let mut gt = RgbImage::from_pixel(2, 1, image::Rgb(BACKGROUND_COLOR));
        gt.put_pixel(1, 0, image::Rgb([255, 0, 255]));
        // [bg(0), bg(1), road(0), road(1)]
        assert_eq!(encode_label(&gt), vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn chw_layout_is_channel_major() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgb([1, 2, 3]));
        img.put_pixel(1, 0, image::Rgb([4, 5, 6]));
        assert_eq!(image_to_chw(&img, 1.0), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }
}
