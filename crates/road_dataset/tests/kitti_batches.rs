use std::fs;
use std::path::Path;

use image::{Rgb, RgbImage};
use road_dataset::{
    index_split, BatchSource, BatchStream, DatasetConfig, ImageShape, KittiRoadDataset,
    MemorySource, RoadDatasetError, RoadSample, BACKGROUND_COLOR,
};

type B = burn_ndarray::NdArray<f32>;

/// Writes `count` image/label pairs; the left half of every label is road.
/// Labels are twice the target size so they go through the resize path.
fn synthetic_split(root: &Path, count: usize) {
    let images = root.join("image_2");
    let labels = root.join("gt_image_2");
    fs::create_dir_all(&images).unwrap();
    fs::create_dir_all(&labels).unwrap();
    for i in 0..count {
        let img = RgbImage::from_pixel(8, 4, Rgb([10, 20, 30]));
        img.save(images.join(format!("um_{i:06}.png"))).unwrap();
        let gt = RgbImage::from_fn(16, 8, |x, _| {
            if x < 8 {
                Rgb([255, 0, 255])
            } else {
                Rgb(BACKGROUND_COLOR)
            }
        });
        gt.save(labels.join(format!("um_road_{i:06}.png"))).unwrap();
        // Lane masks live next to road masks and must be ignored.
        gt.save(labels.join(format!("um_lane_{i:06}.png"))).unwrap();
    }
}

fn config() -> DatasetConfig {
    DatasetConfig {
        image_shape: ImageShape::new(4, 8),
        shuffle: true,
        seed: Some(3),
        ..Default::default()
    }
}

#[test]
fn index_pairs_images_with_road_labels() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_split(tmp.path(), 3);
    let indices = index_split(tmp.path()).unwrap();
    assert_eq!(indices.len(), 3);
    for idx in &indices {
        let label = idx.label.file_name().unwrap().to_str().unwrap();
        assert!(label.contains("_road_"), "{label}");
    }
}

#[test]
fn image_without_label_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_split(tmp.path(), 1);
    RgbImage::new(4, 4)
        .save(tmp.path().join("image_2/uu_000009.png"))
        .unwrap();
    let err = index_split(tmp.path()).unwrap_err();
    assert!(matches!(err, RoadDatasetError::MissingLabel { .. }), "{err}");
}

#[test]
fn missing_split_directory_is_an_io_error() {
    let tmp = tempfile::tempdir().unwrap();
    let err = KittiRoadDataset::open(&tmp.path().join("training"), config()).unwrap_err();
    assert!(matches!(err, RoadDatasetError::Io { .. }), "{err}");
}

#[test]
fn batches_cover_the_split_and_keep_shapes() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_split(tmp.path(), 5);
    let dataset = KittiRoadDataset::open(tmp.path(), config()).unwrap();
    let device = Default::default();

    let mut stream = dataset.batches(2);
    let mut sizes = Vec::new();
    while let Some(batch) = stream.next_batch::<B>(&device).unwrap() {
        assert_eq!(batch.images.dims()[1..], [3, 4, 8]);
        assert_eq!(batch.labels.dims()[1..], [2, 4, 8]);
        sizes.push(batch.len());
    }
    assert_eq!(sizes, vec![2, 2, 1]);

    // A second call restarts the pass.
    let mut again = dataset.batches(5);
    let batch = again.next_batch::<B>(&device).unwrap().expect("one full batch");
    assert_eq!(batch.len(), 5);
    assert!(again.next_batch::<B>(&device).unwrap().is_none());
}

#[test]
fn labels_are_one_hot_with_road_on_the_left() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_split(tmp.path(), 1);
    let dataset = KittiRoadDataset::open(tmp.path(), config()).unwrap();
    let batch = dataset
        .batches(1)
        .next_batch::<B>(&Default::default())
        .unwrap()
        .unwrap();

    let labels = batch.labels.into_data().to_vec::<f32>().unwrap();
    let plane = 4 * 8;
    for y in 0..4 {
        for x in 0..8 {
            let i = y * 8 + x;
            assert_eq!(labels[i] + labels[plane + i], 1.0);
            let road = labels[plane + i] == 1.0;
            assert_eq!(road, x < 4, "pixel ({x}, {y})");
        }
    }
    let images = batch.images.into_data().to_vec::<f32>().unwrap();
    assert_eq!(images[0], 10.0);
    assert_eq!(images[plane], 20.0);
}

#[test]
fn zero_batch_size_yields_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    synthetic_split(tmp.path(), 2);
    let dataset = KittiRoadDataset::open(tmp.path(), config()).unwrap();
    let mut stream = dataset.batches(0);
    assert!(stream.next_batch::<B>(&Default::default()).unwrap().is_none());

    let memory = MemorySource::new(vec![RoadSample::new(
        vec![0.0; 3 * 4],
        vec![1.0; 2 * 4],
        ImageShape::new(2, 2),
        2,
    )
    .unwrap()])
    .unwrap();
    assert!(memory
        .batches(0)
        .next_batch::<B>(&Default::default())
        .unwrap()
        .is_none());
}

#[test]
fn memory_source_rejects_mixed_shapes() {
    let a = RoadSample::new(vec![0.0; 12], vec![0.0; 8], ImageShape::new(2, 2), 2).unwrap();
    let b = RoadSample::new(vec![0.0; 24], vec![0.0; 16], ImageShape::new(2, 4), 2).unwrap();
    assert!(MemorySource::new(vec![a, b]).is_err());
}
