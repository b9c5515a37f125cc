//! Geometric augmentation applied to decoded samples.

use rand::Rng;

use crate::types::RoadSample;

/// Mirrors every row of a channel-first buffer left to right.
pub fn flip_horizontal_chw(data: &mut [f32], width: usize) {
    if width == 0 {
        return;
    }
    for row in data.chunks_exact_mut(width) {
        row.reverse();
    }
}

/// Flips image and label together with probability `prob`.
pub fn maybe_flip<R: Rng>(sample: &mut RoadSample, prob: f32, rng: &mut R) -> bool {
    if prob <= 0.0 || rng.random::<f32>() >= prob {
        return false;
    }
    let width = sample.shape.width;
    flip_horizontal_chw(&mut sample.image_chw, width);
    flip_horizontal_chw(&mut sample.label_chw, width);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageShape;
    use rand::SeedableRng;

    #[test]
    fn flip_reverses_each_row() {
        let mut data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        flip_horizontal_chw(&mut data, 3);
        assert_eq!(data, vec![3.0, 2.0, 1.0, 6.0, 5.0, 4.0]);
    }

    #[test]
    fn certain_flip_keeps_labels_aligned() {
        let shape = ImageShape::new(1, 2);
        let mut sample = RoadSample::new(
            vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0],
            vec![1.0, 0.0, 0.0, 1.0],
            shape,
            2,
        )
        .unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        assert!(maybe_flip(&mut sample, 1.0, &mut rng));
        assert_eq!(sample.image_chw, vec![2.0, 1.0, 2.0, 1.0, 2.0, 1.0]);
        assert_eq!(sample.label_chw, vec![0.0, 1.0, 1.0, 0.0]);
        assert!(!maybe_flip(&mut sample, 0.0, &mut rng));
    }
}
