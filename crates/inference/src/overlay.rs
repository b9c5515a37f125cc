use image::{Rgba, RgbImage};

/// Semi-transparent green painted over road pixels.
pub const ROAD_OVERLAY: Rgba<u8> = Rgba([0, 255, 0, 127]);

/// Alpha-blends `color` over every pixel whose `mask` entry is set.
///
/// `mask` is row-major and must hold one entry per pixel; extra entries are ignored,
/// missing ones leave the remaining pixels untouched.
pub fn blend_mask(img: &RgbImage, mask: &[bool], color: Rgba<u8>) -> RgbImage {
    let mut out = img.clone();
    let alpha = color[3] as u32;
    for (pixel, &masked) in out.pixels_mut().zip(mask) {
        if !masked {
            continue;
        }
        for c in 0..3 {
            let src = pixel[c] as u32;
            pixel[c] = ((src * (255 - alpha) + color[c] as u32 * alpha + 127) / 255) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn only_masked_pixels_are_tinted() {
        let img = RgbImage::from_pixel(2, 1, Rgb([200, 100, 50]));
        let out = blend_mask(&img, &[true, false], ROAD_OVERLAY);
        assert_eq!(out.get_pixel(1, 0), &Rgb([200, 100, 50]));
        let tinted = out.get_pixel(0, 0);
        assert!(tinted[0] < 200 && tinted[2] < 50);
        assert!(tinted[1] > 100);
    }

    #[test]
    fn opaque_and_transparent_extremes() {
        let img = RgbImage::from_pixel(1, 1, Rgb([10, 20, 30]));
        let opaque = blend_mask(&img, &[true], Rgba([0, 255, 0, 255]));
        assert_eq!(opaque.get_pixel(0, 0), &Rgb([0, 255, 0]));
        let clear = blend_mask(&img, &[true], Rgba([0, 255, 0, 0]));
        assert_eq!(clear.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }
}
