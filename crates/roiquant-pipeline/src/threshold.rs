//! Threshold classifier output into a binary object mask.
//!
//! Object classification writes one label value per pixel. The label
//! values must be read exactly as stored: widening an 8-bit label image
//! through `to_luma16` would scale label `1` to `257`, so 8-bit images
//! are widened by value instead.

use image::{DynamicImage, GrayImage, Luma};

use crate::types::{LabelImage, LabelRange};

/// Foreground value in binary masks.
pub const FOREGROUND: u8 = 255;

/// Extract raw label values from a classified image.
///
/// 8-bit images keep their values unchanged; 16-bit images are used
/// as-is. Colour images are reduced to luminance first.
#[must_use]
pub fn label_values(image: &DynamicImage) -> LabelImage {
    match image {
        DynamicImage::ImageLuma16(gray) => gray.clone(),
        DynamicImage::ImageLuma8(gray) => widen(gray),
        DynamicImage::ImageLumaA8(_) | DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => {
            widen(&image.to_luma8())
        }
        _ => image.to_luma16(),
    }
}

fn widen(gray: &GrayImage) -> LabelImage {
    LabelImage::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([u16::from(gray.get_pixel(x, y).0[0])])
    })
}

/// Mark every pixel whose label lies in `range` as [`FOREGROUND`].
#[must_use]
pub fn threshold(labels: &LabelImage, range: LabelRange) -> GrayImage {
    GrayImage::from_fn(labels.width(), labels.height(), |x, y| {
        if range.contains(labels.get_pixel(x, y).0[0]) {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_bit_labels_are_not_scaled() {
        let mut gray = GrayImage::new(2, 1);
        gray.put_pixel(1, 0, Luma([1]));
        let labels = label_values(&DynamicImage::ImageLuma8(gray));
        assert_eq!(labels.get_pixel(0, 0).0[0], 0);
        assert_eq!(labels.get_pixel(1, 0).0[0], 1);
    }

    #[test]
    fn sixteen_bit_labels_pass_through() {
        let mut gray = LabelImage::new(1, 1);
        gray.put_pixel(0, 0, Luma([700]));
        let labels = label_values(&DynamicImage::ImageLuma16(gray));
        assert_eq!(labels.get_pixel(0, 0).0[0], 700);
    }

    #[test]
    fn threshold_selects_range() {
        let labels = LabelImage::from_fn(4, 1, |x, _| Luma([u16::try_from(x).unwrap_or(0)]));
        let mask = threshold(&labels, LabelRange { min: 1, max: 2 });
        let values: Vec<u8> = mask.pixels().map(|p| p.0[0]).collect();
        assert_eq!(values, vec![0, FOREGROUND, FOREGROUND, 0]);
    }
}
