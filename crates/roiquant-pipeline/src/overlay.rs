//! Overlay flattening: burn particle outlines into an RGB copy of the
//! source image for export.

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;

use crate::types::Polyline;

/// Draw every outline as a closed polyline onto an RGB copy of `image`.
///
/// Outlines are expected in the coordinate space of `image`. Points
/// outside the image are clipped by the line rasteriser. The source
/// image is left untouched.
#[must_use = "returns the flattened image"]
#[allow(clippy::cast_possible_truncation)]
pub fn flatten_outlines<'a>(
    image: &DynamicImage,
    outlines: impl IntoIterator<Item = &'a Polyline>,
    color: [u8; 3],
) -> RgbImage {
    let mut canvas = image.to_rgb8();
    let pixel = Rgb(color);
    for outline in outlines {
        let points = outline.points();
        match points {
            [] => {}
            [only] => {
                let (x, y) = (only.x, only.y);
                if x >= 0.0 && y >= 0.0 {
                    #[allow(clippy::cast_sign_loss)]
                    let (px, py) = (x as u32, y as u32);
                    if px < canvas.width() && py < canvas.height() {
                        canvas.put_pixel(px, py, pixel);
                    }
                }
            }
            _ => {
                let closing = points.last().zip(points.first());
                for (a, b) in points.windows(2).map(|w| (&w[0], &w[1])).chain(closing) {
                    draw_line_segment_mut(
                        &mut canvas,
                        (a.x as f32, a.y as f32),
                        (b.x as f32, b.y as f32),
                        pixel,
                    );
                }
            }
        }
    }
    canvas
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::types::Point;

    #[test]
    fn outline_pixels_take_overlay_colour() {
        let base = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(10, 10, Luma([0])));
        let square = Polyline::new(vec![
            Point::new(2.0, 2.0),
            Point::new(6.0, 2.0),
            Point::new(6.0, 6.0),
            Point::new(2.0, 6.0),
        ]);
        let flat = flatten_outlines(&base, [&square], [255, 255, 0]);
        assert_eq!(flat.get_pixel(4, 2), &Rgb([255, 255, 0]));
        // Closing edge from (2, 6) back to (2, 2).
        assert_eq!(flat.get_pixel(2, 4), &Rgb([255, 255, 0]));
        // Interior untouched.
        assert_eq!(flat.get_pixel(4, 4), &Rgb([0, 0, 0]));
    }

    #[test]
    fn no_outlines_is_plain_conversion() {
        let base = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(4, 4, Luma([90])));
        let flat = flatten_outlines(&base, std::iter::empty(), [255, 0, 0]);
        assert!(flat.pixels().all(|p| *p == Rgb([90, 90, 90])));
    }

    #[test]
    fn single_point_outline_marks_one_pixel() {
        let base = DynamicImage::ImageLuma8(image::GrayImage::new(4, 4));
        let dot = Polyline::new(vec![Point::new(1.0, 3.0)]);
        let flat = flatten_outlines(&base, [&dot], [0, 255, 0]);
        assert_eq!(flat.get_pixel(1, 3), &Rgb([0, 255, 0]));
        assert_eq!(flat.pixels().filter(|p| **p == Rgb([0, 255, 0])).count(), 1);
    }
}
