//! Outline tracing: extract the outer boundary of a single object.
//!
//! Uses Suzuki-Abe border following via
//! `imageproc::contours::find_contours`. Hole borders are ignored; a
//! particle's outline is the first outer border found.

use image::GrayImage;
use imageproc::contours::{BorderType, Contour, find_contours};

use crate::types::{Point, Polyline};

/// Trace the outer boundary of the object in `mask`.
///
/// `mask` should contain exactly one 8-connected object. Returns `None`
/// when the mask is empty. A single-pixel object yields a one-point
/// outline.
#[must_use]
pub fn trace_outline(mask: &GrayImage) -> Option<Polyline> {
    let contours: Vec<Contour<u32>> = find_contours(mask);
    contours
        .into_iter()
        .find(|c| c.border_type == BorderType::Outer && !c.points.is_empty())
        .map(|c| {
            let points = c
                .points
                .into_iter()
                .map(|p| Point::new(f64::from(p.x), f64::from(p.y)))
                .collect();
            Polyline::new(points)
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use image::Luma;

    use super::*;

    #[test]
    fn empty_mask_has_no_outline() {
        assert!(trace_outline(&GrayImage::new(10, 10)).is_none());
    }

    #[test]
    fn square_outline_stays_on_the_square() {
        let mut img = GrayImage::new(20, 20);
        for y in 5..15 {
            for x in 5..15 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        let outline = trace_outline(&img).unwrap();
        assert!(outline.len() >= 4);
        for p in outline.points() {
            assert!((5.0..=14.0).contains(&p.x));
            assert!((5.0..=14.0).contains(&p.y));
            let on_edge = p.x == 5.0 || p.x == 14.0 || p.y == 5.0 || p.y == 14.0;
            assert!(on_edge, "({}, {}) is not on the border", p.x, p.y);
        }
    }

    #[test]
    fn ring_outline_ignores_the_hole() {
        let mut img = GrayImage::new(20, 20);
        for y in 2..18 {
            for x in 2..18 {
                if !(6..14).contains(&x) || !(6..14).contains(&y) {
                    img.put_pixel(x, y, Luma([255]));
                }
            }
        }
        let outline = trace_outline(&img).unwrap();
        assert!(outline.points().iter().any(|p| p.x == 2.0));
        assert!(outline.points().iter().all(|p| p.x <= 17.0 && p.y <= 17.0));
    }
}
