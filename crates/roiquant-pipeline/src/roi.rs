//! ROI geometry: bounding boxes and pixel masks.
//!
//! A ROI is an area annotation on the source image. The pipeline only
//! needs two things from it: the integer bounding box used for
//! cropping, and a binary mask telling which pixels of that box belong
//! to the ROI. Pixels are tested at their centres, so a pixel belongs
//! to the ROI when `(x + 0.5, y + 0.5)` lies inside the shape.

use geo::Contains;
use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::types::{Bounds, Point};

/// Mask value for pixels inside the ROI.
pub const INSIDE: u8 = 255;

/// Geometry of an area ROI, in original-image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoiShape {
    /// Axis-aligned rectangle.
    Rectangle(Bounds),
    /// Ellipse inscribed in the given rectangle.
    Oval(Bounds),
    /// Closed polygon (also used for freehand and traced outlines).
    Polygon(Vec<Point>),
}

impl RoiShape {
    /// Integer bounding box of the shape.
    ///
    /// For polygons this is the smallest pixel rectangle containing
    /// every vertex.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn bounds(&self) -> Bounds {
        match self {
            Self::Rectangle(b) | Self::Oval(b) => *b,
            Self::Polygon(points) => {
                if points.is_empty() {
                    return Bounds::new(0, 0, 0, 0);
                }
                let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
                let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
                for p in points {
                    min_x = min_x.min(p.x);
                    min_y = min_y.min(p.y);
                    max_x = max_x.max(p.x);
                    max_y = max_y.max(p.y);
                }
                let left = min_x.floor();
                let top = min_y.floor();
                Bounds::new(
                    left as i32,
                    top as i32,
                    (max_x.ceil() - left).max(0.0) as u32,
                    (max_y.ceil() - top).max(0.0) as u32,
                )
            }
        }
    }

    /// Returns `true` if the point `(x, y)` lies inside the shape.
    #[must_use]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        match self {
            Self::Rectangle(b) => {
                let left = f64::from(b.x);
                let top = f64::from(b.y);
                x >= left
                    && y >= top
                    && x < left + f64::from(b.width)
                    && y < top + f64::from(b.height)
            }
            Self::Oval(b) => {
                if b.is_empty() {
                    return false;
                }
                let rx = f64::from(b.width) / 2.0;
                let ry = f64::from(b.height) / 2.0;
                let dx = (x - (f64::from(b.x) + rx)) / rx;
                let dy = (y - (f64::from(b.y) + ry)) / ry;
                dx.mul_add(dx, dy * dy) <= 1.0
            }
            Self::Polygon(points) => {
                if points.len() < 3 {
                    return false;
                }
                let exterior: Vec<(f64, f64)> = points.iter().map(|p| (p.x, p.y)).collect();
                let polygon = geo::Polygon::new(geo::LineString::from(exterior), vec![]);
                polygon.contains(&geo::Point::new(x, y))
            }
        }
    }

    /// Rasterise the shape over `region`.
    ///
    /// Returns a `region.width x region.height` mask where pixels inside
    /// the ROI are [`INSIDE`] and all others are zero. `region` is given
    /// in original-image coordinates, typically the clipped bounding box.
    #[must_use]
    pub fn mask(&self, region: Bounds) -> GrayImage {
        // Build the polygon once instead of per pixel.
        if let Self::Polygon(points) = self {
            if points.len() < 3 {
                return GrayImage::new(region.width, region.height);
            }
            let exterior: Vec<(f64, f64)> = points.iter().map(|p| (p.x, p.y)).collect();
            let polygon = geo::Polygon::new(geo::LineString::from(exterior), vec![]);
            return GrayImage::from_fn(region.width, region.height, |lx, ly| {
                let (x, y) = pixel_centre(region, lx, ly);
                inside_value(polygon.contains(&geo::Point::new(x, y)))
            });
        }
        GrayImage::from_fn(region.width, region.height, |lx, ly| {
            let (x, y) = pixel_centre(region, lx, ly);
            inside_value(self.contains(x, y))
        })
    }
}

fn pixel_centre(region: Bounds, lx: u32, ly: u32) -> (f64, f64) {
    (
        f64::from(region.x) + f64::from(lx) + 0.5,
        f64::from(region.y) + f64::from(ly) + 0.5,
    )
}

const fn inside_value(inside: bool) -> Luma<u8> {
    if inside { Luma([INSIDE]) } else { Luma([0]) }
}

/// Count the pixels set in a mask.
#[must_use]
pub fn mask_pixel_count(mask: &GrayImage) -> u64 {
    mask.pixels().filter(|p| p.0[0] != 0).count() as u64
}
