//! Shared types for the roiquant quantification pipeline.

use serde::{Deserialize, Serialize};

/// Re-export `DynamicImage` so downstream crates can pass source and
/// classified images without depending on `image` directly.
pub use image::DynamicImage;

/// Re-export `GrayImage` so downstream crates can reference binary
/// masks and intermediate raster data.
pub use image::GrayImage;

/// Re-export `RgbImage` for flattened overlay output.
pub use image::RgbImage;

/// Single-channel 16-bit image holding raw classifier label values.
pub type LabelImage = image::ImageBuffer<image::Luma<u16>, Vec<u16>>;

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Shift the point by `(dx, dy)`.
    #[must_use]
    pub fn translated(self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

/// A sequence of connected points. Particle outlines are closed
/// polylines: the last point connects back to the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline(Vec<Point>);

impl Polyline {
    /// Create a new polyline from a vector of points.
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    /// Returns `true` if the polyline has no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of points in the polyline.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns a slice of all points.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.0
    }

    /// Returns a copy with every point shifted by `offset`.
    ///
    /// Used to move ROI-local outlines into the coordinate space of
    /// the original image.
    #[must_use]
    pub fn translated(&self, offset: Point) -> Self {
        Self(
            self.0
                .iter()
                .map(|p| p.translated(offset.x, offset.y))
                .collect(),
        )
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of an image.
    #[must_use]
    pub fn of(image: &DynamicImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }
}

/// An integer, axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    /// Left edge (inclusive).
    pub x: i32,
    /// Top edge (inclusive).
    pub y: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Bounds {
    /// Create new bounds.
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Returns `true` if the rectangle covers no pixels.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Top-left corner as a point.
    #[must_use]
    pub fn origin(&self) -> Point {
        Point::new(f64::from(self.x), f64::from(self.y))
    }

    /// Clip these bounds to an image of the given dimensions.
    ///
    /// Returns `None` when nothing of the rectangle lies on the image.
    #[must_use]
    pub fn clip_to(&self, dimensions: Dimensions) -> Option<Self> {
        let left = i64::from(self.x).max(0);
        let top = i64::from(self.y).max(0);
        let right = (i64::from(self.x) + i64::from(self.width)).min(i64::from(dimensions.width));
        let bottom =
            (i64::from(self.y) + i64::from(self.height)).min(i64::from(dimensions.height));
        if right <= left || bottom <= top {
            return None;
        }
        Some(Self {
            x: i32::try_from(left).ok()?,
            y: i32::try_from(top).ok()?,
            width: u32::try_from(right - left).ok()?,
            height: u32::try_from(bottom - top).ok()?,
        })
    }
}

/// Spatial calibration of the source image.
///
/// Areas are reported in `unit`² per pixel area; the pipeline performs
/// no conversion beyond multiplying pixel counts by the pixel area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Width of one pixel in `unit`.
    pub pixel_width: f64,
    /// Height of one pixel in `unit`.
    pub pixel_height: f64,
    /// Name of the length unit (e.g. `"pixel"`, `"µm"`).
    pub unit: String,
}

impl Calibration {
    /// Area covered by a single pixel.
    #[must_use]
    pub fn pixel_area(&self) -> f64 {
        self.pixel_width * self.pixel_height
    }

    /// Area covered by `count` pixels.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn area_of(&self, count: u64) -> f64 {
        count as f64 * self.pixel_area()
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            pixel_width: 1.0,
            pixel_height: 1.0,
            unit: "pixel".to_owned(),
        }
    }
}

/// Inclusive range of classifier label values treated as foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRange {
    /// Lowest label value counted as an object pixel.
    pub min: u16,
    /// Highest label value counted as an object pixel.
    pub max: u16,
}

impl LabelRange {
    /// Returns `true` if `value` falls inside the range.
    #[must_use]
    pub const fn contains(&self, value: u16) -> bool {
        value >= self.min && value <= self.max
    }
}

impl Default for LabelRange {
    fn default() -> Self {
        Self {
            min: 1,
            max: u16::MAX,
        }
    }
}

/// Configuration for the per-ROI quantification pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantConfig {
    /// Label values in the object-classification output that count as
    /// object pixels.
    pub threshold: LabelRange,

    /// Whether to split touching objects with a distance-transform
    /// watershed before measuring.
    pub watershed: bool,

    /// Minimum height, in distance-map units, a local maximum must rise
    /// above the saddle joining it to a neighbour before the two are
    /// separated. Lower values split more aggressively.
    pub watershed_tolerance: f64,

    /// Whether to drop particles touching the edge of the cropped ROI
    /// image.
    pub exclude_edge_particles: bool,

    /// Particles smaller than this many pixels are ignored.
    pub min_particle_pixels: u64,

    /// Spatial calibration applied to every reported area.
    pub calibration: Calibration,

    /// RGB colour used when flattening particle outlines onto the
    /// exported image.
    pub overlay_color: [u8; 3],
}

impl QuantConfig {
    /// Default for [`watershed`](Self::watershed).
    pub const DEFAULT_WATERSHED: bool = true;
    /// Default for [`watershed_tolerance`](Self::watershed_tolerance).
    pub const DEFAULT_WATERSHED_TOLERANCE: f64 = 0.5;
    /// Default for [`exclude_edge_particles`](Self::exclude_edge_particles).
    pub const DEFAULT_EXCLUDE_EDGE_PARTICLES: bool = true;
    /// Default for [`min_particle_pixels`](Self::min_particle_pixels).
    pub const DEFAULT_MIN_PARTICLE_PIXELS: u64 = 0;
    /// Default for [`overlay_color`](Self::overlay_color).
    pub const DEFAULT_OVERLAY_COLOR: [u8; 3] = [255, 255, 0];
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            threshold: LabelRange::default(),
            watershed: Self::DEFAULT_WATERSHED,
            watershed_tolerance: Self::DEFAULT_WATERSHED_TOLERANCE,
            exclude_edge_particles: Self::DEFAULT_EXCLUDE_EDGE_PARTICLES,
            min_particle_pixels: Self::DEFAULT_MIN_PARTICLE_PIXELS,
            calibration: Calibration::default(),
            overlay_color: Self::DEFAULT_OVERLAY_COLOR,
        }
    }
}

/// One measured object inside a ROI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Number of pixels in the object.
    pub pixel_count: u64,
    /// Calibrated area of the object.
    pub area: f64,
    /// Closed outer boundary of the object.
    pub outline: Polyline,
}

/// Outcome of quantifying one ROI.
///
/// Particle outlines are already expressed in the coordinate space of
/// the original (uncropped) image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiQuantification {
    /// Top-left corner of the ROI's bounding box in the original image.
    pub origin: Point,
    /// Calibrated area of the ROI itself.
    pub roi_area: f64,
    /// Measured particles, in label order.
    pub particles: Vec<Particle>,
}

impl RoiQuantification {
    /// Number of particles found.
    #[must_use]
    pub const fn cell_count(&self) -> usize {
        self.particles.len()
    }

    /// Sum of all particle areas.
    #[must_use]
    pub fn total_cell_area(&self) -> f64 {
        self.particles.iter().map(|p| p.area).sum()
    }

    /// Outlines of all particles.
    pub fn outlines(&self) -> impl Iterator<Item = &Polyline> {
        self.particles.iter().map(|p| &p.outline)
    }
}

/// Errors that can occur while quantifying a single ROI.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The ROI covers no pixels.
    #[error("ROI has an empty bounding box")]
    EmptyRoi,

    /// The ROI lies entirely outside the source image.
    #[error("ROI bounds {bounds:?} lie outside the {width}x{height} image")]
    RoiOutOfBounds {
        /// Requested ROI bounds.
        bounds: Bounds,
        /// Source image width.
        width: u32,
        /// Source image height.
        height: u32,
    },

    /// The classified image does not match the cropped ROI image.
    #[error(
        "classified image is {}x{} but the ROI crop is {}x{}",
        actual.width, actual.height, expected.width, expected.height
    )]
    DimensionMismatch {
        /// Dimensions of the cropped ROI image.
        expected: Dimensions,
        /// Dimensions of the classified image.
        actual: Dimensions,
    },

    /// Image buffer operation failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn polyline_translated_shifts_every_point() {
        let pl = Polyline::new(vec![Point::new(0.0, 0.0), Point::new(2.0, 3.0)]);
        let moved = pl.translated(Point::new(10.0, 20.0));
        assert_eq!(
            moved.points(),
            &[Point::new(10.0, 20.0), Point::new(12.0, 23.0)]
        );
    }

    #[test]
    fn bounds_clip_inside_is_identity() {
        let b = Bounds::new(2, 3, 4, 5);
        let dims = Dimensions {
            width: 20,
            height: 20,
        };
        assert_eq!(b.clip_to(dims), Some(b));
    }

    #[test]
    fn bounds_clip_partially_outside() {
        let b = Bounds::new(-2, 15, 6, 10);
        let dims = Dimensions {
            width: 20,
            height: 20,
        };
        assert_eq!(b.clip_to(dims), Some(Bounds::new(0, 15, 4, 5)));
    }

    #[test]
    fn bounds_clip_fully_outside() {
        let b = Bounds::new(30, 30, 5, 5);
        let dims = Dimensions {
            width: 20,
            height: 20,
        };
        assert_eq!(b.clip_to(dims), None);
    }

    #[test]
    fn calibration_scales_area() {
        let cal = Calibration {
            pixel_width: 0.5,
            pixel_height: 2.0,
            unit: "µm".to_owned(),
        };
        assert!((cal.area_of(10) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn label_range_is_inclusive() {
        let r = LabelRange { min: 2, max: 3 };
        assert!(!r.contains(1));
        assert!(r.contains(2));
        assert!(r.contains(3));
        assert!(!r.contains(4));
    }

    #[test]
    fn quant_config_default_matches_constants() {
        let c = QuantConfig::default();
        assert_eq!(c.watershed, QuantConfig::DEFAULT_WATERSHED);
        assert!((c.watershed_tolerance - QuantConfig::DEFAULT_WATERSHED_TOLERANCE).abs() < 1e-12);
        assert_eq!(c.threshold, LabelRange { min: 1, max: u16::MAX });
    }

    #[test]
    fn quant_config_partial_json_fills_defaults() {
        let c: QuantConfig = serde_json::from_str(r#"{"watershed": false}"#).unwrap();
        assert!(!c.watershed);
        assert!(c.exclude_edge_particles);
    }

    #[test]
    fn empty_quantification_has_zero_totals() {
        let q = RoiQuantification {
            origin: Point::new(0.0, 0.0),
            roi_area: 12.0,
            particles: Vec::new(),
        };
        assert_eq!(q.cell_count(), 0);
        assert!(q.total_cell_area().abs() < f64::EPSILON);
    }
}
