//! Incremental per-ROI pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! The classification step happens outside this crate (it is an external
//! program working on files), so the pipeline is split around it: the
//! caller crops, hands [`Cropped::crop`] to the classifier, then feeds
//! the classified image back in.
//!
//! ```rust
//! # use roiquant_pipeline::{Bounds, DynamicImage, PipelineError, QuantConfig, RoiPipeline, RoiShape};
//! # fn run(source: &DynamicImage, classify: impl Fn(&DynamicImage) -> DynamicImage)
//! #     -> Result<(), PipelineError> {
//! let shape = RoiShape::Rectangle(Bounds::new(10, 10, 64, 64));
//! let cropped = RoiPipeline::new(source, shape, QuantConfig::default()).crop()?;
//! let classified = classify(cropped.crop());
//! let result = cropped
//!     .classify(classified)?
//!     .segment()
//!     .measure()
//!     .into_result();
//! println!("{} cells", result.cell_count());
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next state (or
//! `Result` for fallible stages), carrying the intermediates that later
//! stages still need.

use image::DynamicImage;

use crate::particles::analyze_particles;
use crate::roi::{RoiShape, mask_pixel_count};
use crate::threshold::{label_values, threshold};
use crate::types::{
    Bounds, Dimensions, GrayImage, LabelImage, Particle, PipelineError, QuantConfig,
    RoiQuantification,
};
use crate::watershed::watershed;

/// Entry point for quantifying a single ROI.
pub struct RoiPipeline;

impl RoiPipeline {
    /// Start a pipeline for `shape` on `source`.
    ///
    /// Nothing is computed until [`Pending::crop`] is called.
    pub const fn new(source: &DynamicImage, shape: RoiShape, config: QuantConfig) -> Pending<'_> {
        Pending {
            source,
            shape,
            config,
        }
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before the ROI has been cut out of the source image.
#[must_use = "pipeline stages are consumed by advancing: call .crop() to continue"]
pub struct Pending<'a> {
    source: &'a DynamicImage,
    shape: RoiShape,
    config: QuantConfig,
}

impl Pending<'_> {
    /// The ROI geometry being quantified.
    #[must_use]
    pub const fn shape(&self) -> &RoiShape {
        &self.shape
    }

    /// Crop the ROI's bounding box out of the source image and rasterise
    /// the ROI mask over it.
    ///
    /// Bounds partially outside the image are clipped.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyRoi`] if the ROI's bounding box is
    /// empty or the clipped box contains no ROI pixels. Returns
    /// [`PipelineError::RoiOutOfBounds`] if the box does not overlap the
    /// image at all.
    pub fn crop(self) -> Result<Cropped, PipelineError> {
        let bounds = self.shape.bounds();
        if bounds.is_empty() {
            return Err(PipelineError::EmptyRoi);
        }
        let dims = Dimensions::of(self.source);
        let region = bounds
            .clip_to(dims)
            .ok_or(PipelineError::RoiOutOfBounds {
                bounds,
                width: dims.width,
                height: dims.height,
            })?;

        let mask = self.shape.mask(region);
        let roi_pixels = mask_pixel_count(&mask);
        if roi_pixels == 0 {
            return Err(PipelineError::EmptyRoi);
        }

        #[allow(clippy::cast_sign_loss)]
        let crop = self.source.crop_imm(
            region.x as u32,
            region.y as u32,
            region.width,
            region.height,
        );
        let roi_area = self.config.calibration.area_of(roi_pixels);
        Ok(Cropped {
            config: self.config,
            region,
            crop,
            mask,
            roi_area,
        })
    }
}

// ───────────────────────── Stage 1: Cropped ──────────────────────────

/// Pipeline state after cropping, waiting for the classifier output.
///
/// Call [`classify`](Self::classify) with the classified crop to
/// continue.
#[must_use = "pipeline stages are consumed by advancing: call .classify() to continue"]
pub struct Cropped {
    config: QuantConfig,
    region: Bounds,
    crop: DynamicImage,
    mask: GrayImage,
    roi_area: f64,
}

impl Cropped {
    /// The cropped ROI image, to be handed to the classifier.
    #[must_use]
    pub const fn crop(&self) -> &DynamicImage {
        &self.crop
    }

    /// The clipped bounding box in original-image coordinates.
    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        self.region
    }

    /// ROI membership mask over the crop.
    #[must_use]
    pub const fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Calibrated area of the ROI.
    #[must_use]
    pub const fn roi_area(&self) -> f64 {
        self.roi_area
    }

    /// Accept the object-classification output for this crop.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] if `classified` is
    /// not the same size as the crop.
    pub fn classify(self, classified: DynamicImage) -> Result<Classified, PipelineError> {
        let expected = Dimensions::of(&self.crop);
        let actual = Dimensions::of(&classified);
        if expected != actual {
            return Err(PipelineError::DimensionMismatch { expected, actual });
        }
        Ok(Classified {
            config: self.config,
            region: self.region,
            mask: self.mask,
            roi_area: self.roi_area,
            labels: label_values(&classified),
        })
    }
}

// ───────────────────────── Stage 2: Classified ───────────────────────

/// Pipeline state holding the classifier's label image.
#[must_use = "pipeline stages are consumed by advancing: call .segment() to continue"]
pub struct Classified {
    config: QuantConfig,
    region: Bounds,
    mask: GrayImage,
    roi_area: f64,
    labels: LabelImage,
}

impl Classified {
    /// Raw label values from the classifier.
    #[must_use]
    pub const fn labels(&self) -> &LabelImage {
        &self.labels
    }

    /// Threshold the labels into a binary mask and, if enabled, split
    /// touching objects with the watershed.
    pub fn segment(self) -> Segmented {
        let binary = threshold(&self.labels, self.config.threshold);
        let binary = if self.config.watershed {
            watershed(&binary, self.config.watershed_tolerance)
        } else {
            binary
        };
        Segmented {
            config: self.config,
            region: self.region,
            mask: self.mask,
            roi_area: self.roi_area,
            binary,
        }
    }
}

// ───────────────────────── Stage 3: Segmented ────────────────────────

/// Pipeline state after thresholding and optional watershed.
#[must_use = "pipeline stages are consumed by advancing: call .measure() to continue"]
pub struct Segmented {
    config: QuantConfig,
    region: Bounds,
    mask: GrayImage,
    roi_area: f64,
    binary: GrayImage,
}

impl Segmented {
    /// Binary object mask (after watershed, if applied).
    #[must_use]
    pub const fn binary(&self) -> &GrayImage {
        &self.binary
    }

    /// Measure the particles lying inside the ROI.
    pub fn measure(self) -> Measured {
        let particles = analyze_particles(&self.binary, &self.mask, &self.config);
        Measured {
            region: self.region,
            roi_area: self.roi_area,
            particles,
        }
    }
}

// ───────────────────────── Stage 4: Measured ─────────────────────────

/// Pipeline state after particle analysis. Outlines are still in
/// crop-local coordinates.
#[must_use = "call .into_result() to obtain the quantification"]
pub struct Measured {
    region: Bounds,
    roi_area: f64,
    particles: Vec<Particle>,
}

impl Measured {
    /// Particles in crop-local coordinates.
    #[must_use]
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Finish the pipeline, moving outlines into original-image
    /// coordinates.
    #[must_use]
    pub fn into_result(self) -> RoiQuantification {
        let origin = self.region.origin();
        let particles = self
            .particles
            .into_iter()
            .map(|p| Particle {
                outline: p.outline.translated(origin),
                ..p
            })
            .collect();
        RoiQuantification {
            origin,
            roi_area: self.roi_area,
            particles,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::types::Point;

    fn blank(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::new(w, h))
    }

    /// Label image with two separated 3x3 objects.
    fn two_objects(w: u32, h: u32) -> DynamicImage {
        let mut labels = GrayImage::new(w, h);
        for (x0, y0) in [(2, 2), (10, 10)] {
            for y in y0..y0 + 3 {
                for x in x0..x0 + 3 {
                    labels.put_pixel(x, y, Luma([1]));
                }
            }
        }
        DynamicImage::ImageLuma8(labels)
    }

    #[test]
    fn full_pipeline_counts_objects() {
        let source = blank(100, 100);
        let shape = RoiShape::Rectangle(Bounds::new(20, 30, 20, 20));
        let cropped = RoiPipeline::new(&source, shape, QuantConfig::default())
            .crop()
            .unwrap();
        assert_eq!(cropped.crop().width(), 20);
        assert!((cropped.roi_area() - 400.0).abs() < f64::EPSILON);

        let result = cropped
            .classify(two_objects(20, 20))
            .unwrap()
            .segment()
            .measure()
            .into_result();
        assert_eq!(result.cell_count(), 2);
        assert!((result.total_cell_area() - 18.0).abs() < f64::EPSILON);
        assert_eq!(result.origin, Point::new(20.0, 30.0));
    }

    #[test]
    fn outlines_are_in_image_coordinates() {
        let source = blank(100, 100);
        let shape = RoiShape::Rectangle(Bounds::new(20, 30, 20, 20));
        let result = RoiPipeline::new(&source, shape, QuantConfig::default())
            .crop()
            .unwrap()
            .classify(two_objects(20, 20))
            .unwrap()
            .segment()
            .measure()
            .into_result();
        let first = result.particles[0].outline.points();
        assert!(first.iter().all(|p| (22.0..=24.0).contains(&p.x)));
        assert!(first.iter().all(|p| (32.0..=34.0).contains(&p.y)));
    }

    #[test]
    fn wrong_classifier_size_is_rejected() {
        let source = blank(50, 50);
        let shape = RoiShape::Rectangle(Bounds::new(0, 0, 10, 10));
        let cropped = RoiPipeline::new(&source, shape, QuantConfig::default())
            .crop()
            .unwrap();
        let err = cropped.classify(blank(11, 10)).err().unwrap();
        assert!(matches!(err, PipelineError::DimensionMismatch { .. }));
    }

    #[test]
    fn roi_outside_image_is_rejected() {
        let source = blank(10, 10);
        let shape = RoiShape::Rectangle(Bounds::new(50, 50, 5, 5));
        let err = RoiPipeline::new(&source, shape, QuantConfig::default())
            .crop()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::RoiOutOfBounds { .. }));
    }

    #[test]
    fn empty_roi_is_rejected() {
        let source = blank(10, 10);
        let shape = RoiShape::Rectangle(Bounds::new(2, 2, 0, 5));
        let err = RoiPipeline::new(&source, shape, QuantConfig::default())
            .crop()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::EmptyRoi));
    }

    #[test]
    fn roi_partially_outside_is_clipped() {
        let source = blank(10, 10);
        let shape = RoiShape::Rectangle(Bounds::new(-5, 5, 10, 10));
        let cropped = RoiPipeline::new(&source, shape, QuantConfig::default())
            .crop()
            .unwrap();
        assert_eq!(cropped.bounds(), Bounds::new(0, 5, 5, 5));
    }

    #[test]
    fn objects_outside_oval_are_ignored() {
        let source = blank(40, 40);
        let shape = RoiShape::Oval(Bounds::new(0, 0, 20, 20));
        let cropped = RoiPipeline::new(&source, shape, QuantConfig::default())
            .crop()
            .unwrap();
        // One object in the corner (outside the ellipse), one in the middle.
        let mut labels = GrayImage::new(20, 20);
        for (x0, y0) in [(1, 1), (9, 9)] {
            for y in y0..y0 + 2 {
                for x in x0..x0 + 2 {
                    labels.put_pixel(x, y, Luma([1]));
                }
            }
        }
        let result = cropped
            .classify(DynamicImage::ImageLuma8(labels))
            .unwrap()
            .segment()
            .measure()
            .into_result();
        assert_eq!(result.cell_count(), 1);
    }
}
