//! roiquant-pipeline: Per-ROI quantification of classified microscopy
//! images (sans-IO).
//!
//! For each region of interest the pipeline runs:
//! crop -> (external classification) -> threshold -> optional watershed
//! -> particle analysis -> outline tracing.
//!
//! This crate has **no I/O dependencies** -- it works on in-memory
//! images and returns structured data. Reading tables and archives,
//! invoking the classifier and writing exports all live in
//! `roiquant-project`.

pub mod contour;
pub mod overlay;
pub mod particles;
pub mod pipeline;
pub mod roi;
pub mod threshold;
pub mod types;
pub mod watershed;

pub use overlay::flatten_outlines;
pub use pipeline::{Classified, Cropped, Measured, Pending, RoiPipeline, Segmented};
pub use roi::RoiShape;
pub use types::{
    Bounds, Calibration, Dimensions, DynamicImage, GrayImage, LabelImage, LabelRange, Particle,
    PipelineError, Point, Polyline, QuantConfig, RgbImage, RoiQuantification,
};

/// Quantify one ROI given a function that classifies the cropped image.
///
/// Convenience wrapper around [`RoiPipeline`] for callers that can
/// classify synchronously and have no use for the intermediates.
///
/// # Errors
///
/// Returns any [`PipelineError`] raised by cropping or by a classified
/// image of the wrong size, and any error returned by `classify`
/// (converted via `From`).
pub fn quantify<E>(
    source: &DynamicImage,
    shape: RoiShape,
    config: QuantConfig,
    classify: impl FnOnce(&DynamicImage) -> Result<DynamicImage, E>,
) -> Result<RoiQuantification, E>
where
    E: From<PipelineError>,
{
    let cropped = RoiPipeline::new(source, shape, config).crop()?;
    let classified = classify(cropped.crop())?;
    Ok(cropped
        .classify(classified)?
        .segment()
        .measure()
        .into_result())
}
