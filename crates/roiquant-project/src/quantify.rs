//! Per-ROI orchestration: archive lookup, scratch crop, cached
//! classification and the quantification pipeline.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use roiquant_pipeline::{DynamicImage, Polyline, QuantConfig, RoiPipeline};

use crate::archive::RoiArchive;
use crate::cache::{CacheTier, ClassificationCache};
use crate::error::RoiError;
use crate::model::{ImageEntry, RoiRecord};
use crate::paths::ProjectPaths;
use crate::tables::ResultRecord;

/// Result of quantifying one ROI.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiOutcome {
    /// Row for the results table.
    pub record: ResultRecord,
    /// Particle outlines in source-image coordinates.
    pub outlines: Vec<Polyline>,
    /// How much classification was served from the cache.
    pub tier: CacheTier,
}

/// A file removed when the guard is dropped.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Guard `path`. The file need not exist yet.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Guarded path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => log::trace!("removed {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("cannot remove scratch file {}: {e}", self.path.display()),
        }
    }
}

/// Encode a ROI name for use in file names.
///
/// ASCII letters, digits, `-`, `.` and space are kept; every other byte,
/// including `_` and `%`, is written as `%XX`. Distinct names always
/// encode differently.
#[must_use]
pub fn encode_name(name: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b' ') {
            encoded.push(char::from(byte));
        } else {
            encoded.push('%');
            encoded.push(char::from(HEX[usize::from(byte >> 4)]));
            encoded.push(char::from(HEX[usize::from(byte & 0x0f)]));
        }
    }
    encoded
}

/// Cache base name for a ROI on an image: `{stem}_{encoded roi_name}`.
///
/// The encoded name never contains `_`, so the text after the last `_`
/// identifies the ROI and different (image, ROI) pairs never share a
/// base name.
#[must_use]
pub fn cache_base(entry: &ImageEntry, roi_name: &str) -> String {
    format!("{}_{}", entry.stem(), encode_name(roi_name))
}

/// Everything a ROI needs besides its own identity.
pub struct RoiContext<'a> {
    /// Project layout.
    pub paths: &'a ProjectPaths,
    /// Classification cache.
    pub cache: &'a ClassificationCache<'a>,
    /// Quantification settings.
    pub config: &'a QuantConfig,
}

/// Quantify one ROI of `entry`.
///
/// The scratch crop written for the classifier is removed on every
/// exit path.
///
/// # Errors
///
/// Returns [`RoiError`] if the ROI is missing from the archive or has
/// unsupported geometry, cropping fails, or classification fails.
pub fn quantify_roi(
    ctx: &RoiContext<'_>,
    entry: &ImageEntry,
    archive: &RoiArchive,
    roi: &RoiRecord,
    source: &DynamicImage,
) -> Result<RoiOutcome, RoiError> {
    let shape = archive.shape(&roi.name, &entry.roi_archive_path)?.clone();
    let cropped = RoiPipeline::new(source, shape, ctx.config.clone()).crop()?;

    let base = cache_base(entry, &roi.name);
    let scratch = ScratchFile::new(ctx.paths.scratch_crop(&base));
    cropped
        .crop()
        .save(scratch.path())
        .map_err(|source| RoiError::Scratch {
            path: scratch.path().to_path_buf(),
            source,
        })?;

    let (classified, tier) = ctx.cache.resolve(&base, scratch.path())?;
    drop(scratch);

    let result = cropped
        .classify(classified)?
        .segment()
        .measure()
        .into_result();
    log::debug!(
        "{}/{}: {} cell(s), {:?} cache",
        entry.filename,
        roi.name,
        result.cell_count(),
        tier
    );

    Ok(RoiOutcome {
        record: ResultRecord {
            filename: entry.filename.clone(),
            roi_name: roi.name.clone(),
            roi_area: result.roi_area,
            bregma_value: roi.bregma.clone(),
            cell_count: result.cell_count() as u64,
            total_cell_area: result.total_cell_area(),
        },
        outlines: result.particles.into_iter().map(|p| p.outline).collect(),
        tier,
    })
}
