//! In-memory data model: ROI records and image entries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::paths::ProjectPaths;

/// Image file extensions recognised when scanning the image directory.
pub const RECOGNIZED_EXTENSIONS: &[&str] = &["tif", "tiff", "png"];

/// Suffix appended to an image stem to name its ROI archive.
pub const ARCHIVE_SUFFIX: &str = "_ROIs.zip";

/// Bregma placeholder for ROIs without metadata.
pub const UNKNOWN_BREGMA: &str = "N/A";

/// Lifecycle status of a ROI record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RoiStatus {
    /// Created but not yet drawn.
    New,
    /// Drawn and named in the editor.
    Defined,
    /// Edited after being defined.
    Modified,
    /// Discovered in an archive without matching metadata.
    FromFile,
    /// Status unknown; waiting for the editor.
    #[default]
    Pending,
}

impl RoiStatus {
    /// Table representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Defined => "Defined",
            Self::Modified => "Modified",
            Self::FromFile => "From File",
            Self::Pending => "Pending",
        }
    }
}

impl fmt::Display for RoiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognised status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised status {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for RoiStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "New" => Ok(Self::New),
            "Defined" => Ok(Self::Defined),
            "Modified" => Ok(Self::Modified),
            "From File" | "FromFile" => Ok(Self::FromFile),
            "Pending" => Ok(Self::Pending),
            other => Err(ParseStatusError(other.to_owned())),
        }
    }
}

/// Processing status of an image entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageStatus {
    /// Listed in the tables but not yet processed.
    #[default]
    New,
    /// Found in the image directory but absent from both tables.
    Untracked,
    /// Quantified and exported.
    Finalized,
}

impl ImageStatus {
    /// Table representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Untracked => "Untracked",
            Self::Finalized => "Finalized",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "New" => Ok(Self::New),
            "Untracked" => Ok(Self::Untracked),
            "Finalized" => Ok(Self::Finalized),
            other => Err(ParseStatusError(other.to_owned())),
        }
    }
}

/// Metadata for one named ROI on an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoiRecord {
    /// Name, unique within the image.
    pub name: String,
    /// Free-text anatomical reference.
    pub bregma: String,
    /// Lifecycle status.
    pub status: RoiStatus,
}

impl RoiRecord {
    /// Create a record. A blank bregma becomes [`UNKNOWN_BREGMA`].
    #[must_use]
    pub fn new(name: impl Into<String>, bregma: impl Into<String>, status: RoiStatus) -> Self {
        Self {
            name: name.into(),
            bregma: normalize_bregma(bregma.into()),
            status,
        }
    }

    /// Record synthesised for a ROI found only in its archive.
    #[must_use]
    pub fn from_archive(name: impl Into<String>) -> Self {
        Self::new(name, UNKNOWN_BREGMA, RoiStatus::FromFile)
    }
}

/// Bregma value as stored: blank values become [`UNKNOWN_BREGMA`],
/// anything else is kept verbatim.
#[must_use]
pub fn normalize_bregma(bregma: String) -> String {
    if bregma.trim().is_empty() {
        UNKNOWN_BREGMA.to_owned()
    } else {
        bregma
    }
}

/// One source image with its derived paths and ROI list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// File name inside the image directory.
    pub filename: String,
    /// Full path of the source image.
    pub source_path: PathBuf,
    /// Full path of the ROI archive (may not exist yet).
    pub roi_archive_path: PathBuf,
    /// ROI metadata in stored order.
    pub rois: Vec<RoiRecord>,
    /// Processing status.
    pub status: ImageStatus,
}

impl ImageEntry {
    /// Create an entry with no ROIs, deriving its paths from `paths`.
    #[must_use]
    pub fn new(filename: impl Into<String>, paths: &ProjectPaths, status: ImageStatus) -> Self {
        let filename = filename.into();
        Self {
            source_path: paths.image(&filename),
            roi_archive_path: paths.roi_archive(&filename),
            filename,
            rois: Vec::new(),
            status,
        }
    }

    /// File name without its extension.
    #[must_use]
    pub fn stem(&self) -> &str {
        image_stem(&self.filename)
    }

    /// Whether the ROI archive exists on disk.
    #[must_use]
    pub fn has_archive(&self) -> bool {
        self.roi_archive_path.is_file()
    }

    /// Look up a ROI record by name.
    #[must_use]
    pub fn roi(&self, name: &str) -> Option<&RoiRecord> {
        self.rois.iter().find(|r| r.name == name)
    }

    pub(crate) fn roi_mut(&mut self, name: &str) -> Option<&mut RoiRecord> {
        self.rois.iter_mut().find(|r| r.name == name)
    }
}

/// File name without its final extension.
#[must_use]
pub fn image_stem(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}

/// Archive file name for an image: `{stem}_ROIs.zip`.
#[must_use]
pub fn roi_archive_name(filename: &str) -> String {
    format!("{}{ARCHIVE_SUFFIX}", image_stem(filename))
}

/// Recover the image stem from an archive file name.
#[must_use]
pub fn stem_from_archive_name(archive: &str) -> Option<&str> {
    archive.strip_suffix(ARCHIVE_SUFFIX)
}

/// Whether `path` has one of the [`RECOGNIZED_EXTENSIONS`].
#[must_use]
pub fn is_recognized_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            RECOGNIZED_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Sort key ordering images by the integer before their first `_`.
///
/// The text up to the first `_` (the whole name if there is none) must
/// parse as an integer for the name to count as numbered: `12_a.tif`
/// has key 12, while `3.tif` and `12abc_x.tif` do not. Numbered names
/// sort first, by value; all others sort after them.
#[must_use]
pub fn natural_sort_key(filename: &str) -> (bool, i64) {
    let prefix = filename.split_once('_').map_or(filename, |(head, _)| head);
    prefix
        .trim()
        .parse::<i64>()
        .map_or((true, 0), |n| (false, n))
}

/// Sort image entries in place by [`natural_sort_key`].
///
/// Ties keep the order of the filename sort applied first, so the
/// result does not depend on the order entries were discovered in.
pub fn sort_images(images: &mut [ImageEntry]) {
    images.sort_by(|a, b| a.filename.cmp(&b.filename));
    images.sort_by_key(|entry| natural_sort_key(&entry.filename));
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            RoiStatus::New,
            RoiStatus::Defined,
            RoiStatus::Modified,
            RoiStatus::FromFile,
            RoiStatus::Pending,
        ] {
            assert_eq!(status.to_string().parse::<RoiStatus>().unwrap(), status);
        }
        assert_eq!("From File".parse::<RoiStatus>().unwrap(), RoiStatus::FromFile);
        assert!("bogus".parse::<RoiStatus>().is_err());
    }

    #[test]
    fn archive_name_strips_extension() {
        for ext in RECOGNIZED_EXTENSIONS {
            let filename = format!("12_sample.v2.{ext}");
            let archive = roi_archive_name(&filename);
            assert_eq!(archive, "12_sample.v2_ROIs.zip");
            let stem = stem_from_archive_name(&archive).unwrap();
            assert_eq!(format!("{stem}.{ext}"), filename);
        }
    }

    #[test]
    fn natural_key_orders_numbers_first() {
        assert!(natural_sort_key("2_a.tif") < natural_sort_key("10_a.tif"));
        assert!(natural_sort_key("999_x.tif") < natural_sort_key("foo.tif"));
        assert_eq!(natural_sort_key("foo.tif"), natural_sort_key("bar.tif"));
        assert_eq!(natural_sort_key("007_x.png"), (false, 7));
        assert!(natural_sort_key("-1_a.tif") < natural_sort_key("0_a.tif"));
    }

    #[test]
    fn only_the_text_before_the_first_underscore_counts() {
        assert_eq!(natural_sort_key("3.tif"), (true, 0));
        assert_eq!(natural_sort_key("12abc_x.tif"), (true, 0));
        assert_eq!(natural_sort_key("12_abc_x.tif"), (false, 12));
    }

    #[test]
    fn sort_is_stable_and_total() {
        let paths = ProjectPaths::new("/p");
        let mut images: Vec<ImageEntry> = ["foo.tif", "10_b.tif", "bar.tif", "2_a.tif", "10_a.tif"]
            .into_iter()
            .map(|f| ImageEntry::new(f, &paths, ImageStatus::New))
            .collect();
        sort_images(&mut images);
        let names: Vec<&str> = images.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, ["2_a.tif", "10_a.tif", "10_b.tif", "bar.tif", "foo.tif"]);
    }

    #[test]
    fn recognized_extensions_ignore_case() {
        assert!(is_recognized_image(Path::new("a.TIF")));
        assert!(is_recognized_image(Path::new("a.png")));
        assert!(!is_recognized_image(Path::new("a.jpg")));
        assert!(!is_recognized_image(Path::new("README")));
    }
}
