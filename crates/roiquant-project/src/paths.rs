//! On-disk layout of a project directory.
//!
//! ```text
//! <root>/
//!   Images/               source images
//!   ROI_Files/            {stem}_ROIs.zip archives
//!   Processed_Images/     {stem}_processed.tiff exports
//!   Probabilities/        classifier cache artifacts
//!   Temp/                 scratch crops
//!   Image_Status_DB.csv
//!   Project_DB.csv
//!   Results_DB.csv
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::model::roi_archive_name;
use crate::tables::{RESULTS_HEADER, ROI_HEADER, STATUS_HEADER};

/// Source image directory name.
pub const IMAGES_DIR: &str = "Images";
/// ROI archive directory name.
pub const ROI_FILES_DIR: &str = "ROI_Files";
/// Export directory name.
pub const PROCESSED_DIR: &str = "Processed_Images";
/// Classification cache directory name.
pub const PROBABILITIES_DIR: &str = "Probabilities";
/// Scratch directory name.
pub const TEMP_DIR: &str = "Temp";
/// Image status table file name.
pub const STATUS_TABLE: &str = "Image_Status_DB.csv";
/// ROI metadata table file name.
pub const ROI_TABLE: &str = "Project_DB.csv";
/// Results table file name.
pub const RESULTS_TABLE: &str = "Results_DB.csv";

/// Every path derived from a project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    /// Derive the layout for `root`. Nothing is touched on disk.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create every missing directory and headered table.
    ///
    /// Failures are logged and otherwise ignored; later reads and writes
    /// will report them with more context.
    pub fn ensure(&self) {
        for dir in [
            self.images_dir(),
            self.roi_dir(),
            self.processed_dir(),
            self.probabilities_dir(),
            self.temp_dir(),
        ] {
            if dir.is_dir() {
                continue;
            }
            match fs::create_dir_all(&dir) {
                Ok(()) => log::info!("created {}", dir.display()),
                Err(e) => log::error!("cannot create {}: {e}", dir.display()),
            }
        }
        for (table, header) in [
            (self.status_table(), STATUS_HEADER),
            (self.roi_table(), ROI_HEADER),
            (self.results_table(), RESULTS_HEADER),
        ] {
            if table.exists() {
                continue;
            }
            let line = format!("{}\n", header.join(","));
            match fs::write(&table, line) {
                Ok(()) => log::info!("created {}", table.display()),
                Err(e) => log::error!("cannot create {}: {e}", table.display()),
            }
        }
    }

    /// Project root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Source image directory.
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    /// ROI archive directory.
    #[must_use]
    pub fn roi_dir(&self) -> PathBuf {
        self.root.join(ROI_FILES_DIR)
    }

    /// Processed export directory.
    #[must_use]
    pub fn processed_dir(&self) -> PathBuf {
        self.root.join(PROCESSED_DIR)
    }

    /// Classification cache directory.
    #[must_use]
    pub fn probabilities_dir(&self) -> PathBuf {
        self.root.join(PROBABILITIES_DIR)
    }

    /// Scratch directory.
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    /// Image status table.
    #[must_use]
    pub fn status_table(&self) -> PathBuf {
        self.root.join(STATUS_TABLE)
    }

    /// ROI metadata table.
    #[must_use]
    pub fn roi_table(&self) -> PathBuf {
        self.root.join(ROI_TABLE)
    }

    /// Results table.
    #[must_use]
    pub fn results_table(&self) -> PathBuf {
        self.root.join(RESULTS_TABLE)
    }

    /// Path of a source image.
    #[must_use]
    pub fn image(&self, filename: &str) -> PathBuf {
        self.images_dir().join(filename)
    }

    /// Path of the ROI archive belonging to `filename`.
    #[must_use]
    pub fn roi_archive(&self, filename: &str) -> PathBuf {
        self.roi_dir().join(roi_archive_name(filename))
    }

    /// Export path for an image with the given stem.
    #[must_use]
    pub fn processed_output(&self, stem: &str) -> PathBuf {
        self.processed_dir().join(format!("{stem}_processed.tiff"))
    }

    /// Scratch crop path for a cache base name.
    #[must_use]
    pub fn scratch_crop(&self, base: &str) -> PathBuf {
        self.temp_dir().join(format!("{base}_crop.tiff"))
    }

    /// Pixel-classification cache artifact for a base name.
    #[must_use]
    pub fn pixel_cache(&self, base: &str) -> PathBuf {
        self.probabilities_dir()
            .join(format!("{base}_pixel_probabilities.tiff"))
    }

    /// Object-classification cache artifact for a base name.
    #[must_use]
    pub fn object_cache(&self, base: &str) -> PathBuf {
        self.probabilities_dir()
            .join(format!("{base}_object_predictions.tiff"))
    }
}
