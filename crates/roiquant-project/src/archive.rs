//! ROI archives: zip files of ImageJ `.roi` records, one per image.
//!
//! Archives are the authority for ROI names, order and shapes. They are
//! only ever read whole and written whole.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use roiquant_pipeline::RoiShape;
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

use crate::error::ArchiveError;
use crate::roi_codec::{self, Geometry};

/// One named ROI from an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedRoi {
    /// ROI name.
    pub name: String,
    /// Stored geometry.
    pub geometry: Geometry,
}

/// In-memory contents of a ROI archive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoiArchive {
    rois: Vec<ArchivedRoi>,
}

impl RoiArchive {
    /// Create an empty archive.
    #[must_use]
    pub const fn new() -> Self {
        Self { rois: Vec::new() }
    }

    /// Read an archive from disk.
    ///
    /// Non-`.roi` entries and directories are skipped. A ROI's name is
    /// taken from its record when present, otherwise from the entry
    /// name without the `.roi` extension.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] if the file cannot be opened, is not a
    /// zip file, or contains a malformed record.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let io_err = |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        };
        let zip_err = |source| ArchiveError::Zip {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(io_err)?;
        let mut zip = ZipArchive::new(file).map_err(zip_err)?;
        log::debug!("ROI archive {} has {} entries", path.display(), zip.len());

        let mut rois = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(zip_err)?;
            let entry_name = entry.name().to_owned();
            if entry.is_dir() {
                continue;
            }
            let Some(stem) = entry_name
                .rsplit('/')
                .next()
                .and_then(|base| base.strip_suffix(".roi"))
                .map(str::to_owned)
            else {
                log::trace!("skipping non-ROI entry {entry_name}");
                continue;
            };
            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(io_err)?;
            let decoded = roi_codec::decode(&entry_name, &data)?;
            rois.push(ArchivedRoi {
                name: decoded.name.filter(|n| !n.is_empty()).unwrap_or(stem),
                geometry: decoded.geometry,
            });
        }
        Ok(Self { rois })
    }

    /// Overwrite `path` with this archive.
    ///
    /// The archive is written next to `path` and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] if a ROI cannot be encoded or the file
    /// cannot be written. Unsupported geometries cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ArchiveError> {
        let io_err = |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        };
        let zip_err = |source| ArchiveError::Zip {
            path: path.to_path_buf(),
            source,
        };

        let mut records = Vec::with_capacity(self.rois.len());
        for roi in &self.rois {
            let shape = match &roi.geometry {
                Geometry::Area(shape) => shape,
                Geometry::Unsupported { kind } => {
                    return Err(ArchiveError::UnsupportedGeometry {
                        name: roi.name.clone(),
                        kind: *kind,
                    });
                }
            };
            records.push((roi.name.as_str(), roi_codec::encode(&roi.name, shape)?));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let partial = crate::tables::partial_path(path);
        let file = File::create(&partial).map_err(io_err)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, bytes) in records {
            zip.start_file(format!("{name}.roi"), options)
                .map_err(zip_err)?;
            zip.write_all(&bytes).map_err(io_err)?;
        }
        zip.finish().map_err(zip_err)?;
        fs::rename(&partial, path).map_err(io_err)?;
        log::info!("saved {} ROI(s) to {}", self.rois.len(), path.display());
        Ok(())
    }

    /// ROIs in archive order.
    #[must_use]
    pub fn rois(&self) -> &[ArchivedRoi] {
        &self.rois
    }

    /// ROI names in archive order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rois.iter().map(|r| r.name.as_str())
    }

    /// Number of ROIs.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.rois.len()
    }

    /// Whether the archive holds no ROIs.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    /// Maskable shape of the ROI named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::RoiNotFound`] if there is no such ROI and
    /// [`ArchiveError::UnsupportedGeometry`] if it is not an area shape.
    /// `path` is only used in the error.
    pub fn shape(&self, name: &str, path: &Path) -> Result<&RoiShape, ArchiveError> {
        let roi = self
            .rois
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ArchiveError::RoiNotFound {
                path: path.to_path_buf(),
                name: name.to_owned(),
            })?;
        match &roi.geometry {
            Geometry::Area(shape) => Ok(shape),
            Geometry::Unsupported { kind } => Err(ArchiveError::UnsupportedGeometry {
                name: name.to_owned(),
                kind: *kind,
            }),
        }
    }

    /// Append a ROI, replacing any existing ROI of the same name in
    /// place.
    pub fn push(&mut self, name: impl Into<String>, shape: RoiShape) {
        let name = name.into();
        let geometry = Geometry::Area(shape);
        if let Some(existing) = self.rois.iter_mut().find(|r| r.name == name) {
            existing.geometry = geometry;
        } else {
            self.rois.push(ArchivedRoi { name, geometry });
        }
    }

    /// Remove the ROI named `name`. Returns whether one was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.rois.len();
        self.rois.retain(|r| r.name != name);
        self.rois.len() != before
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use roiquant_pipeline::{Bounds, Point};

    use super::*;

    fn sample() -> RoiArchive {
        let mut archive = RoiArchive::new();
        archive.push("cortex", RoiShape::Rectangle(Bounds::new(1, 2, 10, 10)));
        archive.push(
            "hippo",
            RoiShape::Polygon(vec![
                Point::new(0.0, 0.0),
                Point::new(8.0, 0.0),
                Point::new(4.0, 6.0),
            ]),
        );
        archive
    }

    #[test]
    fn save_then_open_preserves_order_and_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1_a_ROIs.zip");
        let archive = sample();
        archive.save(&path).unwrap();
        let back = RoiArchive::open(&path).unwrap();
        assert_eq!(back, archive);
        assert_eq!(back.names().collect::<Vec<_>>(), ["cortex", "hippo"]);
    }

    #[test]
    fn shape_lookup_errors() {
        let archive = sample();
        let path = Path::new("x.zip");
        assert!(archive.shape("cortex", path).is_ok());
        assert!(matches!(
            archive.shape("striatum", path),
            Err(ArchiveError::RoiNotFound { .. })
        ));
    }

    #[test]
    fn push_replaces_same_name() {
        let mut archive = sample();
        archive.push("cortex", RoiShape::Oval(Bounds::new(0, 0, 3, 3)));
        assert_eq!(archive.len(), 2);
        assert_eq!(
            archive.shape("cortex", Path::new("x")).unwrap(),
            &RoiShape::Oval(Bounds::new(0, 0, 3, 3))
        );
        assert!(archive.remove("hippo"));
        assert!(!archive.remove("hippo"));
    }

    #[test]
    fn entry_name_used_when_record_has_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_ROIs.zip");
        let mut record =
            roi_codec::encode("", &RoiShape::Rectangle(Bounds::new(0, 0, 2, 2))).unwrap();
        // Clear the header-2 offset so the record carries no name.
        record[60..64].copy_from_slice(&0_i32.to_be_bytes());
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        zip.start_file("0001-0002.roi", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(&record).unwrap();
        zip.start_file("notes.txt", SimpleFileOptions::default())
            .unwrap();
        zip.finish().unwrap();

        let archive = RoiArchive::open(&path).unwrap();
        assert_eq!(archive.names().collect::<Vec<_>>(), ["0001-0002"]);
    }

    #[test]
    fn garbage_file_is_a_zip_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad_ROIs.zip");
        fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(
            RoiArchive::open(&path),
            Err(ArchiveError::Zip { .. })
        ));
    }
}
