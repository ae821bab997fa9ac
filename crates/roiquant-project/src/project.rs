//! The project store: image entries reconciled from the tables, the
//! image directory and the ROI archives.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::archive::RoiArchive;
use crate::error::{BatchError, EditError, StoreError};
use crate::model::{
    ImageEntry, ImageStatus, RoiRecord, RoiStatus, is_recognized_image, normalize_bregma,
    sort_images,
};
use crate::paths::ProjectPaths;
use crate::tables::{self, RoiRow, StatusRow};
use crate::worker::BatchEvent;

/// An opened project directory.
#[derive(Debug, Clone)]
pub struct Project {
    name: String,
    paths: ProjectPaths,
    images: Vec<ImageEntry>,
    dirty: bool,
}

impl Project {
    /// Open the project at `root`, creating any missing directories and
    /// tables.
    ///
    /// Entries are reconciled in this order:
    ///
    /// 1. rows of the status table;
    /// 2. rows of the ROI table, appending ROI records;
    /// 3. entries still without ROIs are backfilled from their archive;
    /// 4. unlisted files in the image directory are added as
    ///    [`ImageStatus::Untracked`] and backfilled the same way;
    /// 5. entries are sorted by their leading integer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only if a table exists but cannot be read.
    /// Failures creating the layout and reading archives are logged.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let paths = ProjectPaths::new(root);
        paths.ensure();
        let name = paths
            .root()
            .file_name()
            .map_or_else(|| paths.root().display().to_string(), |n| {
                n.to_string_lossy().into_owned()
            });
        let images = load_images(&paths)?;
        log::info!("loaded project {name} with {} image(s)", images.len());
        Ok(Self {
            name,
            paths,
            images,
            dirty: false,
        })
    }

    /// Discard in-memory state and read everything from disk again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a table cannot be read; the current
    /// state is kept in that case.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        self.paths.ensure();
        self.images = load_images(&self.paths)?;
        self.dirty = false;
        Ok(())
    }

    /// Project name (the root directory's final component).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory layout.
    #[must_use]
    pub const fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Image entries in natural order.
    #[must_use]
    pub fn images(&self) -> &[ImageEntry] {
        &self.images
    }

    /// Look up an entry by filename.
    #[must_use]
    pub fn image(&self, filename: &str) -> Option<&ImageEntry> {
        self.images.iter().find(|e| e.filename == filename)
    }

    fn image_mut(&mut self, filename: &str) -> Result<&mut ImageEntry, EditError> {
        self.images
            .iter_mut()
            .find(|e| e.filename == filename)
            .ok_or_else(|| EditError::UnknownImage(filename.to_owned()))
    }

    /// Whether anything changed since the last load or successful sync.
    #[must_use]
    pub const fn has_unsaved_changes(&self) -> bool {
        self.dirty
    }

    /// Rewrite both tables from the in-memory model.
    ///
    /// The ROI table gets one row per ROI record; the status table one
    /// row per image. Returns `true` only if both tables were written.
    pub fn sync(&mut self) -> bool {
        let status_rows: Vec<StatusRow> = self
            .images
            .iter()
            .map(|e| StatusRow {
                filename: e.filename.clone(),
                status: e.status,
            })
            .collect();
        let roi_rows: Vec<RoiRow> = self
            .images
            .iter()
            .flat_map(|e| {
                e.rois.iter().map(|r| RoiRow {
                    filename: e.filename.clone(),
                    roi_name: r.name.clone(),
                    bregma: r.bregma.clone(),
                    status: r.status,
                })
            })
            .collect();

        let mut ok = true;
        if let Err(e) = tables::write_roi_table(&self.paths.roi_table(), &roi_rows) {
            log::error!("sync: {e}");
            ok = false;
        }
        if let Err(e) = tables::write_status_table(&self.paths.status_table(), &status_rows) {
            log::error!("sync: {e}");
            ok = false;
        }
        if ok {
            log::info!(
                "synced {} image(s) and {} ROI(s)",
                status_rows.len(),
                roi_rows.len()
            );
            self.dirty = false;
        }
        ok
    }

    /// Add a ROI record with status [`RoiStatus::Defined`].
    ///
    /// # Errors
    ///
    /// Returns [`EditError`] if the image is unknown, the name is empty
    /// or already used on the image.
    pub fn add_roi(&mut self, filename: &str, name: &str, bregma: &str) -> Result<(), EditError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EditError::EmptyName);
        }
        let entry = self.image_mut(filename)?;
        if entry.roi(name).is_some() {
            return Err(EditError::DuplicateRoi {
                filename: filename.to_owned(),
                name: name.to_owned(),
            });
        }
        entry
            .rois
            .push(RoiRecord::new(name, bregma, RoiStatus::Defined));
        self.dirty = true;
        Ok(())
    }

    /// Rename a ROI and/or change its bregma value; status becomes
    /// [`RoiStatus::Modified`].
    ///
    /// # Errors
    ///
    /// Returns [`EditError`] if the image or ROI is unknown, the new name
    /// is empty, or it is taken by another ROI.
    pub fn update_roi(
        &mut self,
        filename: &str,
        old_name: &str,
        new_name: &str,
        bregma: &str,
    ) -> Result<(), EditError> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(EditError::EmptyName);
        }
        let entry = self.image_mut(filename)?;
        if new_name != old_name && entry.roi(new_name).is_some() {
            return Err(EditError::DuplicateRoi {
                filename: filename.to_owned(),
                name: new_name.to_owned(),
            });
        }
        let record = entry
            .roi_mut(old_name)
            .ok_or_else(|| EditError::UnknownRoi {
                filename: filename.to_owned(),
                name: old_name.to_owned(),
            })?;
        new_name.clone_into(&mut record.name);
        record.bregma = normalize_bregma(bregma.to_owned());
        record.status = RoiStatus::Modified;
        self.dirty = true;
        Ok(())
    }

    /// Remove a ROI record.
    ///
    /// # Errors
    ///
    /// Returns [`EditError`] if the image or ROI is unknown.
    pub fn remove_roi(&mut self, filename: &str, name: &str) -> Result<(), EditError> {
        let entry = self.image_mut(filename)?;
        let before = entry.rois.len();
        entry.rois.retain(|r| r.name != name);
        if entry.rois.len() == before {
            return Err(EditError::UnknownRoi {
                filename: filename.to_owned(),
                name: name.to_owned(),
            });
        }
        self.dirty = true;
        Ok(())
    }

    /// Make an image's ROI list match `archive`.
    ///
    /// The archive decides which ROIs exist and their order; existing
    /// metadata is kept for names already present. New names get
    /// bregma `"N/A"` and status [`RoiStatus::FromFile`]; records whose
    /// name is not in the archive are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`EditError::UnknownImage`] if the image is unknown.
    pub fn reconcile_with_archive(
        &mut self,
        filename: &str,
        archive: &RoiArchive,
    ) -> Result<(), EditError> {
        let entry = self.image_mut(filename)?;
        let mut previous: HashMap<String, RoiRecord> = entry
            .rois
            .drain(..)
            .map(|r| (r.name.clone(), r))
            .collect();
        let reconciled: Vec<RoiRecord> = archive
            .names()
            .map(|name| {
                previous
                    .remove(name)
                    .unwrap_or_else(|| RoiRecord::from_archive(name))
            })
            .collect();
        for dropped in previous.keys() {
            log::info!("{filename}: dropping ROI {dropped:?} not present in archive");
        }
        entry.rois = reconciled;
        self.dirty = true;
        Ok(())
    }

    /// Save an editing session: overwrite the image's archive,
    /// reconcile its ROI list with it and sync both tables.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the image is unknown, the archive cannot
    /// be written, or the sync fails.
    pub fn save_rois(&mut self, filename: &str, archive: &RoiArchive) -> Result<(), StoreError> {
        let path = self.image_mut(filename)?.roi_archive_path.clone();
        archive.save(&path)?;
        self.reconcile_with_archive(filename, archive)?;
        if self.sync() {
            Ok(())
        } else {
            Err(StoreError::SyncFailed)
        }
    }

    /// Mark an image as quantified and exported.
    ///
    /// # Errors
    ///
    /// Returns [`EditError::UnknownImage`] if the image is unknown.
    pub fn mark_finalized(&mut self, filename: &str) -> Result<(), EditError> {
        self.image_mut(filename)?.status = ImageStatus::Finalized;
        self.dirty = true;
        Ok(())
    }

    /// Apply a batch event on the controlling thread. Returns `true` if
    /// the model changed.
    pub fn apply_batch_event(&mut self, event: &BatchEvent) -> bool {
        match event {
            BatchEvent::ImageFinalized { filename, .. } => match self.mark_finalized(filename) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("ignoring finalisation event: {e}");
                    false
                }
            },
            _ => false,
        }
    }

    /// Snapshot of the named entries, in the requested order.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::UnknownImage`] for a name not in the project.
    pub fn selection<S: AsRef<str>>(&self, filenames: &[S]) -> Result<Vec<ImageEntry>, BatchError> {
        filenames
            .iter()
            .map(|f| {
                self.image(f.as_ref())
                    .cloned()
                    .ok_or_else(|| BatchError::UnknownImage(f.as_ref().to_owned()))
            })
            .collect()
    }
}

/// Build the entry list from the tables, image directory and archives.
fn load_images(paths: &ProjectPaths) -> Result<Vec<ImageEntry>, StoreError> {
    let mut images: Vec<ImageEntry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    let mut entry_for = |images: &mut Vec<ImageEntry>, filename: &str, status| -> usize {
        *index.entry(filename.to_owned()).or_insert_with(|| {
            images.push(ImageEntry::new(filename, paths, status));
            images.len() - 1
        })
    };

    for row in tables::read_status_table(&paths.status_table())? {
        let i = entry_for(&mut images, &row.filename, row.status);
        images[i].status = row.status;
    }

    for row in tables::read_roi_table(&paths.roi_table())? {
        let i = entry_for(&mut images, &row.filename, ImageStatus::New);
        if row.roi_name.is_empty() {
            continue;
        }
        let entry = &mut images[i];
        if entry.roi(&row.roi_name).is_some() {
            log::warn!(
                "{}: duplicate ROI row {:?} ignored",
                row.filename,
                row.roi_name
            );
            continue;
        }
        entry
            .rois
            .push(RoiRecord::new(row.roi_name, row.bregma, row.status));
    }

    for entry in &mut images {
        if entry.rois.is_empty() {
            backfill_from_archive(entry);
        }
    }

    let known = images.len();
    for filename in scan_image_dir(paths) {
        let before = images.len();
        let i = entry_for(&mut images, &filename, ImageStatus::Untracked);
        if images.len() > before {
            log::info!("found untracked image {filename}");
            backfill_from_archive(&mut images[i]);
        }
    }
    log::debug!("{} untracked image(s)", images.len() - known);

    sort_images(&mut images);
    Ok(images)
}

/// Recognised image files in the image directory, sorted by name.
fn scan_image_dir(paths: &ProjectPaths) -> Vec<String> {
    let dir = paths.images_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("cannot list {}: {e}", dir.display());
            return Vec::new();
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file() && is_recognized_image(&e.path()))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

/// Populate an entry's ROI list from its archive, if there is one.
fn backfill_from_archive(entry: &mut ImageEntry) {
    if !entry.has_archive() {
        return;
    }
    match RoiArchive::open(&entry.roi_archive_path) {
        Ok(archive) => {
            entry.rois = archive.names().map(RoiRecord::from_archive).collect();
            log::info!(
                "{}: restored {} ROI(s) from archive",
                entry.filename,
                entry.rois.len()
            );
        }
        Err(e) => log::warn!("{}: cannot read ROI archive: {e}", entry.filename),
    }
}
