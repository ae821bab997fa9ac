//! Disk memoisation of the two classification stages.
//!
//! Each (image, ROI) pair has a base name `{image_stem}_{roi_name}` and
//! two artifacts under the probabilities directory: the pixel-stage
//! output and the object-stage output. A stage is only run when its
//! artifact is missing or unreadable.

use std::fs;
use std::path::{Path, PathBuf};

use roiquant_pipeline::DynamicImage;

use crate::classify::{Classifier, ClassifierModels, ClassifierStage, ClassifyRequest};
use crate::error::ClassifyError;
use crate::paths::ProjectPaths;

/// How much of the classification was already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// Object output was cached; nothing ran.
    Object,
    /// Pixel output was cached; only the object stage ran.
    Pixel,
    /// Nothing was cached; both stages ran.
    Cold,
}

/// Cache of classifier outputs for one project.
pub struct ClassificationCache<'a> {
    paths: &'a ProjectPaths,
    classifier: &'a dyn Classifier,
    models: &'a ClassifierModels,
}

impl<'a> ClassificationCache<'a> {
    /// Create a cache writing under `paths`' probabilities directory.
    #[must_use]
    pub const fn new(
        paths: &'a ProjectPaths,
        classifier: &'a dyn Classifier,
        models: &'a ClassifierModels,
    ) -> Self {
        Self {
            paths,
            classifier,
            models,
        }
    }

    /// Object-classification output for `base`, running whichever
    /// stages are not cached. `input` is the cropped ROI image on disk.
    ///
    /// On success both artifacts exist.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError`] if a stage fails, produces no output,
    /// or its output cannot be decoded.
    pub fn resolve(
        &self,
        base: &str,
        input: &Path,
    ) -> Result<(DynamicImage, CacheTier), ClassifyError> {
        let object = self.paths.object_cache(base);
        let pixel = self.paths.pixel_cache(base);

        if let Some(image) = load_cached(&object)? {
            log::debug!("{base}: object classification cached");
            return Ok((image, CacheTier::Object));
        }

        let tier = if load_cached(&pixel)?.is_some() {
            log::debug!("{base}: pixel classification cached");
            CacheTier::Pixel
        } else {
            self.run_stage(ClassifierStage::Pixel, input, None, &pixel)?;
            CacheTier::Cold
        };

        self.run_stage(ClassifierStage::Object, input, Some(&pixel), &object)?;
        let image = image::open(&object).map_err(|source| ClassifyError::Decode {
            path: object.clone(),
            source,
        })?;
        Ok((image, tier))
    }

    /// Run one stage into a staging file and move it to `target`.
    fn run_stage(
        &self,
        stage: ClassifierStage,
        input: &Path,
        prior: Option<&Path>,
        target: &Path,
    ) -> Result<(), ClassifyError> {
        let staging = staging_path(target);
        remove_if_present(&staging)?;
        let request = ClassifyRequest {
            stage,
            model: self.models.for_stage(stage),
            input,
            prior,
            output: &staging,
        };
        log::debug!("running {stage} classification for {}", input.display());
        let result = self.classifier.classify(&request);
        if let Err(e) = result {
            remove_if_present(&staging)?;
            return Err(e);
        }
        if !staging.is_file() {
            return Err(ClassifyError::NoOutput {
                stage: stage.name(),
                path: target.to_path_buf(),
            });
        }
        fs::rename(&staging, target).map_err(|source| ClassifyError::Io {
            path: target.to_path_buf(),
            source,
        })
    }
}

/// Decode a cached artifact. Missing files read as `None`; unreadable
/// ones are deleted and also read as `None`.
fn load_cached(path: &Path) -> Result<Option<DynamicImage>, ClassifyError> {
    if !path.is_file() {
        return Ok(None);
    }
    match image::open(path) {
        Ok(image) => Ok(Some(image)),
        Err(e) => {
            log::warn!("discarding unreadable cache artifact {}: {e}", path.display());
            remove_if_present(path)?;
            Ok(None)
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), ClassifyError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ClassifyError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Staging path for a stage output: `name.tiff` becomes
/// `name.partial.tiff`, keeping the extension the classifier uses to
/// pick its output format.
#[must_use]
pub fn staging_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match target.extension() {
        Some(ext) => target.with_file_name(format!("{stem}.partial.{}", ext.to_string_lossy())),
        None => target.with_file_name(format!("{stem}.partial")),
    }
}
