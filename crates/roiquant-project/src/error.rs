//! Error types for the project store, ROI archives, classification and
//! batch runs.

use std::io;
use std::path::PathBuf;

use roiquant_pipeline::PipelineError;

/// Errors reading or writing the project's CSV tables.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A table could not be read or written.
    #[error("{}: {source}", path.display())]
    Csv {
        /// Table path.
        path: PathBuf,
        /// Underlying CSV error.
        #[source]
        source: csv::Error,
    },

    /// A filesystem operation failed.
    #[error("{}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Writing a ROI archive failed while saving an editor session.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// An editing request was rejected.
    #[error(transparent)]
    Edit(#[from] EditError),

    /// One or both tables could not be rewritten.
    #[error("sync failed; in-memory state is unchanged")]
    SyncFailed,
}

/// Errors reading, writing or decoding ROI archives.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The archive file could not be opened or written.
    #[error("{}: {source}", path.display())]
    Io {
        /// Archive path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The zip container is malformed.
    #[error("{}: {source}", path.display())]
    Zip {
        /// Archive path.
        path: PathBuf,
        /// Underlying zip error.
        #[source]
        source: zip::result::ZipError,
    },

    /// A `.roi` entry could not be decoded.
    #[error("ROI entry {entry:?}: {reason}")]
    Decode {
        /// Entry name inside the archive.
        entry: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The archive has no ROI of that name.
    #[error("no ROI named {name:?} in {}", path.display())]
    RoiNotFound {
        /// Archive path.
        path: PathBuf,
        /// Requested ROI name.
        name: String,
    },

    /// The ROI exists but is not an area shape the pipeline can mask.
    #[error("ROI {name:?} has unsupported geometry type {kind}")]
    UnsupportedGeometry {
        /// ROI name.
        name: String,
        /// Raw ImageJ ROI type code.
        kind: u8,
    },

    /// The shape cannot be represented in the `.roi` format.
    #[error("ROI {name:?}: {reason}")]
    Encode {
        /// ROI name.
        name: String,
        /// What could not be encoded.
        reason: String,
    },
}

/// Rejections of editing requests made against the project.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    /// No image entry with that filename.
    #[error("unknown image {0:?}")]
    UnknownImage(String),

    /// No ROI with that name on the image.
    #[error("image {filename:?} has no ROI named {name:?}")]
    UnknownRoi {
        /// Image filename.
        filename: String,
        /// ROI name.
        name: String,
    },

    /// A ROI with that name already exists on the image.
    #[error("image {filename:?} already has a ROI named {name:?}")]
    DuplicateRoi {
        /// Image filename.
        filename: String,
        /// ROI name.
        name: String,
    },

    /// ROI names may not be empty.
    #[error("ROI name is empty")]
    EmptyName,
}

/// Errors from an external classification stage.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// The classifier program could not be started.
    #[error("could not run {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The classifier exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        /// Program that failed.
        program: String,
        /// Exit status description.
        status: String,
        /// Captured standard error (trimmed).
        stderr: String,
    },

    /// The stage reported success but wrote nothing.
    #[error("{stage} classification produced no output at {}", path.display())]
    NoOutput {
        /// Stage name.
        stage: &'static str,
        /// Expected output path.
        path: PathBuf,
    },

    /// A stage output could not be decoded as an image.
    #[error("cannot decode {}: {source}", path.display())]
    Decode {
        /// Artifact path.
        path: PathBuf,
        /// Underlying image error.
        #[source]
        source: image::ImageError,
    },

    /// Moving or removing a cache artifact failed.
    #[error("{}: {source}", path.display())]
    Io {
        /// Artifact path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Errors that abort a single ROI without affecting the rest of the batch.
#[derive(Debug, thiserror::Error)]
pub enum RoiError {
    /// The ROI could not be resolved from the archive.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Classification failed.
    #[error(transparent)]
    Classify(#[from] ClassifyError),

    /// The quantification algorithm rejected the ROI.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Writing the scratch crop failed.
    #[error("cannot write scratch crop {}: {source}", path.display())]
    Scratch {
        /// Scratch path.
        path: PathBuf,
        /// Underlying image error.
        #[source]
        source: image::ImageError,
    },
}

/// Errors that abort a whole batch before or during setup.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// A selected source image could not be opened.
    #[error("cannot open image {}: {source}", path.display())]
    OpenImage {
        /// Image path.
        path: PathBuf,
        /// Underlying image error.
        #[source]
        source: image::ImageError,
    },

    /// A classifier model file does not exist.
    #[error("{stage} classifier model not found: {}", path.display())]
    MissingModel {
        /// Stage name.
        stage: &'static str,
        /// Model path.
        path: PathBuf,
    },

    /// A selected image is not part of the project.
    #[error("image {0:?} is not in the project")]
    UnknownImage(String),

    /// The worker thread could not be spawned.
    #[error("cannot start batch worker: {0}")]
    Spawn(#[source] io::Error),
}
