//! roiquant-project: Project store, ROI archives, classification cache
//! and batch worker.
//!
//! Everything in roiquant that touches the filesystem or runs external
//! programs lives here. The quantification algorithm itself is in
//! `roiquant-pipeline`.
//!
//! ```no_run
//! # use roiquant_project::{BatchSettings, BatchWorker, ClassifierModels, CommandClassifier, Project};
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut project = Project::load("/data/experiment-7")?;
//! let settings = BatchSettings {
//!     images: project.images().to_vec(),
//!     models: ClassifierModels {
//!         pixel: "/models/pixel.ilp".into(),
//!         object: "/models/object.ilp".into(),
//!     },
//!     config: Default::default(),
//!     show_images: false,
//! };
//! let worker = BatchWorker::new(project.paths().clone(), Box::new(CommandClassifier::default()));
//! let handle = worker.start(settings)?;
//! for event in handle.events() {
//!     project.apply_batch_event(&event);
//! }
//! println!("{}", handle.wait().summary());
//! project.sync();
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod classify;
pub mod error;
pub mod model;
pub mod paths;
pub mod project;
pub mod quantify;
pub mod roi_codec;
pub mod tables;
pub mod worker;

pub use archive::{ArchivedRoi, RoiArchive};
pub use cache::{CacheTier, ClassificationCache};
pub use classify::{
    Classifier, ClassifierModels, ClassifierStage, ClassifyRequest, CommandClassifier,
};
pub use error::{ArchiveError, BatchError, ClassifyError, EditError, RoiError, StoreError};
pub use model::{ImageEntry, ImageStatus, RoiRecord, RoiStatus};
pub use paths::ProjectPaths;
pub use project::Project;
pub use roi_codec::Geometry;
pub use tables::ResultRecord;
pub use worker::{
    BatchEvent, BatchHandle, BatchReport, BatchSettings, BatchStatus, BatchWorker,
    CancellationToken,
};
