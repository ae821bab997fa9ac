//! Batch worker: quantify every ROI of a selection of images on a
//! background thread.
//!
//! The worker never touches the [`Project`](crate::Project). It reports
//! through a one-way channel of [`BatchEvent`]s; the controlling thread
//! applies [`BatchEvent::ImageFinalized`] with
//! [`Project::apply_batch_event`](crate::Project::apply_batch_event).
//!
//! ```text
//! Pending -> Running -> Completed | Cancelled | Failed
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use roiquant_pipeline::{DynamicImage, Polyline, QuantConfig, flatten_outlines};

use crate::archive::RoiArchive;
use crate::cache::ClassificationCache;
use crate::classify::{Classifier, ClassifierModels, ClassifierStage};
use crate::error::BatchError;
use crate::model::ImageEntry;
use crate::paths::ProjectPaths;
use crate::quantify::{RoiContext, cache_base, quantify_roi};
use crate::tables::{self, ResultRecord};

/// Immutable input of one batch run.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Images to process, in order, with their ROI lists.
    pub images: Vec<ImageEntry>,
    /// Classifier models.
    pub models: ClassifierModels,
    /// Quantification settings.
    pub config: QuantConfig,
    /// Whether to emit [`BatchEvent::Display`] for intermediate and
    /// final images.
    pub show_images: bool,
}

impl BatchSettings {
    /// Total number of ROIs across all images.
    #[must_use]
    pub fn total_rois(&self) -> usize {
        self.images.iter().map(|e| e.rois.len()).sum()
    }
}

/// Cooperative cancellation flag shared with the worker.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop at the next ROI boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// State of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchStatus {
    /// Not started.
    Pending,
    /// In progress.
    Running,
    /// Every selected ROI was attempted.
    Completed,
    /// Stopped early by the cancellation token.
    Cancelled,
    /// Aborted by a setup error.
    Failed,
}

impl BatchStatus {
    /// Whether the run has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Failed",
        })
    }
}

/// Outcome of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// Terminal status.
    pub status: BatchStatus,
    /// Collected result rows, in processing order.
    pub results: Vec<ResultRecord>,
    /// ROIs attempted (succeeded or failed).
    pub completed: usize,
    /// ROIs that failed.
    pub failed: usize,
    /// ROIs selected.
    pub total: usize,
    /// Whether `results` were appended to the results table.
    pub persisted: bool,
    /// Setup or persistence error, if any.
    pub error: Option<String>,
}

impl BatchReport {
    fn new(total: usize) -> Self {
        Self {
            status: BatchStatus::Pending,
            results: Vec::new(),
            completed: 0,
            failed: 0,
            total,
            persisted: false,
            error: None,
        }
    }

    /// One-line, human-readable status string.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut line = match self.status {
            BatchStatus::Completed => format!(
                "Completed: {} of {} ROI(s) quantified, {} failed",
                self.results.len(),
                self.total,
                self.failed
            ),
            BatchStatus::Cancelled => format!(
                "Cancelled after {} of {} ROI(s); {} result(s) kept",
                self.completed,
                self.total,
                self.results.len()
            ),
            BatchStatus::Failed if self.persisted && !self.results.is_empty() => format!(
                "Failed: {}; {} result(s) saved",
                self.error.as_deref().unwrap_or("unknown error"),
                self.results.len()
            ),
            BatchStatus::Failed => format!(
                "Failed: {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
            status => status.to_string(),
        };
        if self.status != BatchStatus::Failed
            && let Some(error) = &self.error
        {
            line.push_str(&format!(" (results not saved: {error})"));
        }
        line
    }
}

/// Messages from the worker to the controlling thread.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// Another ROI was attempted.
    Progress {
        /// ROIs attempted so far.
        completed: usize,
        /// ROIs selected.
        total: usize,
    },
    /// A ROI failed and was skipped.
    RoiFailed {
        /// Image filename.
        filename: String,
        /// ROI name.
        roi_name: String,
        /// Error description.
        error: String,
    },
    /// An image is ready to be shown. Only sent when
    /// [`BatchSettings::show_images`] is set.
    Display {
        /// Image filename.
        filename: String,
        /// ROI for intermediate images, `None` for the final export.
        roi_name: Option<String>,
        /// Image to show.
        path: PathBuf,
    },
    /// An image's ROIs are done and its export was written.
    ImageFinalized {
        /// Image filename.
        filename: String,
        /// Exported file.
        export_path: PathBuf,
        /// Number of outlines burned into the export.
        outline_count: usize,
    },
    /// The run ended.
    Finished(BatchReport),
}

impl BatchEvent {
    /// Percentage for a [`BatchEvent::Progress`] event.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        match self {
            Self::Progress { completed, total } if *total > 0 => {
                Some(*completed as f64 / *total as f64 * 100.0)
            }
            Self::Progress { .. } => Some(100.0),
            _ => None,
        }
    }
}

/// Runs batches for one project.
pub struct BatchWorker {
    paths: ProjectPaths,
    classifier: Box<dyn Classifier>,
}

impl BatchWorker {
    /// Create a worker for the project at `paths`.
    #[must_use]
    pub fn new(paths: ProjectPaths, classifier: Box<dyn Classifier>) -> Self {
        Self { paths, classifier }
    }

    /// Run a batch on the calling thread.
    ///
    /// Per-ROI errors are logged, reported as [`BatchEvent::RoiFailed`]
    /// and skipped. A missing model or an image that cannot be opened
    /// fails the whole batch. Whatever results were collected, including
    /// those from before a failure, are appended to the results table in
    /// one write.
    pub fn run(
        &self,
        settings: &BatchSettings,
        token: &CancellationToken,
        events: &Sender<BatchEvent>,
    ) -> BatchReport {
        let mut report = BatchReport::new(settings.total_rois());
        report.status = BatchStatus::Running;
        log::info!(
            "batch started: {} image(s), {} ROI(s)",
            settings.images.len(),
            report.total
        );

        let setup_error = match self.process(settings, token, events, &mut report) {
            Ok(status) => {
                report.status = status;
                None
            }
            Err(e) => {
                log::error!("batch failed: {e}");
                report.status = BatchStatus::Failed;
                Some(e.to_string())
            }
        };

        // Rows from images finished before a failure are kept too.
        let persist_error = if setup_error.is_none() || !report.results.is_empty() {
            match tables::append_results(&self.paths.results_table(), &report.results) {
                Ok(()) => {
                    report.persisted = true;
                    None
                }
                Err(e) => {
                    log::error!("cannot save results: {e}");
                    Some(e.to_string())
                }
            }
        } else {
            None
        };
        report.error = match (setup_error, persist_error) {
            (Some(setup), Some(persist)) => Some(format!("{setup} (results not saved: {persist})")),
            (setup, persist) => setup.or(persist),
        };

        log::info!("batch finished: {}", report.summary());
        emit(events, BatchEvent::Finished(report.clone()));
        report
    }

    fn process(
        &self,
        settings: &BatchSettings,
        token: &CancellationToken,
        events: &Sender<BatchEvent>,
        report: &mut BatchReport,
    ) -> Result<BatchStatus, BatchError> {
        for stage in [ClassifierStage::Pixel, ClassifierStage::Object] {
            let model = settings.models.for_stage(stage);
            if !model.is_file() {
                return Err(BatchError::MissingModel {
                    stage: stage.name(),
                    path: model.to_path_buf(),
                });
            }
        }

        let cache = ClassificationCache::new(&self.paths, &*self.classifier, &settings.models);
        let ctx = RoiContext {
            paths: &self.paths,
            cache: &cache,
            config: &settings.config,
        };

        for entry in &settings.images {
            if token.is_cancelled() {
                return Ok(BatchStatus::Cancelled);
            }
            let source =
                image::open(&entry.source_path).map_err(|source| BatchError::OpenImage {
                    path: entry.source_path.clone(),
                    source,
                })?;
            let run = self.process_image(&ctx, entry, &source, settings, token, events, report);
            self.finalize_image(entry, &source, &run.outlines, settings, events);
            if run.cancelled {
                return Ok(BatchStatus::Cancelled);
            }
        }
        Ok(BatchStatus::Completed)
    }

    /// Quantify every ROI of one image.
    #[allow(clippy::too_many_arguments)]
    fn process_image(
        &self,
        ctx: &RoiContext<'_>,
        entry: &ImageEntry,
        source: &DynamicImage,
        settings: &BatchSettings,
        token: &CancellationToken,
        events: &Sender<BatchEvent>,
        report: &mut BatchReport,
    ) -> ImageRun {
        let mut run = ImageRun::default();
        if entry.rois.is_empty() {
            log::info!("{}: no ROIs", entry.filename);
            return run;
        }
        let archive = RoiArchive::open(&entry.roi_archive_path);
        if let Err(e) = &archive {
            log::error!("{}: {e}", entry.filename);
        }

        for roi in &entry.rois {
            if token.is_cancelled() {
                log::info!("{}: cancelled before ROI {}", entry.filename, roi.name);
                run.cancelled = true;
                return run;
            }
            let outcome = match &archive {
                Ok(archive) => {
                    quantify_roi(ctx, entry, archive, roi, source).map_err(|e| error_chain(&e))
                }
                Err(e) => Err(format!("ROI archive unreadable: {e}")),
            };
            match outcome {
                Ok(outcome) => {
                    if settings.show_images {
                        emit(
                            events,
                            BatchEvent::Display {
                                filename: entry.filename.clone(),
                                roi_name: Some(roi.name.clone()),
                                path: self.paths.object_cache(&cache_base(entry, &roi.name)),
                            },
                        );
                    }
                    report.results.push(outcome.record);
                    run.outlines.extend(outcome.outlines);
                }
                Err(error) => {
                    log::error!("{} / {}: {error}", entry.filename, roi.name);
                    report.failed += 1;
                    emit(
                        events,
                        BatchEvent::RoiFailed {
                            filename: entry.filename.clone(),
                            roi_name: roi.name.clone(),
                            error,
                        },
                    );
                }
            }
            report.completed += 1;
            emit(
                events,
                BatchEvent::Progress {
                    completed: report.completed,
                    total: report.total,
                },
            );
        }
        run
    }

    /// Burn the image's outlines into a copy of it and export it.
    fn finalize_image(
        &self,
        entry: &ImageEntry,
        source: &DynamicImage,
        outlines: &[Polyline],
        settings: &BatchSettings,
        events: &Sender<BatchEvent>,
    ) {
        let export_path = self.paths.processed_output(entry.stem());
        let saved = if outlines.is_empty() {
            source.save(&export_path)
        } else {
            flatten_outlines(source, outlines, settings.config.overlay_color).save(&export_path)
        };
        if let Err(e) = saved {
            log::error!("{}: cannot export {}: {e}", entry.filename, export_path.display());
            return;
        }
        log::info!(
            "{}: exported {} with {} outline(s)",
            entry.filename,
            export_path.display(),
            outlines.len()
        );
        if settings.show_images {
            emit(
                events,
                BatchEvent::Display {
                    filename: entry.filename.clone(),
                    roi_name: None,
                    path: export_path.clone(),
                },
            );
        }
        emit(
            events,
            BatchEvent::ImageFinalized {
                filename: entry.filename.clone(),
                export_path,
                outline_count: outlines.len(),
            },
        );
    }

    /// Run a batch on a new background thread.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Spawn`] if the thread cannot be created.
    pub fn start(self, settings: BatchSettings) -> Result<BatchHandle, BatchError> {
        let token = CancellationToken::new();
        let status = Arc::new(Mutex::new(BatchStatus::Pending));
        let (tx, rx) = mpsc::channel();

        let thread = {
            let token = token.clone();
            let status = Arc::clone(&status);
            thread::Builder::new()
                .name("roiquant-batch".to_owned())
                .spawn(move || {
                    set_status(&status, BatchStatus::Running);
                    let report = self.run(&settings, &token, &tx);
                    set_status(&status, report.status);
                    report
                })
                .map_err(BatchError::Spawn)?
        };
        log::debug!("batch worker thread spawned");

        Ok(BatchHandle {
            token,
            status,
            events: rx,
            thread: Some(thread),
        })
    }
}

/// Per-image state collected while its ROIs run.
#[derive(Default)]
struct ImageRun {
    outlines: Vec<Polyline>,
    cancelled: bool,
}

/// Controls a batch running on a background thread.
pub struct BatchHandle {
    token: CancellationToken,
    status: Arc<Mutex<BatchStatus>>,
    events: Receiver<BatchEvent>,
    thread: Option<JoinHandle<BatchReport>>,
}

impl BatchHandle {
    /// Request cancellation at the next ROI boundary.
    pub fn cancel(&self) {
        log::info!("batch cancellation requested");
        self.token.cancel();
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> BatchStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next pending event, without blocking.
    #[must_use]
    pub fn try_event(&self) -> Option<BatchEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking iterator over events; ends when the worker exits.
    pub fn events(&self) -> impl Iterator<Item = BatchEvent> + '_ {
        self.events.iter()
    }

    /// Wait for the worker to finish and return its report.
    #[must_use]
    pub fn wait(mut self) -> BatchReport {
        let Some(thread) = self.thread.take() else {
            return failed_report("batch already joined");
        };
        thread.join().unwrap_or_else(|_| {
            log::error!("batch worker thread panicked");
            set_status(&self.status, BatchStatus::Failed);
            failed_report("batch worker panicked")
        })
    }
}

fn failed_report(error: &str) -> BatchReport {
    BatchReport {
        status: BatchStatus::Failed,
        error: Some(error.to_owned()),
        ..BatchReport::new(0)
    }
}

fn set_status(status: &Mutex<BatchStatus>, value: BatchStatus) {
    *status.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

fn emit(events: &Sender<BatchEvent>, event: BatchEvent) {
    if events.send(event).is_err() {
        log::trace!("batch event dropped; receiver gone");
    }
}

/// An error and all of its sources, joined with `": "`.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        let inner_text = inner.to_string();
        if !text.ends_with(&inner_text) {
            text.push_str(": ");
            text.push_str(&inner_text);
        }
        source = inner.source();
    }
    text
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    use image::{GrayImage, Luma};
    use roiquant_pipeline::{Bounds, RoiShape};

    use super::*;
    use crate::classify::ClassifyRequest;
    use crate::error::ClassifyError;
    use crate::model::{ImageStatus, RoiRecord, RoiStatus};

    /// Labels a 3x3 blob in the centre of each crop. Fails for inputs
    /// whose name contains `bad`.
    #[derive(Default)]
    struct Blob {
        object_calls: AtomicUsize,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl Classifier for Blob {
        fn classify(&self, request: &ClassifyRequest<'_>) -> Result<(), ClassifyError> {
            let name = request.input.file_name().unwrap().to_string_lossy();
            if name.contains("bad") {
                return Err(ClassifyError::Failed {
                    program: "blob".to_owned(),
                    status: "exit status: 2".to_owned(),
                    stderr: "simulated".to_owned(),
                });
            }
            let input = image::open(request.input).unwrap();
            let (w, h) = (input.width(), input.height());
            GrayImage::from_fn(w, h, |x, y| {
                Luma([u8::from(x.abs_diff(w / 2) <= 1 && y.abs_diff(h / 2) <= 1)])
            })
            .save(request.output)
            .unwrap();
            if request.stage == ClassifierStage::Object {
                let n = self.object_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some((k, token)) = &self.cancel_after {
                    if n == *k {
                        token.cancel();
                    }
                }
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: ProjectPaths,
        settings: BatchSettings,
    }

    /// Two images; the first has `names_a`, the second `names_b`.
    fn fixture(names_a: &[&str], names_b: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        paths.ensure();
        let mut images = Vec::new();
        for (filename, names) in [("1_a.tif", names_a), ("2_b.tif", names_b)] {
            GrayImage::new(80, 40).save(paths.image(filename)).unwrap();
            let mut entry = ImageEntry::new(filename, &paths, ImageStatus::New);
            let mut archive = RoiArchive::new();
            for (i, name) in names.iter().enumerate() {
                let x = i32::try_from(i).unwrap() * 20;
                archive.push(*name, RoiShape::Rectangle(Bounds::new(x, 5, 15, 15)));
                entry.rois.push(RoiRecord::new(*name, "0.5", RoiStatus::Defined));
            }
            archive.save(&entry.roi_archive_path).unwrap();
            images.push(entry);
        }
        let models = ClassifierModels {
            pixel: dir.path().join("pixel.ilp"),
            object: dir.path().join("object.ilp"),
        };
        fs::write(&models.pixel, b"model").unwrap();
        fs::write(&models.object, b"model").unwrap();
        Fixture {
            _dir: dir,
            paths,
            settings: BatchSettings {
                images,
                models,
                config: QuantConfig::default(),
                show_images: false,
            },
        }
    }

    fn run(fx: &Fixture, classifier: Blob) -> (BatchReport, Vec<BatchEvent>) {
        let worker = BatchWorker::new(fx.paths.clone(), Box::new(classifier));
        let (tx, rx) = mpsc::channel();
        let report = worker.run(&fx.settings, &CancellationToken::new(), &tx);
        drop(tx);
        (report, rx.iter().collect())
    }

    #[test]
    fn failing_roi_is_isolated() {
        let fx = fixture(&["cortex", "bad", "hippo"], &["dg"]);
        let (report, events) = run(&fx, Blob::default());

        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.failed, 1);
        assert!(report.persisted);
        assert_eq!(tables::read_results(&fx.paths.results_table()).unwrap().len(), 3);

        let percents: Vec<f64> = events.iter().filter_map(BatchEvent::percent).collect();
        assert_eq!(percents.len(), 4);
        assert!((percents[3] - 100.0).abs() < 1e-9);
        assert!(events.iter().any(|e| matches!(
            e,
            BatchEvent::RoiFailed { roi_name, error, .. }
                if roi_name == "bad" && error.contains("simulated")
        )));
        assert!(matches!(events.last(), Some(BatchEvent::Finished(_))));
    }

    #[test]
    fn every_image_is_exported() {
        let fx = fixture(&["cortex"], &[]);
        let (_, events) = run(&fx, Blob::default());
        let finalized: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::ImageFinalized { filename, .. } => Some(filename.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(finalized, ["1_a.tif", "2_b.tif"]);
        assert!(fx.paths.processed_output("1_a").is_file());
        assert!(fx.paths.processed_output("2_b").is_file());
        assert!(!events.iter().any(|e| matches!(e, BatchEvent::Display { .. })));
    }

    #[test]
    fn cancelling_after_k_rois_keeps_k_results() {
        let fx = fixture(&["r1", "r2", "r3"], &["r4", "r5"]);
        let token = CancellationToken::new();
        let blob = Blob {
            cancel_after: Some((2, token.clone())),
            ..Blob::default()
        };
        let worker = BatchWorker::new(fx.paths.clone(), Box::new(blob));
        let (tx, _rx) = mpsc::channel();
        let report = worker.run(&fx.settings, &token, &tx);

        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.completed, 2);
        assert!(report.summary().starts_with("Cancelled"));
        assert_eq!(tables::read_results(&fx.paths.results_table()).unwrap().len(), 2);
    }

    #[test]
    fn missing_model_fails_the_batch() {
        let mut fx = fixture(&["cortex"], &[]);
        fx.settings.models.object = fx.paths.root().join("absent.ilp");
        let (report, _) = run(&fx, Blob::default());
        assert_eq!(report.status, BatchStatus::Failed);
        assert!(!report.persisted);
        assert!(report.summary().contains("object classifier model not found"));
    }

    #[test]
    fn unreadable_image_fails_the_batch_but_keeps_earlier_results() {
        let fx = fixture(&["cortex"], &["dg"]);
        fs::write(fx.paths.image("2_b.tif"), b"not an image").unwrap();
        let (report, _) = run(&fx, Blob::default());
        assert_eq!(report.status, BatchStatus::Failed);
        assert_eq!(report.results.len(), 1);
        assert!(report.persisted);
        assert!(fx.paths.processed_output("1_a").is_file());
        let stored = tables::read_results(&fx.paths.results_table()).unwrap();
        assert_eq!(stored, report.results);
        assert!(report.summary().starts_with("Failed: cannot open"));
        assert!(report.summary().ends_with("; 1 result(s) saved"));
    }

    #[test]
    fn show_images_emits_display_events() {
        let mut fx = fixture(&["cortex"], &[]);
        fx.settings.show_images = true;
        let (_, events) = run(&fx, Blob::default());
        let displays = events
            .iter()
            .filter(|e| matches!(e, BatchEvent::Display { .. }))
            .count();
        // One intermediate for the ROI plus one export per image.
        assert_eq!(displays, 3);
    }

    #[test]
    fn background_run_reports_through_handle() {
        let fx = fixture(&["cortex", "hippo"], &[]);
        let worker = BatchWorker::new(fx.paths.clone(), Box::new(Blob::default()));
        let handle = worker.start(fx.settings.clone()).unwrap();
        let events: Vec<BatchEvent> = handle.events().collect();
        let report = handle.wait();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.results.len(), 2);
        assert!(matches!(events.last(), Some(BatchEvent::Finished(r)) if r == &report));
    }

    #[test]
    fn summary_mentions_counts() {
        let report = BatchReport {
            status: BatchStatus::Completed,
            failed: 1,
            ..BatchReport::new(3)
        };
        assert_eq!(report.summary(), "Completed: 0 of 3 ROI(s) quantified, 1 failed");
    }
}
