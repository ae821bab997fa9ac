//! Integration test: build a project on disk, sync and reload it, then
//! run a batch through a fake classifier.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, mpsc};

use image::{GrayImage, Luma};
use roiquant_pipeline::{Bounds, QuantConfig, RoiShape};
use roiquant_project::{
    BatchEvent, BatchSettings, BatchStatus, BatchWorker, CancellationToken, Classifier,
    ClassifierModels, ClassifierStage, ClassifyError, ClassifyRequest, ImageStatus, Project,
    ProjectPaths, RoiArchive, RoiStatus, tables,
};

/// Writes two separated 2x2 objects into every stage output and records
/// each call.
#[derive(Default, Clone)]
struct TwoBlobs {
    calls: Arc<Mutex<Vec<(ClassifierStage, String)>>>,
}

impl TwoBlobs {
    fn stages(&self) -> Vec<ClassifierStage> {
        self.calls.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }
}

impl Classifier for TwoBlobs {
    fn classify(&self, request: &ClassifyRequest<'_>) -> Result<(), ClassifyError> {
        let input = image::open(request.input).unwrap();
        let name = request.input.file_name().unwrap().to_string_lossy().into_owned();
        self.calls.lock().unwrap().push((request.stage, name));
        let (w, h) = (input.width(), input.height());
        GrayImage::from_fn(w, h, |x, y| {
            let in_first = (3..5).contains(&x) && (3..5).contains(&y);
            let in_second = (w - 5..w - 3).contains(&x) && (h - 5..h - 3).contains(&y);
            Luma([u8::from(in_first || in_second)])
        })
        .save(request.output)
        .unwrap();
        Ok(())
    }
}

fn write_image(paths: &ProjectPaths, name: &str) {
    GrayImage::new(100, 60).save(paths.image(name)).unwrap();
}

fn models(root: &Path) -> ClassifierModels {
    let models = ClassifierModels {
        pixel: root.join("pixel.ilp"),
        object: root.join("object.ilp"),
    };
    fs::write(&models.pixel, b"ilp").unwrap();
    fs::write(&models.object, b"ilp").unwrap();
    models
}

#[test]
fn sync_writes_one_roi_row_and_one_status_row_per_image() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ProjectPaths::new(dir.path());
    paths.ensure();
    write_image(&paths, "foo.tif");
    write_image(&paths, "1_a.tif");

    let mut project = Project::load(dir.path()).unwrap();
    let order: Vec<&str> = project.images().iter().map(|e| e.filename.as_str()).collect();
    assert_eq!(order, ["1_a.tif", "foo.tif"]);

    project.add_roi("1_a.tif", "cortex", "-1.2").unwrap();
    assert!(project.sync());

    let roi_table = fs::read_to_string(paths.roi_table()).unwrap();
    let roi_lines: Vec<&str> = roi_table.lines().collect();
    assert_eq!(roi_lines, ["filename,roi_name,bregma,status", "1_a.tif,cortex,-1.2,Defined"]);

    let status_table = fs::read_to_string(paths.status_table()).unwrap();
    assert_eq!(status_table.lines().count(), 3);

    let reloaded = Project::load(dir.path()).unwrap();
    assert_eq!(reloaded.images(), project.images());
    assert_eq!(reloaded.image("foo.tif").unwrap().status, ImageStatus::Untracked);
}

#[test]
fn batch_quantifies_caches_and_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ProjectPaths::new(dir.path());
    paths.ensure();
    write_image(&paths, "1_a.tif");
    write_image(&paths, "2_b.png");

    let mut project = Project::load(dir.path()).unwrap();
    let mut archive = RoiArchive::new();
    archive.push("cortex", RoiShape::Rectangle(Bounds::new(10, 10, 30, 30)));
    archive.push("hippo", RoiShape::Oval(Bounds::new(50, 10, 40, 40)));
    project.save_rois("1_a.tif", &archive).unwrap();
    project.update_roi("1_a.tif", "cortex", "cortex", "-1.2").unwrap();

    let settings = BatchSettings {
        images: project.selection(&["1_a.tif", "2_b.png"]).unwrap(),
        models: models(dir.path()),
        config: QuantConfig {
            watershed: false,
            ..QuantConfig::default()
        },
        show_images: false,
    };

    let classifier = TwoBlobs::default();
    let worker = BatchWorker::new(paths.clone(), Box::new(classifier.clone()));
    let (tx, rx) = mpsc::channel();
    let report = worker.run(&settings, &CancellationToken::new(), &tx);
    drop(tx);

    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.total, 2);
    assert_eq!(report.results.len(), 2);
    let cortex = &report.results[0];
    assert_eq!(cortex.roi_name, "cortex");
    assert_eq!(cortex.bregma_value, "-1.2");
    assert_eq!(cortex.cell_count, 2);
    assert!((cortex.total_cell_area - 8.0).abs() < 1e-9);
    assert!((cortex.roi_area - 900.0).abs() < 1e-9);
    assert_eq!(report.results[1].bregma_value, "N/A");

    for event in rx.iter() {
        project.apply_batch_event(&event);
    }
    assert_eq!(project.image("1_a.tif").unwrap().status, ImageStatus::Finalized);
    assert_eq!(project.image("2_b.png").unwrap().status, ImageStatus::Finalized);
    assert!(project.has_unsaved_changes());
    assert!(project.sync());

    assert!(paths.object_cache("1_a_cortex").is_file());
    assert!(paths.pixel_cache("1_a_hippo").is_file());
    assert!(paths.processed_output("1_a").is_file());
    assert!(paths.processed_output("2_b").is_file());
    assert_eq!(fs::read_dir(paths.temp_dir()).unwrap().count(), 0);

    let exported = image::open(paths.processed_output("1_a")).unwrap().to_rgb8();
    let yellow = image::Rgb([255, 255, 0]);
    assert!(exported.pixels().any(|p| *p == yellow));

    let stored = tables::read_results(&paths.results_table()).unwrap();
    assert_eq!(stored, report.results);

    // Two ROIs, each through both stages once.
    assert_eq!(classifier.stages().len(), 4);
}

#[test]
fn rerun_uses_cached_classification() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ProjectPaths::new(dir.path());
    paths.ensure();
    write_image(&paths, "3_c.tif");
    let mut project = Project::load(dir.path()).unwrap();
    let mut archive = RoiArchive::new();
    archive.push("dg", RoiShape::Rectangle(Bounds::new(0, 0, 40, 40)));
    project.save_rois("3_c.tif", &archive).unwrap();
    assert_eq!(
        project.image("3_c.tif").unwrap().rois[0].status,
        RoiStatus::FromFile
    );

    let settings = BatchSettings {
        images: project.images().to_vec(),
        models: models(dir.path()),
        config: QuantConfig::default(),
        show_images: false,
    };

    let classifier = TwoBlobs::default();
    let worker = BatchWorker::new(paths.clone(), Box::new(classifier.clone()));
    for _ in 0..2 {
        let (tx, _rx) = mpsc::channel::<BatchEvent>();
        let report = worker.run(&settings, &CancellationToken::new(), &tx);
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.results.len(), 1);
    }
    assert_eq!(
        classifier.stages(),
        [ClassifierStage::Pixel, ClassifierStage::Object]
    );
    // Results accumulate across runs.
    assert_eq!(tables::read_results(&paths.results_table()).unwrap().len(), 2);
}
