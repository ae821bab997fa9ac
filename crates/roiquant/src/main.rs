//! roiquant: command-line front end for ROI projects.
//!
//! Lists and syncs a project's image and ROI tables, runs batch
//! quantification through an external pixel/object classifier, and
//! prints the accumulated results.
//!
//! # Usage
//!
//! ```text
//! roiquant status <PROJECT>
//! roiquant sync <PROJECT>
//! roiquant run <PROJECT> --pixel-model <ILP> --object-model <ILP> [--image <NAME>]...
//! roiquant results <PROJECT> [--json]
//! ```
//!
//! Logging goes to stderr; set `RUST_LOG` to change the default `info`
//! level.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use roiquant_pipeline::QuantConfig;
use roiquant_project::{
    BatchEvent, BatchSettings, BatchStatus, BatchWorker, ClassifierModels, CommandClassifier,
    Project, tables,
};

/// Catalogue microscopy images and ROIs, then count and measure
/// classified objects per ROI.
#[derive(Parser)]
#[command(name = "roiquant", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List images with their ROI file, ROI count and status.
    Status {
        /// Project root directory.
        project: PathBuf,
    },
    /// Load the project and rewrite both tables, registering untracked
    /// images.
    Sync {
        /// Project root directory.
        project: PathBuf,
    },
    /// Quantify the ROIs of the selected images.
    Run(RunArgs),
    /// Print the accumulated results table.
    Results {
        /// Project root directory.
        project: PathBuf,

        /// Print JSON instead of tab-separated text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Project root directory.
    project: PathBuf,

    /// Pixel classification model.
    #[arg(long)]
    pixel_model: PathBuf,

    /// Object classification model.
    #[arg(long)]
    object_model: PathBuf,

    /// Image to process (repeatable). All images when omitted.
    #[arg(long = "image", value_name = "NAME")]
    images: Vec<String>,

    /// Report every intermediate and exported image as it is written.
    #[arg(long)]
    show_images: bool,

    /// Quantification config as a JSON file.
    #[arg(long, conflicts_with = "config_json")]
    config: Option<PathBuf>,

    /// Quantification config as a JSON string.
    ///
    /// The JSON must be a valid `QuantConfig` serialization; missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,

    /// Classifier command description as a JSON file.
    #[arg(long, conflicts_with = "ilastik")]
    classifier: Option<PathBuf>,

    /// Classifier program with the default headless arguments.
    #[arg(long, default_value = CommandClassifier::DEFAULT_PROGRAM)]
    ilastik: String,
}

/// Build a [`QuantConfig`] from `--config` or `--config-json`, or the
/// defaults when neither is given.
fn config_from_cli(args: &RunArgs) -> Result<QuantConfig, String> {
    if let Some(ref json) = args.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }
    if let Some(ref path) = args.config {
        let json = read_to_string(path)?;
        return serde_json::from_str(&json)
            .map_err(|e| format!("Error parsing {}: {e}", path.display()));
    }
    Ok(QuantConfig::default())
}

fn classifier_from_cli(args: &RunArgs) -> Result<CommandClassifier, String> {
    match args.classifier {
        Some(ref path) => {
            let json = read_to_string(path)?;
            serde_json::from_str(&json)
                .map_err(|e| format!("Error parsing {}: {e}", path.display()))
        }
        None => Ok(CommandClassifier::with_program(args.ilastik.clone())),
    }
}

fn read_to_string(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("Error reading {}: {e}", path.display()))
}

fn load(root: &Path) -> Result<Project, String> {
    Project::load(root).map_err(|e| format!("Error loading project {}: {e}", root.display()))
}

fn status(root: &Path) -> Result<ExitCode, String> {
    let project = load(root)?;
    println!("{}: {} image(s)", project.name(), project.images().len());
    println!("filename\troi_file\trois\tstatus");
    for entry in project.images() {
        println!(
            "{}\t{}\t{}\t{}",
            entry.filename,
            if entry.has_archive() { "yes" } else { "no" },
            entry.rois.len(),
            entry.status,
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn sync(root: &Path) -> Result<ExitCode, String> {
    let mut project = load(root)?;
    if !project.sync() {
        return Err(format!("Error syncing {}", root.display()));
    }
    eprintln!("Synced {} image(s)", project.images().len());
    Ok(ExitCode::SUCCESS)
}

fn results(root: &Path, json: bool) -> Result<ExitCode, String> {
    let paths = load(root)?.paths().clone();
    let records = tables::read_results(&paths.results_table()).map_err(|e| e.to_string())?;
    if json {
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| format!("Error serializing results: {e}"))?;
        println!("{json}");
        return Ok(ExitCode::SUCCESS);
    }
    println!("filename\troi_name\troi_area\tbregma_value\tcell_count\ttotal_cell_area");
    for r in &records {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            r.filename, r.roi_name, r.roi_area, r.bregma_value, r.cell_count, r.total_cell_area
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run(args: &RunArgs) -> Result<ExitCode, String> {
    let config = config_from_cli(args)?;
    let classifier = classifier_from_cli(args)?;
    log::debug!("config: {config:?}");
    log::debug!("classifier: {classifier:?}");
    let mut project = load(&args.project)?;

    let images = if args.images.is_empty() {
        project.images().to_vec()
    } else {
        project.selection(&args.images).map_err(|e| e.to_string())?
    };
    let settings = BatchSettings {
        images,
        models: ClassifierModels {
            pixel: args.pixel_model.clone(),
            object: args.object_model.clone(),
        },
        config,
        show_images: args.show_images,
    };
    eprintln!(
        "Running {} ROI(s) on {} image(s) with {}",
        settings.total_rois(),
        settings.images.len(),
        classifier.program,
    );

    let worker = BatchWorker::new(project.paths().clone(), Box::new(classifier));
    let handle = worker.start(settings).map_err(|e| e.to_string())?;
    for event in handle.events() {
        match &event {
            BatchEvent::Progress { completed, total } => {
                let percent = event.percent().unwrap_or_default();
                eprintln!("[{percent:5.1}%] {completed}/{total}");
            }
            BatchEvent::RoiFailed {
                filename,
                roi_name,
                error,
            } => eprintln!("  {filename} / {roi_name}: {error}"),
            BatchEvent::Display {
                filename,
                roi_name,
                path,
            } => match roi_name {
                Some(roi) => eprintln!("  {filename} / {roi}: {}", path.display()),
                None => eprintln!("  {filename}: {}", path.display()),
            },
            BatchEvent::ImageFinalized {
                filename,
                export_path,
                outline_count,
            } => {
                eprintln!(
                    "  {filename}: {outline_count} outline(s) -> {}",
                    export_path.display()
                );
                project.apply_batch_event(&event);
            }
            BatchEvent::Finished(_) => {}
        }
    }

    let report = handle.wait();
    if project.has_unsaved_changes() && !project.sync() {
        eprintln!("Warning: image status could not be saved");
    }
    println!("{}", report.summary());
    Ok(if report.status == BatchStatus::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let outcome = match &cli.command {
        Command::Status { project } => status(project),
        Command::Sync { project } => sync(project),
        Command::Run(args) => run(args),
        Command::Results { project, json } => results(project, *json),
    };
    match outcome {
        Ok(code) => code,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}
