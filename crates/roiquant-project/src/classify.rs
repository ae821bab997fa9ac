//! External classification stages.
//!
//! Classification is done by an external program that works on files.
//! The [`Classifier`] trait is the only seam between the pipeline and
//! that program: every call names its model, input, optional prior
//! output and the output path explicitly.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::ClassifyError;

/// The two classification stages, run in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassifierStage {
    /// Per-pixel class probabilities.
    Pixel,
    /// Object labels derived from pixel probabilities.
    Object,
}

impl ClassifierStage {
    /// Lowercase stage name for messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pixel => "pixel",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for ClassifierStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One stage invocation.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyRequest<'a> {
    /// Which stage to run.
    pub stage: ClassifierStage,
    /// Trained model file for the stage.
    pub model: &'a Path,
    /// Raw input image.
    pub input: &'a Path,
    /// Output of the previous stage, for the object stage.
    pub prior: Option<&'a Path>,
    /// Where the stage must write its single output image.
    pub output: &'a Path,
}

/// An external classification backend.
pub trait Classifier: Send + Sync {
    /// Run one stage, writing its output image to `request.output`.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError`] if the stage cannot be run or fails.
    fn classify(&self, request: &ClassifyRequest<'_>) -> Result<(), ClassifyError>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn classify(&self, request: &ClassifyRequest<'_>) -> Result<(), ClassifyError> {
        (**self).classify(request)
    }
}

/// Model files for both stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierModels {
    /// Pixel-classification model.
    pub pixel: PathBuf,
    /// Object-classification model.
    pub object: PathBuf,
}

impl ClassifierModels {
    /// Model for `stage`.
    #[must_use]
    pub fn for_stage(&self, stage: ClassifierStage) -> &Path {
        match stage {
            ClassifierStage::Pixel => &self.pixel,
            ClassifierStage::Object => &self.object,
        }
    }
}

/// Classifier that runs an external command per stage.
///
/// Argument templates may contain `{model}`, `{input}`, `{prior}` and
/// `{output}`, replaced with the request's paths. An argument that
/// mentions `{prior}` is dropped when the request has no prior output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandClassifier {
    /// Program to run.
    pub program: String,
    /// Arguments for the pixel stage.
    pub pixel_args: Vec<String>,
    /// Arguments for the object stage.
    pub object_args: Vec<String>,
}

impl CommandClassifier {
    /// Default program name.
    pub const DEFAULT_PROGRAM: &str = "run_ilastik.sh";

    /// Classifier running `program` with the default ilastik headless
    /// arguments.
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    fn args_for(&self, stage: ClassifierStage) -> &[String] {
        match stage {
            ClassifierStage::Pixel => &self.pixel_args,
            ClassifierStage::Object => &self.object_args,
        }
    }

    /// Expand the argument templates for `request`.
    #[must_use]
    pub fn arguments(&self, request: &ClassifyRequest<'_>) -> Vec<String> {
        let model = request.model.display().to_string();
        let input = request.input.display().to_string();
        let output = request.output.display().to_string();
        let prior = request.prior.map(|p| p.display().to_string());
        self.args_for(request.stage)
            .iter()
            .filter_map(|arg| {
                let arg = if arg.contains("{prior}") {
                    arg.replace("{prior}", prior.as_deref()?)
                } else {
                    arg.clone()
                };
                Some(
                    arg.replace("{model}", &model)
                        .replace("{input}", &input)
                        .replace("{output}", &output),
                )
            })
            .collect()
    }
}

impl Default for CommandClassifier {
    fn default() -> Self {
        let common = |source: &str| {
            vec![
                "--headless".to_owned(),
                "--project={model}".to_owned(),
                format!("--export_source={source}"),
                "--output_format=tiff".to_owned(),
                "--output_filename_format={output}".to_owned(),
            ]
        };
        let pixel_args = [common("Probabilities"), vec!["{input}".to_owned()]].concat();
        let object_args = [
            common("Object Predictions"),
            vec![
                "--raw_data={input}".to_owned(),
                "--prediction_maps={prior}".to_owned(),
            ],
        ]
        .concat();
        Self {
            program: Self::DEFAULT_PROGRAM.to_owned(),
            pixel_args,
            object_args,
        }
    }
}

impl Classifier for CommandClassifier {
    fn classify(&self, request: &ClassifyRequest<'_>) -> Result<(), ClassifyError> {
        let args = self.arguments(request);
        log::debug!("{} classification: {} {}", request.stage, self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| ClassifyError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ClassifyError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(())
    }
}
