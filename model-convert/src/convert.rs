//! Conversion entry point: drives detection, export, checking, the dummy run and the
//! PyTorch serializations for one [`ConversionRequest`].
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::checker::{check_model, CheckError};
use crate::export::{ExportError, NativeExporter};
use crate::format::ModelFormat;
use crate::onnx_format::ModelReadError;
use crate::request::ConversionRequest;
use crate::session::{dummy_run, SessionConfig, SessionError};

#[cfg(feature = "torch")]
use crate::torch::{ArchiveError, RebuildError};

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("no output was requested")]
    NoOutputRequested,
    #[error("unsupported input format: {0} (expected .h5, .keras or .onnx)")]
    UnsupportedFormat(PathBuf),
    #[error("PyTorch outputs were requested but no ONNX model is available to build them from")]
    MissingInterchangeSource,
    #[error("missing dependency: {0}")]
    MissingDependency(String),
    #[error("the ONNX export failed: {0}")]
    Export(#[from] ExportError),
    #[error("the ONNX model is invalid: {0}")]
    Check(#[from] CheckError),
    #[error("the dummy run failed: {0}")]
    Session(#[from] SessionError),
    #[error("the ONNX model could not be read: {0}")]
    Read(#[from] ModelReadError),
    #[cfg(feature = "torch")]
    #[error("the PyTorch model could not be rebuilt: {0}")]
    Rebuild(#[from] RebuildError),
    #[cfg(feature = "torch")]
    #[error("the PyTorch model could not be saved: {0}")]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Coarse classification of a failed conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself cannot be served; detected before any model work.
    Configuration,
    /// A required external component is not installed.
    Dependency,
    /// An external tool or library failed on the model.
    External,
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::NoOutputRequested
            | ConvertError::UnsupportedFormat(_)
            | ConvertError::MissingInterchangeSource => ErrorKind::Configuration,
            ConvertError::MissingDependency(_)
            | ConvertError::Export(ExportError::MissingDependency(_)) => ErrorKind::Dependency,
            _ => ErrorKind::External,
        }
    }
}

/// The ONNX file the PyTorch outputs and the checks work on.
#[derive(Debug)]
pub enum InterchangeSource {
    /// The input model itself.
    Original(PathBuf),
    /// The ONNX output requested by the caller.
    Requested(PathBuf),
    /// Intermediate export, deleted when dropped.
    Temporary(NamedTempFile),
}

impl InterchangeSource {
    pub fn path(&self) -> &Path {
        match self {
            InterchangeSource::Original(path) | InterchangeSource::Requested(path) => path,
            InterchangeSource::Temporary(file) => file.path(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, InterchangeSource::Temporary(_))
    }
}

/// What a successful conversion produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionReport {
    /// The requested ONNX output, when one was written or is the input itself.
    pub interchange: Option<PathBuf>,
    /// Shape of the first output of the dummy run, when it ran.
    pub dummy_output_shape: Option<Vec<usize>>,
    /// Every file written, in order.
    pub artifacts: Vec<PathBuf>,
}

pub struct Converter<E: NativeExporter> {
    exporter: E,
    session_config: SessionConfig,
}

impl<E: NativeExporter> Converter<E> {
    pub fn new(exporter: E) -> Self {
        Self {
            exporter,
            session_config: SessionConfig::default(),
        }
    }

    /// Execution settings of the dummy run and of the tracing pass.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn exporter(&self) -> &E {
        &self.exporter
    }

    pub fn convert(&self, request: &ConversionRequest) -> Result<ConversionReport, ConvertError> {
        request.validate()?;
        let format = ModelFormat::detect(&request.input)?;
        if request.outputs.wants_torch() && !cfg!(feature = "torch") {
            return Err(torch_unavailable());
        }
        info!("Converting the {} model {}", format, request.input.display());

        let mut report = ConversionReport::default();
        // dropped at the end of the conversion, removing a temporary export
        let interchange = match request.outputs.needs_interchange() {
            true => Some(self.interchange_source(request, format, &mut report)?),
            false => None,
        };

        if let Some(source) = &interchange {
            if request.validate {
                check_model(source.path())?;
            }
            if request.outputs.onnx.is_some() && request.run_dummy {
                let shape = dummy_run(
                    source.path(),
                    &request.signature,
                    self.session_config.clone(),
                )?;
                report.dummy_output_shape = Some(shape);
            }
        }

        if request.outputs.wants_torch() {
            let source = interchange
                .as_ref()
                .ok_or(ConvertError::MissingInterchangeSource)?;
            self.write_torch(source.path(), request, &mut report)?;
        }

        info!("Conversion done, {} file(s) written", report.artifacts.len());
        Ok(report)
    }

    fn interchange_source(
        &self,
        request: &ConversionRequest,
        format: ModelFormat,
        report: &mut ConversionReport,
    ) -> Result<InterchangeSource, ConvertError> {
        let requested = request.outputs.onnx.as_ref();
        let source = match (format, requested) {
            (ModelFormat::Onnx, None) => InterchangeSource::Original(request.input.clone()),
            (ModelFormat::Onnx, Some(destination)) => {
                if same_file(&request.input, destination) {
                    InterchangeSource::Original(request.input.clone())
                } else {
                    info!(
                        "Copying {} to {}",
                        request.input.display(),
                        destination.display()
                    );
                    fs::copy(&request.input, destination)?;
                    report.artifacts.push(destination.clone());
                    InterchangeSource::Requested(destination.clone())
                }
            }
            (ModelFormat::Keras, Some(destination)) => {
                self.export(request, destination)?;
                report.artifacts.push(destination.clone());
                InterchangeSource::Requested(destination.clone())
            }
            (ModelFormat::Keras, None) => {
                let stem = request
                    .input
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("model");
                let file = tempfile::Builder::new()
                    .prefix(&format!("{}-", stem))
                    .suffix(".onnx")
                    .tempfile()?;
                debug!("Exporting to the temporary file {}", file.path().display());
                self.export(request, file.path())?;
                InterchangeSource::Temporary(file)
            }
        };
        if requested.is_some() {
            report.interchange = Some(source.path().to_path_buf());
        }
        Ok(source)
    }

    fn export(&self, request: &ConversionRequest, destination: &Path) -> Result<(), ConvertError> {
        self.exporter.export(
            &request.input,
            destination,
            &request.signature,
            request.opset,
        )?;
        Ok(())
    }

    #[cfg(feature = "torch")]
    fn write_torch(
        &self,
        source: &Path,
        request: &ConversionRequest,
        report: &mut ConversionReport,
    ) -> Result<(), ConvertError> {
        use crate::onnx_format::read_model_proto;
        use crate::torch::{rebuild, trace};

        let onnx = read_model_proto(source)?;
        let model = rebuild(&onnx)?.eval();

        if let Some(path) = &request.outputs.torch_full {
            model.save(path)?;
            report.artifacts.push(path.clone());
        }
        if let Some(path) = &request.outputs.torch_params {
            model.save_state_dict(path)?;
            report.artifacts.push(path.clone());
        }
        if let Some(path) = &request.outputs.torch_script {
            trace(&onnx, &model, &request.signature, self.session_config.clone())?.save(path)?;
            report.artifacts.push(path.clone());
        }
        Ok(())
    }

    #[cfg(not(feature = "torch"))]
    fn write_torch(
        &self,
        _source: &Path,
        _request: &ConversionRequest,
        _report: &mut ConversionReport,
    ) -> Result<(), ConvertError> {
        Err(torch_unavailable())
    }
}

fn torch_unavailable() -> ConvertError {
    ConvertError::MissingDependency(String::from(
        "PyTorch outputs need model-convert built with the `torch` feature",
    ))
}

/// Whether both paths name the same existing file.
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
