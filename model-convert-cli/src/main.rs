use std::fs;
use std::io;
use std::path::PathBuf;

use clap::Parser;
use log::info;
use model_convert::convert::{ConvertError, Converter, ErrorKind};
use model_convert::export::Tf2OnnxExporter;
use model_convert::format::ModelFormat;
use model_convert::session::SessionConfig;

mod cli;
use cli::Args;
use thiserror::Error;

#[derive(Debug, Error)]
enum AppError {
    #[error("Conversion failed -> {0}")]
    Conversion(#[from] ConvertError),
    #[error("Could not create the output directory {path} -> {source}")]
    OutputDirectory { path: PathBuf, source: io::Error },
}

impl AppError {
    fn exit_code(&self) -> i32 {
        match self {
            AppError::Conversion(err) => match err.kind() {
                ErrorKind::Configuration => 2,
                ErrorKind::Dependency => 3,
                ErrorKind::External => 1,
            },
            AppError::OutputDirectory { .. } => 1,
        }
    }
}

fn main() {
    if let Err(e) = exec_program() {
        eprintln!("{e}");
        std::process::exit(e.exit_code());
    }
}

fn exec_program() -> Result<(), AppError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let request = args.request();

    // rejected requests must not touch the filesystem
    request.validate()?;
    let format = ModelFormat::detect(&request.input)?;

    info!("Input model: {} ({})", request.input.display(), format);
    for (kind, path) in args.outputs() {
        info!("Output {}: {}", kind, path.display());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| AppError::OutputDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let exporter = Tf2OnnxExporter::new().interpreter(&args.python);
    let config = SessionConfig {
        num_threads: args.threads.into(),
    };
    let report = Converter::new(exporter).config(config).convert(&request)?;

    if let Some(shape) = &report.dummy_output_shape {
        info!("Dummy run output shape: {:?}", shape);
    }
    for artifact in &report.artifacts {
        println!("{}", artifact.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_convert::export::ExportError;

    #[test]
    fn exit_codes_follow_the_error_kind() {
        let configuration = AppError::from(ConvertError::NoOutputRequested);
        assert_eq!(configuration.exit_code(), 2);

        let dependency = AppError::from(ConvertError::Export(ExportError::MissingDependency(
            String::from("tf2onnx"),
        )));
        assert_eq!(dependency.exit_code(), 3);
        let dependency = AppError::from(ConvertError::MissingDependency(String::from("torch")));
        assert_eq!(dependency.exit_code(), 3);

        let external = AppError::from(ConvertError::Export(ExportError::Failed {
            status: Some(1),
            stderr: String::from("unsupported layer"),
        }));
        assert_eq!(external.exit_code(), 1);

        let output_directory = AppError::OutputDirectory {
            path: PathBuf::from("output"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(output_directory.exit_code(), 1);
    }
}
