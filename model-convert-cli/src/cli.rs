use std::path::{Path, PathBuf};

use clap::Parser;
use strum::{Display, EnumIter, IntoEnumIterator};

use model_convert::request::{ConversionRequest, InputShape, InputSignature, OutputTargets};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Keras (.h5, .keras) or ONNX (.onnx) model to convert.
    /// Example: --input models/classifier.h5
    #[arg(short, long)]
    pub input: PathBuf,

    /// Directory of the outputs requested without an explicit path.
    #[arg(short, long, default_value = "output")]
    pub out_dir: PathBuf,

    /// Write the ONNX model, to PATH or to <out-dir>/<input stem>.onnx.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub onnx: Option<Option<PathBuf>>,

    /// Write the full PyTorch model, to PATH or to <out-dir>/<input stem>.pt.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub pt: Option<Option<PathBuf>>,

    /// Write the PyTorch state dict, to PATH or to <out-dir>/<input stem>.pth.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub pth: Option<Option<PathBuf>>,

    /// Write the traced PyTorch model, to PATH or to <out-dir>/<input stem>.ts.pt.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub ts: Option<Option<PathBuf>>,

    /// ONNX opset used by the Keras export.
    #[arg(long, default_value = "13")]
    pub opset: i64,

    /// Height, width and channels of one input sample (the batch dimension is dynamic).
    /// Example: --input-shape 224 224 3
    #[arg(
        long,
        num_args = 3,
        value_names = ["H", "W", "C"],
        default_values_t = [128, 128, 3],
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub input_shape: Vec<u32>,

    /// Name of the model input.
    #[arg(long, default_value = "input")]
    pub input_name: String,

    /// Skip the structural check of the ONNX model.
    #[arg(long)]
    pub no_check: bool,

    /// Skip the dummy forward run of the ONNX model.
    #[arg(long)]
    pub no_dummy: bool,

    /// Number of threads of the dummy run. Must be greater than 0 and less than 65536.
    /// Example: --threads 8
    #[arg(short, long, default_value = "4", value_parser = clap::value_parser!(u16).range(1..))]
    pub threads: u16,

    /// Python interpreter with tensorflow and tf2onnx installed.
    #[arg(long, default_value = "python3")]
    pub python: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum OutputKind {
    #[strum(serialize = "ONNX model")]
    Onnx,
    #[strum(serialize = "PyTorch model")]
    TorchFull,
    #[strum(serialize = "PyTorch state dict")]
    TorchParams,
    #[strum(serialize = "traced PyTorch model")]
    TorchScript,
}

impl OutputKind {
    pub fn extension(self) -> &'static str {
        match self {
            OutputKind::Onnx => ".onnx",
            OutputKind::TorchFull => ".pt",
            OutputKind::TorchParams => ".pth",
            OutputKind::TorchScript => ".ts.pt",
        }
    }
}

/// `<out_dir>/<input stem><extension>`.
pub fn resolve_output(input: &Path, out_dir: &Path, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("model"));
    out_dir.join(format!("{}{}", stem, extension))
}

impl Args {
    fn flag(&self, kind: OutputKind) -> &Option<Option<PathBuf>> {
        match kind {
            OutputKind::Onnx => &self.onnx,
            OutputKind::TorchFull => &self.pt,
            OutputKind::TorchParams => &self.pth,
            OutputKind::TorchScript => &self.ts,
        }
    }

    fn target(&self, kind: OutputKind) -> Option<PathBuf> {
        match self.flag(kind) {
            Some(Some(path)) => Some(path.clone()),
            Some(None) => Some(resolve_output(&self.input, &self.out_dir, kind.extension())),
            None => None,
        }
    }

    /// Requested outputs with their resolved paths.
    pub fn outputs(&self) -> Vec<(OutputKind, PathBuf)> {
        OutputKind::iter()
            .filter_map(|kind| self.target(kind).map(|path| (kind, path)))
            .collect()
    }

    pub fn request(&self) -> ConversionRequest {
        let outputs = OutputTargets {
            onnx: self.target(OutputKind::Onnx),
            torch_full: self.target(OutputKind::TorchFull),
            torch_params: self.target(OutputKind::TorchParams),
            torch_script: self.target(OutputKind::TorchScript),
        };
        // clap collects exactly three values
        let (height, width, channels) = (
            self.input_shape[0] as usize,
            self.input_shape[1] as usize,
            self.input_shape[2] as usize,
        );
        ConversionRequest::new(
            self.input.clone(),
            outputs,
            InputSignature::new(
                InputShape::new(height, width, channels),
                self.input_name.clone(),
            ),
            self.opset,
            !self.no_check,
            !self.no_dummy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("model-convert").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn bare_flags_are_named_after_the_input() {
        let args = parse(&["--input", "models/net.h5", "--onnx", "--pth"]);
        let request = args.request();
        assert_eq!(request.outputs.onnx, Some(PathBuf::from("output/net.onnx")));
        assert_eq!(request.outputs.torch_params, Some(PathBuf::from("output/net.pth")));
        assert_eq!(request.outputs.torch_full, None);
        assert_eq!(request.outputs.torch_script, None);
    }

    #[test]
    fn explicit_paths_win_over_the_output_directory() {
        let args = parse(&[
            "--input", "net.keras", "--out-dir", "out", "--ts", "traced/net.ts.pt", "--pt",
        ]);
        assert_eq!(
            args.outputs(),
            [
                (OutputKind::TorchFull, PathBuf::from("out/net.pt")),
                (OutputKind::TorchScript, PathBuf::from("traced/net.ts.pt")),
            ]
        );
    }

    #[test]
    fn automatic_names_are_stable() {
        let first = resolve_output(Path::new("a/model.onnx"), Path::new("out"), ".ts.pt");
        let second = resolve_output(Path::new("a/model.onnx"), Path::new("out"), ".ts.pt");
        assert_eq!(first, second);
        assert_eq!(first, PathBuf::from("out/model.ts.pt"));
    }

    #[test]
    fn defaults() {
        let request = parse(&["--input", "net.h5", "--onnx"]).request();
        assert_eq!(request.opset, 13);
        assert_eq!(request.signature.shape, InputShape::new(128, 128, 3));
        assert_eq!(request.signature.name, "input");
        assert!(request.validate);
        assert!(request.run_dummy);
    }

    #[test]
    fn input_shape_and_switches() {
        let request = parse(&[
            "--input", "net.h5", "--onnx", "--input-shape", "32", "48", "1", "--no-check", "--no-dummy",
        ])
        .request();
        assert_eq!(request.signature.shape.batch_shape(), [1, 32, 48, 1]);
        assert!(!request.validate);
        assert!(!request.run_dummy);
    }

    #[test]
    fn input_shape_needs_three_values() {
        let result = Args::try_parse_from([
            "model-convert", "--input", "net.h5", "--onnx", "--input-shape", "32", "32",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_threads_are_rejected() {
        let result = Args::try_parse_from(["model-convert", "--input", "net.h5", "--threads", "0"]);
        assert!(result.is_err());
    }
}
