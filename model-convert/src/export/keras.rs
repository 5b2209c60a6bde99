use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info};

use crate::request::InputSignature;

use super::{ExportError, NativeExporter};

/// Exit status of the helper script when `tensorflow` or `tf2onnx` cannot be imported.
pub const MISSING_MODULE_STATUS: i32 = 3;

/// Loads the Keras model and exports it with a `(None, H, W, C)` float32 signature.
/// Arguments: source, destination, H, W, C, input name, opset.
const TF2ONNX_HELPER: &str = r#"
import sys
try:
    import tensorflow as tf
    import tf2onnx
except ImportError as e:
    sys.stderr.write("missing python module: %s\n" % (e.name or e))
    sys.exit(3)

src, dst, h, w, c, name, opset = sys.argv[1:8]
model = tf.keras.models.load_model(src)
signature = (tf.TensorSpec((None, int(h), int(w), int(c)), tf.float32, name=name),)
tf2onnx.convert.from_keras(
    model,
    input_signature=signature,
    opset=int(opset),
    output_path=dst,
    large_model=False,
)
"#;

/// Runs `tf2onnx` in a Python subprocess.
#[derive(Debug, Clone)]
pub struct Tf2OnnxExporter {
    interpreter: PathBuf,
}

impl Default for Tf2OnnxExporter {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
        }
    }
}

impl Tf2OnnxExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Python interpreter used to run the export, `python3` by default.
    pub fn interpreter<P: AsRef<Path>>(mut self, interpreter: P) -> Self {
        self.interpreter = interpreter.as_ref().to_path_buf();
        self
    }

    fn command(
        &self,
        source: &Path,
        destination: &Path,
        signature: &InputSignature,
        opset: i64,
    ) -> Command {
        let mut command = Command::new(&self.interpreter);
        command
            .arg("-c")
            .arg(TF2ONNX_HELPER)
            .arg(source)
            .arg(destination)
            .arg(signature.shape.height.to_string())
            .arg(signature.shape.width.to_string())
            .arg(signature.shape.channels.to_string())
            .arg(&signature.name)
            .arg(opset.to_string());
        command
    }
}

impl NativeExporter for Tf2OnnxExporter {
    fn export(
        &self,
        source: &Path,
        destination: &Path,
        signature: &InputSignature,
        opset: i64,
    ) -> Result<(), ExportError> {
        info!(
            "Exporting {} to ONNX (opset {}) at {}",
            source.display(),
            opset,
            destination.display()
        );
        debug!("Running tf2onnx with {}", self.interpreter.display());

        let output = match self
            .command(source, destination, signature, opset)
            .output()
        {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ExportError::MissingDependency(format!(
                    "python interpreter {} not found",
                    self.interpreter.display()
                )))
            }
            Err(e) => return Err(ExportError::Io(e)),
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(match output.status.code() {
                Some(MISSING_MODULE_STATUS) => ExportError::MissingDependency(stderr),
                status => ExportError::Failed { status, stderr },
            });
        }
        if !stderr.is_empty() {
            debug!("tf2onnx: {}", stderr);
        }
        if !destination.exists() {
            return Err(ExportError::NoOutput(destination.to_path_buf()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::InputShape;

    fn signature() -> InputSignature {
        InputSignature::new(InputShape::new(64, 32, 3), "image")
    }

    #[test]
    fn helper_receives_the_signature_as_arguments() {
        let command = Tf2OnnxExporter::new().command(
            Path::new("model.h5"),
            Path::new("out/model.onnx"),
            &signature(),
            13,
        );
        let args: Vec<String> = command
            .get_args()
            .skip(2)
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            ["model.h5", "out/model.onnx", "64", "32", "3", "image", "13"]
        );
        assert_eq!(command.get_program(), "python3");
    }

    #[test]
    fn missing_interpreter_is_a_dependency_error() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Tf2OnnxExporter::new().interpreter(dir.path().join("no-such-python"));
        let result = exporter.export(
            Path::new("model.h5"),
            &dir.path().join("model.onnx"),
            &signature(),
            13,
        );
        assert!(matches!(result, Err(ExportError::MissingDependency(_))));
    }
}
