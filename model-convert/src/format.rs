use std::fmt;
use std::path::Path;

use crate::convert::ConvertError;

/// On-disk formats accepted as conversion input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// Keras native serialization (`.h5`, `.keras`).
    Keras,
    /// ONNX interchange graph (`.onnx`).
    Onnx,
}

impl ModelFormat {
    /// Classifies a model file by its extension, ignoring case.
    pub fn detect<P: AsRef<Path>>(path: P) -> Result<Self, ConvertError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("h5") | Some("keras") => Ok(ModelFormat::Keras),
            Some("onnx") => Ok(ModelFormat::Onnx),
            _ => Err(ConvertError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFormat::Keras => write!(f, "Keras"),
            ModelFormat::Onnx => write!(f, "ONNX"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_supported_extensions() {
        assert_eq!(ModelFormat::detect("model.h5").unwrap(), ModelFormat::Keras);
        assert_eq!(ModelFormat::detect("dir/model.KERAS").unwrap(), ModelFormat::Keras);
        assert_eq!(ModelFormat::detect("model.onnx").unwrap(), ModelFormat::Onnx);
    }

    #[test]
    fn rejects_everything_else() {
        for path in ["model.xyz", "model", "model.onnx.bak", ".h5"] {
            assert!(
                matches!(ModelFormat::detect(path), Err(ConvertError::UnsupportedFormat(_))),
                "{} should be rejected",
                path
            );
        }
    }
}
