use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use log::debug;
use thiserror::Error;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::tensor::TensorData;

use super::pickle::{dumps, TensorRef, Value};

/// Name of the top-level directory of every record.
pub const ARCHIVE_ROOT: &str = "archive";
/// Serialization format version understood by `torch.load`.
pub const FORMAT_VERSION: &str = "3\n";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("the archive could not be written: {0}")]
    Io(#[from] io::Error),
    #[error("the archive could not be written: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Storage class restoring the element type of `data`.
fn storage_class(data: &TensorData) -> &'static str {
    match data {
        TensorData::Float(_) => "FloatStorage",
        TensorData::Double(_) => "DoubleStorage",
        TensorData::Uint8(_) => "ByteStorage",
        TensorData::Int8(_) => "CharStorage",
        TensorData::Int16(_) => "ShortStorage",
        TensorData::Int32(_) => "IntStorage",
        TensorData::Int64(_) => "LongStorage",
        TensorData::Bool(_) => "BoolStorage",
    }
}

/// Collects tensor storages and extra records, then writes them next to the
/// pickled root object in the zip container read by `torch.load`.
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    storages: Vec<Vec<u8>>,
    records: Vec<(String, Vec<u8>)>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the storage of `data` and returns the value referencing it.
    pub fn tensor(&mut self, data: &TensorData) -> Value {
        let key = self.storages.len().to_string();
        self.storages.push(data.to_le_bytes());
        Value::Tensor(TensorRef {
            key,
            storage: storage_class(data),
            shape: data.shape().to_vec(),
        })
    }

    /// Adds a record stored under `archive/<name>`.
    pub fn attach<S: Into<String>>(&mut self, name: S, contents: Vec<u8>) {
        self.records.push((name.into(), contents));
    }

    pub fn storage_count(&self) -> usize {
        self.storages.len()
    }

    /// Writes the archive with `root` as its pickled object.
    pub fn write<P: AsRef<Path>>(self, path: P, root: &Value) -> Result<(), ArchiveError> {
        let path = path.as_ref();
        let mut zip = ZipWriter::new(File::create(path)?);
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);

        zip.start_file(format!("{}/data.pkl", ARCHIVE_ROOT), options)?;
        zip.write_all(&dumps(root))?;
        zip.start_file(format!("{}/byteorder", ARCHIVE_ROOT), options)?;
        zip.write_all(b"little")?;
        for (name, contents) in &self.records {
            zip.start_file(format!("{}/{}", ARCHIVE_ROOT, name), options)?;
            zip.write_all(contents)?;
        }
        for (key, bytes) in self.storages.iter().enumerate() {
            zip.start_file(format!("{}/data/{}", ARCHIVE_ROOT, key), options)?;
            zip.write_all(bytes)?;
        }
        zip.start_file(format!("{}/version", ARCHIVE_ROOT), options)?;
        zip.write_all(FORMAT_VERSION.as_bytes())?;
        zip.finish()?;

        debug!(
            "Wrote {} with {} storage(s)",
            path.display(),
            self.storages.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use std::io::Read;

    #[test]
    fn records_follow_the_torch_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.pth");

        let mut writer = ArchiveWriter::new();
        let weight = TensorData::Float(
            ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.5f32, -2.0]).unwrap(),
        );
        let steps = TensorData::Int64(ArrayD::from_elem(IxDyn(&[]), 0i64));
        let root = Value::OrderedDict(vec![
            (Value::str("fc.weight"), writer.tensor(&weight)),
            (Value::str("bn.num_batches_tracked"), writer.tensor(&steps)),
        ]);
        writer.attach("code/listing.txt", b"relu".to_vec());
        assert_eq!(writer.storage_count(), 2);
        writer.write(&path, &root).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort_unstable();
        assert_eq!(
            names,
            [
                "archive/byteorder",
                "archive/code/listing.txt",
                "archive/data.pkl",
                "archive/data/0",
                "archive/data/1",
                "archive/version",
            ]
        );

        let mut version = String::new();
        archive
            .by_name("archive/version")
            .unwrap()
            .read_to_string(&mut version)
            .unwrap();
        assert_eq!(version, FORMAT_VERSION);

        let mut storage = Vec::new();
        archive
            .by_name("archive/data/0")
            .unwrap()
            .read_to_end(&mut storage)
            .unwrap();
        assert_eq!(storage, weight.to_le_bytes());
    }
}
