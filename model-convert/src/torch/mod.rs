///
/// # Torch
///
/// Rebuilds an ONNX model as a PyTorch module graph and writes it in the zip
/// container read by `torch.load`:
///
/// - the full model ([`TorchModel::save`]),
/// - the parameters only ([`TorchModel::save_state_dict`]),
/// - a traced forward pass ([`TracedModel::save`]).
///
/// Tensors are pickled as `torch._utils._rebuild_tensor_v2` calls over storages
/// kept in separate records, so the files load with `torch.load(path, weights_only=True)`.
///
mod archive;
mod model;
mod pickle;
mod trace;

pub use archive::{ArchiveError, ArchiveWriter, ARCHIVE_ROOT, FORMAT_VERSION};
pub use model::*;
pub use pickle::{dumps, TensorRef, Value};
pub use trace::*;
