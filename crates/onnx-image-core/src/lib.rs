//! onnx-image-core: tensor utilities and ONNX session plumbing
//!
//! This crate owns everything that touches ONNX Runtime directly: the
//! process-wide environment, per-model session handles with an explicit
//! loaded/unloaded lifecycle, and the ordered input builder used to feed
//! them. Tensors cross the session boundary as `ndarray` arrays so the
//! rest of the workspace never sees a raw runtime value.

pub mod cancel;
pub mod error;
pub mod parameters;
pub mod runtime;
pub mod session;
pub mod tensor;

pub use cancel::CancellationToken;
pub use error::{DiffusionError, Result};
pub use parameters::{InferenceParameters, InputValue};
pub use runtime::{init_runtime, RuntimeOptions};
pub use session::{
    ExecutionDevice, ModelMetadata, OnnxModel, SessionConfig, TensorDtype, TensorInfo,
};
