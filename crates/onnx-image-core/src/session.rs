//! ONNX sub-model handles
//!
//! Each sub-model (UNet, text encoder, VAE halves, ControlNet) is wrapped
//! in an [`OnnxModel`]: an addressable handle whose session is loaded and
//! unloaded explicitly. The handle stays usable while unloaded — metadata
//! captured at first load is cached so residency policies can drop the
//! session without losing the graph signature.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use ndarray::ArrayD;
use ort::{
    CUDAExecutionProvider, GraphOptimizationLevel, Session, SessionInputValue, TensorElementType,
    Value, ValueType,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DiffusionError, Result};
use crate::parameters::{InferenceParameters, InputValue};
use crate::runtime;

/// Device placement for one sub-model session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionDevice {
    /// CPU execution (default).
    #[default]
    Cpu,
    /// CUDA execution on the given device id.
    Cuda(usize),
}

/// Per-session knobs. Kept small; the runtime-wide settings live in
/// [`crate::runtime`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub device: ExecutionDevice,
    /// Intra-op thread count; `None` lets the backend decide.
    #[serde(default)]
    pub intra_threads: Option<usize>,
}

/// Element type of a graph input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDtype {
    Float32,
    Float64,
    Int32,
    Int64,
    Other,
}

/// Name, declared shape, and dtype of one graph input or output.
/// Dynamic dimensions are reported as -1.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: TensorDtype,
}

/// Graph signature captured at load time and cached across unloads.
#[derive(Debug, Clone, Default)]
pub struct ModelMetadata {
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
}

/// Handle to one ONNX graph with an explicit loaded/unloaded lifecycle.
///
/// Load and unload synchronize internally, so the pipeline can hold the
/// handle by shared reference and apply its residency policy mid-run.
pub struct OnnxModel {
    name: String,
    path: PathBuf,
    config: SessionConfig,
    session: RwLock<Option<Session>>,
    metadata: RwLock<Option<ModelMetadata>>,
}

impl OnnxModel {
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>, config: SessionConfig) -> Self {
        Self {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            config,
            session: RwLock::new(None),
            metadata: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.session.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Creates the session. Idempotent; a loaded model stays loaded.
    pub fn load(&self) -> Result<()> {
        let mut slot = self
            .session
            .write()
            .map_err(|_| DiffusionError::ModelLoadFailed("session lock poisoned".into()))?;
        if slot.is_some() {
            return Ok(());
        }

        let mut builder = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .map_err(|e| DiffusionError::ModelLoadFailed(e.to_string()))?;
        if let Some(threads) = self.config.intra_threads {
            builder = builder
                .with_intra_threads(threads)
                .map_err(|e| DiffusionError::ModelLoadFailed(e.to_string()))?;
        }
        if let ExecutionDevice::Cuda(device_id) = self.config.device {
            let mut provider = CUDAExecutionProvider::default().with_device_id(device_id as i32);
            if let Some(limit) = runtime::device_memory_limit() {
                provider = provider.with_memory_limit(limit);
            }
            builder = builder
                .with_execution_providers([provider.build()])
                .map_err(|e| DiffusionError::ModelLoadFailed(e.to_string()))?;
        }

        let session = builder
            .commit_from_file(&self.path)
            .map_err(|e| DiffusionError::ModelLoadFailed(format!("{}: {e}", self.name)))?;

        let mut metadata = self
            .metadata
            .write()
            .map_err(|_| DiffusionError::ModelLoadFailed("metadata lock poisoned".into()))?;
        if metadata.is_none() {
            *metadata = Some(read_metadata(&session));
        }
        info!(model = %self.name, path = %self.path.display(), "session loaded");
        *slot = Some(session);
        Ok(())
    }

    /// Drops the session, releasing device memory. Metadata survives.
    pub fn unload(&self) {
        if let Ok(mut slot) = self.session.write() {
            if slot.take().is_some() {
                debug!(model = %self.name, "session unloaded");
            }
        }
    }

    /// Cached graph signature. Available from the first load onward, even
    /// while the session itself is unloaded.
    pub fn metadata(&self) -> Result<ModelMetadata> {
        if let Ok(cache) = self.metadata.read() {
            if let Some(meta) = cache.as_ref() {
                return Ok(meta.clone());
            }
        }
        Err(DiffusionError::InferenceFailed(format!(
            "{}: metadata requested before first load",
            self.name
        )))
    }

    /// Runs the graph with positional inputs paired against the signature.
    ///
    /// Every output is extracted into an owned array and returned exactly
    /// once; the backing runtime values are released when this returns.
    pub fn run(&self, params: InferenceParameters) -> Result<Vec<ArrayD<f32>>> {
        let guard = self
            .session
            .read()
            .map_err(|_| DiffusionError::InferenceFailed("session lock poisoned".into()))?;
        let session = guard
            .as_ref()
            .ok_or_else(|| DiffusionError::InferenceFailed(format!("{} is not loaded", self.name)))?;
        let metadata = self.metadata()?;

        let (inputs, output_hints) = params.into_parts();
        if inputs.len() != metadata.inputs.len() {
            return Err(DiffusionError::InferenceFailed(format!(
                "{} expects {} inputs, got {}",
                self.name,
                metadata.inputs.len(),
                inputs.len()
            )));
        }

        let mut session_inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> =
            Vec::with_capacity(inputs.len());
        for (info, value) in metadata.inputs.iter().zip(inputs) {
            session_inputs.push((Cow::from(info.name.clone()), build_value(info, value)?));
        }

        let outputs = session
            .run(session_inputs)
            .map_err(|e| DiffusionError::InferenceFailed(format!("{}: {e}", self.name)))?;

        let mut extracted = Vec::with_capacity(metadata.outputs.len());
        for (index, info) in metadata.outputs.iter().enumerate() {
            let view = outputs[info.name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| DiffusionError::InferenceFailed(format!("{}: {e}", self.name)))?;
            let array = view.to_owned();
            if let Some(Some(hint)) = output_hints.get(index) {
                if array.shape() != hint.as_slice() {
                    return Err(DiffusionError::shape(hint, array.shape()));
                }
            }
            extracted.push(array);
        }
        Ok(extracted)
    }
}

/// Resolves one pending input against the declared signature and wraps it
/// as a runtime value.
fn build_value(info: &TensorInfo, value: InputValue) -> Result<SessionInputValue<'static>> {
    let wrap_err = |e: ort::Error| DiffusionError::InferenceFailed(e.to_string());
    let value = match value {
        InputValue::Timestep(t) => {
            if info.dtype == TensorDtype::Int64 {
                InputValue::I64(ndarray::Array1::from_vec(vec![t as i64]).into_dyn())
            } else {
                InputValue::F32(ndarray::Array1::from_vec(vec![t]).into_dyn())
            }
        }
        InputValue::TokenIds(ids) => {
            let len = ids.len();
            if info.dtype == TensorDtype::Int32 {
                let ids: Vec<i32> = ids.into_iter().map(|v| v as i32).collect();
                InputValue::I32(
                    ndarray::Array2::from_shape_vec((1, len), ids)
                        .map_err(|_| DiffusionError::shape(&[1, len], &[len]))?
                        .into_dyn(),
                )
            } else {
                InputValue::I64(
                    ndarray::Array2::from_shape_vec((1, len), ids)
                        .map_err(|_| DiffusionError::shape(&[1, len], &[len]))?
                        .into_dyn(),
                )
            }
        }
        other => other,
    };

    Ok(match value {
        InputValue::F32(a) => Value::from_array(a).map_err(wrap_err)?.into_dyn().into(),
        InputValue::F64(a) => Value::from_array(a).map_err(wrap_err)?.into_dyn().into(),
        InputValue::I32(a) => Value::from_array(a).map_err(wrap_err)?.into_dyn().into(),
        InputValue::I64(a) => Value::from_array(a).map_err(wrap_err)?.into_dyn().into(),
        InputValue::Timestep(_) | InputValue::TokenIds(_) => unreachable!(),
    })
}

fn read_metadata(session: &Session) -> ModelMetadata {
    let inputs = session
        .inputs
        .iter()
        .map(|input| tensor_info(&input.name, &input.input_type))
        .collect();
    let outputs = session
        .outputs
        .iter()
        .map(|output| tensor_info(&output.name, &output.output_type))
        .collect();
    ModelMetadata { inputs, outputs }
}

fn tensor_info(name: &str, value_type: &ValueType) -> TensorInfo {
    let (shape, dtype) = match value_type {
        ValueType::Tensor { ty, dimensions, .. } => (dimensions.clone(), element_dtype(*ty)),
        _ => (Vec::new(), TensorDtype::Other),
    };
    TensorInfo {
        name: name.to_string(),
        shape,
        dtype,
    }
}

fn element_dtype(ty: TensorElementType) -> TensorDtype {
    match ty {
        TensorElementType::Float32 => TensorDtype::Float32,
        TensorElementType::Float64 => TensorDtype::Float64,
        TensorElementType::Int32 => TensorDtype::Int32,
        TensorElementType::Int64 => TensorDtype::Int64,
        _ => TensorDtype::Other,
    }
}
