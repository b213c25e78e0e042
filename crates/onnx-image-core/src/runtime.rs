//! Process-wide runtime initialization
//!
//! The inference backend keeps one environment and one device memory pool
//! per process. Hosts call [`init_runtime`] exactly once at startup; there
//! are no implicit static constructors, and a second call is rejected so a
//! misconfigured host fails loudly instead of silently re-pooling.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DiffusionError, Result};

/// Runtime-wide settings applied before any session is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Environment name reported by the backend's own logging.
    pub name: String,
    /// Ceiling for the device memory arena shared by all device sessions,
    /// in bytes. `None` lets the backend grow unbounded.
    pub device_memory_limit: Option<usize>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            name: "onnx-image".to_string(),
            // 100 MB contiguous pool; enough for 512x512 latents and
            // decoder activations without starving the host process.
            device_memory_limit: Some(100 * 1024 * 1024),
        }
    }
}

static RUNTIME: OnceLock<RuntimeOptions> = OnceLock::new();

/// Commits the backend environment. Must be called once, before the first
/// model load; later loads read the committed options.
pub fn init_runtime(options: RuntimeOptions) -> Result<()> {
    ort::init()
        .with_name(&options.name)
        .commit()
        .map_err(|e| DiffusionError::ModelLoadFailed(format!("runtime init: {e}")))?;
    info!(name = %options.name, pool = ?options.device_memory_limit, "runtime initialized");
    RUNTIME
        .set(options)
        .map_err(|_| DiffusionError::InvalidOptions("runtime already initialized".into()))
}

/// Pool ceiling committed at init, if any.
pub(crate) fn device_memory_limit() -> Option<usize> {
    RUNTIME.get().and_then(|options| options.device_memory_limit)
}
