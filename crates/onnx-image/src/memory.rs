//! Sub-model residency policy
//!
//! Decides when each sub-model's session is dropped during a generation.
//! Maximum keeps everything resident between runs; Minimum unloads each
//! sub-model immediately after its last use in a run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Sub-models stay loaded between runs. Fastest repeat generation.
    #[default]
    Maximum,
    /// Each sub-model is unloaded right after its last use in a run: the
    /// text encoder after embedding, the UNet (and ControlNet) after the
    /// final step, the VAE decoder after decode.
    Minimum,
}

impl MemoryMode {
    pub fn unload_eagerly(&self) -> bool {
        matches!(self, MemoryMode::Minimum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keeps_models_resident() {
        assert_eq!(MemoryMode::default(), MemoryMode::Maximum);
        assert!(!MemoryMode::Maximum.unload_eagerly());
        assert!(MemoryMode::Minimum.unload_eagerly());
    }
}
