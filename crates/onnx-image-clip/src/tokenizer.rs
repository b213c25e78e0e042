//! Tokenizer sub-model
//!
//! Wraps a HuggingFace `tokenizers` definition behind the same explicit
//! loaded/unloaded lifecycle the ONNX sessions use, so the pipeline's
//! residency policy can treat it like any other sub-model.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tokenizers::Tokenizer;
use tracing::debug;

use onnx_image_core::{DiffusionError, Result};

/// CLIP end-of-text token, which doubles as the pad token in the
/// Stable Diffusion exports.
pub const DEFAULT_PAD_TOKEN_ID: i64 = 49407;

/// Context window of the CLIP text encoders.
pub const DEFAULT_TOKENIZER_LIMIT: usize = 77;

pub struct TokenizerModel {
    path: PathBuf,
    limit: usize,
    pad_token_id: i64,
    state: RwLock<Option<Tokenizer>>,
}

impl TokenizerModel {
    pub fn new(path: impl AsRef<Path>, limit: usize, pad_token_id: i64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            limit,
            pad_token_id,
            state: RwLock::new(None),
        }
    }

    /// Sequence window the paired text encoder accepts.
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn pad_token_id(&self) -> i64 {
        self.pad_token_id
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Parses the tokenizer definition from disk. Idempotent.
    pub fn load(&self) -> Result<()> {
        let mut slot = self
            .state
            .write()
            .map_err(|_| DiffusionError::ModelLoadFailed("tokenizer lock poisoned".into()))?;
        if slot.is_some() {
            return Ok(());
        }
        let tokenizer = Tokenizer::from_file(&self.path).map_err(|e| {
            DiffusionError::ModelLoadFailed(format!("tokenizer {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), "tokenizer loaded");
        *slot = Some(tokenizer);
        Ok(())
    }

    pub fn unload(&self) {
        if let Ok(mut slot) = self.state.write() {
            slot.take();
        }
    }

    /// Encodes text to unpadded token ids, special tokens included.
    pub fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let guard = self
            .state
            .read()
            .map_err(|_| DiffusionError::InferenceFailed("tokenizer lock poisoned".into()))?;
        let tokenizer = guard
            .as_ref()
            .ok_or_else(|| DiffusionError::InferenceFailed("tokenizer is not loaded".into()))?;
        let encoding = tokenizer
            .encode(text, true)
            .map_err(|e| DiffusionError::InferenceFailed(format!("tokenize: {e}")))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unloaded_tokenizer_rejects_encode() {
        let tokenizer =
            TokenizerModel::new("/tmp/tokenizer.json", DEFAULT_TOKENIZER_LIMIT, DEFAULT_PAD_TOKEN_ID);
        assert!(!tokenizer.is_loaded());
        assert!(tokenizer.encode("a photo of a cat").is_err());
    }

    #[test]
    fn test_defaults_match_clip() {
        let tokenizer =
            TokenizerModel::new("/tmp/tokenizer.json", DEFAULT_TOKENIZER_LIMIT, DEFAULT_PAD_TOKEN_ID);
        assert_eq!(tokenizer.limit(), 77);
        assert_eq!(tokenizer.pad_token_id(), 49407);
    }
}
