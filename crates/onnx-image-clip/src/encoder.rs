//! Prompt embedding construction
//!
//! The positive and negative prompts are padded to a shared length, split
//! into encoder-sized windows, embedded window by window, and joined along
//! the sequence axis. With guidance enabled the negative embedding is
//! stacked in front of the positive one so a single UNet call evaluates
//! both halves.

use ndarray::{concatenate, Array2, Array3, Axis, Ix2, Ix3};
use tracing::trace;

use onnx_image_core::{DiffusionError, InferenceParameters, OnnxModel, Result};

use crate::tokenizer::TokenizerModel;

/// Embedding tensors handed to the UNet.
pub struct PromptEmbeddings {
    /// `[B, T, D]`; `B` is 2 (negative ‖ positive) under guidance, else 1.
    pub prompt_embeds: Array3<f32>,
    /// Pooled vector of the positive prompt, when the encoder exports one.
    pub pooled_prompt_embeds: Option<Array2<f32>>,
    /// Pooled vector of the negative prompt.
    pub negative_pooled: Option<Array2<f32>>,
}

impl PromptEmbeddings {
    pub fn batch(&self) -> usize {
        self.prompt_embeds.dim().0
    }
}

/// Pads both token sequences to a common window-aligned length and splits
/// them into encoder-sized windows.
///
/// The shared length is `max(len_prompt, len_negative, limit)` rounded up
/// to a multiple of `limit`; the final window carries the padding.
pub fn pad_and_window(
    prompt: &[i64],
    negative: &[i64],
    limit: usize,
    pad_token_id: i64,
) -> (Vec<Vec<i64>>, Vec<Vec<i64>>) {
    let longest = prompt.len().max(negative.len()).max(limit);
    let padded = longest.div_ceil(limit) * limit;

    let window = |ids: &[i64]| -> Vec<Vec<i64>> {
        let mut full: Vec<i64> = ids.to_vec();
        full.resize(padded, pad_token_id);
        full.chunks(limit).map(|chunk| chunk.to_vec()).collect()
    };

    (window(prompt), window(negative))
}

/// Runs the tokenizer and text encoder(s) for one generation.
pub struct PromptEncoder<'a> {
    tokenizer: &'a TokenizerModel,
    text_encoder: &'a OnnxModel,
    /// Second encoder of dual-encoder model sets; its hidden states are
    /// concatenated on the feature axis and it supplies the pooled vector.
    text_encoder_2: Option<&'a OnnxModel>,
}

impl<'a> PromptEncoder<'a> {
    pub fn new(
        tokenizer: &'a TokenizerModel,
        text_encoder: &'a OnnxModel,
        text_encoder_2: Option<&'a OnnxModel>,
    ) -> Self {
        Self {
            tokenizer,
            text_encoder,
            text_encoder_2,
        }
    }

    /// Builds the embedding tensors for a prompt pair.
    pub fn encode(&self, prompt: &str, negative: &str, guidance: bool) -> Result<PromptEmbeddings> {
        let prompt_ids = self.tokenizer.encode(prompt)?;
        let negative_ids = self.tokenizer.encode(negative)?;
        let (prompt_windows, negative_windows) = pad_and_window(
            &prompt_ids,
            &negative_ids,
            self.tokenizer.limit(),
            self.tokenizer.pad_token_id(),
        );
        trace!(
            prompt_tokens = prompt_ids.len(),
            negative_tokens = negative_ids.len(),
            windows = prompt_windows.len(),
            "encoding prompt"
        );

        let (positive, pooled) = self.encode_windows(&prompt_windows)?;
        if !guidance {
            return Ok(PromptEmbeddings {
                prompt_embeds: positive,
                pooled_prompt_embeds: pooled,
                negative_pooled: None,
            });
        }

        let (negative, negative_pooled) = self.encode_windows(&negative_windows)?;
        let prompt_embeds = concatenate(Axis(0), &[negative.view(), positive.view()])
            .map_err(|_| DiffusionError::shape(positive.shape(), negative.shape()))?;
        Ok(PromptEmbeddings {
            prompt_embeds,
            pooled_prompt_embeds: pooled,
            negative_pooled,
        })
    }

    /// Embeds one padded sequence window by window and joins the results
    /// along the sequence axis. The pooled vector comes from the first
    /// window, which holds the start of the prompt.
    fn encode_windows(&self, windows: &[Vec<i64>]) -> Result<(Array3<f32>, Option<Array2<f32>>)> {
        let mut chunks: Vec<Array3<f32>> = Vec::with_capacity(windows.len());
        let mut pooled = None;

        for (index, window) in windows.iter().enumerate() {
            let (mut hidden, window_pooled) = self.run_encoder(self.text_encoder, window)?;
            if let Some(second) = self.text_encoder_2 {
                let (hidden_2, pooled_2) = self.run_encoder(second, window)?;
                hidden = concatenate(Axis(2), &[hidden.view(), hidden_2.view()])
                    .map_err(|_| DiffusionError::shape(hidden.shape(), hidden_2.shape()))?;
                if index == 0 {
                    pooled = pooled_2;
                }
            } else if index == 0 {
                pooled = window_pooled;
            }
            chunks.push(hidden);
        }

        let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
        let hidden = concatenate(Axis(1), &views)
            .map_err(|_| DiffusionError::InferenceFailed("window concat failed".into()))?;
        Ok((hidden, pooled))
    }

    fn run_encoder(
        &self,
        encoder: &OnnxModel,
        window: &[i64],
    ) -> Result<(Array3<f32>, Option<Array2<f32>>)> {
        let mut params = InferenceParameters::new();
        params.push_token_ids(window.to_vec());
        let mut outputs = encoder.run(params)?;
        if outputs.is_empty() {
            return Err(DiffusionError::InferenceFailed(
                "text encoder produced no outputs".into(),
            ));
        }

        let hidden = outputs.remove(0);
        let hidden_shape = hidden.shape().to_vec();
        let hidden = hidden
            .into_dimensionality::<Ix3>()
            .map_err(|_| DiffusionError::shape(&[1, window.len(), 0], &hidden_shape))?;

        let pooled = if outputs.is_empty() {
            None
        } else {
            let pooled = outputs.remove(0);
            pooled.into_dimensionality::<Ix2>().ok()
        };
        Ok((hidden, pooled))
    }
}
