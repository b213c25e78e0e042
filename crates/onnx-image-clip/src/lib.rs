//! onnx-image-clip: tokenization and prompt embedding
//!
//! Turns prompt text into the guidance-ready embedding tensors the UNet
//! consumes: tokenize, pad both prompts to a common length, window long
//! sequences through the text encoder chunk by chunk, and concatenate the
//! negative/positive halves when classifier-free guidance is enabled.

pub mod encoder;
pub mod tokenizer;

pub use encoder::{pad_and_window, PromptEmbeddings, PromptEncoder};
pub use tokenizer::{TokenizerModel, DEFAULT_PAD_TOKEN_ID, DEFAULT_TOKENIZER_LIMIT};
