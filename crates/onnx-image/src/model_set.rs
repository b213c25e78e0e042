//! Model set description
//!
//! Enumerates the on-disk artifacts and per-submodel session settings one
//! pipeline instance is built from. Hosts typically deserialize this from
//! their own configuration; the runtime only reads the referenced files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use onnx_image_core::{DiffusionError, Result, SessionConfig};

use crate::memory::MemoryMode;
use crate::options::DiffuserType;
use crate::pipelines::PipelineKind;

/// Location and session settings of one sub-model graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub session: SessionConfig,
}

impl ModelConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            session: SessionConfig::default(),
        }
    }
}

fn default_sample_size() -> usize {
    512
}

fn default_scale_factor() -> f32 {
    0.18215
}

fn default_tokenizer_limit() -> usize {
    77
}

fn default_pad_token_id() -> i64 {
    49407
}

fn default_latent_channels() -> usize {
    4
}

/// Everything needed to assemble one pipeline: artifact paths, per-model
/// session config, and the shape/scale constants of the export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StableDiffusionModelSet {
    pub name: String,
    pub pipeline: PipelineKind,
    #[serde(default)]
    pub memory_mode: MemoryMode,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// VAE latent scale (latents are divided by this before decode).
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f32,
    #[serde(default = "default_tokenizer_limit")]
    pub tokenizer_limit: usize,
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: i64,
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
    pub supported_diffusers: Vec<DiffuserType>,

    pub tokenizer: PathBuf,
    pub text_encoder: ModelConfig,
    #[serde(default)]
    pub text_encoder_2: Option<ModelConfig>,
    pub unet: ModelConfig,
    /// Second-phase UNet of two-stage pipelines.
    #[serde(default)]
    pub unet_2: Option<ModelConfig>,
    #[serde(default)]
    pub vae_encoder: Option<ModelConfig>,
    pub vae_decoder: ModelConfig,
    #[serde(default)]
    pub controlnet: Option<ModelConfig>,
}

impl StableDiffusionModelSet {
    /// Standard SD 1.x layout under one directory, with every diffuser the
    /// artifacts support.
    pub fn stable_diffusion(name: impl Into<String>, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            name: name.into(),
            pipeline: PipelineKind::StableDiffusion,
            memory_mode: MemoryMode::default(),
            sample_size: default_sample_size(),
            scale_factor: default_scale_factor(),
            tokenizer_limit: default_tokenizer_limit(),
            pad_token_id: default_pad_token_id(),
            latent_channels: default_latent_channels(),
            supported_diffusers: vec![
                DiffuserType::TextToImage,
                DiffuserType::ImageToImage,
                DiffuserType::ImageInpaintLegacy,
                DiffuserType::VideoToVideo,
            ],
            tokenizer: dir.join("tokenizer/tokenizer.json"),
            text_encoder: ModelConfig::new(dir.join("text_encoder/model.onnx")),
            text_encoder_2: None,
            unet: ModelConfig::new(dir.join("unet/model.onnx")),
            unet_2: None,
            vae_encoder: Some(ModelConfig::new(dir.join("vae_encoder/model.onnx"))),
            vae_decoder: ModelConfig::new(dir.join("vae_decoder/model.onnx")),
            controlnet: None,
        }
    }

    /// Checks that the declared diffusers are backed by the declared
    /// artifacts.
    pub fn validate(&self) -> Result<()> {
        if self.supported_diffusers.is_empty() {
            return Err(DiffusionError::InvalidOptions(
                "model set supports no diffusers".into(),
            ));
        }
        let needs_encoder = self
            .supported_diffusers
            .iter()
            .any(|d| d.needs_image() || *d == DiffuserType::VideoToVideo);
        if needs_encoder && self.vae_encoder.is_none() {
            return Err(DiffusionError::InvalidOptions(
                "image-conditioned diffusers require a VAE encoder".into(),
            ));
        }
        let needs_controlnet = self
            .supported_diffusers
            .iter()
            .any(|d| d.needs_control_image());
        if needs_controlnet && self.controlnet.is_none() {
            return Err(DiffusionError::InvalidOptions(
                "controlnet diffusers require a controlnet model".into(),
            ));
        }
        Ok(())
    }
}
