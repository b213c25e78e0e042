//! Diffuser variants: the per-task latent denoising loops
//!
//! Every variant shares one driver: prepare latents, then per timestep
//! scale the input, gather variant extras, run the UNet, combine guidance,
//! and hand the prediction to the scheduler. Variants customize the hooks
//! (latent preparation, start step, extra UNet inputs, post-step fixups)
//! and the driver owns ordering, cancellation and progress.

mod controlnet;
mod image_to_image;
mod inpaint;
mod text_to_image;

pub use controlnet::{ControlNetDiffuser, ControlNetImageDiffuser};
pub use image_to_image::ImageToImageDiffuser;
pub use inpaint::{ImageInpaintDiffuser, ImageInpaintLegacyDiffuser};
pub use text_to_image::{InstaFlowTextDiffuser, TextToImageDiffuser};

use ndarray::{s, Array4, Ix4};
use tracing::trace;

use onnx_image_clip::PromptEmbeddings;
use onnx_image_core::{tensor, DiffusionError, InferenceParameters, InputValue, OnnxModel, Result};
use onnx_image_schedulers::Scheduler;

use crate::memory::MemoryMode;
use crate::options::{PromptOptions, SchedulerOptions};
use crate::progress::RunContext;

/// Borrowed sub-models and export constants for one generation.
pub struct DiffuserModels<'a> {
    pub unet: &'a OnnxModel,
    pub controlnet: Option<&'a OnnxModel>,
    pub vae_encoder: Option<&'a OnnxModel>,
    pub vae_decoder: &'a OnnxModel,
    pub scale_factor: f32,
    pub latent_channels: usize,
    pub memory_mode: MemoryMode,
}

impl DiffuserModels<'_> {
    /// Latent resolution for the requested output size.
    pub fn latent_shape(&self, options: &SchedulerOptions) -> [usize; 4] {
        [1, self.latent_channels, options.height / 8, options.width / 8]
    }
}

/// Hooks a diffuser variant plugs into the shared loop.
pub trait Diffuser: Send {
    /// Index into the scheduler's timestep list where this variant starts.
    fn start_step(&self, _scheduler: &dyn Scheduler, _options: &SchedulerOptions) -> usize {
        0
    }

    /// Builds the initial latent for the (possibly truncated) timesteps.
    fn prepare_latents(
        &mut self,
        models: &DiffuserModels<'_>,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        scheduler: &mut dyn Scheduler,
        timesteps: &[i64],
    ) -> Result<Array4<f32>>;

    /// Transforms the scaled UNet sample input (channel stacking).
    fn augment_sample(&self, scaled: Array4<f32>, _guidance: bool) -> Result<Array4<f32>> {
        Ok(scaled)
    }

    /// Extra UNet inputs appended after (sample, timestep, embeddings).
    fn step_extras(
        &mut self,
        _models: &DiffuserModels<'_>,
        _scaled: &Array4<f32>,
        _timestep: i64,
        _embeddings: &PromptEmbeddings,
        _options: &SchedulerOptions,
    ) -> Result<Vec<InputValue>> {
        Ok(Vec::new())
    }

    /// Adjusts the latent after the scheduler step.
    fn after_step(
        &mut self,
        latents: Array4<f32>,
        _noise_pred: &Array4<f32>,
        _timestep: i64,
        _scheduler: &mut dyn Scheduler,
        _step: usize,
        _total: usize,
    ) -> Result<Array4<f32>> {
        Ok(latents)
    }
}

/// Classifier-free guidance: `neg + w * (pos - neg)` over a stacked
/// `[2, C, H, W]` prediction.
pub(crate) fn apply_guidance(noise_pred: Array4<f32>, guidance_scale: f32) -> Result<Array4<f32>> {
    let dims = noise_pred.dim();
    if dims.0 != 2 {
        return Err(DiffusionError::shape(
            &[2, dims.1, dims.2, dims.3],
            &[dims.0, dims.1, dims.2, dims.3],
        ));
    }
    let negative = noise_pred.slice(s![0..1, .., .., ..]);
    let positive = noise_pred.slice(s![1..2, .., .., ..]);
    let delta = (&positive - &negative).mapv(|v| v * guidance_scale);
    Ok(&negative.to_owned() + &delta)
}

/// The shared denoising loop.
pub(crate) fn run_loop(
    diffuser: &mut dyn Diffuser,
    models: &DiffuserModels<'_>,
    embeddings: &PromptEmbeddings,
    prompt: &PromptOptions,
    options: &SchedulerOptions,
    ctx: &RunContext,
) -> Result<Array4<f32>> {
    let guidance = options.guidance_enabled();
    let mut scheduler = options
        .scheduler_type
        .create(&options.to_scheduler_config())
        .map_err(|e| DiffusionError::UnsupportedScheduler(e.to_string()))?;

    let all_timesteps = scheduler.timesteps().to_vec();
    let start = diffuser
        .start_step(scheduler.as_ref(), options)
        .min(all_timesteps.len());
    let timesteps = &all_timesteps[start..];

    let mut latents =
        diffuser.prepare_latents(models, prompt, options, scheduler.as_mut(), timesteps)?;
    let total = timesteps.len();

    for (step, &timestep) in timesteps.iter().enumerate() {
        ctx.cancellation.check()?;

        let input = if guidance {
            tensor::repeat(&latents, 2)?
        } else {
            latents.clone()
        };
        let scaled = scheduler.scale_model_input(input, timestep);
        let scaled = diffuser.augment_sample(scaled, guidance)?;
        let extras = diffuser.step_extras(models, &scaled, timestep, embeddings, options)?;

        let mut params = InferenceParameters::new();
        params.push(scaled);
        params.push_timestep(timestep as f32);
        params.push(embeddings.prompt_embeds.clone());
        for extra in extras {
            params.push_value(extra);
        }

        let mut outputs = models.unet.run(params)?;
        if outputs.is_empty() {
            return Err(DiffusionError::InferenceFailed("UNet produced no outputs".into()));
        }
        let raw = outputs.swap_remove(0);
        let raw_shape = raw.shape().to_vec();
        let noise_pred = raw
            .into_dimensionality::<Ix4>()
            .map_err(|_| DiffusionError::shape(&models.latent_shape(options), &raw_shape))?;
        let noise_pred = if guidance {
            apply_guidance(noise_pred, options.guidance_scale)?
        } else {
            noise_pred
        };

        let output = scheduler
            .step(&noise_pred, timestep, &latents)
            .map_err(|e| DiffusionError::InferenceFailed(e.to_string()))?;
        latents = diffuser.after_step(
            output.prev_sample,
            &noise_pred,
            timestep,
            scheduler.as_mut(),
            step,
            total,
        )?;

        trace!(step = step + 1, total, timestep, "scheduler step complete");
        ctx.report(step + 1, total, &latents);
    }

    if models.memory_mode.unload_eagerly() {
        models.unet.unload();
        if let Some(controlnet) = models.controlnet {
            controlnet.unload();
        }
    }
    Ok(latents)
}

/// Scales latents back to VAE range, decodes, and normalizes to [0, 1].
pub(crate) fn decode_latents(
    models: &DiffuserModels<'_>,
    options: &SchedulerOptions,
    latents: &Array4<f32>,
) -> Result<Array4<f32>> {
    let scaled = latents.mapv(|v| v / models.scale_factor);
    let mut params = InferenceParameters::new();
    params.push(scaled);
    params.push_output_hint(Some(vec![1, 3, options.height, options.width]));

    let mut outputs = models.vae_decoder.run(params)?;
    if outputs.is_empty() {
        return Err(DiffusionError::InferenceFailed("VAE produced no outputs".into()));
    }
    let raw = outputs.swap_remove(0);
    let raw_shape = raw.shape().to_vec();
    let image = raw
        .into_dimensionality::<Ix4>()
        .map_err(|_| DiffusionError::shape(&[1, 3, options.height, options.width], &raw_shape))?;

    if models.memory_mode.unload_eagerly() {
        models.vae_decoder.unload();
        if let Some(encoder) = models.vae_encoder {
            encoder.unload();
        }
    }
    Ok(tensor::normalize_minus_one_to_one(&image))
}

/// Runs the VAE encoder and applies the latent scale factor.
pub(crate) fn encode_image(
    models: &DiffuserModels<'_>,
    image: &Array4<f32>,
) -> Result<Array4<f32>> {
    let encoder = models.vae_encoder.ok_or_else(|| {
        DiffusionError::InvalidOptions("model set declares no VAE encoder".into())
    })?;
    let mut params = InferenceParameters::new();
    params.push(image.clone());
    let mut outputs = encoder.run(params)?;
    if outputs.is_empty() {
        return Err(DiffusionError::InferenceFailed(
            "VAE encoder produced no outputs".into(),
        ));
    }
    let raw = outputs.swap_remove(0);
    let raw_shape = raw.shape().to_vec();
    let latent = raw
        .into_dimensionality::<Ix4>()
        .map_err(|_| DiffusionError::shape(&[1, 4, 0, 0], &raw_shape))?;
    Ok(latent.mapv(|v| v * models.scale_factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guidance_extrapolates_from_negative() {
        let mut stacked = Array4::<f32>::zeros((2, 1, 2, 2));
        stacked.slice_mut(s![0..1, .., .., ..]).fill(1.0); // negative
        stacked.slice_mut(s![1..2, .., .., ..]).fill(3.0); // positive
        let guided = apply_guidance(stacked, 7.5).unwrap();
        assert_eq!(guided.dim(), (1, 1, 2, 2));
        // 1 + 7.5 * (3 - 1) = 16
        assert_eq!(guided[[0, 0, 0, 0]], 16.0);
    }

    #[test]
    fn test_guidance_identity_at_scale_one() {
        let mut stacked = Array4::<f32>::zeros((2, 1, 1, 1));
        stacked[[0, 0, 0, 0]] = 0.5;
        stacked[[1, 0, 0, 0]] = 2.0;
        let guided = apply_guidance(stacked, 1.0).unwrap();
        assert_eq!(guided[[0, 0, 0, 0]], 2.0);
    }

    #[test]
    fn test_guidance_rejects_single_batch() {
        let single = Array4::<f32>::zeros((1, 4, 8, 8));
        assert!(apply_guidance(single, 7.5).is_err());
    }
}
