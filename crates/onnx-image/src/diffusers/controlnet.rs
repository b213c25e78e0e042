//! ControlNet diffusers
//!
//! The ControlNet session runs once per step on the same scaled sample,
//! timestep and embeddings as the UNet plus the hint image; its outputs
//! (down-block and mid-block residuals) become additional UNet inputs in
//! declaration order.

use ndarray::Array4;

use onnx_image_clip::PromptEmbeddings;
use onnx_image_core::{tensor, DiffusionError, InferenceParameters, InputValue, Result};
use onnx_image_schedulers::Scheduler;

use super::image_to_image::{prepare_image_latents, strength_start_step};
use super::{Diffuser, DiffuserModels};
use crate::input_image::ImageNormalization;
use crate::options::{PromptOptions, SchedulerOptions};

/// Inputs beyond which a ControlNet export takes an explicit
/// conditioning-scale scalar.
const CONTROLNET_SCALE_INPUT_INDEX: usize = 4;

fn prepare_control_image(
    prompt: &PromptOptions,
    options: &SchedulerOptions,
) -> Result<Array4<f32>> {
    prompt
        .input_control_image
        .as_ref()
        .ok_or_else(|| DiffusionError::InvalidOptions("missing control image".into()))?
        .to_tensor(options.height, options.width, ImageNormalization::ZeroToOne)
}

/// Runs the ControlNet session and converts every residual into an extra
/// UNet input.
fn run_controlnet(
    models: &DiffuserModels<'_>,
    control_image: &Array4<f32>,
    scaled: &Array4<f32>,
    timestep: i64,
    embeddings: &PromptEmbeddings,
    options: &SchedulerOptions,
) -> Result<Vec<InputValue>> {
    let controlnet = models.controlnet.ok_or_else(|| {
        DiffusionError::InvalidOptions("model set declares no controlnet".into())
    })?;

    let batch = scaled.dim().0;
    let hint = tensor::repeat(control_image, batch)?;

    let mut params = InferenceParameters::new();
    params.push(scaled.clone());
    params.push_timestep(timestep as f32);
    params.push(embeddings.prompt_embeds.clone());
    params.push(hint);
    // Older exports bake the scale in; newer ones take it as a scalar.
    if controlnet.metadata()?.inputs.len() > CONTROLNET_SCALE_INPUT_INDEX {
        params.push_scalar_f64(options.conditioning_scale as f64);
    }

    let outputs = controlnet.run(params)?;
    Ok(outputs.into_iter().map(InputValue::F32).collect())
}

/// ControlNet over a text-to-image loop.
#[derive(Default)]
pub struct ControlNetDiffuser {
    control_image: Option<Array4<f32>>,
}

impl Diffuser for ControlNetDiffuser {
    fn prepare_latents(
        &mut self,
        models: &DiffuserModels<'_>,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        scheduler: &mut dyn Scheduler,
        _timesteps: &[i64],
    ) -> Result<Array4<f32>> {
        self.control_image = Some(prepare_control_image(prompt, options)?);
        let sigma = scheduler.init_noise_sigma();
        Ok(scheduler.create_random_sample(models.latent_shape(options), sigma))
    }

    fn step_extras(
        &mut self,
        models: &DiffuserModels<'_>,
        scaled: &Array4<f32>,
        timestep: i64,
        embeddings: &PromptEmbeddings,
        options: &SchedulerOptions,
    ) -> Result<Vec<InputValue>> {
        let control_image = self.control_image.as_ref().ok_or_else(|| {
            DiffusionError::InvalidOptions("control image was not prepared".into())
        })?;
        run_controlnet(models, control_image, scaled, timestep, embeddings, options)
    }
}

/// ControlNet composed with the image-to-image start-step logic.
#[derive(Default)]
pub struct ControlNetImageDiffuser {
    control_image: Option<Array4<f32>>,
}

impl Diffuser for ControlNetImageDiffuser {
    fn start_step(&self, scheduler: &dyn Scheduler, options: &SchedulerOptions) -> usize {
        strength_start_step(scheduler.timesteps().len(), options.strength)
    }

    fn prepare_latents(
        &mut self,
        models: &DiffuserModels<'_>,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        scheduler: &mut dyn Scheduler,
        timesteps: &[i64],
    ) -> Result<Array4<f32>> {
        self.control_image = Some(prepare_control_image(prompt, options)?);
        prepare_image_latents(models, prompt, options, scheduler, timesteps)
    }

    fn step_extras(
        &mut self,
        models: &DiffuserModels<'_>,
        scaled: &Array4<f32>,
        timestep: i64,
        embeddings: &PromptEmbeddings,
        options: &SchedulerOptions,
    ) -> Result<Vec<InputValue>> {
        let control_image = self.control_image.as_ref().ok_or_else(|| {
            DiffusionError::InvalidOptions("control image was not prepared".into())
        })?;
        run_controlnet(models, control_image, scaled, timestep, embeddings, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_image::InputImage;

    #[test]
    fn test_control_image_required() {
        let prompt = PromptOptions::text("an alien");
        let options = SchedulerOptions::default();
        assert!(prepare_control_image(&prompt, &options).is_err());
    }

    #[test]
    fn test_control_image_passthrough_keeps_zero_to_one() {
        let tensor = Array4::from_elem((1, 3, 512, 512), 0.25);
        let prompt = PromptOptions {
            input_control_image: Some(InputImage::Tensor(tensor)),
            ..PromptOptions::text("an alien")
        };
        let options = SchedulerOptions::default();
        let prepared = prepare_control_image(&prompt, &options).unwrap();
        assert_eq!(prepared.dim(), (1, 3, 512, 512));
        assert!((prepared[[0, 0, 0, 0]] - 0.25).abs() < 1e-6);
    }
}
