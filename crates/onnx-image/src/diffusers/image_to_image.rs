//! Image-to-image diffuser

use ndarray::Array4;

use onnx_image_core::{DiffusionError, Result};
use onnx_image_schedulers::Scheduler;

use super::{encode_image, Diffuser, DiffuserModels};
use crate::input_image::ImageNormalization;
use crate::options::{PromptOptions, SchedulerOptions};

/// Start index into the timestep list for a given strength:
/// `steps - int(steps * strength)` timesteps are skipped, leaving
/// `int(steps * strength)` denoising steps.
pub(crate) fn strength_start_step(total_steps: usize, strength: f32) -> usize {
    let denoise_steps = (total_steps as f32 * strength) as usize;
    total_steps.saturating_sub(denoise_steps)
}

/// Encodes the input image and noises it to the first active timestep.
pub(crate) fn prepare_image_latents(
    models: &DiffuserModels<'_>,
    prompt: &PromptOptions,
    options: &SchedulerOptions,
    scheduler: &mut dyn Scheduler,
    timesteps: &[i64],
) -> Result<Array4<f32>> {
    let image = prompt
        .input_image
        .as_ref()
        .ok_or_else(|| DiffusionError::InvalidOptions("missing input image".into()))?
        .to_tensor(options.height, options.width, ImageNormalization::MinusOneToOne)?;
    let clean = encode_image(models, &image)?;

    // A strength low enough to round to zero steps leaves the encoded
    // image untouched; the loop body never runs.
    let Some(&start_timestep) = timesteps.first() else {
        return Ok(clean);
    };

    let dims = clean.dim();
    let noise = scheduler.sample_noise([dims.0, dims.1, dims.2, dims.3]);
    Ok(scheduler.add_noise(&clean, &noise, start_timestep))
}

/// Image-to-image: the VAE-encoded input, strength-noised, denoised over
/// the tail of the timestep list.
#[derive(Default)]
pub struct ImageToImageDiffuser;

impl Diffuser for ImageToImageDiffuser {
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
        prepare_image_latents(models, prompt, options, scheduler, timesteps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strength_start_step_spec_values() {
        // 30 steps at strength 0.8 skips 6 and denoises 24.
        assert_eq!(strength_start_step(30, 0.8), 6);
        // Full strength runs the whole schedule.
        assert_eq!(strength_start_step(30, 1.0), 0);
        // Tiny strength rounds to zero denoising steps.
        assert_eq!(strength_start_step(30, 0.01), 30);
    }

    #[test]
    fn test_remaining_steps_match_strength_floor() {
        for steps in [10usize, 30, 50] {
            for strength in [0.25f32, 0.5, 0.8] {
                let start = strength_start_step(steps, strength);
                assert_eq!(steps - start, (steps as f32 * strength) as usize);
            }
        }
    }
}
