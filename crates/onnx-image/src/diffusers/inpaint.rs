//! Inpainting diffusers
//!
//! Two flavors: the legacy loop blends the denoised latent against a
//! re-noised copy of the original after every step, steering only the
//! masked region; the full loop feeds a 9-channel UNet
//! (latent ‖ mask ‖ masked latent) and needs no mid-step blending.

use ndarray::Array4;

use onnx_image_core::{tensor, DiffusionError, Result};
use onnx_image_schedulers::Scheduler;

use super::image_to_image::{prepare_image_latents, strength_start_step};
use super::{encode_image, Diffuser, DiffuserModels};
use crate::input_image::ImageNormalization;
use crate::options::{PromptOptions, SchedulerOptions};

fn latent_mask(
    prompt: &PromptOptions,
    options: &SchedulerOptions,
) -> Result<Array4<f32>> {
    let mask = prompt
        .input_mask
        .as_ref()
        .ok_or_else(|| DiffusionError::InvalidOptions("missing inpaint mask".into()))?
        .to_mask_tensor(options.height, options.width)?;
    Ok(tensor::resize_nearest(
        &mask,
        options.height / 8,
        options.width / 8,
    ))
}

/// Legacy inpainting: image-to-image with a per-step mask blend.
///
/// Mask value 1 marks the region being regenerated; the complement is
/// re-noised original content.
#[derive(Default)]
pub struct ImageInpaintLegacyDiffuser {
    original_latent: Option<Array4<f32>>,
    mask: Option<Array4<f32>>,
    noise: Option<Array4<f32>>,
}

impl Diffuser for ImageInpaintLegacyDiffuser {
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
        let image = prompt
            .input_image
            .as_ref()
            .ok_or_else(|| DiffusionError::InvalidOptions("missing input image".into()))?
            .to_tensor(options.height, options.width, ImageNormalization::MinusOneToOne)?;
        let clean = encode_image(models, &image)?;
        let dims = clean.dim();
        let noise = scheduler.sample_noise([dims.0, dims.1, dims.2, dims.3]);

        self.mask = Some(latent_mask(prompt, options)?);

        let latents = match timesteps.first() {
            Some(&start) => scheduler.add_noise(&clean, &noise, start),
            None => clean.clone(),
        };
        self.original_latent = Some(clean);
        self.noise = Some(noise);
        Ok(latents)
    }

    fn after_step(
        &mut self,
        latents: Array4<f32>,
        _noise_pred: &Array4<f32>,
        timestep: i64,
        scheduler: &mut dyn Scheduler,
        _step: usize,
        _total: usize,
    ) -> Result<Array4<f32>> {
        let (original, mask, noise) = match (&self.original_latent, &self.mask, &self.noise) {
            (Some(o), Some(m), Some(n)) => (o, m, n),
            _ => return Ok(latents),
        };
        // Re-noise the original to the current noise level with the same
        // noise draw, then keep it everywhere the mask is clear.
        let noised_original = scheduler.add_noise(original, noise, timestep);
        let inverse = mask.mapv(|m| 1.0 - m);
        Ok(&(&latents * mask) + &(&noised_original * &inverse))
    }
}

/// Full inpainting against a 9-channel UNet export: random initial
/// latents over the full schedule, mask and masked-image latents stacked
/// onto every sample input.
#[derive(Default)]
pub struct ImageInpaintDiffuser {
    mask: Option<Array4<f32>>,
    masked_latent: Option<Array4<f32>>,
}

impl Diffuser for ImageInpaintDiffuser {
    fn prepare_latents(
        &mut self,
        models: &DiffuserModels<'_>,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        scheduler: &mut dyn Scheduler,
        _timesteps: &[i64],
    ) -> Result<Array4<f32>> {
        let image = prompt
            .input_image
            .as_ref()
            .ok_or_else(|| DiffusionError::InvalidOptions("missing input image".into()))?
            .to_tensor(options.height, options.width, ImageNormalization::MinusOneToOne)?;
        let full_mask = prompt
            .input_mask
            .as_ref()
            .ok_or_else(|| DiffusionError::InvalidOptions("missing inpaint mask".into()))?
            .to_mask_tensor(options.height, options.width)?;

        // Black out the region being regenerated before encoding.
        let keep = full_mask.mapv(|m| if m < 0.5 { 1.0 } else { 0.0 });
        let masked_image = &image * &keep;
        self.masked_latent = Some(encode_image(models, &masked_image)?);
        self.mask = Some(latent_mask(prompt, options)?);

        let sigma = scheduler.init_noise_sigma();
        Ok(scheduler.create_random_sample(models.latent_shape(options), sigma))
    }

    fn augment_sample(&self, scaled: Array4<f32>, guidance: bool) -> Result<Array4<f32>> {
        let (mask, masked_latent) = match (&self.mask, &self.masked_latent) {
            (Some(m), Some(l)) => (m, l),
            _ => {
                return Err(DiffusionError::InvalidOptions(
                    "inpaint latents were not prepared".into(),
                ))
            }
        };
        let batch = if guidance { 2 } else { 1 };
        let mask = tensor::repeat(mask, batch)?;
        let masked_latent = tensor::repeat(masked_latent, batch)?;
        tensor::concat_axis(1, &[scaled.view(), mask.view(), masked_latent.view()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_augment_requires_prepared_state() {
        let diffuser = ImageInpaintDiffuser::default();
        let scaled = Array4::<f32>::zeros((1, 4, 8, 8));
        assert!(diffuser.augment_sample(scaled, false).is_err());
    }

    #[test]
    fn test_augment_stacks_nine_channels() {
        let diffuser = ImageInpaintDiffuser {
            mask: Some(Array4::zeros((1, 1, 8, 8))),
            masked_latent: Some(Array4::zeros((1, 4, 8, 8))),
        };
        let scaled = Array4::<f32>::zeros((1, 4, 8, 8));
        let stacked = diffuser.augment_sample(scaled, false).unwrap();
        assert_eq!(stacked.dim(), (1, 9, 8, 8));

        let scaled = Array4::<f32>::zeros((2, 4, 8, 8));
        let stacked = diffuser.augment_sample(scaled, true).unwrap();
        assert_eq!(stacked.dim(), (2, 9, 8, 8));
    }

    #[test]
    fn test_legacy_blend_keeps_unmasked_region() {
        let mut diffuser = ImageInpaintLegacyDiffuser {
            original_latent: Some(Array4::from_elem((1, 4, 2, 2), 5.0)),
            // Mask 0 everywhere: nothing is regenerated.
            mask: Some(Array4::zeros((1, 1, 2, 2))),
            noise: Some(Array4::zeros((1, 4, 2, 2))),
        };
        let mut scheduler = onnx_image_schedulers::SchedulerKind::Ddim
            .create(&onnx_image_schedulers::SchedulerConfig::default())
            .unwrap();
        let denoised = Array4::from_elem((1, 4, 2, 2), -1.0);
        let t = scheduler.timesteps()[0];
        let blended = diffuser
            .after_step(denoised, &Array4::zeros((1, 4, 2, 2)), t, scheduler.as_mut(), 0, 1)
            .unwrap();
        // Zero noise draw: the re-noised original is sqrt(abar)*original.
        let alpha = 5.0
            * onnx_image_schedulers::NoiseSchedule::new(
                &onnx_image_schedulers::SchedulerConfig::default(),
            )
            .unwrap()
            .alpha_cumprod(t)
            .sqrt();
        assert!((blended[[0, 0, 0, 0]] - alpha).abs() < 1e-4);
    }
}
