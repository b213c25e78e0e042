//! Text-to-image diffusers

use ndarray::Array4;

use onnx_image_core::Result;
use onnx_image_schedulers::Scheduler;

use super::{Diffuser, DiffuserModels};
use crate::options::{PromptOptions, SchedulerOptions};

/// Plain text-to-image: a seeded gaussian latent denoised over the full
/// timestep list.
#[derive(Default)]
pub struct TextToImageDiffuser;

impl Diffuser for TextToImageDiffuser {
    fn prepare_latents(
        &mut self,
        models: &DiffuserModels<'_>,
        _prompt: &PromptOptions,
        options: &SchedulerOptions,
        scheduler: &mut dyn Scheduler,
        _timesteps: &[i64],
    ) -> Result<Array4<f32>> {
        let sigma = scheduler.init_noise_sigma();
        Ok(scheduler.create_random_sample(models.latent_shape(options), sigma))
    }
}

/// Rectified-flow text-to-image for single-step distilled models.
///
/// After the scheduler step the distilled velocity term
/// `noise_pred / total_steps` is added on top, matching the source
/// implementation this reproduces (the term lands after the step, not in
/// place of it).
#[derive(Default)]
pub struct InstaFlowTextDiffuser;

impl Diffuser for InstaFlowTextDiffuser {
    fn prepare_latents(
        &mut self,
        models: &DiffuserModels<'_>,
        _prompt: &PromptOptions,
        options: &SchedulerOptions,
        scheduler: &mut dyn Scheduler,
        _timesteps: &[i64],
    ) -> Result<Array4<f32>> {
        let sigma = scheduler.init_noise_sigma();
        Ok(scheduler.create_random_sample(models.latent_shape(options), sigma))
    }

    fn after_step(
        &mut self,
        latents: Array4<f32>,
        noise_pred: &Array4<f32>,
        _timestep: i64,
        _scheduler: &mut dyn Scheduler,
        _step: usize,
        total: usize,
    ) -> Result<Array4<f32>> {
        let weight = 1.0 / total.max(1) as f32;
        Ok(&latents + &noise_pred.mapv(|v| v * weight))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onnx_image_schedulers::{SchedulerConfig, SchedulerKind};

    #[test]
    fn test_instaflow_residual_weighting() {
        let mut diffuser = InstaFlowTextDiffuser;
        let mut scheduler = SchedulerKind::Euler
            .create(&SchedulerConfig::default())
            .unwrap();
        let latents = Array4::<f32>::zeros((1, 4, 8, 8));
        let noise_pred = Array4::from_elem((1, 4, 8, 8), 2.0);
        let out = diffuser
            .after_step(latents, &noise_pred, 999, scheduler.as_mut(), 0, 4)
            .unwrap();
        assert!((out[[0, 0, 0, 0]] - 0.5).abs() < 1e-6);
    }
}
