//! DDIM solver
//!
//! Deterministic (eta = 0) reverse step. The last transition treats the
//! final cumulative alpha as 1 so the output lands exactly on the
//! predicted clean sample.

use ndarray::Array4;
use rand::rngs::StdRng;

use crate::schedule::{
    pred_original_alpha, sample_normal, seeded_rng, spaced_timesteps, NoiseSchedule, Scheduler,
    SchedulerConfig, SchedulerError, StepOutput,
};

pub struct DdimScheduler {
    config: SchedulerConfig,
    schedule: NoiseSchedule,
    timesteps: Vec<i64>,
    rng: StdRng,
}

impl DdimScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let schedule = NoiseSchedule::new(&config)?;
        let rng = seeded_rng(config.seed);
        let timesteps = spaced_timesteps(&config)?;
        Ok(Self {
            config,
            schedule,
            timesteps,
            rng,
        })
    }

    fn previous_timestep(&self, timestep: i64) -> i64 {
        timestep - (self.config.train_timesteps / self.config.inference_steps) as i64
    }
}

impl Scheduler for DdimScheduler {
    fn timesteps(&self) -> &[i64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    fn scale_model_input(&mut self, sample: Array4<f32>, _timestep: i64) -> Array4<f32> {
        sample
    }

    fn step(
        &mut self,
        model_output: &Array4<f32>,
        timestep: i64,
        sample: &Array4<f32>,
    ) -> Result<StepOutput, SchedulerError> {
        if !self.timesteps.contains(&timestep) {
            return Err(SchedulerError::UnknownTimestep(timestep));
        }
        let prev_timestep = self.previous_timestep(timestep);

        let alpha_prod = self.schedule.alpha_cumprod(timestep);
        let alpha_prod_prev = if prev_timestep < 0 {
            1.0
        } else {
            self.schedule.alpha_cumprod(prev_timestep)
        };

        let (mut pred_original, mut pred_epsilon) =
            pred_original_alpha(model_output, sample, alpha_prod, self.config.prediction_type);
        if self.config.clip_sample {
            let range = self.config.clip_sample_range;
            pred_original = pred_original.mapv(|v| v.clamp(-range, range));
            // Clipping moved x_0, so the epsilon implied by it changes too.
            let sqrt_alpha = alpha_prod.sqrt();
            let sqrt_beta = (1.0 - alpha_prod).sqrt();
            pred_epsilon =
                (sample - &pred_original.mapv(|v| v * sqrt_alpha)).mapv(|v| v / sqrt_beta);
        }

        let direction = pred_epsilon.mapv(|v| v * (1.0 - alpha_prod_prev).sqrt());
        let prev_sample =
            &pred_original.mapv(|v| v * alpha_prod_prev.sqrt()) + &direction;

        Ok(StepOutput {
            prev_sample,
            pred_original_sample: Some(pred_original),
        })
    }

    fn add_noise(
        &mut self,
        original: &Array4<f32>,
        noise: &Array4<f32>,
        timestep: i64,
    ) -> Array4<f32> {
        let alpha_prod = self.schedule.alpha_cumprod(timestep);
        let sqrt_alpha = alpha_prod.sqrt();
        let sqrt_one_minus = (1.0 - alpha_prod).sqrt();
        &original.mapv(|v| v * sqrt_alpha) + &noise.mapv(|v| v * sqrt_one_minus)
    }

    fn sample_noise(&mut self, shape: [usize; 4]) -> Array4<f32> {
        sample_normal(&mut self.rng, shape)
    }

    fn set_timesteps(&mut self, inference_steps: usize) -> Result<(), SchedulerError> {
        self.config.inference_steps = inference_steps;
        self.timesteps = spaced_timesteps(&self.config)?;
        Ok(())
    }
}
