//! DDPM solver
//!
//! The original stochastic reverse process: posterior mean from the
//! predicted clean sample plus fixed-small variance noise at every step
//! except the last.

use ndarray::Array4;
use rand::rngs::StdRng;

use crate::schedule::{
    pred_original_alpha, sample_normal, seeded_rng, spaced_timesteps, NoiseSchedule, Scheduler,
    SchedulerConfig, SchedulerError, StepOutput,
};

pub struct DdpmScheduler {
    config: SchedulerConfig,
    schedule: NoiseSchedule,
    timesteps: Vec<i64>,
    rng: StdRng,
}

impl DdpmScheduler {
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

    fn alpha_cumprod_or_one(&self, timestep: i64) -> f32 {
        if timestep < 0 {
            1.0
        } else {
            self.schedule.alpha_cumprod(timestep)
        }
    }
}

impl Scheduler for DdpmScheduler {
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
        let alpha_prod_prev = self.alpha_cumprod_or_one(prev_timestep);
        let beta_prod = 1.0 - alpha_prod;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let (mut pred_original, _) =
            pred_original_alpha(model_output, sample, alpha_prod, self.config.prediction_type);
        if self.config.clip_sample {
            let range = self.config.clip_sample_range;
            pred_original = pred_original.mapv(|v| v.clamp(-range, range));
        }

        // Posterior mean q(x_{t-1} | x_t, x_0).
        let original_coeff = alpha_prod_prev.sqrt() * current_beta / beta_prod;
        let sample_coeff = current_alpha.sqrt() * beta_prod_prev / beta_prod;
        let mut prev_sample =
            &pred_original.mapv(|v| v * original_coeff) + &sample.mapv(|v| v * sample_coeff);

        if timestep > 0 {
            // Fixed-small variance, floored away from zero.
            let variance = (beta_prod_prev / beta_prod * current_beta).max(1e-20);
            let shape = prev_sample.dim();
            let noise = sample_normal(&mut self.rng, [shape.0, shape.1, shape.2, shape.3]);
            prev_sample = &prev_sample + &noise.mapv(|v| v * variance.sqrt());
        }

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::PredictionType;

    fn scheduler(steps: usize, seed: u64) -> DdpmScheduler {
        DdpmScheduler::new(SchedulerConfig {
            inference_steps: steps,
            seed,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_identity_input_scaling() {
        let mut s = scheduler(10, 1);
        let sample = Array4::from_elem((1, 4, 8, 8), 0.3);
        let t = s.timesteps()[0];
        assert_eq!(s.scale_model_input(sample.clone(), t), sample);
        assert_eq!(s.init_noise_sigma(), 1.0);
    }

    #[test]
    fn test_add_noise_preserves_unit_variance() {
        let mut s = scheduler(10, 1);
        let t = s.timesteps()[0];
        let alpha_prod = s.schedule.alpha_cumprod(t);
        let original = Array4::from_elem((1, 1, 1, 1), 1.0);
        let noise = Array4::from_elem((1, 1, 1, 1), 1.0);
        let noised = s.add_noise(&original, &noise, t);
        let expected = alpha_prod.sqrt() + (1.0 - alpha_prod).sqrt();
        assert!((noised[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_step_reproducible_per_seed() {
        let sample = Array4::from_elem((1, 4, 8, 8), 0.5);
        let output = Array4::from_elem((1, 4, 8, 8), 0.1);

        let mut a = scheduler(10, 42);
        let mut b = scheduler(10, 42);
        let t = a.timesteps()[0];
        assert_eq!(
            a.step(&output, t, &sample).unwrap().prev_sample,
            b.step(&output, t, &sample).unwrap().prev_sample
        );
    }

    #[test]
    fn test_sample_prediction_passthrough() {
        let mut s = DdpmScheduler::new(SchedulerConfig {
            inference_steps: 10,
            prediction_type: PredictionType::Sample,
            seed: 3,
            ..Default::default()
        })
        .unwrap();
        let t = s.timesteps()[0];
        let sample = Array4::from_elem((1, 1, 2, 2), 0.5);
        let output = Array4::from_elem((1, 1, 2, 2), 0.25);
        let out = s.step(&output, t, &sample).unwrap();
        assert_eq!(out.pred_original_sample.unwrap(), output);
    }

    #[test]
    fn test_clip_sample_bounds_prediction() {
        let mut s = DdpmScheduler::new(SchedulerConfig {
            inference_steps: 10,
            clip_sample: true,
            clip_sample_range: 1.0,
            prediction_type: PredictionType::Sample,
            seed: 3,
            ..Default::default()
        })
        .unwrap();
        let t = s.timesteps()[0];
        let sample = Array4::from_elem((1, 1, 2, 2), 0.0);
        let output = Array4::from_elem((1, 1, 2, 2), 5.0);
        let out = s.step(&output, t, &sample).unwrap();
        assert_eq!(out.pred_original_sample.unwrap()[[0, 0, 0, 0]], 1.0);
    }
}
