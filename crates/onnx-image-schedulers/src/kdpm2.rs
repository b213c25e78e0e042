//! KDPM2 solver
//!
//! Two-evaluation midpoint method. Each displayed step expands into an
//! evaluation at the anchor sigma and one at the log-space midpoint, so
//! the published timestep list interleaves anchor and midpoint timesteps
//! and the solver caches the anchor sample between the paired calls.

use ndarray::Array4;
use rand::rngs::StdRng;

use crate::schedule::{
    pred_original_sigma, sample_normal, seeded_rng, spaced_timesteps, NoiseSchedule, Scheduler,
    SchedulerConfig, SchedulerError, StepOutput, TimestepSpacing,
};

pub struct Kdpm2Scheduler {
    config: SchedulerConfig,
    schedule: NoiseSchedule,
    /// Interleaved anchor/midpoint timesteps, length `2n - 1`.
    timesteps: Vec<i64>,
    /// Anchor sigmas, length `n + 1` with a trailing 0.
    anchor_sigmas: Vec<f32>,
    /// Midpoint sigmas between consecutive anchors, length `n - 1`.
    interpol_sigmas: Vec<f32>,
    /// Call counter into the interleaved list; lazily positioned so a
    /// truncated (image-to-image) schedule starts in the right place.
    step_index: Option<usize>,
    /// Anchor sample cached by the first call of each pair.
    anchor_sample: Option<Array4<f32>>,
    rng: StdRng,
}

impl Kdpm2Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let schedule = NoiseSchedule::new(&config)?;
        let rng = seeded_rng(config.seed);
        let mut scheduler = Self {
            config,
            schedule,
            timesteps: Vec::new(),
            anchor_sigmas: Vec::new(),
            interpol_sigmas: Vec::new(),
            step_index: None,
            anchor_sample: None,
            rng,
        };
        scheduler.compute()?;
        Ok(scheduler)
    }

    fn compute(&mut self) -> Result<(), SchedulerError> {
        let anchors = spaced_timesteps(&self.config)?;
        let n = anchors.len();
        self.anchor_sigmas = anchors.iter().map(|&t| self.schedule.sigma(t)).collect();
        self.anchor_sigmas.push(0.0);

        self.interpol_sigmas = (0..n.saturating_sub(1))
            .map(|i| {
                let a = self.anchor_sigmas[i].max(1e-10).ln();
                let b = self.anchor_sigmas[i + 1].max(1e-10).ln();
                (0.5 * (a + b)).exp()
            })
            .collect();

        let log_sigmas: Vec<f32> = self
            .schedule
            .sigmas()
            .iter()
            .map(|&s| s.max(1e-10).ln())
            .collect();
        self.timesteps = Vec::with_capacity(2 * n - 1);
        for i in 0..n {
            self.timesteps.push(anchors[i]);
            if i < n - 1 {
                let midpoint = sigma_to_timestep(self.interpol_sigmas[i], &log_sigmas);
                self.timesteps.push(midpoint.round() as i64);
            }
        }

        self.step_index = None;
        self.anchor_sample = None;
        Ok(())
    }

    fn call_index(&self, timestep: i64) -> Result<usize, SchedulerError> {
        match self.step_index {
            Some(index) if index < self.timesteps.len() => Ok(index),
            Some(index) => Err(SchedulerError::InvalidSchedule(format!(
                "step called past the end of the schedule (index {index})"
            ))),
            None => self
                .timesteps
                .iter()
                .position(|&t| t == timestep)
                .ok_or(SchedulerError::UnknownTimestep(timestep)),
        }
    }

    fn sigma_for_call(&self, index: usize) -> f32 {
        let pair = index / 2;
        if index % 2 == 0 {
            self.anchor_sigmas[pair]
        } else {
            self.interpol_sigmas[pair]
        }
    }
}

/// Log-linear interpolation of a sigma back onto the (fractional)
/// training timestep axis.
fn sigma_to_timestep(sigma: f32, log_sigmas: &[f32]) -> f32 {
    let log_sigma = sigma.max(1e-10).ln();
    let mut low_idx = 0;
    for (i, &value) in log_sigmas.iter().enumerate().take(log_sigmas.len() - 1) {
        if log_sigma >= value {
            low_idx = i;
        }
    }
    let high_idx = low_idx + 1;
    let low = log_sigmas[low_idx];
    let high = log_sigmas[high_idx];
    let w = ((log_sigma - low) / (high - low)).clamp(0.0, 1.0);
    (1.0 - w) * low_idx as f32 + w * high_idx as f32
}

impl Scheduler for Kdpm2Scheduler {
    fn timesteps(&self) -> &[i64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        let sigma_max = self.anchor_sigmas[0];
        match self.config.timestep_spacing {
            TimestepSpacing::Linspace | TimestepSpacing::Trailing => sigma_max,
            TimestepSpacing::Leading => (sigma_max * sigma_max + 1.0).sqrt(),
        }
    }

    fn scale_model_input(&mut self, sample: Array4<f32>, timestep: i64) -> Array4<f32> {
        match self.call_index(timestep) {
            Ok(index) => {
                let sigma = self.sigma_for_call(index);
                let scale = (sigma * sigma + 1.0).sqrt();
                sample.mapv(|v| v / scale)
            }
            Err(_) => sample,
        }
    }

    fn step(
        &mut self,
        model_output: &Array4<f32>,
        timestep: i64,
        sample: &Array4<f32>,
    ) -> Result<StepOutput, SchedulerError> {
        let index = self.call_index(timestep)?;
        let pair = index / 2;
        let first_of_pair = index % 2 == 0;
        let prediction = self.config.prediction_type;

        let output = if first_of_pair {
            let sigma = self.anchor_sigmas[pair];
            let sigma_next = self.anchor_sigmas[pair + 1];
            let pred_original = pred_original_sigma(model_output, sample, sigma, prediction);
            let derivative = (sample - &pred_original).mapv(|v| v / sigma);

            if sigma_next == 0.0 {
                // Final anchor has no midpoint; close with a plain Euler
                // step to sigma = 0.
                let dt = sigma_next - sigma;
                StepOutput {
                    prev_sample: sample + &derivative.mapv(|v| v * dt),
                    pred_original_sample: Some(pred_original),
                }
            } else {
                let sigma_interpol = self.interpol_sigmas[pair];
                let dt = sigma_interpol - sigma;
                self.anchor_sample = Some(sample.clone());
                StepOutput {
                    prev_sample: sample + &derivative.mapv(|v| v * dt),
                    pred_original_sample: Some(pred_original),
                }
            }
        } else {
            let sigma = self.anchor_sigmas[pair];
            let sigma_interpol = self.interpol_sigmas[pair];
            let sigma_next = self.anchor_sigmas[pair + 1];

            let pred_original =
                pred_original_sigma(model_output, sample, sigma_interpol, prediction);
            let derivative = (sample - &pred_original).mapv(|v| v / sigma_interpol);
            match self.anchor_sample.take() {
                Some(anchor) => {
                    let dt = sigma_next - sigma;
                    StepOutput {
                        prev_sample: &anchor + &derivative.mapv(|v| v * dt),
                        pred_original_sample: Some(pred_original),
                    }
                }
                // A truncated schedule can enter on a midpoint row; without
                // an anchor the transition degrades to plain Euler.
                None => {
                    let dt = sigma_next - sigma_interpol;
                    StepOutput {
                        prev_sample: sample + &derivative.mapv(|v| v * dt),
                        pred_original_sample: Some(pred_original),
                    }
                }
            }
        };

        self.step_index = Some(index + 1);
        Ok(output)
    }

    fn add_noise(
        &mut self,
        original: &Array4<f32>,
        noise: &Array4<f32>,
        timestep: i64,
    ) -> Array4<f32> {
        let sigma = self.schedule.sigma(timestep);
        original + &noise.mapv(|v| v * sigma)
    }

    fn sample_noise(&mut self, shape: [usize; 4]) -> Array4<f32> {
        sample_normal(&mut self.rng, shape)
    }

    fn set_timesteps(&mut self, inference_steps: usize) -> Result<(), SchedulerError> {
        self.config.inference_steps = inference_steps;
        self.compute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(steps: usize) -> Kdpm2Scheduler {
        Kdpm2Scheduler::new(SchedulerConfig {
            inference_steps: steps,
            seed: 11,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_interleaved_timestep_count() {
        let s = scheduler(10);
        assert_eq!(s.timesteps().len(), 19);
        assert_eq!(s.anchor_sigmas.len(), 11);
        assert_eq!(s.interpol_sigmas.len(), 9);
    }

    #[test]
    fn test_midpoint_sigma_between_anchors() {
        let s = scheduler(10);
        for i in 0..9 {
            let mid = s.interpol_sigmas[i];
            assert!(mid < s.anchor_sigmas[i]);
            assert!(mid > s.anchor_sigmas[i + 1].max(0.0));
        }
    }

    #[test]
    fn test_pair_consumes_two_calls() {
        let mut s = scheduler(10);
        let sample = Array4::from_elem((1, 4, 8, 8), 0.5);
        let zero = Array4::zeros((1, 4, 8, 8));

        let t0 = s.timesteps()[0];
        s.step(&zero, t0, &sample).unwrap();
        assert!(s.anchor_sample.is_some());

        let t1 = s.timesteps()[1];
        s.step(&zero, t1, &sample).unwrap();
        assert!(s.anchor_sample.is_none());
        assert_eq!(s.step_index, Some(2));
    }

    #[test]
    fn test_zero_epsilon_keeps_anchor_sample() {
        let mut s = scheduler(10);
        let sample = Array4::from_elem((1, 4, 8, 8), 0.5);
        let zero = Array4::zeros((1, 4, 8, 8));
        let first = s.step(&zero, s.timesteps()[0], &sample).unwrap();
        // epsilon = 0: the midpoint move has zero derivative.
        assert_eq!(first.prev_sample, sample);
        let second = s.step(&zero, s.timesteps()[1], &sample).unwrap();
        assert_eq!(second.prev_sample, sample);
    }

    #[test]
    fn test_sigma_to_timestep_roundtrip() {
        let s = scheduler(10);
        let log_sigmas: Vec<f32> = s
            .schedule
            .sigmas()
            .iter()
            .map(|&v| v.max(1e-10).ln())
            .collect();
        // Exact table entries map back to their own index.
        let t = sigma_to_timestep(s.schedule.sigma(500), &log_sigmas);
        assert!((t - 500.0).abs() < 1e-2);
    }
}
