//! Linear multistep solver
//!
//! Integrates the probability-flow ODE with a linear combination of the
//! last few derivatives. Coefficients are the integrals of the Lagrange
//! basis polynomials over each sigma interval; Simpson integration is
//! exact for the cubic bases the order-4 method produces.

use std::collections::VecDeque;

use ndarray::Array4;
use rand::rngs::StdRng;

use crate::schedule::{
    pred_original_sigma, sample_normal, seeded_rng, spaced_timesteps, NoiseSchedule, Scheduler,
    SchedulerConfig, SchedulerError, StepOutput, TimestepSpacing,
};

/// Maximum multistep order.
const MAX_ORDER: usize = 4;

pub struct LmsScheduler {
    config: SchedulerConfig,
    schedule: NoiseSchedule,
    timesteps: Vec<i64>,
    /// Sigma per inference step plus a trailing 0.
    sigmas: Vec<f32>,
    derivatives: VecDeque<Array4<f32>>,
    rng: StdRng,
}

impl LmsScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let schedule = NoiseSchedule::new(&config)?;
        let rng = seeded_rng(config.seed);
        let mut scheduler = Self {
            config,
            schedule,
            timesteps: Vec::new(),
            sigmas: Vec::new(),
            derivatives: VecDeque::new(),
            rng,
        };
        scheduler.compute()?;
        Ok(scheduler)
    }

    fn compute(&mut self) -> Result<(), SchedulerError> {
        self.timesteps = spaced_timesteps(&self.config)?;
        self.sigmas = self
            .timesteps
            .iter()
            .map(|&t| self.schedule.sigma(t))
            .collect();
        self.sigmas.push(0.0);
        self.derivatives.clear();
        Ok(())
    }

    fn step_index(&self, timestep: i64) -> Result<usize, SchedulerError> {
        self.timesteps
            .iter()
            .position(|&t| t == timestep)
            .ok_or(SchedulerError::UnknownTimestep(timestep))
    }

    /// Integral of the Lagrange basis for derivative `k` over the current
    /// sigma interval.
    fn lms_coefficient(&self, order: usize, index: usize, k: usize) -> f32 {
        let sigmas = &self.sigmas;
        let integrand = |tau: f64| -> f64 {
            let mut prod = 1.0;
            for j in 0..order {
                if j == k {
                    continue;
                }
                let sigma_k = sigmas[index - k] as f64;
                let sigma_j = sigmas[index - j] as f64;
                prod *= (tau - sigma_j) / (sigma_k - sigma_j);
            }
            prod
        };
        simpson(integrand, sigmas[index] as f64, sigmas[index + 1] as f64, 128) as f32
    }
}

/// Composite Simpson rule over `n` (even) subintervals.
fn simpson(f: impl Fn(f64) -> f64, a: f64, b: f64, n: usize) -> f64 {
    let h = (b - a) / n as f64;
    let mut sum = f(a) + f(b);
    for i in 1..n {
        let weight = if i % 2 == 0 { 2.0 } else { 4.0 };
        sum += weight * f(a + i as f64 * h);
    }
    sum * h / 3.0
}

impl Scheduler for LmsScheduler {
    fn timesteps(&self) -> &[i64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        let sigma_max = self.sigmas[0];
        match self.config.timestep_spacing {
            TimestepSpacing::Linspace | TimestepSpacing::Trailing => sigma_max,
            TimestepSpacing::Leading => (sigma_max * sigma_max + 1.0).sqrt(),
        }
    }

    fn scale_model_input(&mut self, sample: Array4<f32>, timestep: i64) -> Array4<f32> {
        match self.step_index(timestep) {
            Ok(index) => {
                let sigma = self.sigmas[index];
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
        let index = self.step_index(timestep)?;
        let sigma = self.sigmas[index];

        let pred_original =
            pred_original_sigma(model_output, sample, sigma, self.config.prediction_type);
        let derivative = (sample - &pred_original).mapv(|v| v / sigma);

        self.derivatives.push_front(derivative);
        if self.derivatives.len() > MAX_ORDER {
            self.derivatives.pop_back();
        }

        // History length governs the usable order; a schedule entered
        // mid-way (image-to-image) warms up exactly like the first steps.
        let order = self.derivatives.len().min(MAX_ORDER);
        let mut prev_sample = sample.clone();
        for (k, derivative) in self.derivatives.iter().take(order).enumerate() {
            let coefficient = self.lms_coefficient(order, index, k);
            prev_sample = &prev_sample + &derivative.mapv(|v| v * coefficient);
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
