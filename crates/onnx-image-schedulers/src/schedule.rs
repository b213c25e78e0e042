//! Shared noise-schedule tables and the scheduler contract
//!
//! This module provides the beta/alpha tables every solver derives from,
//! the inference timestep spacings, and the common [`Scheduler`] trait.

use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("timestep {0} is not part of the computed schedule")]
    UnknownTimestep(i64),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// How beta ranges from its minimum to its maximum over training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    /// Linear interpolation of sqrt(beta); the Stable Diffusion default.
    #[default]
    ScaledLinear,
    /// Glide cosine schedule.
    SquaredcosCapV2,
}

/// The quantity the trained model predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    #[default]
    Epsilon,
    VPrediction,
    Sample,
}

/// Inference timestep spacing, per the annotations of arXiv:2305.08891.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    #[default]
    Linspace,
    Leading,
    Trailing,
}

/// Numeric recipe a scheduler is built from. Immutable once created;
/// option updates replace the whole value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub train_timesteps: usize,
    pub inference_steps: usize,
    /// Step count of the distilled teacher schedule, for consistency
    /// models whose usable timesteps are a subsample of it.
    pub original_inference_steps: Option<usize>,
    pub beta_start: f32,
    pub beta_end: f32,
    pub beta_schedule: BetaSchedule,
    /// Pre-trained betas override the analytic schedule when present.
    pub trained_betas: Option<Vec<f32>>,
    pub prediction_type: PredictionType,
    pub timestep_spacing: TimestepSpacing,
    pub steps_offset: usize,
    pub clip_sample: bool,
    pub clip_sample_range: f32,
    pub seed: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            train_timesteps: 1000,
            inference_steps: 30,
            original_inference_steps: None,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            trained_betas: None,
            prediction_type: PredictionType::Epsilon,
            timestep_spacing: TimestepSpacing::Linspace,
            steps_offset: 0,
            clip_sample: false,
            clip_sample_range: 1.0,
            seed: 0,
        }
    }
}

// ============================================================================
// Precomputed schedule tables
// ============================================================================

/// Beta table and derived cumulative alphas, shared by every solver.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f32>,
    alphas: Vec<f32>,
    alphas_cumprod: Vec<f32>,
    train_timesteps: usize,
}

impl NoiseSchedule {
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let n = config.train_timesteps;
        if n == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "train_timesteps must be >= 1".into(),
            ));
        }

        let betas: Vec<f64> = if let Some(trained) = &config.trained_betas {
            if trained.len() != n {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "trained_betas has {} entries, expected {n}",
                    trained.len()
                )));
            }
            trained.iter().map(|&b| b as f64).collect()
        } else {
            let (start, end) = (config.beta_start as f64, config.beta_end as f64);
            match config.beta_schedule {
                BetaSchedule::Linear => linspace(start, end, n),
                BetaSchedule::ScaledLinear => linspace(start.sqrt(), end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect(),
                BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(n, 0.999),
            }
        };

        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut cumprod = 1.0f64;
        for &alpha in &alphas {
            cumprod *= alpha;
            alphas_cumprod.push(cumprod as f32);
        }

        Ok(Self {
            betas: betas.into_iter().map(|b| b as f32).collect(),
            alphas: alphas.into_iter().map(|a| a as f32).collect(),
            alphas_cumprod,
            train_timesteps: n,
        })
    }

    pub fn train_timesteps(&self) -> usize {
        self.train_timesteps
    }

    fn clamp_index(&self, timestep: i64) -> usize {
        (timestep.max(0) as usize).min(self.train_timesteps - 1)
    }

    pub fn beta(&self, timestep: i64) -> f32 {
        self.betas[self.clamp_index(timestep)]
    }

    pub fn alpha(&self, timestep: i64) -> f32 {
        self.alphas[self.clamp_index(timestep)]
    }

    pub fn alpha_cumprod(&self, timestep: i64) -> f32 {
        self.alphas_cumprod[self.clamp_index(timestep)]
    }

    /// Noise magnitude in the variance-exploding view,
    /// `sigma = sqrt((1 - alpha_bar) / alpha_bar)`.
    pub fn sigma(&self, timestep: i64) -> f32 {
        let alpha_bar = self.alpha_cumprod(timestep) as f64;
        (((1.0 - alpha_bar) / alpha_bar).sqrt()) as f32
    }

    /// Full per-timestep sigma table, ascending in `t`.
    pub fn sigmas(&self) -> Vec<f32> {
        (0..self.train_timesteps as i64).map(|t| self.sigma(t)).collect()
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
        .collect()
}

/// Discretizes the Glide cosine alpha-bar curve into betas.
fn betas_for_alpha_bar(n: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar =
        |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

// ============================================================================
// Timestep selection
// ============================================================================

/// Computes the descending inference timesteps for a config.
///
/// With `original_inference_steps` set, the usable timesteps are the
/// distilled teacher schedule subsampled down to `inference_steps`.
pub fn spaced_timesteps(config: &SchedulerConfig) -> Result<Vec<i64>, SchedulerError> {
    let steps = config.inference_steps;
    let train = config.train_timesteps;
    if steps == 0 {
        return Err(SchedulerError::InvalidSchedule(
            "inference_steps must be >= 1".into(),
        ));
    }
    if steps > train {
        return Err(SchedulerError::InvalidSchedule(format!(
            "inference_steps {steps} exceeds train_timesteps {train}"
        )));
    }

    if let Some(original) = config.original_inference_steps {
        let original = original.clamp(1, train);
        let c = (train / original) as i64;
        let origin: Vec<i64> = (1..=original as i64).map(|i| i * c - 1).collect();
        let skip = (original / steps.min(original)).max(1);
        let mut timesteps: Vec<i64> = origin
            .into_iter()
            .rev()
            .step_by(skip)
            .take(steps)
            .collect();
        timesteps.sort_unstable();
        timesteps.dedup();
        timesteps.reverse();
        return Ok(timesteps);
    }

    let mut timesteps: Vec<i64> = match config.timestep_spacing {
        TimestepSpacing::Linspace => {
            if steps == 1 {
                vec![0]
            } else {
                (0..steps)
                    .map(|i| {
                        (i as f64 * (train - 1) as f64 / (steps - 1) as f64).round() as i64
                    })
                    .collect()
            }
        }
        TimestepSpacing::Leading => {
            let ratio = train / steps;
            (0..steps)
                .map(|i| (i * ratio + config.steps_offset) as i64)
                .collect()
        }
        TimestepSpacing::Trailing => {
            let ratio = train as f64 / steps as f64;
            (1..=steps)
                .map(|i| (i as f64 * ratio).round() as i64 - 1)
                .collect()
        }
    };
    timesteps.sort_unstable();
    timesteps.dedup();
    timesteps.reverse();
    Ok(timesteps)
}

// ============================================================================
// Prediction-type conversions
// ============================================================================

/// Predicted clean sample in sigma space (variance-exploding solvers).
pub(crate) fn pred_original_sigma(
    model_output: &Array4<f32>,
    sample: &Array4<f32>,
    sigma: f32,
    prediction: PredictionType,
) -> Array4<f32> {
    match prediction {
        PredictionType::Epsilon => sample - &model_output.mapv(|v| v * sigma),
        PredictionType::VPrediction => {
            let scale = -sigma / (sigma * sigma + 1.0).sqrt();
            let denom = sigma * sigma + 1.0;
            &model_output.mapv(|v| v * scale) + &sample.mapv(|v| v / denom)
        }
        PredictionType::Sample => model_output.clone(),
    }
}

/// Predicted clean sample and epsilon in alpha-bar space (DDPM/DDIM).
pub(crate) fn pred_original_alpha(
    model_output: &Array4<f32>,
    sample: &Array4<f32>,
    alpha_prod: f32,
    prediction: PredictionType,
) -> (Array4<f32>, Array4<f32>) {
    let beta_prod = 1.0 - alpha_prod;
    let sqrt_alpha = alpha_prod.sqrt();
    let sqrt_beta = beta_prod.sqrt();
    match prediction {
        PredictionType::Epsilon => {
            let original = (sample - &model_output.mapv(|v| v * sqrt_beta)).mapv(|v| v / sqrt_alpha);
            (original, model_output.clone())
        }
        PredictionType::VPrediction => {
            let original = &sample.mapv(|v| v * sqrt_alpha) - &model_output.mapv(|v| v * sqrt_beta);
            let epsilon = &model_output.mapv(|v| v * sqrt_alpha) + &sample.mapv(|v| v * sqrt_beta);
            (original, epsilon)
        }
        PredictionType::Sample => {
            let epsilon =
                (sample - &model_output.mapv(|v| v * sqrt_alpha)).mapv(|v| v / sqrt_beta);
            (model_output.clone(), epsilon)
        }
    }
}

/// Ancestral step split of a sigma transition into a deterministic target
/// and a noise re-injection level.
pub(crate) fn ancestral_step(sigma: f32, sigma_next: f32) -> (f32, f32) {
    if sigma_next == 0.0 {
        return (0.0, 0.0);
    }
    let sigma_up = (sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2))
        .max(0.0)
        .sqrt()
        .min(sigma_next);
    let sigma_down = (sigma_next.powi(2) - sigma_up.powi(2)).max(0.0).sqrt();
    (sigma_down, sigma_up)
}

/// Draws a unit gaussian tensor from a seeded generator.
pub(crate) fn sample_normal(rng: &mut StdRng, shape: [usize; 4]) -> Array4<f32> {
    Array4::from_shape_simple_fn((shape[0], shape[1], shape[2], shape[3]), || {
        rng.sample::<f32, _>(StandardNormal)
    })
}

pub(crate) fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

// ============================================================================
// Scheduler contract
// ============================================================================

/// Result of one reverse-diffusion step.
pub struct StepOutput {
    /// `x_{t-1}`; the next loop input.
    pub prev_sample: Array4<f32>,
    /// Predicted `x_0`, when the solver computes one. Usable for previews.
    pub pred_original_sample: Option<Array4<f32>>,
}

/// Common capability set of the solver family.
///
/// A scheduler is created per generation, mutated by `step`, and dropped
/// when the generation ends; the derivative/midpoint state inside the
/// multistep solvers never outlives a run.
pub trait Scheduler: Send {
    /// Ordered descending timestep sequence.
    fn timesteps(&self) -> &[i64];

    /// Noise magnitude of the initial random latent.
    fn init_noise_sigma(&self) -> f32;

    /// Scales the model input to the variance the UNet was trained on.
    fn scale_model_input(&mut self, sample: Array4<f32>, timestep: i64) -> Array4<f32>;

    /// Propagates the latent one step back along the reverse process.
    fn step(
        &mut self,
        model_output: &Array4<f32>,
        timestep: i64,
        sample: &Array4<f32>,
    ) -> Result<StepOutput, SchedulerError>;

    /// Noises a clean latent to the given timestep (image-to-image entry).
    fn add_noise(
        &mut self,
        original: &Array4<f32>,
        noise: &Array4<f32>,
        timestep: i64,
    ) -> Array4<f32>;

    /// Draws a unit gaussian latent from the scheduler's seeded generator.
    fn sample_noise(&mut self, shape: [usize; 4]) -> Array4<f32>;

    /// Recomputes the timestep schedule for a new step count, resetting
    /// any multistep state.
    fn set_timesteps(&mut self, inference_steps: usize) -> Result<(), SchedulerError>;

    /// Seeded random latent scaled to a given sigma.
    fn create_random_sample(&mut self, shape: [usize; 4], sigma: f32) -> Array4<f32> {
        let noise = self.sample_noise(shape);
        noise.mapv(|v| v * sigma)
    }
}

/// Solver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Lms,
    Euler,
    EulerAncestral,
    Ddpm,
    Ddim,
    Kdpm2,
}

impl SchedulerKind {
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerKind::Lms => "lms",
            SchedulerKind::Euler => "euler",
            SchedulerKind::EulerAncestral => "euler_ancestral",
            SchedulerKind::Ddpm => "ddpm",
            SchedulerKind::Ddim => "ddim",
            SchedulerKind::Kdpm2 => "kdpm2",
        }
    }

    /// Builds a fresh solver for one generation.
    pub fn create(&self, config: &SchedulerConfig) -> Result<Box<dyn Scheduler>, SchedulerError> {
        Ok(match self {
            SchedulerKind::Lms => Box::new(crate::lms::LmsScheduler::new(config.clone())?),
            SchedulerKind::Euler => Box::new(crate::euler::EulerScheduler::new(config.clone())?),
            SchedulerKind::EulerAncestral => {
                Box::new(crate::euler::EulerAncestralScheduler::new(config.clone())?)
            }
            SchedulerKind::Ddpm => Box::new(crate::ddpm::DdpmScheduler::new(config.clone())?),
            SchedulerKind::Ddim => Box::new(crate::ddim::DdimScheduler::new(config.clone())?),
            SchedulerKind::Kdpm2 => Box::new(crate::kdpm2::Kdpm2Scheduler::new(config.clone())?),
        })
    }
}
