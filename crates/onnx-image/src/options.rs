//! Generation option types
//!
//! Options are immutable value types: batch expansion and seed
//! randomization construct fresh copies with one field replaced rather
//! than mutating shared state.

use serde::{Deserialize, Serialize};

use onnx_image_core::{DiffusionError, Result};
use onnx_image_schedulers::{
    BetaSchedule, PredictionType, SchedulerConfig, SchedulerKind, TimestepSpacing,
};

use crate::input_image::InputImage;
use crate::video::VideoInput;

/// The per-task latent loop a generation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffuserType {
    #[default]
    TextToImage,
    ImageToImage,
    ImageInpaint,
    ImageInpaintLegacy,
    ControlNet,
    ControlNetImage,
    VideoToVideo,
}

impl DiffuserType {
    pub fn name(&self) -> &'static str {
        match self {
            DiffuserType::TextToImage => "text_to_image",
            DiffuserType::ImageToImage => "image_to_image",
            DiffuserType::ImageInpaint => "image_inpaint",
            DiffuserType::ImageInpaintLegacy => "image_inpaint_legacy",
            DiffuserType::ControlNet => "controlnet",
            DiffuserType::ControlNetImage => "controlnet_image",
            DiffuserType::VideoToVideo => "video_to_video",
        }
    }

    /// Whether this loop denoises from an input image.
    pub fn needs_image(&self) -> bool {
        matches!(
            self,
            DiffuserType::ImageToImage
                | DiffuserType::ImageInpaint
                | DiffuserType::ImageInpaintLegacy
                | DiffuserType::ControlNetImage
        )
    }

    pub fn needs_control_image(&self) -> bool {
        matches!(self, DiffuserType::ControlNet | DiffuserType::ControlNetImage)
    }
}

/// User intent for one generation.
#[derive(Clone, Default)]
pub struct PromptOptions {
    pub prompt: String,
    pub negative_prompt: String,
    pub diffuser_type: DiffuserType,
    pub input_image: Option<InputImage>,
    pub input_mask: Option<InputImage>,
    pub input_control_image: Option<InputImage>,
    pub input_video: Option<VideoInput>,
}

impl PromptOptions {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Checks that the inputs the chosen diffuser needs are present.
    pub fn validate(&self) -> Result<()> {
        if self.diffuser_type.needs_image() && self.input_image.is_none() {
            return Err(DiffusionError::InvalidOptions(format!(
                "{} requires an input image",
                self.diffuser_type.name()
            )));
        }
        if self.diffuser_type.needs_control_image() && self.input_control_image.is_none() {
            return Err(DiffusionError::InvalidOptions(format!(
                "{} requires a control image",
                self.diffuser_type.name()
            )));
        }
        if matches!(
            self.diffuser_type,
            DiffuserType::ImageInpaint | DiffuserType::ImageInpaintLegacy
        ) && self.input_mask.is_none()
        {
            return Err(DiffusionError::InvalidOptions(
                "inpainting requires a mask".into(),
            ));
        }
        if self.diffuser_type == DiffuserType::VideoToVideo && self.input_video.is_none() {
            return Err(DiffusionError::InvalidOptions(
                "video_to_video requires an input video".into(),
            ));
        }
        Ok(())
    }
}

/// Numeric recipe for one generation. Replaced as a whole on updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// 0 picks a random seed when the run starts; the replacement is
    /// recorded in the returned options.
    pub seed: u64,
    pub inference_steps: usize,
    /// Values above 1 enable classifier-free guidance.
    pub guidance_scale: f32,
    /// Image-to-image noise level in (0, 1].
    pub strength: f32,
    pub height: usize,
    pub width: usize,
    pub scheduler_type: SchedulerKind,
    pub train_timesteps: usize,
    pub beta_start: f32,
    pub beta_end: f32,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    pub timestep_spacing: TimestepSpacing,
    pub steps_offset: usize,
    pub clip_sample: bool,
    /// ControlNet hint weight.
    pub conditioning_scale: f32,
    pub original_inference_steps: Option<usize>,
    pub trained_betas: Option<Vec<f32>>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            inference_steps: 30,
            guidance_scale: 7.5,
            strength: 0.75,
            height: 512,
            width: 512,
            scheduler_type: SchedulerKind::Lms,
            train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            timestep_spacing: TimestepSpacing::Linspace,
            steps_offset: 0,
            clip_sample: false,
            conditioning_scale: 1.0,
            original_inference_steps: None,
            trained_betas: None,
        }
    }
}

impl SchedulerOptions {
    pub fn guidance_enabled(&self) -> bool {
        self.guidance_scale > 1.0
    }

    pub fn validate(&self) -> Result<()> {
        if self.inference_steps == 0 {
            return Err(DiffusionError::InvalidOptions(
                "inference_steps must be >= 1".into(),
            ));
        }
        if self.height == 0 || self.width == 0 || self.height % 8 != 0 || self.width % 8 != 0 {
            return Err(DiffusionError::InvalidOptions(format!(
                "dimensions must be non-zero multiples of 8, got {}x{}",
                self.width, self.height
            )));
        }
        if !(self.strength > 0.0 && self.strength <= 1.0) {
            return Err(DiffusionError::InvalidOptions(format!(
                "strength must be in (0, 1], got {}",
                self.strength
            )));
        }
        Ok(())
    }

    /// Copy with the seed replaced; used when seed 0 is randomized.
    pub fn with_seed(&self, seed: u64) -> Self {
        Self {
            seed,
            ..self.clone()
        }
    }

    /// Numeric subset handed to the solver family.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            train_timesteps: self.train_timesteps,
            inference_steps: self.inference_steps,
            original_inference_steps: self.original_inference_steps,
            beta_start: self.beta_start,
            beta_end: self.beta_end,
            beta_schedule: self.beta_schedule,
            trained_betas: self.trained_betas.clone(),
            prediction_type: self.prediction_type,
            timestep_spacing: self.timestep_spacing,
            steps_offset: self.steps_offset,
            clip_sample: self.clip_sample,
            clip_sample_range: 1.0,
            seed: self.seed,
        }
    }
}

/// The axis a batch run enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Seed,
    Step,
    Guidance,
    Strength,
}

/// One-axis expansion of a base [`SchedulerOptions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    pub batch_type: BatchType,
    /// Number of entries for the Seed axis; other axes derive their count
    /// from the range.
    pub count: usize,
    pub value_from: f32,
    pub value_to: f32,
    pub increment: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_options_defaults() {
        let options = SchedulerOptions::default();
        assert_eq!(options.inference_steps, 30);
        assert_eq!(options.guidance_scale, 7.5);
        assert!(options.guidance_enabled());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_guidance_disabled_at_or_below_one() {
        let options = SchedulerOptions {
            guidance_scale: 1.0,
            ..Default::default()
        };
        assert!(!options.guidance_enabled());
    }

    #[test]
    fn test_dimensions_must_be_multiple_of_eight() {
        let options = SchedulerOptions {
            height: 500,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(DiffusionError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_strength_bounds() {
        let zero = SchedulerOptions {
            strength: 0.0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        let full = SchedulerOptions {
            strength: 1.0,
            ..Default::default()
        };
        assert!(full.validate().is_ok());
    }

    #[test]
    fn test_prompt_options_validation() {
        let missing = PromptOptions {
            diffuser_type: DiffuserType::ImageToImage,
            ..Default::default()
        };
        assert!(missing.validate().is_err());

        let text = PromptOptions::text("a cat");
        assert!(text.validate().is_ok());
    }

    #[test]
    fn test_controlnet_requires_hint() {
        let missing = PromptOptions {
            diffuser_type: DiffuserType::ControlNet,
            ..Default::default()
        };
        assert!(matches!(
            missing.validate(),
            Err(DiffusionError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_options_roundtrip_through_json() {
        let options = SchedulerOptions::default();
        let json = serde_json::to_string(&options).unwrap();
        let back: SchedulerOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.inference_steps, options.inference_steps);
        assert_eq!(back.scheduler_type, options.scheduler_type);
    }
}
