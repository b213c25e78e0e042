//! Stable Diffusion pipeline shell
//!
//! Also backs the InstaFlow and LatentConsistency families, which share
//! the sub-model layout and differ in diffuser selection and option
//! resolution.

use std::sync::Mutex;

use ndarray::Array4;
use rand::Rng;
use tracing::{debug, info};

use onnx_image_clip::{PromptEncoder, TokenizerModel};
use onnx_image_core::{DiffusionError, OnnxModel, Result};
use onnx_image_schedulers::SchedulerKind;

use crate::diffusers::{
    decode_latents, run_loop, ControlNetDiffuser, ControlNetImageDiffuser, Diffuser,
    DiffuserModels, ImageInpaintDiffuser, ImageInpaintLegacyDiffuser, ImageToImageDiffuser,
    InstaFlowTextDiffuser, TextToImageDiffuser,
};
use crate::input_image::InputImage;
use crate::memory::MemoryMode;
use crate::model_set::{ModelConfig, StableDiffusionModelSet};
use crate::options::{DiffuserType, PromptOptions, SchedulerOptions};
use crate::pipelines::{DiffusionPipeline, GenerationResult, PipelineKind};
use crate::progress::RunContext;
use crate::video;

const ALL_SCHEDULERS: [SchedulerKind; 6] = [
    SchedulerKind::Lms,
    SchedulerKind::Euler,
    SchedulerKind::EulerAncestral,
    SchedulerKind::Ddpm,
    SchedulerKind::Ddim,
    SchedulerKind::Kdpm2,
];

/// Teacher-schedule length assumed for consistency models that do not
/// specify one.
const DEFAULT_ORIGIN_STEPS: usize = 50;

pub struct StableDiffusionPipeline {
    set: StableDiffusionModelSet,
    tokenizer: TokenizerModel,
    text_encoder: OnnxModel,
    text_encoder_2: Option<OnnxModel>,
    unet: OnnxModel,
    vae_encoder: Option<OnnxModel>,
    vae_decoder: OnnxModel,
    controlnet: Option<OnnxModel>,
    /// One generation at a time on a shared model set.
    run_lock: Mutex<()>,
}

fn submodel(name: &str, config: &ModelConfig) -> OnnxModel {
    OnnxModel::new(name, &config.path, config.session.clone())
}

impl StableDiffusionPipeline {
    pub fn new(set: StableDiffusionModelSet) -> Result<Self> {
        set.validate()?;
        Ok(Self {
            tokenizer: TokenizerModel::new(&set.tokenizer, set.tokenizer_limit, set.pad_token_id),
            text_encoder: submodel("text_encoder", &set.text_encoder),
            text_encoder_2: set.text_encoder_2.as_ref().map(|c| submodel("text_encoder_2", c)),
            unet: submodel("unet", &set.unet),
            vae_encoder: set.vae_encoder.as_ref().map(|c| submodel("vae_encoder", c)),
            vae_decoder: submodel("vae_decoder", &set.vae_decoder),
            controlnet: set.controlnet.as_ref().map(|c| submodel("controlnet", c)),
            run_lock: Mutex::new(()),
            set,
        })
    }

    fn models(&self, memory_mode: MemoryMode) -> DiffuserModels<'_> {
        DiffuserModels {
            unet: &self.unet,
            controlnet: self.controlnet.as_ref(),
            vae_encoder: self.vae_encoder.as_ref(),
            vae_decoder: &self.vae_decoder,
            scale_factor: self.set.scale_factor,
            latent_channels: self.set.latent_channels,
            memory_mode,
        }
    }

    /// Diffuser resolution per pipeline family.
    fn make_diffuser(&self, diffuser_type: DiffuserType) -> Result<Box<dyn Diffuser>> {
        let unsupported = || {
            DiffusionError::UnsupportedDiffuser(format!(
                "{} does not support {}",
                self.kind().name(),
                diffuser_type.name()
            ))
        };
        Ok(match self.set.pipeline {
            PipelineKind::InstaFlow => match diffuser_type {
                DiffuserType::TextToImage => Box::new(InstaFlowTextDiffuser),
                _ => return Err(unsupported()),
            },
            PipelineKind::LatentConsistency => match diffuser_type {
                DiffuserType::TextToImage => Box::new(TextToImageDiffuser),
                DiffuserType::ImageToImage => Box::<ImageToImageDiffuser>::default(),
                _ => return Err(unsupported()),
            },
            _ => match diffuser_type {
                DiffuserType::TextToImage => Box::new(TextToImageDiffuser),
                DiffuserType::ImageToImage => Box::<ImageToImageDiffuser>::default(),
                DiffuserType::ImageInpaint => Box::<ImageInpaintDiffuser>::default(),
                DiffuserType::ImageInpaintLegacy => Box::<ImageInpaintLegacyDiffuser>::default(),
                DiffuserType::ControlNet => Box::<ControlNetDiffuser>::default(),
                DiffuserType::ControlNetImage => Box::<ControlNetImageDiffuser>::default(),
                DiffuserType::VideoToVideo => return Err(unsupported()),
            },
        })
    }

    /// Seed randomization and per-family option fixups, applied to a
    /// fresh copy.
    fn resolve_options(&self, options: &SchedulerOptions) -> SchedulerOptions {
        let mut resolved = options.clone();
        if resolved.seed == 0 {
            resolved.seed = rand::thread_rng().gen_range(1..u64::MAX);
            debug!(seed = resolved.seed, "seed randomized");
        }
        if self.set.pipeline == PipelineKind::LatentConsistency {
            // The distilled UNet embeds its own guidance; classifier-free
            // doubling would feed it a batch it was never trained on.
            resolved.guidance_scale = resolved.guidance_scale.min(1.0);
            if resolved.original_inference_steps.is_none() {
                resolved.original_inference_steps = Some(DEFAULT_ORIGIN_STEPS);
            }
        }
        resolved
    }

    fn load_for(&self, diffuser_type: DiffuserType) -> Result<()> {
        self.tokenizer.load()?;
        self.text_encoder.load()?;
        if let Some(encoder) = &self.text_encoder_2 {
            encoder.load()?;
        }
        self.unet.load()?;
        self.vae_decoder.load()?;
        if diffuser_type.needs_image() || diffuser_type == DiffuserType::VideoToVideo {
            self.vae_encoder
                .as_ref()
                .ok_or_else(|| {
                    DiffusionError::InvalidOptions("model set declares no VAE encoder".into())
                })?
                .load()?;
        }
        if diffuser_type.needs_control_image() {
            self.controlnet
                .as_ref()
                .ok_or_else(|| {
                    DiffusionError::InvalidOptions("model set declares no controlnet".into())
                })?
                .load()?;
        }
        Ok(())
    }

    fn unload_all(&self) {
        self.tokenizer.unload();
        self.text_encoder.unload();
        if let Some(encoder) = &self.text_encoder_2 {
            encoder.unload();
        }
        self.unet.unload();
        if let Some(encoder) = &self.vae_encoder {
            encoder.unload();
        }
        self.vae_decoder.unload();
        if let Some(controlnet) = &self.controlnet {
            controlnet.unload();
        }
    }

    fn run_locked(
        &self,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        ctx: &RunContext,
    ) -> Result<Array4<f32>> {
        self.load_for(prompt.diffuser_type)?;

        let encoder = PromptEncoder::new(
            &self.tokenizer,
            &self.text_encoder,
            self.text_encoder_2.as_ref(),
        );
        let embeddings = encoder.encode(
            &prompt.prompt,
            &prompt.negative_prompt,
            options.guidance_enabled(),
        )?;
        if self.set.memory_mode.unload_eagerly() {
            self.tokenizer.unload();
            self.text_encoder.unload();
            if let Some(encoder) = &self.text_encoder_2 {
                encoder.unload();
            }
        }

        if prompt.diffuser_type == DiffuserType::VideoToVideo {
            let input_video = prompt
                .input_video
                .as_ref()
                .ok_or_else(|| DiffusionError::InvalidOptions("missing input video".into()))?;
            // Eager unloads are deferred to the end of the sequence so the
            // UNet survives across frames.
            let models = self.models(MemoryMode::Maximum);
            return video::diffuse_frames(input_video, options, ctx, |frame, frame_options, frame_ctx| {
                let frame_prompt = PromptOptions {
                    diffuser_type: DiffuserType::ImageToImage,
                    input_image: Some(InputImage::Tensor(frame.clone())),
                    input_video: None,
                    ..prompt.clone()
                };
                let mut diffuser = ImageToImageDiffuser;
                let latents = run_loop(
                    &mut diffuser,
                    &models,
                    &embeddings,
                    &frame_prompt,
                    frame_options,
                    frame_ctx,
                )?;
                frame_ctx.cancellation.check()?;
                decode_latents(&models, frame_options, &latents)
            });
        }

        let models = self.models(self.set.memory_mode);
        let mut diffuser = self.make_diffuser(prompt.diffuser_type)?;
        let latents = run_loop(diffuser.as_mut(), &models, &embeddings, prompt, options, ctx)?;
        ctx.cancellation.check()?;
        decode_latents(&models, options, &latents)
    }
}

impl DiffusionPipeline for StableDiffusionPipeline {
    fn name(&self) -> &str {
        &self.set.name
    }

    fn kind(&self) -> PipelineKind {
        self.set.pipeline
    }

    fn supported_diffusers(&self) -> &[DiffuserType] {
        &self.set.supported_diffusers
    }

    fn supported_schedulers(&self) -> &[SchedulerKind] {
        &ALL_SCHEDULERS
    }

    fn load(&self) -> Result<()> {
        self.tokenizer.load()?;
        self.text_encoder.load()?;
        if let Some(encoder) = &self.text_encoder_2 {
            encoder.load()?;
        }
        self.unet.load()?;
        if let Some(encoder) = &self.vae_encoder {
            encoder.load()?;
        }
        self.vae_decoder.load()?;
        if let Some(controlnet) = &self.controlnet {
            controlnet.load()?;
        }
        info!(pipeline = %self.set.name, "pipeline loaded");
        Ok(())
    }

    fn unload(&self) -> Result<()> {
        self.unload_all();
        info!(pipeline = %self.set.name, "pipeline unloaded");
        Ok(())
    }

    fn run(
        &self,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        ctx: &RunContext,
    ) -> Result<GenerationResult> {
        prompt.validate()?;
        options.validate()?;
        if !self.supported_diffusers().contains(&prompt.diffuser_type) {
            return Err(DiffusionError::UnsupportedDiffuser(
                prompt.diffuser_type.name().into(),
            ));
        }
        if !self.supported_schedulers().contains(&options.scheduler_type) {
            return Err(DiffusionError::UnsupportedScheduler(
                options.scheduler_type.name().into(),
            ));
        }

        let _guard = self
            .run_lock
            .lock()
            .map_err(|_| DiffusionError::InferenceFailed("pipeline lock poisoned".into()))?;
        let options = self.resolve_options(options);
        info!(
            pipeline = %self.set.name,
            diffuser = prompt.diffuser_type.name(),
            scheduler = options.scheduler_type.name(),
            steps = options.inference_steps,
            seed = options.seed,
            "generation started"
        );

        let result = self.run_locked(prompt, &options, ctx);
        if self.set.memory_mode.unload_eagerly() {
            // Covers the error and cancellation paths; successful runs have
            // already unloaded each sub-model after its last use.
            self.unload_all();
        }
        match result {
            Ok(pixels) => {
                info!(pipeline = %self.set.name, "generation finished");
                Ok(GenerationResult { pixels, options })
            }
            Err(err) => {
                info!(pipeline = %self.set.name, error = %err, "generation failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(kind: PipelineKind) -> StableDiffusionPipeline {
        let mut set = StableDiffusionModelSet::stable_diffusion("test", "/models/test");
        set.pipeline = kind;
        StableDiffusionPipeline::new(set).unwrap()
    }

    #[test]
    fn test_unsupported_diffuser_rejected_before_model_io() {
        let p = pipeline(PipelineKind::StableDiffusion);
        let prompt = PromptOptions {
            diffuser_type: DiffuserType::ControlNet,
            input_control_image: Some(InputImage::Tensor(Array4::zeros((1, 3, 512, 512)))),
            ..PromptOptions::text("a dog")
        };
        let err = p
            .run(&prompt, &SchedulerOptions::default(), &RunContext::new())
            .unwrap_err();
        assert!(matches!(err, DiffusionError::UnsupportedDiffuser(_)));
    }

    #[test]
    fn test_invalid_options_rejected_before_model_io() {
        let p = pipeline(PipelineKind::StableDiffusion);
        let options = SchedulerOptions {
            height: 500,
            ..Default::default()
        };
        let err = p
            .run(&PromptOptions::text("a dog"), &options, &RunContext::new())
            .unwrap_err();
        assert!(matches!(err, DiffusionError::InvalidOptions(_)));
    }

    #[test]
    fn test_seed_zero_is_randomized() {
        let p = pipeline(PipelineKind::StableDiffusion);
        let options = SchedulerOptions {
            seed: 0,
            ..Default::default()
        };
        let resolved = p.resolve_options(&options);
        assert_ne!(resolved.seed, 0);
        // A fixed seed is preserved untouched.
        let fixed = p.resolve_options(&options.with_seed(42));
        assert_eq!(fixed.seed, 42);
    }

    #[test]
    fn test_latent_consistency_forces_guidance_off() {
        let p = pipeline(PipelineKind::LatentConsistency);
        let resolved = p.resolve_options(&SchedulerOptions {
            guidance_scale: 7.5,
            seed: 1,
            ..Default::default()
        });
        assert!(!resolved.guidance_enabled());
        assert_eq!(resolved.original_inference_steps, Some(50));
    }

    #[test]
    fn test_instaflow_only_diffuses_text() {
        let p = pipeline(PipelineKind::InstaFlow);
        assert!(p.make_diffuser(DiffuserType::TextToImage).is_ok());
        assert!(p.make_diffuser(DiffuserType::ImageToImage).is_err());
    }

    #[test]
    fn test_pipeline_starts_unloaded() {
        let p = pipeline(PipelineKind::StableDiffusion);
        assert!(!p.unet.is_loaded());
        assert!(!p.text_encoder.is_loaded());
        // Unload on a fresh pipeline is a no-op, not an error.
        assert!(p.unload().is_ok());
    }
}
