//! Stable Cascade pipeline shell
//!
//! Two-phase generation: a prior UNet produces highly compressed semantic
//! latents from pooled + sequence text embeddings, then a decoder UNet
//! expands them into VQGAN latents which decode to pixels.

use std::sync::Mutex;

use ndarray::{concatenate, Array2, Array3, Array4, Axis, Ix4};
use rand::Rng;
use tracing::{debug, info};

use onnx_image_clip::{PromptEmbeddings, PromptEncoder, TokenizerModel};
use onnx_image_core::{
    tensor, DiffusionError, InferenceParameters, OnnxModel, Result,
};
use onnx_image_schedulers::{Scheduler, SchedulerKind};

use crate::diffusers::apply_guidance;
use crate::model_set::{ModelConfig, StableDiffusionModelSet};
use crate::options::{DiffuserType, PromptOptions, SchedulerOptions};
use crate::pipelines::{DiffusionPipeline, GenerationResult, PipelineKind};
use crate::progress::RunContext;

/// Channel count of the prior's semantic latents.
const PRIOR_CHANNELS: usize = 16;

/// Spatial compression of the prior latents. Hand-chosen constant of the
/// exported models; keep exactly.
const PRIOR_COMPRESSION: f32 = 42.67;

/// Channel count and spatial compression of the decoder-phase latents.
const DECODER_CHANNELS: usize = 4;
const DECODER_COMPRESSION: usize = 4;

/// The decoder phase always runs a short guidance-free refinement.
const DECODER_STEPS: usize = 10;

/// Width of the CLIP image-embedding slot the prior expects; filled with
/// zeros for pure text conditioning.
const IMAGE_EMBED_DIM: usize = 768;

const CASCADE_SCHEDULERS: [SchedulerKind; 1] = [SchedulerKind::Ddpm];

pub struct StableCascadePipeline {
    set: StableDiffusionModelSet,
    tokenizer: TokenizerModel,
    text_encoder: OnnxModel,
    prior_unet: OnnxModel,
    decoder_unet: OnnxModel,
    vqgan: OnnxModel,
    run_lock: Mutex<()>,
}

fn submodel(name: &str, config: &ModelConfig) -> OnnxModel {
    OnnxModel::new(name, &config.path, config.session.clone())
}

impl StableCascadePipeline {
    pub fn new(set: StableDiffusionModelSet) -> Result<Self> {
        let decoder = set.unet_2.as_ref().ok_or_else(|| {
            DiffusionError::InvalidOptions("stable_cascade requires a decoder UNet (unet_2)".into())
        })?;
        Ok(Self {
            tokenizer: TokenizerModel::new(&set.tokenizer, set.tokenizer_limit, set.pad_token_id),
            text_encoder: submodel("text_encoder", &set.text_encoder),
            prior_unet: submodel("prior_unet", &set.unet),
            decoder_unet: submodel("decoder_unet", decoder),
            vqgan: submodel("vqgan", &set.vae_decoder),
            run_lock: Mutex::new(()),
            set,
        })
    }

    fn prior_latent_shape(&self, options: &SchedulerOptions) -> [usize; 4] {
        [
            1,
            PRIOR_CHANNELS,
            (options.height as f32 / PRIOR_COMPRESSION).ceil() as usize,
            (options.width as f32 / PRIOR_COMPRESSION).ceil() as usize,
        ]
    }

    /// Pooled text vectors stacked for guidance, shaped `[B, 1, D]`.
    fn pooled_batch(embeddings: &PromptEmbeddings, guidance: bool) -> Result<Array3<f32>> {
        let positive = embeddings.pooled_prompt_embeds.as_ref().ok_or_else(|| {
            DiffusionError::InvalidOptions(
                "stable_cascade requires a text encoder with pooled output".into(),
            )
        })?;
        let pooled: Array2<f32> = if guidance {
            let negative = embeddings.negative_pooled.as_ref().ok_or_else(|| {
                DiffusionError::InvalidOptions("missing negative pooled embedding".into())
            })?;
            concatenate(Axis(0), &[negative.view(), positive.view()])
                .map_err(|_| DiffusionError::shape(positive.shape(), negative.shape()))?
        } else {
            positive.clone()
        };
        let (batch, dim) = pooled.dim();
        pooled
            .into_shape_with_order((batch, 1, dim))
            .map_err(|_| DiffusionError::shape(&[batch, 1, dim], &[batch, dim]))
    }

    /// Prior phase: denoise the semantic latents under guidance.
    fn run_prior(
        &self,
        embeddings: &PromptEmbeddings,
        options: &SchedulerOptions,
        ctx: &RunContext,
        total: usize,
    ) -> Result<Array4<f32>> {
        let guidance = options.guidance_enabled();
        let mut scheduler = SchedulerKind::Ddpm
            .create(&options.to_scheduler_config())
            .map_err(|e| DiffusionError::UnsupportedScheduler(e.to_string()))?;
        let pooled = Self::pooled_batch(embeddings, guidance)?;
        let batch = pooled.dim().0;
        let image_embeds = Array3::<f32>::zeros((batch, 1, IMAGE_EMBED_DIM));

        let mut latents = {
            let sigma = scheduler.init_noise_sigma();
            scheduler.create_random_sample(self.prior_latent_shape(options), sigma)
        };
        let timesteps = scheduler.timesteps().to_vec();

        for (step, &timestep) in timesteps.iter().enumerate() {
            ctx.cancellation.check()?;
            let input = if guidance {
                tensor::repeat(&latents, 2)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep);

            let mut params = InferenceParameters::new();
            params.push(input);
            params.push_timestep(timestep as f32);
            params.push(pooled.clone());
            params.push(embeddings.prompt_embeds.clone());
            params.push(image_embeds.clone());

            let mut outputs = self.prior_unet.run(params)?;
            if outputs.is_empty() {
                return Err(DiffusionError::InferenceFailed(
                    "prior UNet produced no outputs".into(),
                ));
            }
            let raw = outputs.swap_remove(0);
            let raw_shape = raw.shape().to_vec();
            let noise_pred = raw
                .into_dimensionality::<Ix4>()
                .map_err(|_| DiffusionError::shape(&self.prior_latent_shape(options), &raw_shape))?;
            let noise_pred = if guidance {
                apply_guidance(noise_pred, options.guidance_scale)?
            } else {
                noise_pred
            };

            latents = scheduler
                .step(&noise_pred, timestep, &latents)
                .map_err(|e| DiffusionError::InferenceFailed(e.to_string()))?
                .prev_sample;
            ctx.report(step + 1, total, &latents);
        }
        Ok(latents)
    }

    /// Decoder phase: guidance-free refinement seeded by the prior
    /// latents, then VQGAN decode.
    fn run_decoder(
        &self,
        prior_latents: &Array4<f32>,
        embeddings: &PromptEmbeddings,
        options: &SchedulerOptions,
        ctx: &RunContext,
        progress_offset: usize,
        total: usize,
    ) -> Result<Array4<f32>> {
        let decoder_options = SchedulerOptions {
            inference_steps: DECODER_STEPS,
            guidance_scale: 0.0,
            ..options.clone()
        };
        let mut scheduler = SchedulerKind::Ddpm
            .create(&decoder_options.to_scheduler_config())
            .map_err(|e| DiffusionError::UnsupportedScheduler(e.to_string()))?;

        // Guidance is off in this phase: single-batch pooled conditioning,
        // and the prior latents ride alongside a zero-filled companion
        // batch in the decoder's conditioning slot.
        let pooled = Self::pooled_batch(embeddings, false)?;
        let effnet = tensor::concat_batch(prior_latents, &Array4::zeros(prior_latents.dim()))?;
        let shape = [
            1,
            DECODER_CHANNELS,
            options.height / DECODER_COMPRESSION,
            options.width / DECODER_COMPRESSION,
        ];
        let mut latents = {
            let sigma = scheduler.init_noise_sigma();
            scheduler.create_random_sample(shape, sigma)
        };
        let timesteps = scheduler.timesteps().to_vec();

        for (step, &timestep) in timesteps.iter().enumerate() {
            ctx.cancellation.check()?;
            let input = scheduler.scale_model_input(latents.clone(), timestep);

            let mut params = InferenceParameters::new();
            params.push(input);
            params.push_timestep(timestep as f32);
            params.push(pooled.clone());
            params.push(effnet.clone());

            let mut outputs = self.decoder_unet.run(params)?;
            if outputs.is_empty() {
                return Err(DiffusionError::InferenceFailed(
                    "decoder UNet produced no outputs".into(),
                ));
            }
            let raw = outputs.swap_remove(0);
            let raw_shape = raw.shape().to_vec();
            let noise_pred = raw
                .into_dimensionality::<Ix4>()
                .map_err(|_| DiffusionError::shape(&shape, &raw_shape))?;

            latents = scheduler
                .step(&noise_pred, timestep, &latents)
                .map_err(|e| DiffusionError::InferenceFailed(e.to_string()))?
                .prev_sample;
            ctx.report(progress_offset + step + 1, total, &latents);
        }

        ctx.cancellation.check()?;
        let scaled = latents.mapv(|v| v / self.set.scale_factor);
        let mut params = InferenceParameters::new();
        params.push(scaled);
        params.push_output_hint(Some(vec![1, 3, options.height, options.width]));
        let mut outputs = self.vqgan.run(params)?;
        if outputs.is_empty() {
            return Err(DiffusionError::InferenceFailed("VQGAN produced no outputs".into()));
        }
        let raw = outputs.swap_remove(0);
        let raw_shape = raw.shape().to_vec();
        let image = raw
            .into_dimensionality::<Ix4>()
            .map_err(|_| DiffusionError::shape(&[1, 3, options.height, options.width], &raw_shape))?;
        Ok(tensor::normalize_minus_one_to_one(&image))
    }

    fn unload_all(&self) {
        self.tokenizer.unload();
        self.text_encoder.unload();
        self.prior_unet.unload();
        self.decoder_unet.unload();
        self.vqgan.unload();
    }

    fn run_locked(
        &self,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        ctx: &RunContext,
    ) -> Result<Array4<f32>> {
        self.tokenizer.load()?;
        self.text_encoder.load()?;
        self.prior_unet.load()?;
        self.decoder_unet.load()?;
        self.vqgan.load()?;

        let encoder = PromptEncoder::new(&self.tokenizer, &self.text_encoder, None);
        let embeddings = encoder.encode(
            &prompt.prompt,
            &prompt.negative_prompt,
            options.guidance_enabled(),
        )?;
        if self.set.memory_mode.unload_eagerly() {
            self.tokenizer.unload();
            self.text_encoder.unload();
        }

        let total = options.inference_steps + DECODER_STEPS;
        let prior_latents = self.run_prior(&embeddings, options, ctx, total)?;
        debug!(shape = ?prior_latents.shape(), "prior phase complete");
        if self.set.memory_mode.unload_eagerly() {
            self.prior_unet.unload();
        }

        let image = self.run_decoder(
            &prior_latents,
            &embeddings,
            options,
            ctx,
            options.inference_steps,
            total,
        )?;
        if self.set.memory_mode.unload_eagerly() {
            self.decoder_unet.unload();
            self.vqgan.unload();
        }
        Ok(image)
    }
}

impl DiffusionPipeline for StableCascadePipeline {
    fn name(&self) -> &str {
        &self.set.name
    }

    fn kind(&self) -> PipelineKind {
        PipelineKind::StableCascade
    }

    fn supported_diffusers(&self) -> &[DiffuserType] {
        &self.set.supported_diffusers
    }

    fn supported_schedulers(&self) -> &[SchedulerKind] {
        &CASCADE_SCHEDULERS
    }

    fn load(&self) -> Result<()> {
        self.tokenizer.load()?;
        self.text_encoder.load()?;
        self.prior_unet.load()?;
        self.decoder_unet.load()?;
        self.vqgan.load()?;
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
        if prompt.diffuser_type != DiffuserType::TextToImage
            || !self.supported_diffusers().contains(&prompt.diffuser_type)
        {
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
        let mut options = options.clone();
        if options.seed == 0 {
            options.seed = rand::thread_rng().gen_range(1..u64::MAX);
        }
        info!(
            pipeline = %self.set.name,
            steps = options.inference_steps,
            seed = options.seed,
            "cascade generation started"
        );

        let result = self.run_locked(prompt, &options, ctx);
        if self.set.memory_mode.unload_eagerly() {
            self.unload_all();
        }
        result.map(|pixels| GenerationResult { pixels, options })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cascade_set() -> StableDiffusionModelSet {
        let mut set = StableDiffusionModelSet::stable_diffusion("cascade", "/models/cascade");
        set.pipeline = PipelineKind::StableCascade;
        set.supported_diffusers = vec![DiffuserType::TextToImage];
        set.vae_encoder = None;
        set.unet_2 = Some(ModelConfig::new("/models/cascade/decoder/model.onnx"));
        set
    }

    #[test]
    fn test_requires_decoder_unet() {
        let mut set = cascade_set();
        set.unet_2 = None;
        assert!(StableCascadePipeline::new(set).is_err());
    }

    #[test]
    fn test_prior_latent_shape_uses_compression_constant() {
        let pipeline = StableCascadePipeline::new(cascade_set()).unwrap();
        let options = SchedulerOptions {
            height: 1024,
            width: 1024,
            ..Default::default()
        };
        // ceil(1024 / 42.67) = 24
        assert_eq!(pipeline.prior_latent_shape(&options), [1, 16, 24, 24]);

        let options = SchedulerOptions {
            height: 512,
            width: 768,
            ..Default::default()
        };
        // ceil(512 / 42.67) = 12, ceil(768 / 42.67) = 18
        assert_eq!(pipeline.prior_latent_shape(&options), [1, 16, 12, 18]);
    }

    #[test]
    fn test_only_ddpm_supported() {
        let pipeline = StableCascadePipeline::new(cascade_set()).unwrap();
        let options = SchedulerOptions {
            scheduler_type: SchedulerKind::Lms,
            ..Default::default()
        };
        let err = pipeline
            .run(&PromptOptions::text("a castle"), &options, &RunContext::new())
            .unwrap_err();
        assert!(matches!(err, DiffusionError::UnsupportedScheduler(_)));
    }

    #[test]
    fn test_image_diffusers_rejected() {
        let pipeline = StableCascadePipeline::new(cascade_set()).unwrap();
        let prompt = PromptOptions {
            diffuser_type: DiffuserType::ImageToImage,
            input_image: Some(crate::input_image::InputImage::Tensor(Array4::zeros((
                1, 3, 512, 512,
            )))),
            ..PromptOptions::text("a castle")
        };
        let options = SchedulerOptions {
            scheduler_type: SchedulerKind::Ddpm,
            ..Default::default()
        };
        let err = pipeline.run(&prompt, &options, &RunContext::new()).unwrap_err();
        assert!(matches!(err, DiffusionError::UnsupportedDiffuser(_)));
    }

    #[test]
    fn test_pooled_batch_requires_pooled_embeddings() {
        let embeddings = PromptEmbeddings {
            prompt_embeds: Array3::zeros((1, 77, 1280)),
            pooled_prompt_embeds: None,
            negative_pooled: None,
        };
        assert!(StableCascadePipeline::pooled_batch(&embeddings, false).is_err());

        let embeddings = PromptEmbeddings {
            prompt_embeds: Array3::zeros((2, 77, 1280)),
            pooled_prompt_embeds: Some(Array2::zeros((1, 1280))),
            negative_pooled: Some(Array2::zeros((1, 1280))),
        };
        let pooled = StableCascadePipeline::pooled_batch(&embeddings, true).unwrap();
        assert_eq!(pooled.dim(), (2, 1, 1280));
    }
}
