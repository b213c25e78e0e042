//! Pipeline shells
//!
//! A pipeline ties one model set to its diffusers and schedulers: it
//! loads and unloads the sub-models as a set, validates requests against
//! what the set supports, resolves the concrete diffuser, and drives
//! single runs, batches, and the async façade.

mod stable_cascade;
mod stable_diffusion;

pub use stable_cascade::StableCascadePipeline;
pub use stable_diffusion::StableDiffusionPipeline;

use std::sync::Arc;

use ndarray::Array4;
use serde::{Deserialize, Serialize};

use onnx_image_core::{DiffusionError, Result};
use onnx_image_schedulers::SchedulerKind;

use crate::model_set::StableDiffusionModelSet;
use crate::options::{BatchOptions, DiffuserType, PromptOptions, SchedulerOptions};
use crate::progress::RunContext;

/// Pipeline families a model set can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    #[default]
    StableDiffusion,
    /// Rectified-flow distillation; single-step text-to-image.
    InstaFlow,
    /// Consistency distillation; guidance is baked into the UNet.
    LatentConsistency,
    /// Two-stage prior/decoder cascade.
    StableCascade,
}

impl PipelineKind {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineKind::StableDiffusion => "stable_diffusion",
            PipelineKind::InstaFlow => "instaflow",
            PipelineKind::LatentConsistency => "latent_consistency",
            PipelineKind::StableCascade => "stable_cascade",
        }
    }
}

/// One finished generation: the pixel tensor plus the exact options used,
/// including any randomized seed.
pub struct GenerationResult {
    /// `[N, 3, H, W]` pixels in [0, 1]; `N` is 1 except for video runs.
    pub pixels: Array4<f32>,
    pub options: SchedulerOptions,
}

/// Capability set of every pipeline shell.
pub trait DiffusionPipeline: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PipelineKind;

    fn supported_diffusers(&self) -> &[DiffuserType];

    fn supported_schedulers(&self) -> &[SchedulerKind];

    /// Loads every sub-model the set declares, as an atomic set.
    fn load(&self) -> Result<()>;

    /// Drops every loaded session. Metadata stays cached.
    fn unload(&self) -> Result<()>;

    /// Runs one generation. Generations on a shared pipeline are
    /// serialized internally.
    fn run(
        &self,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        ctx: &RunContext,
    ) -> Result<GenerationResult>;

    /// Lazily runs one generation per batch entry, in batch order. The
    /// first error ends the stream; callers resume by submitting the
    /// remaining configurations themselves.
    fn run_batch<'a>(
        &'a self,
        prompt: &'a PromptOptions,
        options: &SchedulerOptions,
        batch: &BatchOptions,
        ctx: &'a RunContext,
    ) -> Box<dyn Iterator<Item = Result<GenerationResult>> + 'a> {
        let configs = crate::batch::expand(options, batch);
        let mut failed = false;
        Box::new(
            configs
                .into_iter()
                .enumerate()
                .filter_map(move |(index, config)| {
                    if failed {
                        return None;
                    }
                    let result = self.run(prompt, &config, &ctx.with_batch_index(index));
                    if result.is_err() {
                        failed = true;
                    }
                    Some(result)
                }),
        )
    }
}

/// Builds the pipeline declared by the model set.
pub fn create_pipeline(set: StableDiffusionModelSet) -> Result<Box<dyn DiffusionPipeline>> {
    Ok(match set.pipeline {
        PipelineKind::StableCascade => Box::new(StableCascadePipeline::new(set)?),
        _ => Box::new(StableDiffusionPipeline::new(set)?),
    })
}

/// Async façade over [`DiffusionPipeline::run`]; the blocking driver runs
/// on the runtime's blocking pool.
pub async fn run_async(
    pipeline: Arc<dyn DiffusionPipeline>,
    prompt: PromptOptions,
    options: SchedulerOptions,
    ctx: RunContext,
) -> Result<GenerationResult> {
    tokio::task::spawn_blocking(move || pipeline.run(&prompt, &options, &ctx))
        .await
        .map_err(|e| DiffusionError::InferenceFailed(format!("generation task failed: {e}")))?
}
