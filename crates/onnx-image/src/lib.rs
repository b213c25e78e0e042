//! onnx-image: Stable Diffusion inference over ONNX Runtime
//!
//! Drives ONNX-compiled diffusion model sets end to end: prompt
//! conditioning, iterative latent denoising under a pluggable scheduler
//! family, and VAE decoding to pixel tensors. Image encoding, video frame
//! I/O and configuration loading stay with the host.
//!
//! # Example
//!
//! ```ignore
//! use onnx_image::{
//!     create_pipeline, PromptOptions, RunContext, RuntimeOptions, SchedulerOptions,
//!     StableDiffusionModelSet,
//! };
//!
//! onnx_image::init_runtime(RuntimeOptions::default())?;
//! let set = StableDiffusionModelSet::stable_diffusion("sd15", "./stable-diffusion-v1-5");
//! let pipeline = create_pipeline(set)?;
//!
//! let result = pipeline.run(
//!     &PromptOptions::text("photo of a red fox"),
//!     &SchedulerOptions::default(),
//!     &RunContext::new(),
//! )?;
//! let image = onnx_image::tensor_to_rgb_image(&result.pixels)?;
//! image.save("result.png")?;
//! ```

pub use onnx_image_core as core;
pub use onnx_image_clip as clip;
pub use onnx_image_schedulers as schedulers;

pub mod batch;
pub mod diffusers;
pub mod input_image;
pub mod memory;
pub mod model_set;
pub mod options;
pub mod pipelines;
pub mod progress;
pub mod video;

// Core runtime surface
pub use onnx_image_core::{
    init_runtime, CancellationToken, DiffusionError, ExecutionDevice, OnnxModel, Result,
    RuntimeOptions, SessionConfig,
};

// Scheduler selection
pub use onnx_image_schedulers::{
    BetaSchedule, PredictionType, Scheduler, SchedulerKind, TimestepSpacing,
};

// Prompt encoding
pub use onnx_image_clip::{PromptEmbeddings, PromptEncoder, TokenizerModel};

pub use batch::expand as expand_batch;
pub use input_image::{tensor_to_rgb_image, ImageNormalization, InputImage};
pub use memory::MemoryMode;
pub use model_set::{ModelConfig, StableDiffusionModelSet};
pub use options::{BatchOptions, BatchType, DiffuserType, PromptOptions, SchedulerOptions};
pub use pipelines::{
    create_pipeline, run_async, DiffusionPipeline, GenerationResult, PipelineKind,
    StableCascadePipeline, StableDiffusionPipeline,
};
pub use progress::{DiffusionProgress, ProgressCallback, RunContext};
pub use video::{frame_seed, FrameBlend, VideoInput, VideoSeedMode};
