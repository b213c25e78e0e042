//! Video adapter
//!
//! Runs the image diffuser once per decoded frame. Frame decoding and
//! re-encoding belong to the host's frame sequencer; the adapter only
//! sees ordered pixel tensors. Seeds are either fixed across frames or
//! jittered by one per frame, and an optional blend hook lets a host mix
//! consecutive input frames for temporal coherence.

use std::sync::Arc;

use ndarray::Array4;

use onnx_image_core::{tensor, DiffusionError, Result};

use crate::options::SchedulerOptions;
use crate::progress::RunContext;

/// Seed policy across a frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoSeedMode {
    /// Same seed for every frame.
    #[default]
    Fixed,
    /// Seed + frame index; varies detail while keeping the palette.
    Increment,
}

/// Mixes the previously diffused input frame into the next one.
pub type FrameBlend = Arc<dyn Fn(&Array4<f32>, &Array4<f32>) -> Array4<f32> + Send + Sync>;

/// An ordered frame sequence plus its replay rate.
#[derive(Clone, Default)]
pub struct VideoInput {
    /// Frames as `[1, 3, H, W]` tensors in [-1, 1], ready for the VAE
    /// encoder.
    pub frames: Vec<Array4<f32>>,
    pub frame_rate: f32,
    pub seed_mode: VideoSeedMode,
    /// Optional temporal-coherence hook applied to each frame before
    /// diffusion, receiving (previous frame, current frame).
    pub blend: Option<FrameBlend>,
}

/// Seed for one frame under the chosen policy.
pub fn frame_seed(base: u64, index: usize, mode: VideoSeedMode) -> u64 {
    match mode {
        VideoSeedMode::Fixed => base,
        VideoSeedMode::Increment => base.wrapping_add(index as u64),
    }
}

/// Drives `run_frame` over every frame in order and stacks the outputs
/// along the batch axis.
pub(crate) fn diffuse_frames<F>(
    video: &VideoInput,
    options: &SchedulerOptions,
    ctx: &RunContext,
    mut run_frame: F,
) -> Result<Array4<f32>>
where
    F: FnMut(&Array4<f32>, &SchedulerOptions, &RunContext) -> Result<Array4<f32>>,
{
    if video.frames.is_empty() {
        return Err(DiffusionError::InvalidOptions("video has no frames".into()));
    }

    let mut outputs: Vec<Array4<f32>> = Vec::with_capacity(video.frames.len());
    let mut previous: Option<Array4<f32>> = None;
    for (index, frame) in video.frames.iter().enumerate() {
        ctx.cancellation.check()?;

        let input = match (&previous, &video.blend) {
            (Some(prev), Some(blend)) => blend(prev, frame),
            _ => frame.clone(),
        };
        let frame_options = options.with_seed(frame_seed(options.seed, index, video.seed_mode));
        let frame_ctx = ctx.with_batch_index(index);
        let output = run_frame(&input, &frame_options, &frame_ctx)?;
        previous = Some(input);
        outputs.push(output);
    }

    let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
    tensor::concat_axis(0, &views)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(frames: usize, seed_mode: VideoSeedMode) -> VideoInput {
        VideoInput {
            frames: vec![Array4::zeros((1, 3, 8, 8)); frames],
            frame_rate: 24.0,
            seed_mode,
            blend: None,
        }
    }

    #[test]
    fn test_fixed_seed_repeats_across_frames() {
        assert_eq!(frame_seed(42, 0, VideoSeedMode::Fixed), 42);
        assert_eq!(frame_seed(42, 9, VideoSeedMode::Fixed), 42);
        assert_eq!(frame_seed(42, 3, VideoSeedMode::Increment), 45);
    }

    #[test]
    fn test_frames_processed_in_order_with_seeds() {
        let video = video(3, VideoSeedMode::Increment);
        let options = SchedulerOptions {
            seed: 100,
            ..Default::default()
        };
        let mut seen = Vec::new();
        let result = diffuse_frames(&video, &options, &RunContext::new(), |_, opts, ctx| {
            seen.push((opts.seed, ctx.batch_index));
            Ok(Array4::zeros((1, 3, 8, 8)))
        })
        .unwrap();
        assert_eq!(result.dim(), (3, 3, 8, 8));
        assert_eq!(
            seen,
            vec![(100, Some(0)), (101, Some(1)), (102, Some(2))]
        );
    }

    #[test]
    fn test_empty_video_rejected() {
        let video = video(0, VideoSeedMode::Fixed);
        let options = SchedulerOptions::default();
        let result = diffuse_frames(&video, &options, &RunContext::new(), |frame, _, _| {
            Ok(frame.clone())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_blend_hook_receives_previous_frame() {
        let mut video = video(2, VideoSeedMode::Fixed);
        video.frames[1] = Array4::from_elem((1, 3, 8, 8), 1.0);
        video.blend = Some(Arc::new(|prev, current| {
            (prev + current).mapv(|v| v * 0.5)
        }));
        let options = SchedulerOptions::default();
        let mut second_frame_mean = 0.0;
        diffuse_frames(&video, &options, &RunContext::new(), |frame, _, ctx| {
            if ctx.batch_index == Some(1) {
                second_frame_mean = frame.mean().unwrap_or(0.0);
            }
            Ok(frame.clone())
        })
        .unwrap();
        // Second frame was averaged with the first (all-zero) frame.
        assert!((second_frame_mean - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_cancellation_stops_frame_loop() {
        let video = video(5, VideoSeedMode::Fixed);
        let options = SchedulerOptions::default();
        let ctx = RunContext::new();
        let token = ctx.cancellation.clone();
        let mut processed = 0;
        let result = diffuse_frames(&video, &options, &ctx, |frame, _, _| {
            processed += 1;
            if processed == 2 {
                token.cancel();
            }
            Ok(frame.clone())
        });
        assert!(matches!(result, Err(DiffusionError::Cancelled)));
        assert_eq!(processed, 2);
    }
}
