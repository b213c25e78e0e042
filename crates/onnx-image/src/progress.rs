//! Progress reporting and per-run callbacks
//!
//! A [`RunContext`] bundles everything a caller can attach to one
//! generation: a progress callback, a cancellation token, and whether
//! intermediate latents should be included in the reports. Callback
//! panics are swallowed and logged; progress must never kill a run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use ndarray::Array4;
use tracing::warn;

use onnx_image_core::CancellationToken;

/// One progress report, emitted after every completed scheduler step.
#[derive(Clone)]
pub struct DiffusionProgress {
    /// 1-based completed step count.
    pub step: usize,
    pub total: usize,
    /// Snapshot of the current latent, when requested via
    /// [`RunContext::latent_snapshots`].
    pub latent: Option<Array4<f32>>,
    /// Position within a batch or frame sequence, when applicable.
    pub batch_index: Option<usize>,
}

pub type ProgressCallback = Arc<dyn Fn(DiffusionProgress) + Send + Sync>;

/// Caller-supplied hooks for one generation.
#[derive(Clone, Default)]
pub struct RunContext {
    pub progress: Option<ProgressCallback>,
    /// Include a latent snapshot in every progress report. Off by default;
    /// each snapshot clones the full latent.
    pub latent_snapshots: bool,
    pub cancellation: CancellationToken,
    pub(crate) batch_index: Option<usize>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_latent_snapshots(mut self) -> Self {
        self.latent_snapshots = true;
        self
    }

    pub(crate) fn with_batch_index(&self, index: usize) -> Self {
        let mut ctx = self.clone();
        ctx.batch_index = Some(index);
        ctx
    }

    /// Emits one report. Panics inside the callback are swallowed.
    pub(crate) fn report(&self, step: usize, total: usize, latent: &Array4<f32>) {
        let Some(callback) = &self.progress else {
            return;
        };
        let progress = DiffusionProgress {
            step,
            total,
            latent: self.latent_snapshots.then(|| latent.clone()),
            batch_index: self.batch_index,
        };
        if catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
            warn!(step, total, "progress callback panicked; report dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_reports_are_ordered_and_counted() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let ctx = RunContext::new().with_progress(Arc::new(move |p: DiffusionProgress| {
            assert_eq!(p.step, seen_cb.load(Ordering::SeqCst) + 1);
            assert!(p.latent.is_none());
            seen_cb.fetch_add(1, Ordering::SeqCst);
        }));

        let latent = Array4::zeros((1, 4, 8, 8));
        for step in 1..=5 {
            ctx.report(step, 5, &latent);
        }
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_callback_panic_is_swallowed() {
        let ctx = RunContext::new().with_progress(Arc::new(|_| panic!("listener bug")));
        let latent = Array4::zeros((1, 4, 8, 8));
        // Must not propagate.
        ctx.report(1, 10, &latent);
    }

    #[test]
    fn test_latent_snapshots_included_when_requested() {
        let ctx = RunContext::new()
            .with_progress(Arc::new(|p: DiffusionProgress| {
                assert!(p.latent.is_some());
            }))
            .with_latent_snapshots();
        let latent = Array4::zeros((1, 4, 8, 8));
        ctx.report(1, 1, &latent);
    }

    #[test]
    fn test_batch_index_threaded_through() {
        let ctx = RunContext::new().with_progress(Arc::new(|p: DiffusionProgress| {
            assert_eq!(p.batch_index, Some(3));
        }));
        let batched = ctx.with_batch_index(3);
        batched.report(1, 1, &Array4::zeros((1, 4, 8, 8)));
    }
}
