//! Cooperative cancellation for long-running generations
//!
//! The driver checks the token at the top of every scheduler step and
//! immediately before the final decode. In-flight session runs are never
//! interrupted; cancellation takes effect at the next check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{DiffusionError, Result};

/// Clonable cancellation signal shared between a caller and a running
/// generation. Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once the token has been triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DiffusionError::Cancelled)
        } else {
            Ok(())
        }
    }
}
