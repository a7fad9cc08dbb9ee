use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use crate::error::{Result, RagsyncError};

/// Cooperative cancellation shared between a run and whoever may stop it.
///
/// Checked only at batch boundaries (between files, embedding batches and
/// rebuild windows), so a committed batch is never split.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once `cancel` has been called
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(RagsyncError::Cancelled);
        }
        Ok(())
    }
}
