//! Cooperative cancellation for long-running streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, SliceSyncError};

/// Shared cancellation token.
///
/// Cloned tokens observe the same flag. Fingerprint generation, diffing and
/// reconstruction check the token at every slice boundary and return
/// [`SliceSyncError::Cancelled`] once it is set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Has this token been cancelled?
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Return `Err(Cancelled)` once the token is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(SliceSyncError::Cancelled);
        }
        Ok(())
    }
}
