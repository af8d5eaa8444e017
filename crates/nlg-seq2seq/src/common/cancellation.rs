//! Cooperative cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{GenerationError, GenerationResult};

/// A token that can be checked to determine if cancellation was requested.
///
/// The generation loop only looks at it between two decoding steps, so a
/// step that has started always completes.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a new cancellation token pair.
    ///
    /// Returns:
    /// - `CancellationToken` - Pass this to the generation function
    /// - `CancellationHandle` - Keep this to trigger cancellation
    ///
    /// # Example
    ///
    /// ```ignore
    /// let (token, handle) = CancellationToken::new();
    /// std::thread::spawn(move || handle.cancel());
    /// let result = generator.generate_cancellable(input, &config, token);
    /// ```
    pub fn new() -> (Self, CancellationHandle) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let token = CancellationToken {
            cancelled: cancelled.clone(),
        };
        let handle = CancellationHandle { cancelled };
        (token, handle)
    }

    /// Creates a token that is never cancelled.
    pub fn never() -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a token that is already cancelled.
    pub fn already_cancelled() -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(true)),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `GenerationError::Cancelled` if cancellation was requested.
    #[inline]
    pub fn check(&self, cur_len: usize) -> GenerationResult<()> {
        if self.is_cancelled() {
            Err(GenerationError::Cancelled { cur_len })
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    /// Default token is never cancelled.
    fn default() -> Self {
        Self::never()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A handle that can trigger cancellation.
#[derive(Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Signals cancellation to all associated tokens.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CancellationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
