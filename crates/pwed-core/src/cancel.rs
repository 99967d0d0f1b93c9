use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ImportError;

/// Thread-safe cancellation flag shared between the caller and a running import.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns [`ImportError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<(), ImportError> {
        if self.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        Ok(())
    }
}

/// Control options for a running import.
#[derive(Debug, Clone, Default)]
pub struct ImportControl {
    pub cancel_token: Option<CancellationToken>,
}

impl ImportControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub(crate) fn check(&self) -> Result<(), ImportError> {
        match self.cancel_token {
            Some(ref token) => token.check(),
            None => Ok(()),
        }
    }
}
