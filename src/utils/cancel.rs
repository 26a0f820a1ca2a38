//! Cooperative cancellation token fed by the termination signal.

use tokio::sync::watch;

use crate::protocol::WireError;

/// Read-only view of the shared termination flag. Cloned into every place
/// that performs blocking socket I/O; callers poll it right before each such
/// call. Nothing in flight is ever interrupted by it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx_term: watch::Receiver<bool>,
}

impl CancelToken {
    /// Creates a fresh (unraised) token along with the sender side used to
    /// raise it, typically from within a signal handler.
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx_term, rx_term) = watch::channel(false);
        (tx_term, CancelToken { rx_term })
    }

    /// Wraps an existing termination channel receiver.
    pub fn from_receiver(rx_term: watch::Receiver<bool>) -> Self {
        CancelToken { rx_term }
    }

    /// Returns true if termination has been requested.
    #[inline]
    pub fn is_raised(&self) -> bool {
        *self.rx_term.borrow()
    }

    /// Returns `Err(WireError::Cancelled)` if termination has been requested.
    #[inline]
    pub fn check(&self) -> Result<(), WireError> {
        if self.is_raised() {
            Err(WireError::Cancelled)
        } else {
            Ok(())
        }
    }
}
