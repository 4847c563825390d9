//! Cooperative cancellation (SIGINT/SIGTERM)
//!
//! The signal handler never unwinds the run. It only flips a flag; the
//! coordinator, staging and publishing loops poll that flag at step and
//! file boundaries and then take the normal cleanup path (pid-file release,
//! optional staged-file clearing) before reporting the run as canceled.
//!
//! Repeated signals while cleanup is running are counted but otherwise
//! ignored, so a second Ctrl-C cannot leave a stale pid file behind.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Exit code for canceled runs
pub const EXIT_CODE_CANCELED: i32 = 80;

/// Shared cancellation state
#[derive(Debug, Default)]
pub struct SignalState {
    /// A cancellation has been requested
    cancel_requested: AtomicBool,
    /// Number of signals received
    signal_count: AtomicU8,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record a delivered signal and decide what it means.
    pub fn handle_signal(&self) -> SignalAction {
        let _ = self
            .signal_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)));
        if !self.cancel_requested.swap(true, Ordering::SeqCst) {
            SignalAction::InitiateCancellation
        } else {
            SignalAction::AlreadyCanceling
        }
    }

    fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: stop at the next boundary and clean up
    InitiateCancellation,
    /// Later signals: cleanup is already under way
    AlreadyCanceling,
}

/// Cheap, cloneable handle polled by long-running steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<SignalState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: Arc<SignalState>) -> Self {
        Self { state }
    }

    pub fn is_canceled(&self) -> bool {
        self.state.is_cancel_requested()
    }

    /// Request cancellation without a signal.
    pub fn cancel(&self) {
        self.state.request_cancel();
    }
}

/// Installs the process-wide signal handler
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken::from_state(Arc::clone(&self.state))
    }

    /// Install handlers for SIGINT, SIGTERM and SIGHUP.
    ///
    /// Must be called at most once per process.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::InitiateCancellation => {
                warn!("termination requested, stopping at the next file boundary");
            }
            SignalAction::AlreadyCanceling => {
                warn!("termination already in progress, finishing cleanup");
            }
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
