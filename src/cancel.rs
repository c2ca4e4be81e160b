//! Stream lifecycle and user-initiated stop.
//!
//! Every network stream gets its own [`StreamHandle`]. Stopping cancels the
//! handle's token: the read loop sees it before its next read, and a read
//! already in flight is discarded once it resolves. Cancellation never
//! interrupts a read forcibly.

use crate::error::StopError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct StreamHandle {
    token: CancellationToken,
    round: u32,
}

impl StreamHandle {
    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// True once the stream is tombstoned; nothing it yields may be applied.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Default)]
struct GovernorState {
    active: Option<StreamHandle>,
    awaiting_confirmation: bool,
    rounds_opened: u32,
}

/// Shared between the task reading a stream and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct CancellationGovernor {
    state: Arc<Mutex<GovernorState>>,
}

impl CancellationGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open_round(&self) -> StreamHandle {
        let mut state = self.lock();
        if let Some(previous) = state.active.take() {
            debug!(round = previous.round, "superseding unfinished stream");
            previous.token.cancel();
        }
        state.rounds_opened += 1;
        state.awaiting_confirmation = false;
        let handle = StreamHandle {
            token: CancellationToken::new(),
            round: state.rounds_opened,
        };
        state.active = Some(handle.clone());
        debug!(round = handle.round, "stream opened");
        handle
    }

    pub fn close_round(&self, handle: &StreamHandle) {
        let mut state = self.lock();
        if state
            .active
            .as_ref()
            .is_some_and(|active| active.round == handle.round)
        {
            state.active = None;
            debug!(round = handle.round, "stream closed");
        }
    }

    pub fn set_awaiting_confirmation(&self, awaiting: bool) {
        self.lock().awaiting_confirmation = awaiting;
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn rounds_opened(&self) -> u32 {
        self.lock().rounds_opened
    }

    /// Stops the in-flight stream. Returns `Ok(false)` when nothing was
    /// streaming. Refused while a confirmation decision is outstanding, since
    /// there is no stream to stop and the pending operation would go stale.
    pub fn stop(&self) -> Result<bool, StopError> {
        let mut state = self.lock();
        if state.awaiting_confirmation {
            return Err(StopError::AwaitingConfirmation);
        }
        match state.active.take() {
            Some(handle) => {
                handle.token.cancel();
                info!(round = handle.round, "stream stopped by user");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
