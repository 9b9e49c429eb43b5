use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use crate::credential::CredentialUpdate;

/// FIFO of pending writes where a newer update replaces a pending one for
/// the same slot in place.
#[derive(Debug, Default)]
pub(crate) struct LatestQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<CredentialUpdate>,
    closed: bool,
}

impl LatestQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues `update`. Returns `true` if it superseded a pending update.
    pub(crate) fn push(&self, update: CredentialUpdate) -> bool {
        let superseded = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = update.slot();
            match state.pending.iter_mut().find(|p| p.slot() == slot) {
                Some(existing) => {
                    *existing = update;
                    true
                }
                None => {
                    state.pending.push_back(update);
                    false
                }
            }
        };
        self.notify.notify_one();
        superseded
    }

    /// Wakes the consumer once everything pending has been taken.
    pub(crate) fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_one();
    }

    /// Next pending update, or `None` once closed and drained.
    pub(crate) async fn pop(&self) -> Option<CredentialUpdate> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(update) = state.pending.pop_front() {
                    return Some(update);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }
}
