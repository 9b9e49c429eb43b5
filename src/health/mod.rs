//! Health Reporter: readiness and liveness of the rotation loop.
//!
//! The controller is the only writer. Readers (the HTTP listener, embedders)
//! get cheap snapshots through a cloned [`HealthReporter`].

mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::credential::UpdateSlot;

pub use server::{router, serve, HealthServerError};

#[derive(Debug)]
struct SlotStatus {
    slot: UpdateSlot,
    written: AtomicBool,
}

#[derive(Debug)]
struct Inner {
    live: AtomicBool,
    slots: Vec<SlotStatus>,
}

/// Shared ready/live flags.
///
/// Ready once every configured write slot (the X.509 set, each JWT audience,
/// the JWT bundle) has been written at least once. A later failed write
/// keeps readiness: the previous files are still complete on disk. Live
/// until the controller loop stops abnormally.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    inner: Arc<Inner>,
}

/// Point-in-time view served by the health listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Liveness flag.
    pub live: bool,
    /// Readiness flag.
    pub ready: bool,
    /// Per-slot write status.
    pub credentials: Vec<CredentialStatus>,
}

/// Write status of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    /// Credential kind name.
    pub kind: &'static str,
    /// Audiences of a JWT SVID slot, comma separated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Whether it has been written at least once.
    pub written: bool,
}

impl HealthReporter {
    /// Creates a reporter tracking `slots`. Starts live and not ready.
    pub fn new(slots: impl IntoIterator<Item = UpdateSlot>) -> Self {
        let mut seen: Vec<UpdateSlot> = Vec::new();
        for slot in slots {
            if !seen.contains(&slot) {
                seen.push(slot);
            }
        }
        Self {
            inner: Arc::new(Inner {
                live: AtomicBool::new(true),
                slots: seen
                    .into_iter()
                    .map(|slot| SlotStatus {
                        slot,
                        written: AtomicBool::new(false),
                    })
                    .collect(),
            }),
        }
    }

    /// Records a successful write of `slot`. Untracked slots are ignored.
    pub fn mark_written(&self, slot: &UpdateSlot) {
        if let Some(status) = self.inner.slots.iter().find(|s| &s.slot == slot) {
            status.written.store(true, Ordering::Release);
        }
    }

    /// Updates the liveness flag.
    pub fn set_live(&self, live: bool) {
        self.inner.live.store(live, Ordering::Release);
    }

    /// Every tracked slot has been written.
    pub fn is_ready(&self) -> bool {
        self.inner
            .slots
            .iter()
            .all(|s| s.written.load(Ordering::Acquire))
    }

    /// The controller loop is running.
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Current flags and per-slot status.
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            live: self.is_live(),
            ready: self.is_ready(),
            credentials: self
                .inner
                .slots
                .iter()
                .map(|s| CredentialStatus {
                    kind: s.slot.kind().as_str(),
                    audience: match &s.slot {
                        UpdateSlot::JwtSvid(key) => Some(key.to_string()),
                        UpdateSlot::X509 | UpdateSlot::JwtBundle => None,
                    },
                    written: s.written.load(Ordering::Acquire),
                })
                .collect(),
        }
    }
}
