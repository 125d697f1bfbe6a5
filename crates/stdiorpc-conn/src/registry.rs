use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::message::RequestId;

/// What a waiting caller eventually receives.
pub type CallOutcome = std::result::Result<Value, RpcError>;

/// Minted ids stay within the positive `i32` range, which every peer
/// implementation can represent, and wrap back to 1.
const MAX_MINTED_ID: i64 = i32::MAX as i64;

/// Table of outstanding calls awaiting a response.
///
/// Shared between the read loop (which resolves entries) and any number of
/// callers (which register and abandon them). Each entry is a single-use
/// slot: it is either resolved once or removed without delivery.
#[derive(Debug)]
pub struct PendingCalls {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<RequestId, oneshot::Sender<CallOutcome>>,
    next_id: i64,
    max_id: i64,
    sealed: bool,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    /// Create an empty registry. The first minted id is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(next_id: i64) -> Self {
        Self::with_id_range(next_id, MAX_MINTED_ID)
    }

    fn with_id_range(next_id: i64, max_id: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_id,
                max_id,
                sealed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an explicit id.
    ///
    /// Fails with [`RpcError::DuplicateId`] if the id is already pending and
    /// with [`RpcError::ConnectionClosed`] once the registry is sealed.
    pub fn register(&self, id: RequestId) -> Result<oneshot::Receiver<CallOutcome>> {
        let mut inner = self.lock();
        if inner.sealed {
            return Err(RpcError::ConnectionClosed);
        }
        if inner.entries.contains_key(&id) {
            return Err(RpcError::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        inner.entries.insert(id, tx);
        Ok(rx)
    }

    /// Mint the next free id and register it in one step.
    ///
    /// After wrap-around, ids that are still pending are skipped. Fails with
    /// [`RpcError::IdSpaceExhausted`] if every id is pending.
    pub fn register_next(&self) -> Result<(RequestId, oneshot::Receiver<CallOutcome>)> {
        let mut inner = self.lock();
        if inner.sealed {
            return Err(RpcError::ConnectionClosed);
        }
        for _ in 0..inner.max_id {
            let candidate = inner.next_id;
            inner.next_id = if candidate >= inner.max_id {
                1
            } else {
                candidate + 1
            };

            let id = RequestId::Number(candidate);
            if inner.entries.contains_key(&id) {
                tracing::trace!(%id, "skipping id still pending after wrap-around");
                continue;
            }
            let (tx, rx) = oneshot::channel();
            inner.entries.insert(id.clone(), tx);
            return Ok((id, rx));
        }
        Err(RpcError::IdSpaceExhausted)
    }

    /// Deliver an outcome to the caller waiting on `id`.
    ///
    /// Returns `false` if no entry exists (unknown id, or a call that already
    /// timed out); the outcome is dropped in that case.
    pub fn resolve(&self, id: &RequestId, outcome: CallOutcome) -> bool {
        let Some(slot) = self.lock().entries.remove(id) else {
            tracing::debug!(%id, "dropping response for unknown or expired request id");
            return false;
        };
        if slot.send(outcome).is_err() {
            tracing::debug!(%id, "caller stopped waiting before response arrived");
        }
        true
    }

    /// Remove an entry without delivering anything.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    /// Deliver an error to every pending entry, clear the table, and refuse
    /// further registrations. Returns the number of entries abandoned.
    pub fn abandon_all(&self, error: impl Fn() -> RpcError) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.sealed = true;
            inner.entries.drain().collect()
        };
        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.send(Err(error()));
        }
        count
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True if no calls are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once [`abandon_all`](Self::abandon_all) has run.
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }
}
