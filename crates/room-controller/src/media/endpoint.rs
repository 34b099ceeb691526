//! Candidate-buffering endpoint cell.
//!
//! Clients may trickle candidates before the engine has created the endpoint
//! they belong to. [`EndpointCell`] holds those candidates until the endpoint
//! is installed and then flushes them in arrival order, under the same lock
//! that later candidates take, so ordering is preserved.

use crate::engine::{release_in_background, ElementHandle, IceCandidate, MediaEngine};
use crate::errors::RoomError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug)]
enum CellState {
    Empty { pending: Vec<IceCandidate> },
    Creating { pending: Vec<IceCandidate> },
    Ready(ElementHandle),
    Released,
}

/// Slot for one engine endpoint plus the candidates that arrived early.
#[derive(Debug)]
pub struct EndpointCell {
    owner: String,
    state: Mutex<CellState>,
}

impl EndpointCell {
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            state: Mutex::new(CellState::Empty {
                pending: Vec::new(),
            }),
        }
    }

    /// Claim the right to create the endpoint.
    ///
    /// Returns `false` if another caller already claimed it, it exists, or
    /// the cell was released.
    pub async fn begin_create(&self) -> bool {
        let mut state = self.state.lock().await;
        match &mut *state {
            CellState::Empty { pending } => {
                let pending = std::mem::take(pending);
                *state = CellState::Creating { pending };
                true
            }
            _ => false,
        }
    }

    /// Give up a claim after a failed creation. Buffered candidates are kept.
    pub async fn abort_create(&self) {
        let mut state = self.state.lock().await;
        if let CellState::Creating { pending } = &mut *state {
            let pending = std::mem::take(pending);
            *state = CellState::Empty { pending };
        }
    }

    /// Install a freshly created endpoint and flush buffered candidates.
    ///
    /// Returns `Ok(false)` when the claim was lost (the cell was released or
    /// reset while the endpoint was being created); the endpoint is then
    /// released in the background.
    pub async fn install(
        &self,
        engine: &Arc<dyn MediaEngine>,
        endpoint: ElementHandle,
    ) -> Result<bool, RoomError> {
        let mut state = self.state.lock().await;
        let pending = match &mut *state {
            CellState::Creating { pending } => std::mem::take(pending),
            CellState::Empty { .. } | CellState::Ready(_) | CellState::Released => {
                debug!(
                    target: "room.media.endpoint",
                    owner = %self.owner,
                    endpoint = %endpoint,
                    "Endpoint created after its owner went away, releasing"
                );
                release_in_background(Arc::clone(engine), endpoint, self.owner.clone());
                return Ok(false);
            }
        };

        let flushed = pending.len();
        *state = CellState::Ready(endpoint.clone());
        for candidate in &pending {
            engine.add_candidate(&endpoint, candidate).await?;
        }
        if flushed > 0 {
            debug!(
                target: "room.media.endpoint",
                owner = %self.owner,
                endpoint = %endpoint,
                flushed,
                "Flushed buffered candidates"
            );
        }
        Ok(true)
    }

    /// Deliver a remote candidate, buffering it if the endpoint is not ready.
    pub async fn add_candidate(
        &self,
        engine: &Arc<dyn MediaEngine>,
        candidate: IceCandidate,
    ) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        match &mut *state {
            CellState::Empty { pending } | CellState::Creating { pending } => {
                pending.push(candidate);
                Ok(())
            }
            CellState::Ready(endpoint) => {
                engine.add_candidate(endpoint, &candidate).await?;
                Ok(())
            }
            CellState::Released => {
                warn!(
                    target: "room.media.endpoint",
                    owner = %self.owner,
                    "Dropping candidate for released endpoint"
                );
                Ok(())
            }
        }
    }

    /// The endpoint, if installed.
    pub async fn handle(&self) -> Option<ElementHandle> {
        match &*self.state.lock().await {
            CellState::Ready(endpoint) => Some(endpoint.clone()),
            _ => None,
        }
    }

    /// Number of candidates waiting for the endpoint.
    pub async fn pending_candidates(&self) -> usize {
        match &*self.state.lock().await {
            CellState::Empty { pending } | CellState::Creating { pending } => pending.len(),
            _ => 0,
        }
    }

    /// Release the endpoint (if any) and refuse further use.
    pub async fn release(&self, engine: &Arc<dyn MediaEngine>) -> Option<ElementHandle> {
        let previous = std::mem::replace(&mut *self.state.lock().await, CellState::Released);
        match previous {
            CellState::Ready(endpoint) => {
                release_in_background(Arc::clone(engine), endpoint.clone(), self.owner.clone());
                Some(endpoint)
            }
            _ => None,
        }
    }

    /// Return a released cell to its initial empty state.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, CellState::Released) {
            *state = CellState::Empty {
                pending: Vec::new(),
            };
        }
    }

    pub async fn is_released(&self) -> bool {
        matches!(*self.state.lock().await, CellState::Released)
    }
}
