//! Publisher endpoint.
//!
//! Each participant owns one outbound endpoint. It is built asynchronously:
//! [`PublisherEndpoint::create`] starts construction exactly once and returns
//! immediately, and callers that need the endpoint wait on the phase channel.
//!
//! Phases:
//!
//! ```text
//! Uninitialized -> Pending -> Ready -> Streaming
//!       ^                        |         |
//!       +------- unpublish ------+---------+
//! any -> Released (close, or engine failure while pending)
//! ```

use super::chain::MediaChain;
use super::endpoint::EndpointCell;
use super::mute::MuteKind;
use crate::engine::{
    release_in_background, ElementHandle, EndpointTag, IceCandidate, MediaEngine, MediaKind,
    PipelineHandle,
};
use crate::errors::RoomError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

/// Lifecycle phase of a publisher endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherPhase {
    Uninitialized,
    Pending,
    Ready,
    Streaming,
    Released,
}

impl PublisherPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PublisherPhase::Uninitialized => "uninitialized",
            PublisherPhase::Pending => "pending",
            PublisherPhase::Ready => "ready",
            PublisherPhase::Streaming => "streaming",
            PublisherPhase::Released => "released",
        }
    }
}

pub struct PublisherEndpoint {
    owner_id: String,
    owner_name: String,
    engine: Arc<dyn MediaEngine>,
    pipeline: PipelineHandle,
    creating: AtomicBool,
    phase: watch::Sender<PublisherPhase>,
    cell: EndpointCell,
    /// Chain lock. `None` until the endpoint and merge point exist.
    chain: Mutex<Option<MediaChain>>,
}

impl std::fmt::Debug for PublisherEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherEndpoint")
            .field("owner_id", &self.owner_id)
            .field("owner_name", &self.owner_name)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl PublisherEndpoint {
    #[must_use]
    pub fn new(
        owner_id: impl Into<String>,
        owner_name: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        pipeline: PipelineHandle,
    ) -> Self {
        let owner_name = owner_name.into();
        let (phase, _) = watch::channel(PublisherPhase::Uninitialized);
        Self {
            owner_id: owner_id.into(),
            cell: EndpointCell::new(owner_name.clone()),
            owner_name,
            engine,
            pipeline,
            creating: AtomicBool::new(false),
            phase,
            chain: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn phase(&self) -> PublisherPhase {
        *self.phase.borrow()
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.phase() == PublisherPhase::Streaming
    }

    /// Whether the endpoint exists and can feed subscribers.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self.phase(), PublisherPhase::Ready | PublisherPhase::Streaming)
    }

    /// Move `from -> to` only if the current phase is `from`.
    fn transition(&self, from: PublisherPhase, to: PublisherPhase) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == from {
                *phase = to;
                true
            } else {
                false
            }
        })
    }

    /// Start building the endpoint. Only the first call does anything.
    pub fn create(self: &Arc<Self>) {
        if self
            .creating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if !self.transition(PublisherPhase::Uninitialized, PublisherPhase::Pending) {
            return;
        }

        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = publisher.build().await {
                warn!(
                    target: "room.media.publisher",
                    participant = %publisher.owner_name,
                    error = %e,
                    "Could not create publisher endpoint"
                );
                publisher.transition(PublisherPhase::Pending, PublisherPhase::Released);
            }
        });
    }

    async fn build(&self) -> Result<(), RoomError> {
        if !self.cell.begin_create().await {
            return Ok(());
        }

        let tag = EndpointTag::new(&self.owner_id, &self.owner_name);
        let endpoint = match self.engine.create_endpoint(&self.pipeline, &tag).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.cell.abort_create().await;
                return Err(e.into());
            }
        };
        let merge_point = match self.engine.create_merge_point(&self.pipeline, &tag).await {
            Ok(merge_point) => merge_point,
            Err(e) => {
                self.cell.abort_create().await;
                release_in_background(Arc::clone(&self.engine), endpoint, self.owner_name.clone());
                return Err(e.into());
            }
        };

        let mut chain = self.chain.lock().await;
        match self.cell.install(&self.engine, endpoint.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                release_in_background(Arc::clone(&self.engine), merge_point, self.owner_name.clone());
                return Ok(());
            }
            Err(e) => {
                release_in_background(Arc::clone(&self.engine), merge_point, self.owner_name.clone());
                self.cell.release(&self.engine).await;
                return Err(e);
            }
        }
        *chain = Some(MediaChain::new(self.owner_name.clone(), endpoint, merge_point));
        drop(chain);

        if self.transition(PublisherPhase::Pending, PublisherPhase::Ready) {
            debug!(
                target: "room.media.publisher",
                participant = %self.owner_name,
                "Publisher endpoint ready"
            );
        }
        Ok(())
    }

    /// Wait until the endpoint is usable.
    ///
    /// # Errors
    ///
    /// - `RoomError::InvalidState` - creation was never started
    /// - `RoomError::NoAnswer` - creation failed or the endpoint was released
    pub async fn wait_ready(&self) -> Result<(), RoomError> {
        let mut rx = self.phase.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            match phase {
                PublisherPhase::Ready | PublisherPhase::Streaming => return Ok(()),
                PublisherPhase::Uninitialized => {
                    return Err(RoomError::InvalidState(format!(
                        "publisher of '{}' was not created",
                        self.owner_name
                    )))
                }
                PublisherPhase::Released => {
                    return Err(RoomError::NoAnswer(format!(
                        "publisher of '{}' is gone",
                        self.owner_name
                    )))
                }
                PublisherPhase::Pending => {
                    if rx.changed().await.is_err() {
                        return Err(RoomError::NoAnswer(self.owner_name.clone()));
                    }
                }
            }
        }
    }

    /// Negotiate the client's offer and start streaming.
    #[instrument(skip_all, fields(participant = %self.owner_name, loopback = loopback))]
    pub async fn publish(&self, offer: &str, loopback: bool) -> Result<String, RoomError> {
        self.wait_ready().await?;
        let endpoint = self
            .cell
            .handle()
            .await
            .ok_or_else(|| RoomError::NoAnswer(self.owner_name.clone()))?;

        let answer = self.engine.process_offer(&endpoint, offer).await?;
        if answer.is_empty() {
            return Err(RoomError::NoAnswer(self.owner_name.clone()));
        }
        self.engine.gather_candidates(&endpoint).await?;

        self.ready_chain()
            .await?
            .connect(&self.engine, loopback)
            .await?;

        self.transition(PublisherPhase::Ready, PublisherPhase::Streaming);
        Ok(answer)
    }

    /// Chain lock guard, once the endpoint is ready.
    async fn ready_chain(&self) -> Result<MappedMutexGuard<'_, MediaChain>, RoomError> {
        self.wait_ready().await?;
        MutexGuard::try_map(self.chain.lock().await, Option::as_mut)
            .map_err(|_| RoomError::NoAnswer(self.owner_name.clone()))
    }

    pub async fn insert_stage(&self, stage: ElementHandle) -> Result<(), RoomError> {
        self.ready_chain().await?.insert(&self.engine, stage).await
    }

    pub async fn remove_stage(&self, stage_id: &str) -> Result<(), RoomError> {
        self.ready_chain().await?.remove(&self.engine, stage_id).await
    }

    /// Take a stage back out of the path without releasing it.
    pub async fn detach_stage(&self, stage_id: &str) -> Result<ElementHandle, RoomError> {
        let mut guard = self.chain.lock().await;
        match guard.as_mut() {
            Some(chain) => chain.detach(&self.engine, stage_id).await,
            None => Err(RoomError::StageNotFound(stage_id.to_string())),
        }
    }

    pub async fn mute(&self, kind: MuteKind) -> Result<(), RoomError> {
        self.ready_chain().await?.mute(&self.engine, kind).await
    }

    pub async fn unmute(&self) -> Result<(), RoomError> {
        self.ready_chain().await?.unmute(&self.engine).await
    }

    /// Attach a subscriber endpoint to the merge point.
    pub async fn connect_sink(&self, sink: &ElementHandle, kind: Option<MediaKind>) -> Result<(), RoomError> {
        self.ready_chain()
            .await?
            .connect_sink(&self.engine, sink, kind)
            .await
    }

    /// Detach a subscriber endpoint from the merge point.
    pub async fn disconnect_sink(&self, sink: &ElementHandle, kind: Option<MediaKind>) -> Result<(), RoomError> {
        let guard = self.chain.lock().await;
        match guard.as_ref() {
            Some(chain) => chain.disconnect_sink(&self.engine, sink, kind).await,
            None => Ok(()),
        }
    }

    /// Stage ids in path order.
    pub async fn stage_ids(&self) -> Vec<String> {
        self.chain
            .lock()
            .await
            .as_ref()
            .map(|chain| chain.stage_ids().to_vec())
            .unwrap_or_default()
    }

    pub async fn endpoint(&self) -> Option<ElementHandle> {
        self.cell.handle().await
    }

    pub async fn merge_point(&self) -> Option<ElementHandle> {
        self.chain
            .lock()
            .await
            .as_ref()
            .map(|chain| chain.merge_point().clone())
    }

    /// Deliver a client candidate, buffering it until the endpoint exists.
    pub async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), RoomError> {
        self.cell.add_candidate(&self.engine, candidate).await
    }

    /// Release the endpoint and stages and go back to a fresh, uncreated
    /// endpoint so a later publish can start over.
    pub async fn unpublish(&self) {
        if self.phase() == PublisherPhase::Released {
            return;
        }
        let mut guard = self.chain.lock().await;
        if let Some(chain) = guard.take() {
            chain.release(&self.engine);
        }
        self.cell.release(&self.engine).await;
        self.cell.reset().await;
        drop(guard);

        self.creating.store(false, Ordering::SeqCst);
        self.phase.send_replace(PublisherPhase::Uninitialized);
        debug!(
            target: "room.media.publisher",
            participant = %self.owner_name,
            "Publisher reset"
        );
    }

    /// Release everything. Late creation completions are released on arrival.
    pub async fn close(&self) {
        self.phase.send_replace(PublisherPhase::Released);
        let mut guard = self.chain.lock().await;
        if let Some(chain) = guard.take() {
            chain.release(&self.engine);
        }
        self.cell.release(&self.engine).await;
    }
}
