//! Inbound link from one peer's publisher to a participant.
//!
//! A link can exist before its endpoint does: placeholder links are created
//! when a peer starts publishing or when a client trickles candidates for a
//! stream it has not subscribed to yet. The endpoint itself is created by the
//! first [`SubscriberLink::subscribe`] that claims the link's cell.

use super::endpoint::EndpointCell;
use super::mute::{MuteKind, MuteState};
use super::publisher::PublisherEndpoint;
use crate::engine::{ElementHandle, EndpointTag, IceCandidate, MediaEngine, PipelineHandle};
use crate::errors::RoomError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

#[derive(Debug, Default)]
struct LinkState {
    publisher: Option<Arc<PublisherEndpoint>>,
    connected: bool,
    mute: MuteState,
}

pub struct SubscriberLink {
    owner_id: String,
    owner_name: String,
    peer_name: String,
    engine: Arc<dyn MediaEngine>,
    pipeline: PipelineHandle,
    cell: EndpointCell,
    state: Mutex<LinkState>,
}

impl std::fmt::Debug for SubscriberLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberLink")
            .field("owner_id", &self.owner_id)
            .field("owner_name", &self.owner_name)
            .field("peer_name", &self.peer_name)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl SubscriberLink {
    #[must_use]
    pub fn new(
        owner_id: impl Into<String>,
        owner_name: impl Into<String>,
        peer_name: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        pipeline: PipelineHandle,
    ) -> Self {
        let owner_name = owner_name.into();
        let peer_name = peer_name.into();
        Self {
            owner_id: owner_id.into(),
            cell: EndpointCell::new(format!("{owner_name}<-{peer_name}")),
            owner_name,
            peer_name,
            engine,
            pipeline,
            state: Mutex::new(LinkState::default()),
        }
    }

    #[must_use]
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn mute_state(&self) -> MuteState {
        self.state.lock().await.mute
    }

    /// Create the endpoint, negotiate `offer` and attach it to `publisher`.
    ///
    /// Returns `Ok(None)` when there is nothing to answer: the publisher is
    /// gone, or another caller already created this link's endpoint. On
    /// engine failure the partially created endpoint is released.
    #[instrument(skip_all, fields(subscriber = %self.owner_name, publisher = %self.peer_name))]
    pub async fn subscribe(
        &self,
        publisher: Arc<PublisherEndpoint>,
        offer: &str,
    ) -> Result<Option<String>, RoomError> {
        let mut state = self.state.lock().await;

        if !publisher.is_available() {
            debug!(
                target: "room.media.subscriber",
                subscriber = %self.owner_name,
                publisher = %self.peer_name,
                "Publisher endpoint is gone"
            );
            return Ok(None);
        }
        if !self.cell.begin_create().await {
            debug!(
                target: "room.media.subscriber",
                subscriber = %self.owner_name,
                publisher = %self.peer_name,
                "Link endpoint already created"
            );
            return Ok(None);
        }

        let tag = EndpointTag::new(&self.owner_id, &self.peer_name);
        let endpoint = match self.engine.create_endpoint(&self.pipeline, &tag).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.cell.abort_create().await;
                return Err(e.into());
            }
        };
        if !self.cell.install(&self.engine, endpoint.clone()).await? {
            return Ok(None);
        }

        let negotiated = async {
            let answer = self.engine.process_offer(&endpoint, offer).await?;
            if answer.is_empty() {
                return Err(RoomError::NoAnswer(self.owner_name.clone()));
            }
            self.engine.gather_candidates(&endpoint).await?;
            publisher.connect_sink(&endpoint, None).await?;
            Ok(answer)
        }
        .await;

        match negotiated {
            Ok(answer) => {
                state.publisher = Some(publisher);
                state.connected = true;
                Ok(Some(answer))
            }
            Err(e) => {
                self.cell.release(&self.engine).await;
                Err(e)
            }
        }
    }

    /// Stop the given leg(s) of the received stream.
    ///
    /// # Errors
    ///
    /// `RoomError::Mute` when the link was never connected.
    pub async fn mute(&self, kind: MuteKind) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        let publisher = self.connected_publisher(&state)?;
        if state.mute.covers(kind) {
            return Ok(());
        }
        let endpoint = self.endpoint_or_mute_error().await?;
        publisher.disconnect_sink(&endpoint, kind.media_kind()).await?;
        state.mute = state.mute.fold(kind);
        Ok(())
    }

    /// Resume the full received stream.
    pub async fn unmute(&self) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        let publisher = self.connected_publisher(&state)?;
        if !state.mute.is_muted() {
            return Ok(());
        }
        let endpoint = self.endpoint_or_mute_error().await?;
        publisher.connect_sink(&endpoint, None).await?;
        state.mute = state.mute.cleared();
        Ok(())
    }

    fn connected_publisher(&self, state: &LinkState) -> Result<Arc<PublisherEndpoint>, RoomError> {
        match (&state.publisher, state.connected) {
            (Some(publisher), true) => Ok(Arc::clone(publisher)),
            _ => Err(RoomError::Mute(format!(
                "'{}' is not receiving media from '{}'",
                self.owner_name, self.peer_name
            ))),
        }
    }

    async fn endpoint_or_mute_error(&self) -> Result<ElementHandle, RoomError> {
        self.cell.handle().await.ok_or_else(|| {
            RoomError::Mute(format!(
                "'{}' has no endpoint for '{}'",
                self.owner_name, self.peer_name
            ))
        })
    }

    /// Deliver a client candidate, buffering it until the endpoint exists.
    pub async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), RoomError> {
        self.cell.add_candidate(&self.engine, candidate).await
    }

    /// Release the endpoint. Safe to call on placeholder links.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if let (Some(publisher), Some(endpoint)) = (&state.publisher, self.cell.handle().await) {
            if let Err(e) = publisher.disconnect_sink(&endpoint, None).await {
                warn!(
                    target: "room.media.subscriber",
                    subscriber = %self.owner_name,
                    publisher = %self.peer_name,
                    error = %e,
                    "Could not detach link before release"
                );
            }
        }
        self.cell.release(&self.engine).await;
        state.publisher = None;
        state.connected = false;
    }
}
