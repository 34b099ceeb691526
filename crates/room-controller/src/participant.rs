//! Room participant.
//!
//! A participant owns one outbound [`PublisherEndpoint`] and one
//! [`SubscriberLink`] per peer it receives from (or has trickled candidates
//! for). Links are keyed by the peer's display name.

use crate::engine::{ElementHandle, IceCandidate, MediaEngine, PipelineHandle};
use crate::errors::RoomError;
use crate::media::{MuteKind, PublisherEndpoint, SubscriberLink};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Name of the single stream a streaming participant exposes.
pub const DEFAULT_STREAM_ID: &str = "webcam";

/// Stream descriptor visible to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
}

/// Participant descriptor sent to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub name: String,
    pub streaming: bool,
}

impl ParticipantInfo {
    /// Visible streams: the default stream while streaming, nothing otherwise.
    #[must_use]
    pub fn streams(&self) -> Vec<StreamInfo> {
        if self.streaming {
            vec![StreamInfo {
                id: DEFAULT_STREAM_ID.to_string(),
            }]
        } else {
            Vec::new()
        }
    }
}

pub struct Participant {
    id: String,
    name: String,
    room_name: String,
    engine: Arc<dyn MediaEngine>,
    pipeline: PipelineHandle,
    publisher: Arc<PublisherEndpoint>,
    subscribers: DashMap<String, Arc<SubscriberLink>>,
    streaming: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("room_name", &self.room_name)
            .field("streaming", &self.is_streaming())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Participant {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        room_name: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        pipeline: PipelineHandle,
    ) -> Self {
        let id = id.into();
        let name = name.into();
        let publisher = Arc::new(PublisherEndpoint::new(
            id.clone(),
            name.clone(),
            Arc::clone(&engine),
            pipeline.clone(),
        ));
        Self {
            id,
            name,
            room_name: room_name.into(),
            engine,
            pipeline,
            publisher,
            subscribers: DashMap::new(),
            streaming: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn publisher(&self) -> &Arc<PublisherEndpoint> {
        &self.publisher
    }

    #[must_use]
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            streaming: self.is_streaming(),
        }
    }

    fn ensure_open(&self) -> Result<(), RoomError> {
        if self.is_closed() {
            return Err(RoomError::ParticipantClosed(self.name.clone()));
        }
        Ok(())
    }

    fn link_for(&self, peer_name: &str) -> Arc<SubscriberLink> {
        let link = self
            .subscribers
            .entry(peer_name.to_string())
            .or_insert_with(|| {
                Arc::new(SubscriberLink::new(
                    self.id.clone(),
                    self.name.clone(),
                    peer_name,
                    Arc::clone(&self.engine),
                    self.pipeline.clone(),
                ))
            });
        Arc::clone(link.value())
    }

    /// Pre-create an (endpoint-less) link to `peer_name` so early candidates
    /// have somewhere to wait.
    pub fn ensure_placeholder(&self, peer_name: &str) {
        if peer_name != self.name && !self.is_closed() {
            self.link_for(peer_name);
        }
    }

    /// Start building the outbound endpoint.
    pub fn create_publisher(&self) -> Result<(), RoomError> {
        self.ensure_open()?;
        self.publisher.create();
        Ok(())
    }

    /// Negotiate the outbound stream.
    #[instrument(skip_all, fields(participant_id = %self.id, room = %self.room_name))]
    pub async fn publish(&self, offer: &str, loopback: bool) -> Result<String, RoomError> {
        self.ensure_open()?;
        if self.is_streaming() {
            return Err(RoomError::InvalidState(format!(
                "'{}' is already streaming",
                self.name
            )));
        }
        let answer = self.publisher.publish(offer, loopback).await?;
        self.streaming.store(true, Ordering::SeqCst);
        debug!(
            target: "room.participant",
            participant_id = %self.id,
            room = %self.room_name,
            "Publishing"
        );
        Ok(answer)
    }

    /// Build the publisher, splice `stages` and negotiate.
    ///
    /// A failed call takes back out the stages it added, unreleased, so the
    /// caller can retry with the same handles.
    #[instrument(skip_all, fields(participant_id = %self.id, stages = stages.len()))]
    pub async fn publish_with_stages(
        &self,
        offer: &str,
        loopback: bool,
        stages: Vec<ElementHandle>,
    ) -> Result<String, RoomError> {
        self.ensure_open()?;
        if self.is_streaming() {
            return Err(RoomError::InvalidState(format!(
                "'{}' is already streaming",
                self.name
            )));
        }
        self.publisher.create();

        let mut added = Vec::new();
        let published = self
            .splice_and_publish(offer, loopback, stages, &mut added)
            .await;

        if published.is_err() {
            for id in added.iter().rev() {
                if let Err(e) = self.publisher.detach_stage(id).await {
                    warn!(
                        target: "room.participant",
                        participant_id = %self.id,
                        stage = %id,
                        error = %e,
                        "Could not take back stage after failed publish"
                    );
                }
            }
        }
        published
    }

    async fn splice_and_publish(
        &self,
        offer: &str,
        loopback: bool,
        stages: Vec<ElementHandle>,
        added: &mut Vec<String>,
    ) -> Result<String, RoomError> {
        for stage in stages {
            let id = stage.id().to_string();
            self.publisher.insert_stage(stage).await?;
            added.push(id);
        }
        self.publish(offer, loopback).await
    }

    /// Stop streaming and reset the outbound endpoint.
    pub async fn unpublish(&self) -> Result<(), RoomError> {
        self.ensure_open()?;
        if !self.streaming.swap(false, Ordering::SeqCst) {
            return Err(RoomError::NotStreaming(self.name.clone()));
        }
        self.publisher.unpublish().await;
        debug!(
            target: "room.participant",
            participant_id = %self.id,
            room = %self.room_name,
            "Unpublished"
        );
        Ok(())
    }

    pub async fn add_stage(&self, stage: ElementHandle) -> Result<(), RoomError> {
        self.ensure_open()?;
        self.publisher.insert_stage(stage).await
    }

    pub async fn remove_stage(&self, stage_id: &str) -> Result<(), RoomError> {
        self.ensure_open()?;
        self.publisher.remove_stage(stage_id).await
    }

    pub async fn mute_published(&self, kind: MuteKind) -> Result<(), RoomError> {
        self.ensure_open()?;
        self.publisher.mute(kind).await
    }

    pub async fn unmute_published(&self) -> Result<(), RoomError> {
        self.ensure_open()?;
        self.publisher.unmute().await
    }

    /// Receive `sender`'s stream.
    ///
    /// Returns `Ok(None)` when the sender's endpoint is gone or another
    /// caller already created the link's endpoint.
    #[instrument(skip_all, fields(participant_id = %self.id, sender = %sender.name))]
    pub async fn receive_from(&self, sender: &Participant, offer: &str) -> Result<Option<String>, RoomError> {
        self.ensure_open()?;
        if sender.name == self.name {
            return Err(RoomError::InvalidArgument(
                "cannot subscribe to own stream, use loopback".to_string(),
            ));
        }

        if !sender.publisher.is_available() {
            debug!(
                target: "room.participant",
                participant_id = %self.id,
                sender = %sender.name,
                "Sender is not publishing"
            );
            return Ok(None);
        }

        let link = self.link_for(&sender.name);
        match link.subscribe(Arc::clone(&sender.publisher), offer).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                self.subscribers
                    .remove_if(&sender.name, |_, current| Arc::ptr_eq(current, &link));
                Err(e)
            }
        }
    }

    /// Release the link from `sender_name`. Returns whether one existed.
    pub async fn drop_link(&self, sender_name: &str) -> bool {
        match self.subscribers.remove(sender_name) {
            Some((_, link)) => {
                link.release().await;
                true
            }
            None => false,
        }
    }

    /// Stop receiving `sender_name`'s stream.
    pub async fn cancel_receiving(&self, sender_name: &str) {
        if !self.drop_link(sender_name).await {
            warn!(
                target: "room.participant",
                participant_id = %self.id,
                sender = %sender_name,
                "No link to cancel"
            );
        }
    }

    pub async fn mute_subscribed(&self, sender_name: &str, kind: MuteKind) -> Result<(), RoomError> {
        self.ensure_open()?;
        self.existing_link(sender_name)?.mute(kind).await
    }

    pub async fn unmute_subscribed(&self, sender_name: &str) -> Result<(), RoomError> {
        self.ensure_open()?;
        self.existing_link(sender_name)?.unmute().await
    }

    fn existing_link(&self, sender_name: &str) -> Result<Arc<SubscriberLink>, RoomError> {
        self.subscribers
            .get(sender_name)
            .map(|link| Arc::clone(link.value()))
            .ok_or_else(|| {
                RoomError::Mute(format!(
                    "'{}' is not receiving media from '{sender_name}'",
                    self.name
                ))
            })
    }

    /// Route a client candidate to the publisher (own name) or to the link
    /// for `endpoint_name`, creating a placeholder link if needed.
    pub async fn add_ice_candidate(&self, endpoint_name: &str, candidate: IceCandidate) -> Result<(), RoomError> {
        self.ensure_open()?;
        if endpoint_name == self.name {
            self.publisher.add_candidate(candidate).await
        } else {
            self.link_for(endpoint_name).add_candidate(candidate).await
        }
    }

    /// Names of peers this participant is actually receiving from.
    pub async fn receiving_from(&self) -> Vec<String> {
        let links: Vec<Arc<SubscriberLink>> = self
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut names = Vec::new();
        for link in links {
            if link.is_connected().await {
                names.push(link.peer_name().to_string());
            }
        }
        names.sort();
        names
    }

    /// Release every link and the publisher. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let links: Vec<Arc<SubscriberLink>> = self
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.subscribers.clear();
        for link in links {
            link.release().await;
        }
        self.publisher.close().await;
        self.streaming.store(false, Ordering::SeqCst);
        debug!(
            target: "room.participant",
            participant_id = %self.id,
            room = %self.room_name,
            "Participant closed"
        );
    }
}
