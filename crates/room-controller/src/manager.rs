//! Room manager: the top-level registry.
//!
//! Maps room names to rooms and participant ids to the room they are in.
//! Every client-facing operation enters here, resolves its target, delegates
//! to the room/participant and reports the outcome through the notifier.

use crate::config::{
    Config, DEFAULT_CONTROLLER_ID, DEFAULT_EVENT_CHANNEL_BUFFER, DEFAULT_RELEASE_TIMEOUT_SECONDS,
};
use crate::engine::{ElementHandle, EnginePool, IceCandidate};
use crate::errors::RoomError;
use crate::media::MuteKind;
use crate::notify::{Notifications, RoomNotifier};
use crate::observability::metrics;
use crate::participant::{Participant, ParticipantInfo};
use crate::room::{Room, RoomInfo};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Joins that meet a room whose closure was just claimed retry against a
/// fresh room this many times.
const JOIN_ATTEMPTS: usize = 3;

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room: String,
    pub participant: ParticipantInfo,
    /// Peers that were already in the room.
    pub existing: Vec<ParticipantInfo>,
    /// Whether this join created the room.
    pub created_room: bool,
}

/// Result of a successful leave.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub room: String,
    pub name: String,
    /// Ids of the participants still in the room.
    pub remaining: Vec<String>,
    /// Whether the room was closed because it became empty.
    pub room_closed: bool,
}

pub struct RoomManager {
    controller_id: String,
    pool: Arc<EnginePool>,
    notifier: Notifications,
    rooms: DashMap<String, Arc<Room>>,
    /// participant id -> room name
    participant_index: DashMap<String, String>,
    event_buffer: usize,
    release_timeout: Duration,
    cancel: CancellationToken,
}

impl RoomManager {
    #[must_use]
    pub fn new(pool: Arc<EnginePool>, notifier: Arc<dyn RoomNotifier>) -> Self {
        Self {
            controller_id: DEFAULT_CONTROLLER_ID.to_string(),
            pool,
            notifier: Notifications::new(notifier),
            rooms: DashMap::new(),
            participant_index: DashMap::new(),
            event_buffer: DEFAULT_EVENT_CHANNEL_BUFFER,
            release_timeout: Duration::from_secs(DEFAULT_RELEASE_TIMEOUT_SECONDS),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config, pool: Arc<EnginePool>, notifier: Arc<dyn RoomNotifier>) -> Self {
        Self::new(pool, notifier)
            .with_controller_id(config.controller_id.clone())
            .with_event_buffer(config.event_channel_buffer)
            .with_release_timeout(config.release_timeout())
    }

    /// Identity of this controller in logs.
    #[must_use]
    pub fn with_controller_id(mut self, controller_id: impl Into<String>) -> Self {
        self.controller_id = controller_id.into();
        self
    }

    #[must_use]
    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    #[must_use]
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }

    #[must_use]
    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<EnginePool> {
        &self.pool
    }

    /// Token cancelled by [`RoomManager::close_all`].
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    #[must_use]
    pub fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.get(name).map(|r| Arc::clone(r.value()))
    }

    fn existing_room(&self, name: &str) -> Result<Arc<Room>, RoomError> {
        self.room(name)
            .ok_or_else(|| RoomError::RoomNotFound(name.to_string()))
    }

    /// Resolve a participant id to its room and participant.
    fn resolve(&self, participant_id: &str) -> Result<(Arc<Room>, Arc<Participant>), RoomError> {
        let room_name = self
            .participant_index
            .get(participant_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RoomError::ParticipantNotFound(participant_id.to_string()))?;
        let room = self.existing_room(&room_name)?;
        let participant = room
            .participant(participant_id)
            .ok_or_else(|| RoomError::ParticipantNotFound(participant_id.to_string()))?;
        Ok((room, participant))
    }

    fn peer(room: &Room, name: &str) -> Result<Arc<Participant>, RoomError> {
        room.participant_by_name(name)
            .ok_or_else(|| RoomError::PeerNotFound {
                peer: name.to_string(),
                room: room.name().to_string(),
            })
    }

    fn others(room: &Room, participant_id: &str) -> Vec<String> {
        room.participant_ids()
            .into_iter()
            .filter(|id| id != participant_id)
            .collect()
    }

    fn update_room_gauge(&self) {
        metrics::set_rooms_active(self.rooms.len());
    }

    // ------------------------------------------------------------------
    // Room lifecycle
    // ------------------------------------------------------------------

    /// Resolve a room, creating it if absent. Returns whether this call
    /// created it.
    async fn resolve_or_create(&self, name: &str, requester: &str) -> Result<(Arc<Room>, bool), RoomError> {
        if name.is_empty() {
            return Err(RoomError::InvalidArgument(
                "room name must not be empty".to_string(),
            ));
        }
        if let Some(room) = self.room(name) {
            if !room.is_closing() {
                return Ok((room, false));
            }
        }

        let engine = self.pool.pick_for_new_room(requester)?;
        let candidate = Room::start(
            name,
            Arc::clone(&engine),
            self.notifier.clone(),
            self.event_buffer,
            self.cancel.child_token(),
        );

        let (room, created) = match self.rooms.entry(name.to_string()) {
            // A closing room is on its way out; take its place.
            Entry::Occupied(mut existing) if existing.get().is_closing() => {
                existing.insert(Arc::clone(&candidate));
                (Arc::clone(&candidate), true)
            }
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&candidate));
                (Arc::clone(&candidate), true)
            }
        };

        if created {
            self.update_room_gauge();
            info!(
                target: "room.manager",
                controller = %self.controller_id,
                room = %name,
                engine = %engine.id(),
                "Room created"
            );
            self.notifier.room_created(name, requester);
        } else {
            candidate.discard();
            debug!(target: "room.manager", room = %name, "Lost room creation race");
        }
        Ok((room, created))
    }

    /// Resolve a room, creating it on behalf of `requester` if absent.
    #[instrument(skip_all, fields(room = %name))]
    pub async fn get_or_create_room(&self, name: &str, requester: &str) -> Result<Arc<Room>, RoomError> {
        self.resolve_or_create(name, requester)
            .await
            .map(|(room, _)| room)
    }

    /// Create an empty room. Returns `false` if it already exists.
    #[instrument(skip_all, fields(room = %name))]
    pub async fn create_room(&self, name: &str) -> Result<bool, RoomError> {
        if self.room(name).is_some_and(|room| !room.is_closing()) {
            return Ok(false);
        }
        let (_, created) = self.resolve_or_create(name, "").await?;
        Ok(created)
    }

    /// Remove `room` from the registry (if it is still the registered one)
    /// and close it. The caller must have claimed the room's closure.
    async fn remove_room(&self, room: &Arc<Room>) {
        self.rooms
            .remove_if(room.name(), |_, current| Arc::ptr_eq(current, room));
        room.close().await;
        self.update_room_gauge();
    }

    // ------------------------------------------------------------------
    // Participant operations
    // ------------------------------------------------------------------

    /// Join `room_name` as `user_name`, creating the room if needed.
    #[instrument(
        skip_all,
        fields(controller = %self.controller_id, room = %room_name, participant_id = %participant_id)
    )]
    pub async fn join_room(
        &self,
        participant_id: &str,
        user_name: &str,
        room_name: &str,
    ) -> Result<JoinOutcome, RoomError> {
        match self.participant_index.entry(participant_id.to_string()) {
            Entry::Occupied(existing) => {
                return Err(RoomError::Conflict(format!(
                    "participant '{participant_id}' is already in room '{}'",
                    existing.get()
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(room_name.to_string());
            }
        }

        let result = self.join_resolved(participant_id, user_name, room_name).await;
        if result.is_err() {
            self.participant_index
                .remove_if(participant_id, |_, room| room == room_name);
        }
        result
    }

    async fn join_resolved(
        &self,
        participant_id: &str,
        user_name: &str,
        room_name: &str,
    ) -> Result<JoinOutcome, RoomError> {
        let mut attempt = 1;
        loop {
            let (room, created) = self.resolve_or_create(room_name, user_name).await?;
            match room.join(participant_id, user_name).await {
                Err(RoomError::RoomClosed(_)) if room.is_closing() && attempt < JOIN_ATTEMPTS => {
                    debug!(
                        target: "room.manager",
                        room = %room_name,
                        attempt,
                        "Room closed under join, retrying"
                    );
                    attempt += 1;
                }
                joined => return self.finish_join(&room, created, participant_id, joined).await,
            }
        }
    }

    async fn finish_join(
        &self,
        room: &Arc<Room>,
        created: bool,
        participant_id: &str,
        joined: Result<(Arc<Participant>, Vec<ParticipantInfo>), RoomError>,
    ) -> Result<JoinOutcome, RoomError> {
        let room_name = room.name();
        match joined {
            Ok((participant, existing)) => {
                let info = participant.info();
                self.notifier.participant_joined(room.name(), &info, &existing);
                info!(
                    target: "room.manager",
                    room = %room_name,
                    participant_id = %participant_id,
                    peers = existing.len(),
                    "Participant joined"
                );
                Ok(JoinOutcome {
                    room: room_name.to_string(),
                    participant: info,
                    existing,
                    created_room: created,
                })
            }
            Err(e) => {
                if (created || room.was_populated()) && room.try_claim_empty() {
                    debug!(
                        target: "room.manager",
                        room = %room_name,
                        "Removing room left empty by failed join"
                    );
                    self.remove_room(room).await;
                }
                Err(e)
            }
        }
    }

    /// Leave the room. Closes and removes the room if it becomes empty.
    #[instrument(skip_all, fields(participant_id = %participant_id))]
    pub async fn leave_room(&self, participant_id: &str) -> Result<LeaveOutcome, RoomError> {
        let (room, participant) = self.resolve(participant_id)?;
        let empty = room.leave(participant_id).await?;
        self.participant_index.remove(participant_id);

        let remaining = room.participant_ids();
        self.notifier
            .participant_left(room.name(), participant.name(), &remaining);
        if empty {
            self.remove_room(&room).await;
        }

        info!(
            target: "room.manager",
            room = %room.name(),
            participant_id = %participant_id,
            room_closed = empty,
            "Participant left"
        );
        Ok(LeaveOutcome {
            room: room.name().to_string(),
            name: participant.name().to_string(),
            remaining,
            room_closed: empty,
        })
    }

    /// Create the publisher, apply `stages`, publish and announce the stream.
    #[instrument(skip_all, fields(participant_id = %participant_id, loopback = loopback))]
    pub async fn publish_media(
        &self,
        participant_id: &str,
        offer: &str,
        loopback: bool,
        stages: Vec<ElementHandle>,
    ) -> Result<String, RoomError> {
        let (room, participant) = self.resolve(participant_id)?;
        let answer = participant
            .publish_with_stages(offer, loopback, stages)
            .await?;

        self.notifier.stream_published(
            room.name(),
            participant.name(),
            &Self::others(&room, participant_id),
        );
        room.new_publisher(&participant);
        Ok(answer)
    }

    #[instrument(skip_all, fields(participant_id = %participant_id))]
    pub async fn unpublish_media(&self, participant_id: &str) -> Result<(), RoomError> {
        let (room, participant) = self.resolve(participant_id)?;
        participant.unpublish().await?;
        room.cancel_publisher(&participant).await;
        self.notifier.stream_unpublished(
            room.name(),
            participant.name(),
            &Self::others(&room, participant_id),
        );
        Ok(())
    }

    /// Receive `remote_name`'s stream.
    #[instrument(skip_all, fields(participant_id = %participant_id, remote = %remote_name))]
    pub async fn subscribe(&self, participant_id: &str, remote_name: &str, offer: &str) -> Result<String, RoomError> {
        let (room, participant) = self.resolve(participant_id)?;
        let sender = Self::peer(&room, remote_name)?;
        participant
            .receive_from(&sender, offer)
            .await?
            .ok_or_else(|| {
                RoomError::NoAnswer(format!(
                    "'{}' receiving from '{remote_name}'",
                    participant.name()
                ))
            })
    }

    #[instrument(skip_all, fields(participant_id = %participant_id, remote = %remote_name))]
    pub async fn unsubscribe(&self, participant_id: &str, remote_name: &str) -> Result<(), RoomError> {
        let (room, participant) = self.resolve(participant_id)?;
        Self::peer(&room, remote_name)?;
        participant.cancel_receiving(remote_name).await;
        Ok(())
    }

    /// Broadcast a chat message to the whole room, sender included.
    pub async fn send_message(
        &self,
        participant_id: &str,
        user_name: &str,
        room_name: &str,
        message: &str,
    ) -> Result<(), RoomError> {
        let (room, participant) = self.resolve(participant_id)?;
        if participant.name() != user_name || room.name() != room_name {
            return Err(RoomError::PeerNotFound {
                peer: user_name.to_string(),
                room: room_name.to_string(),
            });
        }
        self.notifier
            .message_broadcast(room.name(), user_name, message, &room.participant_ids());
        Ok(())
    }

    /// Route a client candidate to one of the participant's endpoints.
    pub async fn on_ice_candidate(
        &self,
        participant_id: &str,
        endpoint_name: &str,
        candidate: IceCandidate,
    ) -> Result<(), RoomError> {
        let (_, participant) = self.resolve(participant_id)?;
        participant.add_ice_candidate(endpoint_name, candidate).await
    }

    pub async fn mute_published_media(&self, participant_id: &str, kind: MuteKind) -> Result<(), RoomError> {
        let (_, participant) = self.resolve(participant_id)?;
        if !participant.is_streaming() {
            return Err(RoomError::NotStreaming(participant.name().to_string()));
        }
        participant.mute_published(kind).await
    }

    pub async fn unmute_published_media(&self, participant_id: &str) -> Result<(), RoomError> {
        let (_, participant) = self.resolve(participant_id)?;
        if !participant.is_streaming() {
            return Err(RoomError::NotStreaming(participant.name().to_string()));
        }
        participant.unmute_published().await
    }

    pub async fn mute_subscribed_media(
        &self,
        participant_id: &str,
        remote_name: &str,
        kind: MuteKind,
    ) -> Result<(), RoomError> {
        let (room, participant) = self.resolve(participant_id)?;
        Self::peer(&room, remote_name)?;
        participant.mute_subscribed(remote_name, kind).await
    }

    pub async fn unmute_subscribed_media(&self, participant_id: &str, remote_name: &str) -> Result<(), RoomError> {
        let (room, participant) = self.resolve(participant_id)?;
        Self::peer(&room, remote_name)?;
        participant.unmute_subscribed(remote_name).await
    }

    /// Splice a processing stage into the participant's outbound chain.
    pub async fn add_media_element(&self, participant_id: &str, stage: ElementHandle) -> Result<(), RoomError> {
        let (_, participant) = self.resolve(participant_id)?;
        participant.add_stage(stage).await
    }

    pub async fn remove_media_element(&self, participant_id: &str, stage_id: &str) -> Result<(), RoomError> {
        let (_, participant) = self.resolve(participant_id)?;
        participant.remove_stage(stage_id).await
    }

    // ------------------------------------------------------------------
    // Administrative operations
    // ------------------------------------------------------------------

    /// Evict everyone and close the room.
    ///
    /// # Errors
    ///
    /// - `RoomError::RoomNotFound` - no such room
    /// - `RoomError::RoomClosed` - already closed
    #[instrument(skip_all, fields(controller = %self.controller_id, room = %name))]
    pub async fn close_room(&self, name: &str) -> Result<Vec<String>, RoomError> {
        let room = self.existing_room(name)?;
        if !room.begin_close() {
            return Err(RoomError::RoomClosed(name.to_string()));
        }

        let mut evicted = Vec::new();
        for participant_id in room.participant_ids() {
            match room.leave(&participant_id).await {
                Ok(_) => evicted.push(participant_id.clone()),
                Err(e) => {
                    warn!(
                        target: "room.manager",
                        room = %name,
                        participant_id = %participant_id,
                        error = %e,
                        "Could not evict participant"
                    );
                }
            }
            self.participant_index.remove(&participant_id);
        }

        self.notifier.room_closed(name, &evicted);
        for participant_id in &evicted {
            self.notifier.participant_evicted(name, participant_id);
        }
        self.remove_room(&room).await;

        info!(
            target: "room.manager",
            room = %name,
            evicted = evicted.len(),
            "Room closed"
        );
        Ok(evicted)
    }

    /// Forcibly remove one participant.
    #[instrument(skip_all, fields(participant_id = %participant_id))]
    pub async fn evict_participant(&self, participant_id: &str) -> Result<(), RoomError> {
        let (room, participant) = self.resolve(participant_id)?;
        let empty = room.leave(participant_id).await?;
        self.participant_index.remove(participant_id);

        self.notifier.participant_evicted(room.name(), participant_id);
        if empty {
            self.notifier.room_closed(room.name(), &[]);
            self.remove_room(&room).await;
        } else {
            self.notifier
                .participant_left(room.name(), participant.name(), &room.participant_ids());
        }

        info!(
            target: "room.manager",
            room = %room.name(),
            participant_id = %participant_id,
            "Participant evicted"
        );
        Ok(())
    }

    /// Close every room, tolerating individual failures, then cancel the
    /// manager's token.
    pub async fn close_all(&self) {
        let names = self.rooms();
        info!(
            target: "room.manager",
            controller = %self.controller_id,
            rooms = names.len(),
            "Closing all rooms"
        );
        for name in names {
            match tokio::time::timeout(self.release_timeout, self.close_room(&name)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(target: "room.manager", room = %name, error = %e, "Could not close room");
                }
                Err(_) => {
                    warn!(target: "room.manager", room = %name, "Timed out closing room");
                }
            }
        }
        self.cancel.cancel();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Names of all registered rooms, sorted.
    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn participants(&self, room_name: &str) -> Result<Vec<ParticipantInfo>, RoomError> {
        Ok(self.existing_room(room_name)?.participant_infos())
    }

    /// Participants currently streaming.
    pub fn publishers(&self, room_name: &str) -> Result<Vec<ParticipantInfo>, RoomError> {
        Ok(self
            .existing_room(room_name)?
            .participant_infos()
            .into_iter()
            .filter(|p| p.streaming)
            .collect())
    }

    /// Participants receiving at least one stream.
    pub async fn subscribers(&self, room_name: &str) -> Result<Vec<ParticipantInfo>, RoomError> {
        let room = self.existing_room(room_name)?;
        let mut subscribers = Vec::new();
        for participant in room.participants() {
            if !participant.receiving_from().await.is_empty() {
                subscribers.push(participant.info());
            }
        }
        subscribers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(subscribers)
    }

    /// Other streaming participants in the participant's room.
    pub fn peer_publishers(&self, participant_id: &str) -> Result<Vec<ParticipantInfo>, RoomError> {
        let (room, _) = self.resolve(participant_id)?;
        Ok(room
            .participant_infos()
            .into_iter()
            .filter(|p| p.streaming && p.id != participant_id)
            .collect())
    }

    /// Other participants receiving this participant's stream.
    pub async fn peer_subscribers(&self, participant_id: &str) -> Result<Vec<ParticipantInfo>, RoomError> {
        let (room, participant) = self.resolve(participant_id)?;
        let mut subscribers = Vec::new();
        for peer in room.participants() {
            if peer.id() == participant_id {
                continue;
            }
            if peer
                .receiving_from()
                .await
                .iter()
                .any(|name| name == participant.name())
            {
                subscribers.push(peer.info());
            }
        }
        subscribers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(subscribers)
    }

    pub fn room_info(&self, room_name: &str) -> Result<RoomInfo, RoomError> {
        Ok(self.existing_room(room_name)?.info())
    }
}
