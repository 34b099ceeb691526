//! Room.
//!
//! A room owns the participants that joined it and, once the first join
//! succeeds, one engine pipeline. The pipeline is created exactly once through
//! a `OnceCell`; concurrent first joins wait for the same creation.
//!
//! Membership is tracked by one atomic word that counts admitted and
//! in-flight joins, or holds `CLOSING` once somebody has claimed the room's
//! closure. Claiming happens at the decision point (the last leave, an
//! administrative close) so a join can never slip into a room that is about
//! to be torn down.
//!
//! Each room also runs an engine event pump: a task that drains the room's
//! bounded engine event channel and forwards candidates and errors upward
//! until the room's cancellation token fires.

use crate::engine::{
    release_pipeline_in_background, EngineEvent, EngineInstance, MediaEngine, PipelineHandle,
};
use crate::errors::RoomError;
use crate::notify::Notifications;
use crate::observability::metrics;
use crate::participant::{Participant, ParticipantInfo};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Membership word value once the room's closure has been claimed.
const CLOSING: usize = usize::MAX;

/// Room summary for administrative queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomInfo {
    pub name: String,
    pub engine_id: String,
    pub participants: usize,
    pub publishers: usize,
    pub has_pipeline: bool,
    pub created_at: DateTime<Utc>,
}

pub struct Room {
    name: String,
    engine: Arc<EngineInstance>,
    notifier: Notifications,
    pipeline: OnceCell<PipelineHandle>,
    pipeline_released: AtomicBool,
    participants: DashMap<String, Arc<Participant>>,
    /// display name -> participant id
    names: DashMap<String, String>,
    active_publishers: AtomicUsize,
    /// Admitted plus joining participants, or `CLOSING`.
    members: AtomicUsize,
    populated: AtomicBool,
    closed: AtomicBool,
    created_at: DateTime<Utc>,
    events_tx: mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("engine", &self.engine.id())
            .field("participants", &self.participants.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Room {
    /// Create a room and start its event pump.
    ///
    /// `cancel` should be a child of the manager's token so shutdown reaches
    /// every pump.
    pub(crate) fn start(
        name: impl Into<String>,
        engine: Arc<EngineInstance>,
        notifier: Notifications,
        event_buffer: usize,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(event_buffer.max(1));
        let room = Arc::new(Self {
            name: name.into(),
            engine,
            notifier,
            pipeline: OnceCell::new(),
            pipeline_released: AtomicBool::new(false),
            participants: DashMap::new(),
            names: DashMap::new(),
            active_publishers: AtomicUsize::new(0),
            members: AtomicUsize::new(0),
            populated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            created_at: Utc::now(),
            events_tx,
            cancel,
        });

        tokio::spawn(run_event_pump(
            Arc::downgrade(&room),
            events_rx,
            room.cancel.clone(),
        ));
        room
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<EngineInstance> {
        &self.engine
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the room's closure has been claimed. A closing room admits
    /// nobody, even before [`Room::close`] has run.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.members.load(Ordering::SeqCst) == CLOSING || self.is_closed()
    }

    /// Whether anybody ever joined successfully.
    #[must_use]
    pub fn was_populated(&self) -> bool {
        self.populated.load(Ordering::SeqCst)
    }

    /// Claim the room's closure. Returns `false` if it was already claimed.
    pub(crate) fn begin_close(&self) -> bool {
        self.members.swap(CLOSING, Ordering::SeqCst) != CLOSING
    }

    /// Claim the closure of a room nobody is in or joining.
    pub(crate) fn try_claim_empty(&self) -> bool {
        self.members
            .compare_exchange(0, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn reserve_slot(&self) -> bool {
        self.members
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n != CLOSING).then(|| n.saturating_add(1))
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .members
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n != CLOSING).then(|| n.saturating_sub(1))
            });
    }

    /// Give up a departing member's slot, claiming closure if it was the
    /// last one. Returns whether closure was claimed here.
    fn vacate_slot(&self) -> bool {
        let previous = self
            .members
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                CLOSING => None,
                0 | 1 => Some(CLOSING),
                n => Some(n - 1),
            });
        matches!(previous, Ok(0 | 1))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    #[must_use]
    pub fn pipeline(&self) -> Option<&PipelineHandle> {
        self.pipeline.get()
    }

    #[must_use]
    pub fn active_publishers(&self) -> usize {
        self.active_publishers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn participant(&self, participant_id: &str) -> Option<Arc<Participant>> {
        self.participants
            .get(participant_id)
            .map(|p| Arc::clone(p.value()))
    }

    #[must_use]
    pub fn participant_by_name(&self, name: &str) -> Option<Arc<Participant>> {
        let id = self.names.get(name).map(|id| id.value().clone())?;
        self.participant(&id)
    }

    #[must_use]
    pub fn participants(&self) -> Vec<Arc<Participant>> {
        self.participants
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[must_use]
    pub fn participant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.participants.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn participant_infos(&self) -> Vec<ParticipantInfo> {
        let mut infos: Vec<ParticipantInfo> = self
            .participants
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    #[must_use]
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            name: self.name.clone(),
            engine_id: self.engine.id().to_string(),
            participants: self.participants.len(),
            publishers: self.active_publishers(),
            has_pipeline: self.pipeline.initialized(),
            created_at: self.created_at,
        }
    }

    fn engine_dyn(&self) -> Arc<dyn MediaEngine> {
        self.engine.clone()
    }

    async fn ensure_pipeline(&self) -> Result<PipelineHandle, RoomError> {
        let pipeline = self
            .pipeline
            .get_or_try_init(|| async {
                let pipeline = self
                    .engine
                    .create_pipeline(self.events_tx.clone())
                    .await
                    .inspect_err(|_| metrics::record_engine_error("create_pipeline"))?;
                metrics::record_pipeline_created();
                info!(
                    target: "room.room",
                    room = %self.name,
                    engine = %self.engine.id(),
                    pipeline = %pipeline,
                    "Room pipeline created"
                );
                Ok::<_, RoomError>(pipeline)
            })
            .await?;
        Ok(pipeline.clone())
    }

    /// Admit a participant and return it with the peers already present.
    ///
    /// A failed join leaves no registered participant or reserved name.
    #[instrument(skip_all, fields(room = %self.name, participant_id = %participant_id))]
    pub async fn join(
        &self,
        participant_id: &str,
        name: &str,
    ) -> Result<(Arc<Participant>, Vec<ParticipantInfo>), RoomError> {
        if self.is_closing() {
            return Err(RoomError::RoomClosed(self.name.clone()));
        }
        if name.is_empty() {
            return Err(RoomError::InvalidArgument(
                "participant name must not be empty".to_string(),
            ));
        }
        if self.participants.contains_key(participant_id) {
            return Err(RoomError::Conflict(format!(
                "participant '{participant_id}' already in room '{}'",
                self.name
            )));
        }

        match self.names.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(RoomError::Conflict(format!(
                    "'{name}' is already in room '{}'",
                    self.name
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(participant_id.to_string());
            }
        }

        if !self.reserve_slot() {
            self.names.remove_if(name, |_, id| id == participant_id);
            return Err(RoomError::RoomClosed(self.name.clone()));
        }

        match self.admit(participant_id, name).await {
            Ok(joined) => Ok(joined),
            Err(e) => {
                self.names.remove_if(name, |_, id| id == participant_id);
                self.release_slot();
                Err(e)
            }
        }
    }

    async fn admit(
        &self,
        participant_id: &str,
        name: &str,
    ) -> Result<(Arc<Participant>, Vec<ParticipantInfo>), RoomError> {
        let pipeline = self.ensure_pipeline().await?;
        if self.is_closing() {
            if self.is_closed() {
                self.release_pipeline();
            }
            return Err(RoomError::RoomClosed(self.name.clone()));
        }

        let existing = self.participant_infos();
        let participant = Arc::new(Participant::new(
            participant_id,
            name,
            self.name.clone(),
            self.engine_dyn(),
            pipeline,
        ));

        match self.participants.entry(participant_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(RoomError::Conflict(format!(
                    "participant '{participant_id}' already in room '{}'",
                    self.name
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&participant));
            }
        }

        // Close raced the insert: undo so nothing outlives the room.
        if self.is_closing() {
            self.participants
                .remove_if(participant_id, |_, current| Arc::ptr_eq(current, &participant));
            participant.close().await;
            return Err(RoomError::RoomClosed(self.name.clone()));
        }
        self.populated.store(true, Ordering::SeqCst);

        for peer in self.participants() {
            if peer.id() != participant_id && peer.is_streaming() {
                participant.ensure_placeholder(peer.name());
            }
        }

        metrics::participant_joined();
        debug!(
            target: "room.room",
            room = %self.name,
            participant_id = %participant_id,
            peers = existing.len(),
            "Participant joined"
        );
        Ok((participant, existing))
    }

    /// Remove a participant and tear down every link to it.
    ///
    /// Returns whether this departure emptied the room. In that case the
    /// room's closure has been claimed and the caller must close it.
    #[instrument(skip_all, fields(room = %self.name, participant_id = %participant_id))]
    pub async fn leave(&self, participant_id: &str) -> Result<bool, RoomError> {
        let (_, participant) = self
            .participants
            .remove(participant_id)
            .ok_or_else(|| RoomError::ParticipantNotFound(participant_id.to_string()))?;
        self.names
            .remove_if(participant.name(), |_, id| id == participant_id);

        for peer in self.participants() {
            peer.drop_link(participant.name()).await;
        }
        if participant.is_streaming() {
            self.deregister_publisher();
        }
        let emptied = self.vacate_slot();
        participant.close().await;
        metrics::participant_left();

        debug!(
            target: "room.room",
            room = %self.name,
            participant_id = %participant_id,
            remaining = self.participants.len(),
            emptied,
            "Participant left"
        );
        Ok(emptied)
    }

    /// Record a new publisher and pre-create placeholder links to it.
    pub fn new_publisher(&self, publisher: &Participant) {
        self.active_publishers.fetch_add(1, Ordering::SeqCst);
        metrics::publisher_registered();
        for peer in self.participants() {
            if peer.id() != publisher.id() {
                peer.ensure_placeholder(publisher.name());
            }
        }
        debug!(
            target: "room.room",
            room = %self.name,
            publisher = %publisher.name(),
            publishers = self.active_publishers(),
            "Publisher registered"
        );
    }

    /// Forget a publisher and tear down every link to it.
    pub async fn cancel_publisher(&self, publisher: &Participant) {
        self.deregister_publisher();
        for peer in self.participants() {
            if peer.id() != publisher.id() {
                peer.drop_link(publisher.name()).await;
            }
        }
    }

    fn deregister_publisher(&self) {
        let previous = self
            .active_publishers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous.is_ok() {
            metrics::publisher_deregistered();
        }
    }

    fn release_pipeline(&self) {
        if let Some(pipeline) = self.pipeline.get() {
            if !self.pipeline_released.swap(true, Ordering::SeqCst) {
                release_pipeline_in_background(self.engine_dyn(), pipeline.clone(), self.name.clone());
            }
        }
    }

    /// Close every participant, stop the event pump and release the pipeline.
    ///
    /// Idempotent: a second call is logged and returns.
    pub async fn close(&self) {
        self.members.store(CLOSING, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(target: "room.room", room = %self.name, "Redundant close");
            return;
        }

        let participants = self.participants();
        self.participants.clear();
        self.names.clear();
        for participant in participants {
            if participant.is_streaming() {
                self.deregister_publisher();
            }
            participant.close().await;
            metrics::participant_left();
        }

        self.cancel.cancel();
        self.release_pipeline();
        info!(target: "room.room", room = %self.name, "Room closed");
    }

    /// Stop a room that lost the creation race. It never had a pipeline.
    pub(crate) fn discard(&self) {
        self.members.store(CLOSING, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn dispatch(&self, event: EngineEvent) {
        match event {
            EngineEvent::CandidateGathered { tag, candidate } => {
                self.notifier
                    .candidate_forwarded(&tag.participant_id, &tag.endpoint_name, &candidate);
            }
            EngineEvent::ElementError { tag, description } => {
                warn!(
                    target: "room.room",
                    room = %self.name,
                    participant_id = %tag.participant_id,
                    endpoint = %tag.endpoint_name,
                    error = %description,
                    "Element error"
                );
                self.notifier.element_error(&tag.participant_id, &description);
            }
            EngineEvent::PipelineError { description } => {
                warn!(
                    target: "room.room",
                    room = %self.name,
                    error = %description,
                    "Pipeline error"
                );
                self.notifier
                    .pipeline_error(&self.name, &self.participant_ids(), &description);
            }
        }
    }
}

async fn run_event_pump(
    room: Weak<Room>,
    mut events: mpsc::Receiver<EngineEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(room) = room.upgrade() else { break };
                room.dispatch(event);
            }
        }
    }
    debug!(target: "room.room", "Engine event pump stopped");
}
