//! Upward notifications.
//!
//! The control plane never talks to clients directly. Every observable event
//! goes through one [`RoomNotifier`] call; the embedding transport layer
//! decides how to deliver it. Calls are synchronous and must not block.

use crate::engine::IceCandidate;
use crate::observability::metrics;
use crate::participant::ParticipantInfo;
use std::sync::Arc;
use tracing::trace;

/// Receiver of room events. Participant ids identify recipients.
pub trait RoomNotifier: Send + Sync {
    /// A room was created on behalf of `requester`.
    fn room_created(&self, room: &str, requester: &str);

    /// `joined` entered `room`, which already held `existing`.
    fn participant_joined(&self, room: &str, joined: &ParticipantInfo, existing: &[ParticipantInfo]);

    /// `name` left `room`; `remaining` are the ids still inside.
    fn participant_left(&self, room: &str, name: &str, remaining: &[String]);

    /// `publisher` started streaming; `recipients` excludes the publisher.
    fn stream_published(&self, room: &str, publisher: &str, recipients: &[String]);

    /// `publisher` stopped streaming; `recipients` excludes the publisher.
    fn stream_unpublished(&self, room: &str, publisher: &str, recipients: &[String]);

    /// `sender` broadcast `message`; `recipients` includes the sender.
    fn message_broadcast(&self, room: &str, sender: &str, message: &str, recipients: &[String]);

    /// The engine gathered a local candidate for one of `participant_id`'s
    /// endpoints.
    fn candidate_forwarded(&self, participant_id: &str, endpoint_name: &str, candidate: &IceCandidate);

    /// `room` was closed; `participants` were inside.
    fn room_closed(&self, room: &str, participants: &[String]);

    /// `participant_id` was forcibly removed from `room`.
    fn participant_evicted(&self, room: &str, participant_id: &str);

    /// The room's pipeline failed.
    fn pipeline_error(&self, room: &str, participants: &[String], description: &str);

    /// One of `participant_id`'s elements failed.
    fn element_error(&self, participant_id: &str, description: &str);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl RoomNotifier for NoopNotifier {
    fn room_created(&self, _room: &str, _requester: &str) {}
    fn participant_joined(&self, _room: &str, _joined: &ParticipantInfo, _existing: &[ParticipantInfo]) {}
    fn participant_left(&self, _room: &str, _name: &str, _remaining: &[String]) {}
    fn stream_published(&self, _room: &str, _publisher: &str, _recipients: &[String]) {}
    fn stream_unpublished(&self, _room: &str, _publisher: &str, _recipients: &[String]) {}
    fn message_broadcast(&self, _room: &str, _sender: &str, _message: &str, _recipients: &[String]) {}
    fn candidate_forwarded(&self, _participant_id: &str, _endpoint_name: &str, _candidate: &IceCandidate) {}
    fn room_closed(&self, _room: &str, _participants: &[String]) {}
    fn participant_evicted(&self, _room: &str, _participant_id: &str) {}
    fn pipeline_error(&self, _room: &str, _participants: &[String], _description: &str) {}
    fn element_error(&self, _participant_id: &str, _description: &str) {}
}

/// Shared notifier wrapper that counts every event.
#[derive(Clone)]
pub(crate) struct Notifications {
    inner: Arc<dyn RoomNotifier>,
}

impl Notifications {
    pub(crate) fn new(inner: Arc<dyn RoomNotifier>) -> Self {
        Self { inner }
    }

    fn record(event: &'static str) {
        metrics::record_notification(event);
        trace!(target: "room.notify", event, "Notification");
    }

    pub(crate) fn room_created(&self, room: &str, requester: &str) {
        Self::record("room_created");
        self.inner.room_created(room, requester);
    }

    pub(crate) fn participant_joined(&self, room: &str, joined: &ParticipantInfo, existing: &[ParticipantInfo]) {
        Self::record("participant_joined");
        self.inner.participant_joined(room, joined, existing);
    }

    pub(crate) fn participant_left(&self, room: &str, name: &str, remaining: &[String]) {
        Self::record("participant_left");
        self.inner.participant_left(room, name, remaining);
    }

    pub(crate) fn stream_published(&self, room: &str, publisher: &str, recipients: &[String]) {
        Self::record("stream_published");
        self.inner.stream_published(room, publisher, recipients);
    }

    pub(crate) fn stream_unpublished(&self, room: &str, publisher: &str, recipients: &[String]) {
        Self::record("stream_unpublished");
        self.inner.stream_unpublished(room, publisher, recipients);
    }

    pub(crate) fn message_broadcast(&self, room: &str, sender: &str, message: &str, recipients: &[String]) {
        Self::record("message_broadcast");
        self.inner.message_broadcast(room, sender, message, recipients);
    }

    pub(crate) fn candidate_forwarded(&self, participant_id: &str, endpoint_name: &str, candidate: &IceCandidate) {
        Self::record("candidate_forwarded");
        self.inner
            .candidate_forwarded(participant_id, endpoint_name, candidate);
    }

    pub(crate) fn room_closed(&self, room: &str, participants: &[String]) {
        Self::record("room_closed");
        self.inner.room_closed(room, participants);
    }

    pub(crate) fn participant_evicted(&self, room: &str, participant_id: &str) {
        Self::record("participant_evicted");
        self.inner.participant_evicted(room, participant_id);
    }

    pub(crate) fn pipeline_error(&self, room: &str, participants: &[String], description: &str) {
        Self::record("pipeline_error");
        self.inner.pipeline_error(room, participants, description);
    }

    pub(crate) fn element_error(&self, participant_id: &str, description: &str) {
        Self::record("element_error");
        self.inner.element_error(participant_id, description);
    }
}
