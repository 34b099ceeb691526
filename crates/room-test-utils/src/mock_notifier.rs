//! Recording notifier.
//!
//! Captures every upward notification so tests can assert on who was told
//! what, in order.

use room_controller::engine::IceCandidate;
use room_controller::{ParticipantInfo, RoomNotifier};
use std::sync::Mutex;

/// One captured notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    RoomCreated {
        room: String,
        requester: String,
    },
    ParticipantJoined {
        room: String,
        joined: ParticipantInfo,
        existing: Vec<ParticipantInfo>,
    },
    ParticipantLeft {
        room: String,
        name: String,
        remaining: Vec<String>,
    },
    StreamPublished {
        room: String,
        publisher: String,
        recipients: Vec<String>,
    },
    StreamUnpublished {
        room: String,
        publisher: String,
        recipients: Vec<String>,
    },
    MessageBroadcast {
        room: String,
        sender: String,
        message: String,
        recipients: Vec<String>,
    },
    CandidateForwarded {
        participant_id: String,
        endpoint_name: String,
        candidate: IceCandidate,
    },
    RoomClosed {
        room: String,
        participants: Vec<String>,
    },
    ParticipantEvicted {
        room: String,
        participant_id: String,
    },
    PipelineError {
        room: String,
        participants: Vec<String>,
        description: String,
    },
    ElementError {
        participant_id: String,
        description: String,
    },
}

impl NotifierEvent {
    /// Short name of the variant, for counting.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            NotifierEvent::RoomCreated { .. } => "room_created",
            NotifierEvent::ParticipantJoined { .. } => "participant_joined",
            NotifierEvent::ParticipantLeft { .. } => "participant_left",
            NotifierEvent::StreamPublished { .. } => "stream_published",
            NotifierEvent::StreamUnpublished { .. } => "stream_unpublished",
            NotifierEvent::MessageBroadcast { .. } => "message_broadcast",
            NotifierEvent::CandidateForwarded { .. } => "candidate_forwarded",
            NotifierEvent::RoomClosed { .. } => "room_closed",
            NotifierEvent::ParticipantEvicted { .. } => "participant_evicted",
            NotifierEvent::PipelineError { .. } => "pipeline_error",
            NotifierEvent::ElementError { .. } => "element_error",
        }
    }
}

/// Notifier that records every call.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifierEvent>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: NotifierEvent) {
        self.events.lock().unwrap().push(event);
    }

    /// Everything recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<NotifierEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Number of recorded events named `name` (see [`NotifierEvent::name`]).
    #[must_use]
    pub fn count_of(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    /// Recorded events named `name`.
    #[must_use]
    pub fn events_named(&self, name: &str) -> Vec<NotifierEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl RoomNotifier for RecordingNotifier {
    fn room_created(&self, room: &str, requester: &str) {
        self.push(NotifierEvent::RoomCreated {
            room: room.to_string(),
            requester: requester.to_string(),
        });
    }

    fn participant_joined(&self, room: &str, joined: &ParticipantInfo, existing: &[ParticipantInfo]) {
        self.push(NotifierEvent::ParticipantJoined {
            room: room.to_string(),
            joined: joined.clone(),
            existing: existing.to_vec(),
        });
    }

    fn participant_left(&self, room: &str, name: &str, remaining: &[String]) {
        self.push(NotifierEvent::ParticipantLeft {
            room: room.to_string(),
            name: name.to_string(),
            remaining: remaining.to_vec(),
        });
    }

    fn stream_published(&self, room: &str, publisher: &str, recipients: &[String]) {
        self.push(NotifierEvent::StreamPublished {
            room: room.to_string(),
            publisher: publisher.to_string(),
            recipients: recipients.to_vec(),
        });
    }

    fn stream_unpublished(&self, room: &str, publisher: &str, recipients: &[String]) {
        self.push(NotifierEvent::StreamUnpublished {
            room: room.to_string(),
            publisher: publisher.to_string(),
            recipients: recipients.to_vec(),
        });
    }

    fn message_broadcast(&self, room: &str, sender: &str, message: &str, recipients: &[String]) {
        self.push(NotifierEvent::MessageBroadcast {
            room: room.to_string(),
            sender: sender.to_string(),
            message: message.to_string(),
            recipients: recipients.to_vec(),
        });
    }

    fn candidate_forwarded(&self, participant_id: &str, endpoint_name: &str, candidate: &IceCandidate) {
        self.push(NotifierEvent::CandidateForwarded {
            participant_id: participant_id.to_string(),
            endpoint_name: endpoint_name.to_string(),
            candidate: candidate.clone(),
        });
    }

    fn room_closed(&self, room: &str, participants: &[String]) {
        self.push(NotifierEvent::RoomClosed {
            room: room.to_string(),
            participants: participants.to_vec(),
        });
    }

    fn participant_evicted(&self, room: &str, participant_id: &str) {
        self.push(NotifierEvent::ParticipantEvicted {
            room: room.to_string(),
            participant_id: participant_id.to_string(),
        });
    }

    fn pipeline_error(&self, room: &str, participants: &[String], description: &str) {
        self.push(NotifierEvent::PipelineError {
            room: room.to_string(),
            participants: participants.to_vec(),
            description: description.to_string(),
        });
    }

    fn element_error(&self, participant_id: &str, description: &str) {
        self.push(NotifierEvent::ElementError {
            participant_id: participant_id.to_string(),
            description: description.to_string(),
        });
    }
}
