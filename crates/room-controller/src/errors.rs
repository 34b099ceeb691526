//! Room Controller error types.
//!
//! Error types map to the numeric room-service codes sent back to clients.
//! Engine internals are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use thiserror::Error;

/// Coarse error taxonomy used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Room, participant, peer or stage missing.
    NotFound,
    /// Duplicate display name, participant id or stage id.
    Conflict,
    /// No engine instance has room for new work.
    Capacity,
    /// Operation invalid for the current lifecycle state.
    State,
    /// The engine returned no usable result.
    Engine,
    /// Malformed request (empty names, loopback subscription).
    InvalidArgument,
    /// The tier policy refused the requester.
    Forbidden,
}

/// Room Controller error type.
///
/// Maps to room-service codes:
/// - `NoAnswer`: `SDP_ERROR` (101)
/// - `ParticipantNotFound`, `PeerNotFound`, `ParticipantClosed`: `USER_NOT_FOUND` (102)
/// - `RoomClosed`: `ROOM_CLOSED` (103)
/// - `Conflict`: `EXISTING_USER_IN_ROOM` (104)
/// - `CreationRefused`: `CANNOT_CREATE_ROOM` (105)
/// - `RoomNotFound`: `ROOM_NOT_FOUND` (106)
/// - `StageNotFound`, `DuplicateStage`, `Engine`: `ENDPOINT_ERROR` (108)
/// - `NotStreaming`: `USER_NOT_STREAMING` (111)
/// - `Mute`: `MUTE_MEDIA_ERROR` (112)
/// - `NoEngineCapacity`: `NO_MEDIA_RESOURCES` (199)
/// - `InvalidState`, `InvalidArgument`: `GENERIC_ERROR` (999)
#[derive(Debug, Error)]
pub enum RoomError {
    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Participant not found (by id).
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Peer not found (by display name) in a room.
    #[error("Peer '{peer}' not found in room '{room}'")]
    PeerNotFound { peer: String, room: String },

    /// Stage not present in a publisher chain.
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    /// Conflict error (e.g., display name already used in the room).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Stage already present in a publisher chain.
    #[error("Duplicate stage: {0}")]
    DuplicateStage(String),

    /// No engine instance can take a new room.
    #[error("No engine capacity: {0}")]
    NoEngineCapacity(String),

    /// The tier policy refused to let the requester create a room.
    #[error("Room creation refused: {0}")]
    CreationRefused(String),

    /// Room is closed or closing.
    #[error("Room closed: {0}")]
    RoomClosed(String),

    /// Participant has been closed.
    #[error("Participant closed: {0}")]
    ParticipantClosed(String),

    /// Participant is not publishing.
    #[error("Participant not streaming: {0}")]
    NotStreaming(String),

    /// Mute/unmute requested on a leg that cannot be muted.
    #[error("Mute error: {0}")]
    Mute(String),

    /// Operation not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed request.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine produced no SDP answer.
    #[error("No SDP answer: {0}")]
    NoAnswer(String),

    /// Engine request failed.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl RoomError {
    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoomError::RoomNotFound(_)
            | RoomError::ParticipantNotFound(_)
            | RoomError::PeerNotFound { .. }
            | RoomError::StageNotFound(_) => ErrorKind::NotFound,
            RoomError::Conflict(_) | RoomError::DuplicateStage(_) => ErrorKind::Conflict,
            RoomError::NoEngineCapacity(_) => ErrorKind::Capacity,
            RoomError::RoomClosed(_)
            | RoomError::ParticipantClosed(_)
            | RoomError::NotStreaming(_)
            | RoomError::Mute(_)
            | RoomError::InvalidState(_) => ErrorKind::State,
            RoomError::NoAnswer(_) | RoomError::Engine(_) => ErrorKind::Engine,
            RoomError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            RoomError::CreationRefused(_) => ErrorKind::Forbidden,
        }
    }

    /// Returns the room-service error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            RoomError::NoAnswer(_) => 101,
            RoomError::ParticipantNotFound(_)
            | RoomError::PeerNotFound { .. }
            | RoomError::ParticipantClosed(_) => 102,
            RoomError::RoomClosed(_) => 103,
            RoomError::Conflict(_) => 104,
            RoomError::CreationRefused(_) => 105,
            RoomError::RoomNotFound(_) => 106,
            RoomError::StageNotFound(_) | RoomError::DuplicateStage(_) | RoomError::Engine(_) => {
                108
            }
            RoomError::NotStreaming(_) => 111,
            RoomError::Mute(_) => 112,
            RoomError::NoEngineCapacity(_) => 199,
            RoomError::InvalidState(_) | RoomError::InvalidArgument(_) => 999,
        }
    }

    /// Returns a client-safe error message (no engine details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RoomError::Engine(_) => "A media server error occurred".to_string(),
            RoomError::NoEngineCapacity(_) => "No resources left to create new room".to_string(),
            RoomError::NoAnswer(_) => "Unable to negotiate media".to_string(),
            other => other.to_string(),
        }
    }
}
