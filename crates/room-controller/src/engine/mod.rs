//! Media engine seam.
//!
//! The media-processing engine is an external collaborator. This module
//! defines the request/response surface the control plane consumes
//! ([`MediaEngine`]), the opaque handles it hands back, and the event
//! channel through which the engine reports gathered candidates and errors.
//!
//! # Modules
//!
//! - [`pool`] - `EngineInstance` accounting and `EnginePool` selection

pub mod pool;

#[cfg(test)]
pub(crate) mod testing;

use crate::observability::metrics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{trace, warn};

pub use pool::{AllowListTierPolicy, EngineInstance, EnginePool, NoPrivilegeTierPolicy, Tier, TierPolicy};

/// Engine-side error type.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine rejected or failed the request.
    #[error("Engine request failed: {0}")]
    RequestFailed(String),

    /// The element was released before the request reached it.
    #[error("Element already released: {0}")]
    ElementReleased(String),

    /// The engine cannot be reached.
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

/// Media leg selector for partial connect/disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Handle to a pipeline created by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    id: String,
}

impl PipelineHandle {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Handle to an element (endpoint, merge point or stage) inside a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle {
    id: String,
    pipeline_id: String,
}

impl ElementHandle {
    #[must_use]
    pub fn new(id: impl Into<String>, pipeline_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pipeline_id: pipeline_id.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// ICE candidate exchanged between a client and an engine endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_m_line_index: u32,
}

impl IceCandidate {
    #[must_use]
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_m_line_index: u32) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.into(),
            sdp_m_line_index,
        }
    }
}

/// Identifies who an endpoint belongs to, so engine events can be routed.
///
/// `endpoint_name` is the owner's own name for its publisher endpoint and the
/// peer's name for a subscriber endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointTag {
    pub participant_id: String,
    pub endpoint_name: String,
}

impl EndpointTag {
    #[must_use]
    pub fn new(participant_id: impl Into<String>, endpoint_name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            endpoint_name: endpoint_name.into(),
        }
    }
}

/// Events the engine reports asynchronously for a pipeline.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An endpoint gathered a local candidate that must reach the client.
    CandidateGathered {
        tag: EndpointTag,
        candidate: IceCandidate,
    },
    /// An element failed.
    ElementError { tag: EndpointTag, description: String },
    /// The pipeline as a whole failed.
    PipelineError { description: String },
}

/// Sender half of a room's engine event channel.
pub type EngineEventSender = mpsc::Sender<EngineEvent>;

/// Request/response client to one media-processing engine.
///
/// Every call may complete on an engine callback thread; implementations
/// must be safe to share across tasks.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a pipeline. Events for its elements are delivered on `events`.
    async fn create_pipeline(&self, events: EngineEventSender) -> Result<PipelineHandle, EngineError>;

    /// Create a client-facing endpoint inside `pipeline`.
    async fn create_endpoint(
        &self,
        pipeline: &PipelineHandle,
        tag: &EndpointTag,
    ) -> Result<ElementHandle, EngineError>;

    /// Create the pass-through element that serves as a publisher's merge point.
    async fn create_merge_point(
        &self,
        pipeline: &PipelineHandle,
        tag: &EndpointTag,
    ) -> Result<ElementHandle, EngineError>;

    /// Process an SDP offer and return the engine-generated answer.
    async fn process_offer(&self, endpoint: &ElementHandle, offer: &str) -> Result<String, EngineError>;

    /// Start gathering local candidates for `endpoint`.
    async fn gather_candidates(&self, endpoint: &ElementHandle) -> Result<(), EngineError>;

    /// Add a remote candidate to `endpoint`.
    async fn add_candidate(
        &self,
        endpoint: &ElementHandle,
        candidate: &IceCandidate,
    ) -> Result<(), EngineError>;

    /// Connect `source` to `sink`, either fully or one media leg.
    async fn connect(
        &self,
        source: &ElementHandle,
        sink: &ElementHandle,
        kind: Option<MediaKind>,
    ) -> Result<(), EngineError>;

    /// Disconnect `source` from `sink`, either fully or one media leg.
    async fn disconnect(
        &self,
        source: &ElementHandle,
        sink: &ElementHandle,
        kind: Option<MediaKind>,
    ) -> Result<(), EngineError>;

    /// Release an element.
    async fn release(&self, element: &ElementHandle) -> Result<(), EngineError>;

    /// Release a pipeline and everything in it.
    async fn release_pipeline(&self, pipeline: &PipelineHandle) -> Result<(), EngineError>;
}

/// Release an element without blocking the caller.
///
/// Failures are logged and swallowed.
pub fn release_in_background(engine: Arc<dyn MediaEngine>, element: ElementHandle, owner: String) {
    tokio::spawn(async move {
        match engine.release(&element).await {
            Ok(()) => {
                trace!(
                    target: "room.engine",
                    owner = %owner,
                    element = %element,
                    "Released element"
                );
            }
            Err(e) => {
                metrics::record_engine_error("release");
                warn!(
                    target: "room.engine",
                    owner = %owner,
                    element = %element,
                    error = %e,
                    "Could not release element"
                );
            }
        }
    });
}

/// Release a pipeline without blocking the caller.
pub fn release_pipeline_in_background(engine: Arc<dyn MediaEngine>, pipeline: PipelineHandle, room: String) {
    tokio::spawn(async move {
        match engine.release_pipeline(&pipeline).await {
            Ok(()) => {
                trace!(
                    target: "room.engine",
                    room = %room,
                    pipeline = %pipeline,
                    "Released pipeline"
                );
            }
            Err(e) => {
                metrics::record_engine_error("release_pipeline");
                warn!(
                    target: "room.engine",
                    room = %room,
                    pipeline = %pipeline,
                    error = %e,
                    "Could not release pipeline"
                );
            }
        }
    });
}
