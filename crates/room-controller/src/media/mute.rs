//! Mute state algebra.

use crate::engine::MediaKind;
use serde::{Deserialize, Serialize};

/// What is muted on a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MuteKind {
    Audio,
    Video,
    All,
}

impl MuteKind {
    /// The single media leg to disconnect, or `None` for both.
    #[must_use]
    pub const fn media_kind(&self) -> Option<MediaKind> {
        match self {
            MuteKind::Audio => Some(MediaKind::Audio),
            MuteKind::Video => Some(MediaKind::Video),
            MuteKind::All => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MuteKind::Audio => "audio",
            MuteKind::Video => "video",
            MuteKind::All => "all",
        }
    }
}

impl From<MediaKind> for MuteKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => MuteKind::Audio,
            MediaKind::Video => MuteKind::Video,
        }
    }
}

/// Current mute state of a leg: `None` when nothing is muted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuteState(Option<MuteKind>);

impl MuteState {
    #[must_use]
    pub const fn unmuted() -> Self {
        Self(None)
    }

    #[must_use]
    pub const fn current(&self) -> Option<MuteKind> {
        self.0
    }

    #[must_use]
    pub const fn is_muted(&self) -> bool {
        self.0.is_some()
    }

    /// Whether muting `kind` would change nothing.
    #[must_use]
    pub fn covers(&self, kind: MuteKind) -> bool {
        match self.0 {
            None => false,
            Some(MuteKind::All) => true,
            Some(current) => current == kind,
        }
    }

    /// Fold `kind` into the state.
    ///
    /// Same kind is a no-op, audio plus video is all, all absorbs anything.
    #[must_use]
    pub fn fold(self, kind: MuteKind) -> Self {
        let next = match (self.0, kind) {
            (None, k) => k,
            (Some(MuteKind::All), _) | (_, MuteKind::All) => MuteKind::All,
            (Some(current), k) if current == k => current,
            (Some(_), _) => MuteKind::All,
        };
        Self(Some(next))
    }

    /// Clear the state.
    #[must_use]
    pub const fn cleared(self) -> Self {
        Self(None)
    }
}
