//! The narrow interface to the host's media and peer-connection stack.

use std::fmt;

use async_trait::async_trait;
use huddle_signal::IceCandidate;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::SinkResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|track| track.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Adds `track` unless a track with the same id is already present.
    pub fn insert(&mut self, track: MediaTrack) -> bool {
        if self.tracks.iter().any(|existing| existing.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };
    pub const VIDEO_ONLY: Self = Self {
        audio: false,
        video: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// A local ICE candidate ready to be signaled.
    LocalCandidate(IceCandidate),
    /// A remote track arrived.
    Track { track: MediaTrack, stream_id: String },
    /// Local media changed and the session needs a new offer.
    NegotiationNeeded,
}

/// Media capture plus peer connection, as the negotiation engine sees it.
///
/// `set_remote_description` with an offer while a local offer is
/// outstanding must roll the local offer back first.
#[async_trait]
pub trait CapabilitySink: Send + Sync {
    async fn acquire_local_tracks(&self, constraints: MediaConstraints) -> SinkResult<MediaStream>;
    async fn create_offer(&self) -> SinkResult<SessionDescription>;
    async fn create_answer(&self) -> SinkResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> SinkResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> SinkResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SinkResult<()>;

    /// The event stream can be taken once.
    fn take_events(&self) -> SinkResult<mpsc::UnboundedReceiver<SinkEvent>>;

    /// Stops every local capture. Must not block.
    fn release_local_tracks(&self);
}
