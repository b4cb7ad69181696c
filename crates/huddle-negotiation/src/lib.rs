//! Glare-free offer/answer negotiation for two-party media sessions.

pub mod acquire;
pub mod engine;
pub mod error;
pub mod mock;
pub mod role;
pub mod session;
pub mod sink;
#[cfg(feature = "webrtc-sink")]
pub mod webrtc_sink;

pub use acquire::{acquire_with_fallback, MediaProfile};
pub use engine::{EngineInput, NegotiationState, Negotiator, SignalOutbox};
pub use error::{SessionError, SessionFailure, SinkError, SinkResult};
pub use role::{resolve_role, NegotiationRole};
pub use session::{PeerSession, SessionConfig};
pub use sink::{
    CapabilitySink, MediaConstraints, MediaStream, MediaTrack, SdpKind, SessionDescription,
    SinkEvent, TrackKind,
};
#[cfg(feature = "webrtc-sink")]
pub use webrtc_sink::WebRtcSink;
