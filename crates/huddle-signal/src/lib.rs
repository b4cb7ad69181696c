//! Reconnecting, ordered message channels to the huddle coordinator.
//!
//! Every real-time feature (video negotiation, live notifications,
//! whiteboard sync) talks to the coordinator through a
//! [`SignalingTransport`], parameterised by the message type it carries.

pub mod backoff;
pub mod channel;
pub mod config;
pub mod connector;
pub mod error;
pub mod feeds;
pub mod loopback;
pub mod message;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use channel::{ChannelKind, endpoint_url};
pub use config::ChannelConfig;
pub use connector::{Connection, Connector, Frame, WsConnector};
pub use error::{ChannelError, ChannelResult};
pub use feeds::{NotificationEvent, Stroke, Whiteboard, WhiteboardEvent};
pub use loopback::LoopbackCoordinator;
pub use message::{IceCandidate, Participant, ParticipantId, Sdp, SignalBody, SignalingMessage};
pub use transport::{ConnectionState, SignalingTransport, TransportEvent, TransportOptions};
