use huddle_signal::ChannelError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The peer-connection primitive itself cannot be used.
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    #[error("no usable media devices: {0}")]
    NoDevices(String),
    #[error("session description failed: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("sink events already taken")]
    EventsTaken,
}

pub type SinkResult<T> = Result<T, SinkError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    CapabilityUnavailable(SinkError),
    #[error("signaling transport error: {0}")]
    Transport(#[from] ChannelError),
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
}

/// Runtime failures reported to whoever owns a session. None of these
/// stop the session on their own, except `TransportFailed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFailure {
    #[error("signaling transport gave up after {attempts} reconnect attempts")]
    TransportFailed { attempts: u32 },
    #[error("negotiation step `{step}` failed: {reason}")]
    Negotiation { step: &'static str, reason: String },
    #[error("ice candidate could not be applied: {reason}")]
    Candidate { reason: String },
}
