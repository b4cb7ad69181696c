use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("signaling channel is closed")]
    Closed,
    #[error("gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection error: {0}")]
    Io(String),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("inbound stream already taken")]
    InboundTaken,
}

pub type ChannelResult<T> = Result<T, ChannelError>;
