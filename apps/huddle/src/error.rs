use huddle_negotiation::SessionError;
use huddle_signal::ChannelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("signaling gave up after {attempts} reconnect attempts")]
    SignalingLost { attempts: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("output encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
