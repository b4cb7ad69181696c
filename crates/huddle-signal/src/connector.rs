use std::future::ready;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::sink::Sink;
use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};
use url::Url;

use crate::error::ChannelError;

/// Outbound frame written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ChannelError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<String, ChannelError>>;

/// One established duplex connection. The stream ends when the peer
/// closes the connection.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Connection, ChannelError>;
}

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Connection, ChannelError> {
        let (socket, response) = connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        debug!(target: "huddle::signal", url = %redacted(url), status = %response.status(), "websocket connected");

        let (write, read) = socket.split();
        let sink = write
            .with(|frame: Frame| {
                ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(match frame {
                    Frame::Text(text) => Message::Text(text),
                    Frame::Ping => Message::Ping(Vec::new()),
                }))
            })
            .sink_map_err(|err| ChannelError::Io(err.to_string()));

        let stream = stream::unfold(read, |mut read| async move {
            loop {
                match read.next().await? {
                    Ok(Message::Text(text)) => return Some((Ok(text), read)),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => return Some((Ok(text), read)),
                        Err(err) => {
                            return Some((Err(ChannelError::Decode(err.to_string())), read))
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        trace!(target: "huddle::signal", ?frame, "close frame received");
                        return None;
                    }
                    Ok(_) => continue,
                    Err(err) => return Some((Err(ChannelError::Io(err.to_string())), read)),
                }
            }
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}

/// Strips the auth token before a URL reaches the logs.
pub(crate) fn redacted(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}
