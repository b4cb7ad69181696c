use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{sink, stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;
use url::Url;

use crate::connector::{Connection, Connector, Frame};
use crate::error::ChannelError;

/// In-memory coordinator for tests and single-process demos.
///
/// Every text frame written on a connection is relayed to all other live
/// connections dialed to the same URL path, like the real coordinator
/// relays within a session room.
#[derive(Debug, Clone, Default)]
pub struct LoopbackCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    rooms: RwLock<HashMap<String, Vec<Peer>>>,
    refusals: AtomicU32,
    offline: AtomicBool,
    next_id: AtomicU64,
    dials: Mutex<Vec<Instant>>,
}

#[derive(Debug)]
struct Peer {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl LoopbackCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` dials.
    pub fn refuse_next(&self, count: u32) {
        self.inner.refusals.store(count, Ordering::SeqCst);
    }

    /// While offline every dial is refused.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.inner.dials.lock().len()
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.inner.dials.lock().clone()
    }

    /// Cuts every live connection, as if the network blipped.
    pub fn drop_all(&self) {
        let dropped: usize = self.inner.rooms.write().drain().map(|(_, peers)| peers.len()).sum();
        trace!(target: "huddle::signal", dropped, "loopback dropped all connections");
    }

    pub fn live_connections(&self, path: &str) -> usize {
        self.inner
            .rooms
            .read()
            .get(path)
            .map(|peers| peers.iter().filter(|peer| !peer.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Pushes a raw frame to every connection on `path`.
    pub fn inject(&self, path: &str, text: &str) {
        if let Some(peers) = self.inner.rooms.read().get(path) {
            for peer in peers {
                let _ = peer.tx.send(text.to_string());
            }
        }
    }
}

impl Inner {
    /// Returns false once the sending connection is no longer registered.
    fn relay(&self, path: &str, from: u64, text: &str) -> bool {
        let mut rooms = self.rooms.write();
        let Some(peers) = rooms.get_mut(path) else {
            return false;
        };
        if !peers.iter().any(|peer| peer.id == from) {
            return false;
        }
        peers.retain(|peer| peer.id == from || peer.tx.send(text.to_string()).is_ok());
        true
    }
}

#[async_trait]
impl Connector for LoopbackCoordinator {
    async fn connect(&self, url: &Url) -> Result<Connection, ChannelError> {
        self.inner.dials.lock().push(Instant::now());
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(ChannelError::Connect("coordinator unreachable".into()));
        }
        let refused = self
            .inner
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChannelError::Connect("connection refused".into()));
        }

        let path = url.path().to_string();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .rooms
            .write()
            .entry(path.clone())
            .or_default()
            .push(Peer { id, tx });

        let inner = Arc::clone(&self.inner);
        let sink = sink::unfold((inner, path, id), |(inner, path, id), frame: Frame| async move {
            match frame {
                Frame::Text(text) => {
                    if !inner.relay(&path, id, &text) {
                        return Err(ChannelError::Io("connection reset".into()));
                    }
                }
                Frame::Ping => {}
            }
            Ok((inner, path, id))
        });
        let stream = stream::unfold(rx, |mut rx| async move {
            let text = rx.recv().await?;
            Some((Ok(text), rx))
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}
