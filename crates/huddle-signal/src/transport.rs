use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::channel::{endpoint_url, ChannelKind};
use crate::config::ChannelConfig;
use crate::connector::{redacted, Connection, Connector, Frame};
use crate::error::{ChannelError, ChannelResult};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Reconnect budget spent; the transport is now permanently closed.
    Failed { attempts: u32 },
    /// An inbound frame could not be decoded and was dropped.
    Rejected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportOptions {
    pub backoff: BackoffPolicy,
    pub keepalive: Option<Duration>,
}

/// Reconnecting duplex channel to one coordinator endpoint.
///
/// Frames sent while `Open` are written in order on the current
/// connection. Nothing is buffered across a drop: `send` fails fast when
/// the channel is not open, and anything still queued when a connection
/// dies is lost.
pub struct SignalingTransport<M> {
    shared: Arc<Shared<M>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct Shared<M> {
    url: Url,
    connector: Arc<dyn Connector>,
    options: TransportOptions,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<TransportEvent>,
    writer: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound_tx: mpsc::UnboundedSender<M>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<M>>>,
    attempt: AtomicU32,
    closed: AtomicBool,
    _message: PhantomData<fn() -> M>,
}

enum EpochEnd {
    Shutdown,
    Dropped(String),
}

impl<M> SignalingTransport<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(url: Url, connector: Arc<dyn Connector>, options: TransportOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                url,
                connector,
                options,
                state_tx,
                events_tx,
                writer: Mutex::new(None),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                attempt: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                _message: PhantomData,
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &ChannelConfig,
        kind: &ChannelKind,
        connector: Arc<dyn Connector>,
    ) -> ChannelResult<Self> {
        let url = endpoint_url(&config.coordinator_url, kind, config.token.as_deref())?;
        Ok(Self::new(url, connector, config.options()))
    }

    /// Starts the connection supervisor. Calling it again while the
    /// transport is live does nothing. Must be called inside a tokio runtime.
    pub fn connect(&self) -> ChannelResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            trace!(target: "huddle::signal", url = %redacted(&self.shared.url), "connect ignored; already running");
            return Ok(());
        }
        self.shared.set_state(ConnectionState::Connecting);
        *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.shared))));
        Ok(())
    }

    pub fn send(&self, message: &M) -> ChannelResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if self.state() != ConnectionState::Open {
            return Err(ChannelError::NotConnected);
        }
        let text = serde_json::to_string(message)?;
        let writer = self.shared.writer.lock();
        match writer.as_ref() {
            Some(tx) => tx
                .send(Frame::Text(text))
                .map_err(|_| ChannelError::NotConnected),
            None => Err(ChannelError::NotConnected),
        }
    }

    /// Hands out the inbound message stream. Only one consumer may own it.
    pub fn take_inbound(&self) -> ChannelResult<mpsc::UnboundedReceiver<M>> {
        self.shared
            .inbound_rx
            .lock()
            .take()
            .ok_or(ChannelError::InboundTaken)
    }

    /// Closes after letting the current connection flush what was already
    /// queued, waiting at most `grace` before cutting it off.
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.writer.lock().take();
        self.shared.set_state(ConnectionState::Closed);
        let handle = self.supervisor.lock().take();
        if let Some(mut handle) = handle {
            if time::timeout(grace, &mut handle).await.is_err() {
                debug!(target: "huddle::signal", url = %redacted(&self.shared.url), "shutdown grace elapsed");
                handle.abort();
            }
        }
    }
}

impl<M> SignalingTransport<M> {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn attempt(&self) -> u32 {
        self.shared.attempt.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Terminal: stops any pending reconnect and drops the connection.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.writer.lock().take();
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        if self.shared.set_state(ConnectionState::Closed) {
            info!(target: "huddle::signal", url = %redacted(&self.shared.url), "transport closed");
        }
    }
}

impl<M> Drop for SignalingTransport<M> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<M> Shared<M> {
    /// Returns whether the state actually changed. Once closed, only
    /// `Closed` is accepted.
    fn set_state(&self, next: ConnectionState) -> bool {
        if next != ConnectionState::Closed && self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(target: "huddle::signal", url = %redacted(&self.url), state = %next, "connection state");
            let _ = self.events_tx.send(TransportEvent::StateChanged(next));
        }
        changed
    }
}

impl<M> Shared<M>
where
    M: DeserializeOwned,
{
    fn deliver(&self, text: &str) {
        match serde_json::from_str::<M>(text) {
            Ok(message) => {
                if self.inbound_tx.send(message).is_err() {
                    trace!(target: "huddle::signal", "inbound consumer gone; dropping message");
                }
            }
            Err(err) => {
                warn!(target: "huddle::signal", url = %redacted(&self.url), error = %err, "dropping undecodable frame");
                let _ = self.events_tx.send(TransportEvent::Rejected {
                    reason: err.to_string(),
                });
            }
        }
    }
}

async fn closed_signal(rx: &mut watch::Receiver<ConnectionState>) {
    let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
}

async fn keepalive_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn supervise<M>(shared: Arc<Shared<M>>)
where
    M: DeserializeOwned + Send + 'static,
{
    let url = redacted(&shared.url);
    let mut state_rx = shared.state_tx.subscribe();
    loop {
        let dialed = tokio::select! {
            result = shared.connector.connect(&shared.url) => result,
            _ = closed_signal(&mut state_rx) => return,
        };

        match dialed {
            Ok(connection) => {
                let (tx, rx) = mpsc::unbounded_channel();
                {
                    let mut writer = shared.writer.lock();
                    if shared.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    *writer = Some(tx);
                }
                shared.attempt.store(0, Ordering::SeqCst);
                shared.set_state(ConnectionState::Open);
                info!(target: "huddle::signal", url = %url, "signaling channel open");

                let end = run_epoch(&shared, connection, rx).await;
                shared.writer.lock().take();
                match end {
                    EpochEnd::Shutdown => {
                        debug!(target: "huddle::signal", url = %url, "connection closed locally");
                        return;
                    }
                    EpochEnd::Dropped(reason) => {
                        warn!(target: "huddle::signal", url = %url, reason = %reason, "signaling connection dropped");
                    }
                }
            }
            Err(err) => {
                warn!(
                    target: "huddle::signal",
                    url = %url,
                    attempt = shared.attempt.load(Ordering::SeqCst),
                    error = %err,
                    "signaling connect failed"
                );
            }
        }

        if shared.closed.load(Ordering::SeqCst) {
            return;
        }

        let attempt = shared.attempt.load(Ordering::SeqCst);
        let Some(delay) = shared.options.backoff.retry_delay(attempt) else {
            shared.closed.store(true, Ordering::SeqCst);
            shared.set_state(ConnectionState::Closed);
            error!(target: "huddle::signal", url = %url, attempts = attempt, "giving up on signaling channel");
            let _ = shared.events_tx.send(TransportEvent::Failed { attempts: attempt });
            return;
        };
        shared.attempt.store(attempt + 1, Ordering::SeqCst);
        shared.set_state(ConnectionState::Reconnecting);
        warn!(
            target: "huddle::signal",
            url = %url,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = closed_signal(&mut state_rx) => return,
        }
    }
}

async fn run_epoch<M>(
    shared: &Shared<M>,
    connection: Connection,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) -> EpochEnd
where
    M: DeserializeOwned,
{
    let Connection {
        mut sink,
        mut stream,
    } = connection;
    let mut keepalive = shared.options.keepalive.map(|period| {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = sink.send(frame).await {
                        return EpochEnd::Dropped(err.to_string());
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return EpochEnd::Shutdown;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(text)) => shared.deliver(&text),
                Some(Err(err)) => return EpochEnd::Dropped(err.to_string()),
                None => return EpochEnd::Dropped("closed by coordinator".into()),
            },
            _ = keepalive_tick(&mut keepalive) => {
                trace!(target: "huddle::signal", "keepalive ping");
                if let Err(err) = sink.send(Frame::Ping).await {
                    return EpochEnd::Dropped(err.to_string());
                }
            }
        }
    }
}
