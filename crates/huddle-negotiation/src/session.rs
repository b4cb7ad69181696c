use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use huddle_signal::{
    ChannelConfig, ChannelKind, ConnectionState, Connector, Participant, SignalBody,
    SignalingMessage, SignalingTransport, TransportEvent,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::acquire::{acquire_with_fallback, MediaProfile};
use crate::engine::{EngineInput, NegotiationState, Negotiator, SignalOutbox};
use crate::error::{SessionError, SessionFailure, SinkError};
use crate::sink::{CapabilitySink, MediaStream};

const LEAVE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub local: Participant,
    pub channel: ChannelConfig,
    /// Best media to ask for; acquisition degrades from here.
    pub media: MediaProfile,
}

/// One live audio/video session with a single remote peer.
///
/// Owns the negotiation engine, the session's signaling transport and the
/// capability sink. Dropping it cancels in-flight negotiation, closes the
/// transport and releases local media.
pub struct PeerSession {
    session_id: String,
    local: Participant,
    transport: Arc<SignalingTransport<SignalingMessage>>,
    sink: Arc<dyn CapabilitySink>,
    local_stream: MediaStream,
    profile: MediaProfile,
    control: mpsc::UnboundedSender<EngineInput>,
    negotiation: watch::Receiver<NegotiationState>,
    remote: watch::Receiver<Option<MediaStream>>,
    failures: broadcast::Sender<SessionFailure>,
    engine_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
    torn_down: AtomicBool,
}

impl PeerSession {
    /// Builds the sink, acquires media, and starts signaling.
    ///
    /// Fails only when the capability itself is unusable or the
    /// configuration is invalid; missing devices merely degrade the
    /// media profile.
    pub async fn start<F>(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        sink_factory: F,
    ) -> Result<Self, SessionError>
    where
        F: Future<Output = Result<Arc<dyn CapabilitySink>, SinkError>>,
    {
        if config.session_id.trim().is_empty() {
            return Err(SessionError::InvalidConfig("session id is empty".into()));
        }
        let sink = sink_factory
            .await
            .map_err(SessionError::CapabilityUnavailable)?;
        let (local_stream, profile) = acquire_with_fallback(sink.as_ref(), config.media)
            .await
            .map_err(SessionError::CapabilityUnavailable)?;

        match Self::wire(config, connector, Arc::clone(&sink), local_stream, profile) {
            Ok(session) => Ok(session),
            Err(err) => {
                sink.release_local_tracks();
                Err(err)
            }
        }
    }

    fn wire(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn CapabilitySink>,
        local_stream: MediaStream,
        profile: MediaProfile,
    ) -> Result<Self, SessionError> {
        let SessionConfig {
            session_id,
            local,
            channel,
            ..
        } = config;

        let sink_events = sink
            .take_events()
            .map_err(SessionError::CapabilityUnavailable)?;
        let transport = Arc::new(SignalingTransport::from_config(
            &channel,
            &ChannelKind::video(session_id.clone()),
            connector,
        )?);
        let inbound = transport.take_inbound()?;

        let outbox: Arc<dyn SignalOutbox> = transport.clone();
        let engine = Negotiator::new(session_id.clone(), local.clone(), Arc::clone(&sink), outbox);
        let negotiation = engine.watch_state();
        let remote = engine.watch_remote_stream();
        let failures = engine.failure_sender();

        let (control, control_rx) = mpsc::unbounded_channel();
        let engine_task = tokio::spawn(engine.run(inbound, sink_events, control_rx));
        let monitor_task = tokio::spawn(monitor_transport(
            Arc::downgrade(&transport),
            transport.subscribe_events(),
            session_id.clone(),
            local.clone(),
            failures.clone(),
        ));

        let session = Self {
            session_id,
            local,
            transport,
            sink,
            local_stream,
            profile,
            control,
            negotiation,
            remote,
            failures,
            engine_task,
            monitor_task,
            torn_down: AtomicBool::new(false),
        };
        session.transport.connect()?;
        info!(
            target: "huddle::session",
            session = %session.session_id,
            user = %session.local.id,
            profile = %session.profile,
            "session started"
        );
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn local_stream(&self) -> &MediaStream {
        &self.local_stream
    }

    pub fn media_profile(&self) -> MediaProfile {
        self.profile
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.remote.borrow().clone()
    }

    pub fn watch_remote_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.remote.clone()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation.borrow()
    }

    pub fn watch_negotiation(&self) -> watch::Receiver<NegotiationState> {
        self.negotiation.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.transport.watch_state()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<SessionFailure> {
        self.failures.subscribe()
    }

    /// Asks the engine for a fresh offer, e.g. after local tracks changed.
    pub fn renegotiate(&self) {
        if self.control.send(EngineInput::Renegotiate).is_err() {
            debug!(target: "huddle::session", session = %self.session_id, "engine stopped; renegotiation dropped");
        }
    }

    /// Tells the peer we are leaving, then tears the session down.
    pub async fn leave(self) {
        self.engine_task.abort();
        self.monitor_task.abort();
        let bye = SignalingMessage::new(
            self.session_id.clone(),
            self.local.clone(),
            SignalBody::UserLeave {
                peer_id: self.local.id.clone(),
            },
        );
        if let Err(err) = self.transport.send(&bye) {
            debug!(target: "huddle::session", session = %self.session_id, error = %err, "leave not announced");
        }
        self.transport.shutdown(LEAVE_GRACE).await;
        self.teardown();
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.engine_task.abort();
        self.monitor_task.abort();
        self.transport.close();
        self.sink.release_local_tracks();
        info!(target: "huddle::session", session = %self.session_id, "session torn down");
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn monitor_transport(
    transport: Weak<SignalingTransport<SignalingMessage>>,
    mut events: broadcast::Receiver<TransportEvent>,
    session_id: String,
    local: Participant,
    failures: broadcast::Sender<SessionFailure>,
) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::StateChanged(ConnectionState::Open)) => {
                let Some(transport) = transport.upgrade() else {
                    return;
                };
                let hello = SignalingMessage::new(
                    session_id.clone(),
                    local.clone(),
                    SignalBody::UserJoin {
                        peer_id: local.id.clone(),
                    },
                );
                match transport.send(&hello) {
                    Ok(()) => debug!(target: "huddle::session", session = %session_id, "announced presence"),
                    Err(err) => warn!(target: "huddle::session", session = %session_id, error = %err, "presence announcement failed"),
                }
            }
            Ok(TransportEvent::StateChanged(state)) => {
                debug!(target: "huddle::session", session = %session_id, state = %state, "signaling state");
            }
            Ok(TransportEvent::Failed { attempts }) => {
                error!(target: "huddle::session", session = %session_id, attempts, "signaling lost for good");
                let _ = failures.send(SessionFailure::TransportFailed { attempts });
            }
            Ok(TransportEvent::Rejected { reason }) => {
                debug!(target: "huddle::session", session = %session_id, reason = %reason, "coordinator frame rejected");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "huddle::session", session = %session_id, skipped, "transport events lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}
