//! Perfect-negotiation state machine for one peer session.
//!
//! Every input (remote signaling, sink events, local renegotiation
//! requests) is handled to completion before the next one is looked at, so
//! "is an offer outstanding" never races with an incoming offer.

use std::fmt;
use std::sync::Arc;

use huddle_signal::{
    ChannelError, IceCandidate, Participant, ParticipantId, Sdp, SignalBody, SignalingMessage,
    SignalingTransport,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::error::{SessionFailure, SinkError};
use crate::role::{resolve_role, NegotiationRole};
use crate::sink::{CapabilitySink, MediaStream, SessionDescription, SinkEvent};

const FAILURE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    MakingOffer,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NegotiationState::Idle => "idle",
            NegotiationState::MakingOffer => "making_offer",
            NegotiationState::HaveLocalOffer => "have_local_offer",
            NegotiationState::HaveRemoteOffer => "have_remote_offer",
            NegotiationState::Stable => "stable",
        })
    }
}

/// Where the engine writes outbound signaling. Delivery is best effort.
pub trait SignalOutbox: Send + Sync {
    fn post(&self, message: SignalingMessage) -> Result<(), ChannelError>;
}

impl SignalOutbox for SignalingTransport<SignalingMessage> {
    fn post(&self, message: SignalingMessage) -> Result<(), ChannelError> {
        self.send(&message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineInput {
    Remote(SignalingMessage),
    Sink(SinkEvent),
    Renegotiate,
}

impl NegotiationState {
    fn offer_outstanding(self) -> bool {
        matches!(
            self,
            NegotiationState::MakingOffer | NegotiationState::HaveLocalOffer
        )
    }
}

#[derive(Debug)]
struct PendingCandidate {
    candidate: IceCandidate,
    // Round of our own offer that was outstanding on arrival. Such a
    // candidate answers that offer and dies with it on rollback.
    local_round: Option<u64>,
    from_ignored_offer: bool,
}

pub struct Negotiator {
    session_id: String,
    local: Participant,
    sink: Arc<dyn CapabilitySink>,
    outbox: Arc<dyn SignalOutbox>,
    peer: Option<ParticipantId>,
    role: Option<NegotiationRole>,
    state: NegotiationState,
    // State to fall back to when a step fails.
    settled: NegotiationState,
    round: u64,
    remote_description_set: bool,
    ignore_offer: bool,
    pending: Vec<PendingCandidate>,
    remote_stream: Option<MediaStream>,
    state_tx: watch::Sender<NegotiationState>,
    remote_tx: watch::Sender<Option<MediaStream>>,
    failures: broadcast::Sender<SessionFailure>,
}

impl Negotiator {
    pub fn new(
        session_id: impl Into<String>,
        local: Participant,
        sink: Arc<dyn CapabilitySink>,
        outbox: Arc<dyn SignalOutbox>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            local,
            sink,
            outbox,
            peer: None,
            role: None,
            state: NegotiationState::Idle,
            settled: NegotiationState::Idle,
            round: 0,
            remote_description_set: false,
            ignore_offer: false,
            pending: Vec::new(),
            remote_stream: None,
            state_tx: watch::channel(NegotiationState::Idle).0,
            remote_tx: watch::channel(None).0,
            failures: broadcast::channel(FAILURE_CAPACITY).0,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        self.role
    }

    pub fn peer(&self) -> Option<&ParticipantId> {
        self.peer.as_ref()
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.state_tx.subscribe()
    }

    pub fn watch_remote_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.remote_tx.subscribe()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<SessionFailure> {
        self.failures.subscribe()
    }

    pub fn failure_sender(&self) -> broadcast::Sender<SessionFailure> {
        self.failures.clone()
    }

    /// Runs until every input source is closed.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
        mut sink_events: mpsc::UnboundedReceiver<SinkEvent>,
        mut control: mpsc::UnboundedReceiver<EngineInput>,
    ) {
        debug!(target: "huddle::negotiation", session = %self.session_id, "negotiation engine started");
        loop {
            let input = tokio::select! {
                Some(message) = inbound.recv() => EngineInput::Remote(message),
                Some(event) = sink_events.recv() => EngineInput::Sink(event),
                Some(input) = control.recv() => input,
                else => break,
            };
            self.handle(input).await;
        }
        debug!(target: "huddle::negotiation", session = %self.session_id, "negotiation engine stopped");
    }

    pub async fn handle(&mut self, input: EngineInput) {
        match input {
            EngineInput::Remote(message) => self.on_remote(message).await,
            EngineInput::Sink(event) => self.on_sink_event(event).await,
            EngineInput::Renegotiate => self.make_offer("renegotiation requested").await,
        }
    }

    async fn on_remote(&mut self, message: SignalingMessage) {
        if message.session_id != self.session_id {
            debug!(
                target: "huddle::negotiation",
                session = %self.session_id,
                foreign = %message.session_id,
                kind = message.kind(),
                "dropping message for another session"
            );
            return;
        }
        if message.sender.id == self.local.id {
            trace!(target: "huddle::negotiation", kind = message.kind(), "dropping own echo");
            return;
        }

        let sender = message.sender.id;
        match message.body {
            SignalBody::UserJoin { peer_id } => self.on_user_join(peer_id).await,
            SignalBody::UserLeave { peer_id } => self.on_user_leave(peer_id),
            SignalBody::Offer(offer) => self.on_offer(sender, offer).await,
            SignalBody::Answer(answer) => self.on_answer(sender, answer).await,
            SignalBody::Candidate(candidate) => self.on_candidate(sender, candidate).await,
        }
    }

    async fn on_sink_event(&mut self, event: SinkEvent) {
        match event {
            SinkEvent::LocalCandidate(candidate) => self.post(SignalBody::Candidate(candidate)),
            SinkEvent::Track { track, stream_id } => {
                let stream = self
                    .remote_stream
                    .get_or_insert_with(|| MediaStream::new(stream_id.clone()));
                if stream.insert(track.clone()) {
                    info!(
                        target: "huddle::negotiation",
                        session = %self.session_id,
                        stream = %stream_id,
                        track = %track.id,
                        kind = ?track.kind,
                        "remote track"
                    );
                    self.remote_tx.send_replace(Some(stream.clone()));
                }
            }
            SinkEvent::NegotiationNeeded => self.make_offer("local media changed").await,
        }
    }

    async fn on_user_join(&mut self, peer_id: ParticipantId) {
        match &self.peer {
            Some(known) if *known == peer_id => {
                debug!(target: "huddle::negotiation", session = %self.session_id, peer = %peer_id, "duplicate join");
                return;
            }
            Some(known) => {
                warn!(
                    target: "huddle::negotiation",
                    session = %self.session_id,
                    peer = %known,
                    ignored = %peer_id,
                    "session already has a peer; ignoring join"
                );
                return;
            }
            None => {}
        }
        if !self.adopt_peer(peer_id) {
            return;
        }
        // Let the newcomer learn about us without the coordinator tracking membership.
        self.post(SignalBody::UserJoin {
            peer_id: self.local.id.clone(),
        });
        if self.role == Some(NegotiationRole::Impolite) && self.state == NegotiationState::Idle {
            self.make_offer("initial offer").await;
        }
    }

    fn on_user_leave(&mut self, peer_id: ParticipantId) {
        if self.peer.as_ref() != Some(&peer_id) {
            debug!(target: "huddle::negotiation", session = %self.session_id, peer = %peer_id, "leave from unknown participant");
            return;
        }
        info!(target: "huddle::negotiation", session = %self.session_id, peer = %peer_id, "peer left");
        self.peer = None;
        self.role = None;
        self.pending.clear();
        self.remote_description_set = false;
        self.ignore_offer = false;
        self.remote_stream = None;
        self.remote_tx.send_replace(None);
        self.settle(NegotiationState::Idle);
    }

    async fn on_offer(&mut self, sender: ParticipantId, offer: Sdp) {
        if self.peer.is_none() {
            self.adopt_peer(sender.clone());
        }
        if !self.is_peer(&sender, "offer") {
            return;
        }
        let Some(role) = self.role else {
            return;
        };

        let collision = self.state.offer_outstanding();
        self.ignore_offer = collision && role == NegotiationRole::Impolite;
        if self.ignore_offer {
            info!(
                target: "huddle::negotiation",
                session = %self.session_id,
                round = self.round,
                "offer collision; keeping our own offer"
            );
            return;
        }
        if collision {
            info!(target: "huddle::negotiation", session = %self.session_id, "offer collision; yielding to peer");
        }

        // A failed rollback leaves our offer in place on the sink.
        let fallback = if collision {
            NegotiationState::HaveLocalOffer
        } else {
            self.settled
        };
        self.set_state(NegotiationState::HaveRemoteOffer);
        if let Err(err) = self
            .sink
            .set_remote_description(SessionDescription::offer(offer.sdp))
            .await
        {
            return self.fail_to("set_remote_description", err, fallback);
        }
        if collision {
            self.discard_round(self.round);
        }
        self.begin_round();
        self.remote_description_set = true;
        self.flush_pending().await;

        let answer = match self.sink.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return self.fail("create_answer", err),
        };
        if let Err(err) = self.sink.set_local_description(answer.clone()).await {
            return self.fail("set_local_description", err);
        }
        self.settle(NegotiationState::Stable);
        self.post(SignalBody::Answer(Sdp::new(answer.sdp)));
    }

    async fn on_answer(&mut self, sender: ParticipantId, answer: Sdp) {
        if self.state != NegotiationState::HaveLocalOffer {
            debug!(
                target: "huddle::negotiation",
                session = %self.session_id,
                state = %self.state,
                "dropping answer with no outstanding offer"
            );
            return;
        }
        if !self.is_peer(&sender, "answer") {
            return;
        }
        if let Err(err) = self
            .sink
            .set_remote_description(SessionDescription::answer(answer.sdp))
            .await
        {
            return self.fail("set_remote_description", err);
        }
        self.remote_description_set = true;
        self.flush_pending().await;
        self.settle(NegotiationState::Stable);
    }

    async fn on_candidate(&mut self, sender: ParticipantId, candidate: IceCandidate) {
        if self.peer.is_some() && !self.is_peer(&sender, "candidate") {
            return;
        }
        if self.remote_description_set {
            let suppress = self.ignore_offer;
            self.apply_candidate(candidate, suppress).await;
        } else {
            trace!(target: "huddle::negotiation", round = self.round, "buffering early candidate");
            self.pending.push(PendingCandidate {
                candidate,
                local_round: self.state.offer_outstanding().then_some(self.round),
                from_ignored_offer: self.ignore_offer,
            });
        }
    }

    async fn make_offer(&mut self, reason: &'static str) {
        if self.peer.is_none() {
            debug!(target: "huddle::negotiation", session = %self.session_id, reason, "no peer yet; not offering");
            return;
        }
        if self.state.offer_outstanding() {
            debug!(target: "huddle::negotiation", session = %self.session_id, reason, "offer already outstanding");
            return;
        }

        self.begin_round();
        self.set_state(NegotiationState::MakingOffer);
        info!(target: "huddle::negotiation", session = %self.session_id, round = self.round, reason, "creating offer");
        let offer = match self.sink.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return self.fail("create_offer", err),
        };
        if let Err(err) = self.sink.set_local_description(offer.clone()).await {
            return self.fail("set_local_description", err);
        }
        self.set_state(NegotiationState::HaveLocalOffer);
        self.post(SignalBody::Offer(Sdp::new(offer.sdp)));
    }

    fn adopt_peer(&mut self, peer_id: ParticipantId) -> bool {
        let Some(role) = resolve_role(&self.local.id, &peer_id) else {
            warn!(target: "huddle::negotiation", session = %self.session_id, peer = %peer_id, "peer shares our id; ignoring");
            return false;
        };
        info!(
            target: "huddle::negotiation",
            session = %self.session_id,
            peer = %peer_id,
            role = %role,
            "peer joined"
        );
        self.peer = Some(peer_id);
        self.role = Some(role);
        true
    }

    fn is_peer(&self, sender: &ParticipantId, kind: &'static str) -> bool {
        if self.peer.as_ref() == Some(sender) {
            return true;
        }
        warn!(target: "huddle::negotiation", session = %self.session_id, sender = %sender, kind, "dropping message from a non-peer");
        false
    }

    fn begin_round(&mut self) {
        self.round += 1;
        self.ignore_offer = false;
    }

    /// Drops buffered candidates that answered our offer from `round`.
    fn discard_round(&mut self, round: u64) {
        let before = self.pending.len();
        self.pending.retain(|entry| entry.local_round != Some(round));
        let discarded = before - self.pending.len();
        if discarded > 0 {
            debug!(
                target: "huddle::negotiation",
                round,
                discarded,
                "discarding candidates for a rolled back offer"
            );
        }
    }

    async fn flush_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for entry in pending {
            self.apply_candidate(entry.candidate, entry.from_ignored_offer)
                .await;
        }
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate, suppress: bool) {
        match self.sink.add_ice_candidate(candidate).await {
            Ok(()) => trace!(target: "huddle::negotiation", round = self.round, "candidate applied"),
            Err(err) if suppress => {
                debug!(target: "huddle::negotiation", error = %err, "candidate for an ignored offer failed");
            }
            Err(err) => {
                warn!(target: "huddle::negotiation", session = %self.session_id, error = %err, "candidate failed");
                let _ = self.failures.send(SessionFailure::Candidate {
                    reason: err.to_string(),
                });
            }
        }
    }

    fn fail(&mut self, step: &'static str, err: SinkError) {
        let settled = self.settled;
        self.fail_to(step, err, settled);
    }

    fn fail_to(&mut self, step: &'static str, err: SinkError, fallback: NegotiationState) {
        warn!(
            target: "huddle::negotiation",
            session = %self.session_id,
            step,
            error = %err,
            "negotiation step failed"
        );
        let _ = self.failures.send(SessionFailure::Negotiation {
            step,
            reason: err.to_string(),
        });
        self.set_state(fallback);
    }

    fn settle(&mut self, state: NegotiationState) {
        self.settled = state;
        self.set_state(state);
    }

    fn set_state(&mut self, next: NegotiationState) {
        if self.state == next {
            return;
        }
        debug!(
            target: "huddle::negotiation",
            session = %self.session_id,
            from = %self.state,
            to = %next,
            round = self.round,
            "negotiation state"
        );
        // An ignored offer only matters while ours is still on the table.
        if !next.offer_outstanding() {
            self.ignore_offer = false;
        }
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn post(&self, body: SignalBody) {
        let message = SignalingMessage::new(self.session_id.clone(), self.local.clone(), body);
        let kind = message.kind();
        if let Err(err) = self.outbox.post(message) {
            debug!(target: "huddle::negotiation", kind, error = %err, "signal not sent");
        }
    }
}
