#![cfg(feature = "webrtc-sink")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use huddle_negotiation::{
    CapabilitySink, EngineInput, MediaConstraints, NegotiationState, Negotiator, SessionFailure,
    SignalOutbox, SinkError, SinkEvent, TrackKind, WebRtcSink,
};
use huddle_signal::{ChannelError, Participant, SignalBody, SignalingMessage};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};
use webrtc::peer_connection::signaling_state::RTCSignalingState;

const SESSION: &str = "S100";
const SETTLE: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<SignalingMessage>>,
}

impl Outbox {
    fn drain(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl SignalOutbox for Outbox {
    fn post(&self, message: SignalingMessage) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

struct Peer {
    engine: Negotiator,
    sink: Arc<WebRtcSink>,
    outbox: Arc<Outbox>,
    events: mpsc::UnboundedReceiver<SinkEvent>,
    failures: broadcast::Receiver<SessionFailure>,
}

fn name(id: u64) -> &'static str {
    if id == 1 {
        "alice"
    } else {
        "bob"
    }
}

fn join(id: u64) -> EngineInput {
    EngineInput::Remote(SignalingMessage::new(
        SESSION,
        Participant::new(id, name(id)),
        SignalBody::UserJoin { peer_id: id.into() },
    ))
}

async fn peer(id: u64) -> Peer {
    let sink = WebRtcSink::new(Vec::new()).await.expect("peer connection");
    let local = sink
        .acquire_local_tracks(MediaConstraints::AUDIO_VIDEO)
        .await
        .expect("local tracks");
    assert_eq!(local.tracks.len(), 2);
    let events = sink.take_events().expect("sink events");
    let outbox = Arc::new(Outbox::default());
    let engine = Negotiator::new(
        SESSION,
        Participant::new(id, name(id)),
        sink.clone(),
        outbox.clone(),
    );
    let failures = engine.subscribe_failures();
    Peer {
        engine,
        sink,
        outbox,
        events,
        failures,
    }
}

impl Peer {
    async fn pump_sink(&mut self) -> bool {
        let mut any = false;
        while let Ok(event) = self.events.try_recv() {
            any = true;
            self.engine.handle(EngineInput::Sink(event)).await;
        }
        any
    }

    /// Candidate hiccups depend on the host's interfaces; description
    /// failures never should.
    fn assert_no_negotiation_failures(&mut self) {
        while let Ok(failure) = self.failures.try_recv() {
            assert!(
                !matches!(failure, SessionFailure::Negotiation { .. }),
                "unexpected failure: {failure}"
            );
        }
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.sink.peer_connection().signaling_state()
    }
}

async fn deliver(sender: &Peer, to: &mut Peer) -> bool {
    let messages = sender.outbox.drain();
    let any = !messages.is_empty();
    for message in messages {
        to.engine.handle(EngineInput::Remote(message)).await;
    }
    any
}

/// Relays until both engines are stable and nothing moved for a while.
/// Peer connection callbacks fire on their own tasks, so quiet is measured
/// in wall time.
async fn settle(a: &mut Peer, b: &mut Peer) {
    let deadline = Instant::now() + SETTLE;
    let mut quiet = 0;
    while Instant::now() < deadline {
        let mut busy = a.pump_sink().await;
        busy |= b.pump_sink().await;
        busy |= deliver(a, b).await;
        busy |= deliver(b, a).await;
        quiet = if busy { 0 } else { quiet + 1 };
        let stable = a.engine.state() == NegotiationState::Stable
            && b.engine.state() == NegotiationState::Stable;
        if stable && quiet >= 10 {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "negotiation did not settle: alice={} bob={}",
        a.engine.state(),
        b.engine.state()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_connections_negotiate_to_stable() {
    let mut a = peer(1).await;
    let mut b = peer(2).await;

    b.engine.handle(join(1)).await;
    assert_eq!(b.engine.state(), NegotiationState::HaveLocalOffer);
    assert_eq!(b.signaling_state(), RTCSignalingState::HaveLocalOffer);

    settle(&mut a, &mut b).await;

    assert_eq!(a.signaling_state(), RTCSignalingState::Stable);
    assert_eq!(b.signaling_state(), RTCSignalingState::Stable);
    let at_a = a.sink.peer_connection().current_remote_description().await;
    let at_b = b.sink.peer_connection().current_remote_description().await;
    assert!(at_a.is_some_and(|d| d.sdp.contains("m=audio") && d.sdp.contains("m=video")));
    assert!(at_b.is_some_and(|d| d.sdp.contains("m=audio") && d.sdp.contains("m=video")));
    a.assert_no_negotiation_failures();
    b.assert_no_negotiation_failures();
}

#[tokio::test(flavor = "multi_thread")]
async fn polite_peer_rolls_back_on_glare() {
    let mut a = peer(1).await;
    let mut b = peer(2).await;

    a.engine.handle(join(2)).await;
    a.engine.handle(EngineInput::Renegotiate).await;
    b.engine.handle(join(1)).await;
    assert_eq!(a.signaling_state(), RTCSignalingState::HaveLocalOffer);
    assert_eq!(b.signaling_state(), RTCSignalingState::HaveLocalOffer);

    let from_a = a.outbox.drain();
    let from_b = b.outbox.drain();
    for message in from_b {
        a.engine.handle(EngineInput::Remote(message)).await;
    }
    for message in from_a {
        b.engine.handle(EngineInput::Remote(message)).await;
    }

    // Alice dropped her offer and answered Bob's.
    assert_eq!(a.engine.state(), NegotiationState::Stable);
    assert_eq!(a.signaling_state(), RTCSignalingState::Stable);
    assert_eq!(b.engine.state(), NegotiationState::HaveLocalOffer);
    a.assert_no_negotiation_failures();

    settle(&mut a, &mut b).await;

    assert_eq!(a.signaling_state(), RTCSignalingState::Stable);
    assert_eq!(b.signaling_state(), RTCSignalingState::Stable);
    a.assert_no_negotiation_failures();
    b.assert_no_negotiation_failures();
}

#[tokio::test(flavor = "multi_thread")]
async fn releasing_local_tracks_detaches_them() {
    let sink = WebRtcSink::new(Vec::new()).await.expect("peer connection");
    sink.acquire_local_tracks(MediaConstraints::AUDIO_VIDEO)
        .await
        .expect("local tracks");
    assert!(sink.local_track(TrackKind::Audio).is_some());
    assert!(sink.local_track(TrackKind::Video).is_some());

    sink.release_local_tracks();
    assert!(sink.local_track(TrackKind::Audio).is_none());
    assert!(sink.local_track(TrackKind::Video).is_none());

    let again = sink
        .acquire_local_tracks(MediaConstraints::AUDIO_ONLY)
        .await
        .expect("tracks after release");
    assert_eq!(again.tracks.len(), 1);
    assert!(sink.local_track(TrackKind::Audio).is_some());
    assert!(sink.local_track(TrackKind::Video).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_acquisition_leaves_no_tracks_behind() {
    let sink = WebRtcSink::new(Vec::new()).await.expect("peer connection");
    sink.peer_connection().close().await.expect("close");

    let err = sink
        .acquire_local_tracks(MediaConstraints::AUDIO_VIDEO)
        .await
        .expect_err("closed connection refuses tracks");
    assert!(matches!(err, SinkError::NoDevices(_)));
    assert!(sink.local_track(TrackKind::Audio).is_none());
    assert!(sink.local_track(TrackKind::Video).is_none());
}
