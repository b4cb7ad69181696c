use std::sync::Arc;
use std::time::Duration;

use huddle_negotiation::mock::MockSink;
use huddle_negotiation::{
    CapabilitySink, MediaConstraints, MediaProfile, MediaStream, NegotiationState, PeerSession,
    SessionConfig, SessionError, SessionFailure, SinkError, TrackKind,
};
use huddle_signal::{ChannelConfig, ConnectionState, LoopbackCoordinator, Participant};
use tokio::time::{sleep, timeout};

const SESSION: &str = "S100";
const ROOM: &str = "/ws/video/S100";
const WAIT: Duration = Duration::from_secs(120);

fn config(id: u64, name: &str) -> SessionConfig {
    SessionConfig {
        session_id: SESSION.to_string(),
        local: Participant::new(id, name),
        channel: ChannelConfig {
            jitter: 0.0,
            keepalive: None,
            ..ChannelConfig::default()
        },
        media: MediaProfile::AudioVideo,
    }
}

async fn start(
    coordinator: &LoopbackCoordinator,
    config: SessionConfig,
    sink: &Arc<MockSink>,
) -> Result<PeerSession, SessionError> {
    let sink: Arc<dyn CapabilitySink> = sink.clone();
    PeerSession::start(config, Arc::new(coordinator.clone()), async move {
        Ok::<_, SinkError>(sink)
    })
    .await
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let polled = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

async fn stable(session: &PeerSession) {
    let mut rx = session.watch_negotiation();
    timeout(WAIT, rx.wait_for(|state| *state == NegotiationState::Stable))
        .await
        .expect("negotiation settles in time")
        .expect("engine alive");
}

async fn remote_tracks(session: &PeerSession, count: usize) -> MediaStream {
    let mut rx = session.watch_remote_stream();
    let stream = timeout(
        WAIT,
        rx.wait_for(|stream| stream.as_ref().is_some_and(|s| s.tracks.len() == count)),
    )
    .await
    .expect("remote tracks in time")
    .expect("engine alive");
    stream.clone().expect("remote stream")
}

async fn pair(
    coordinator: &LoopbackCoordinator,
) -> (PeerSession, Arc<MockSink>, PeerSession, Arc<MockSink>) {
    let alice_sink = MockSink::new("alice");
    let alice = start(coordinator, config(1, "alice"), &alice_sink)
        .await
        .expect("alice starts");
    eventually("alice connected", || alice.is_connected()).await;

    let bob_sink = MockSink::new("bob");
    let bob = start(coordinator, config(2, "bob"), &bob_sink)
        .await
        .expect("bob starts");
    (alice, alice_sink, bob, bob_sink)
}

#[tokio::test(start_paused = true)]
async fn two_participants_negotiate_media() {
    let coordinator = LoopbackCoordinator::new();
    let (alice, alice_sink, bob, bob_sink) = pair(&coordinator).await;

    stable(&alice).await;
    stable(&bob).await;
    let at_alice = remote_tracks(&alice, 2).await;
    let at_bob = remote_tracks(&bob, 2).await;

    assert_eq!(at_alice.id, "bob-stream");
    assert_eq!(at_bob.id, "alice-stream");
    assert_eq!(alice.media_profile(), MediaProfile::AudioVideo);
    assert_eq!(alice_sink.offers_created(), 0, "the polite peer answers");
    assert_eq!(bob_sink.offers_created(), 1);
    assert_eq!(coordinator.live_connections(ROOM), 2);
}

#[tokio::test(start_paused = true)]
async fn signaling_blip_does_not_renegotiate() {
    let coordinator = LoopbackCoordinator::new();
    let (alice, alice_sink, bob, bob_sink) = pair(&coordinator).await;
    stable(&alice).await;
    stable(&bob).await;
    remote_tracks(&alice, 2).await;
    let dials = coordinator.dial_count();
    let mut failures = alice.subscribe_failures();

    coordinator.drop_all();
    eventually("both sides redial", || coordinator.dial_count() == dials + 2).await;
    eventually("both sides reconnected", || {
        alice.is_connected() && bob.is_connected() && coordinator.live_connections(ROOM) == 2
    })
    .await;
    // Let the re-announcements cross.
    sleep(Duration::from_millis(100)).await;

    assert_eq!(alice.negotiation_state(), NegotiationState::Stable);
    assert_eq!(bob.negotiation_state(), NegotiationState::Stable);
    assert_eq!(alice_sink.offers_created(), 0);
    assert_eq!(bob_sink.offers_created(), 1);
    assert!(alice.remote_stream().is_some());
    assert!(failures.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn missing_devices_degrade_instead_of_failing() {
    let coordinator = LoopbackCoordinator::new();
    let alice_sink = MockSink::new("alice");
    alice_sink.fail_acquisition(MediaConstraints::AUDIO_VIDEO);
    let alice = start(&coordinator, config(1, "alice"), &alice_sink)
        .await
        .expect("alice starts without a microphone");
    assert_eq!(alice.media_profile(), MediaProfile::VideoOnly);
    assert!(!alice.local_stream().has(TrackKind::Audio));
    eventually("alice connected", || alice.is_connected()).await;

    let bob_sink = MockSink::new("bob");
    let bob = start(&coordinator, config(2, "bob"), &bob_sink)
        .await
        .expect("bob starts");

    let at_bob = remote_tracks(&bob, 1).await;
    assert!(at_bob.has(TrackKind::Video));
    let at_alice = remote_tracks(&alice, 2).await;
    assert!(at_alice.has(TrackKind::Audio));
}

#[tokio::test(start_paused = true)]
async fn unavailable_capability_aborts_start() {
    let coordinator = LoopbackCoordinator::new();

    let refused = PeerSession::start(
        config(1, "alice"),
        Arc::new(coordinator.clone()),
        async {
            Err::<Arc<dyn CapabilitySink>, _>(SinkError::Unavailable("no webrtc support".into()))
        },
    )
    .await;
    assert!(matches!(
        refused,
        Err(SessionError::CapabilityUnavailable(SinkError::Unavailable(_)))
    ));

    let sink = MockSink::new("alice");
    sink.set_unavailable();
    let refused = start(&coordinator, config(1, "alice"), &sink).await;
    assert!(matches!(refused, Err(SessionError::CapabilityUnavailable(_))));
    assert_eq!(coordinator.dial_count(), 0, "no signaling without a capability");
}

#[tokio::test(start_paused = true)]
async fn empty_session_id_is_rejected() {
    let coordinator = LoopbackCoordinator::new();
    let sink = MockSink::new("alice");
    let mut bad = config(1, "alice");
    bad.session_id = "  ".into();

    let result = start(&coordinator, bad, &sink).await;
    assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    assert!(sink.local_tracks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_a_session_cancels_negotiation_and_releases_media() {
    let coordinator = LoopbackCoordinator::new();
    let alice_sink = MockSink::new("alice");
    let alice = start(&coordinator, config(1, "alice"), &alice_sink)
        .await
        .expect("alice starts");
    eventually("alice connected", || alice.is_connected()).await;

    let bob_sink = MockSink::new("bob");
    bob_sink.gate_offers();
    let bob = start(&coordinator, config(2, "bob"), &bob_sink)
        .await
        .expect("bob starts");
    eventually("bob mid-offer", || bob_sink.in_flight() == 1).await;

    drop(bob);

    assert!(bob_sink.tracks_released());
    eventually("offer cancelled", || bob_sink.in_flight() == 0).await;
    eventually("bob's connection closed", || coordinator.live_connections(ROOM) == 1).await;
    assert_eq!(bob_sink.offers_created(), 0);
    assert_eq!(alice.negotiation_state(), NegotiationState::Idle);
}

#[tokio::test(start_paused = true)]
async fn leaving_resets_the_remaining_peer() {
    let coordinator = LoopbackCoordinator::new();
    let (alice, alice_sink, bob, _bob_sink) = pair(&coordinator).await;
    stable(&alice).await;
    remote_tracks(&bob, 2).await;

    alice.leave().await;
    assert!(alice_sink.tracks_released());

    let mut remote = bob.watch_remote_stream();
    timeout(WAIT, remote.wait_for(|stream| stream.is_none()))
        .await
        .expect("remote stream cleared")
        .expect("engine alive");
    let mut negotiation = bob.watch_negotiation();
    timeout(WAIT, negotiation.wait_for(|state| *state == NegotiationState::Idle))
        .await
        .expect("negotiation reset")
        .expect("engine alive");
    eventually("alice's connection closed", || coordinator.live_connections(ROOM) == 1).await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_coordinator_surfaces_transport_failure() {
    let coordinator = LoopbackCoordinator::new();
    coordinator.set_offline(true);
    let sink = MockSink::new("alice");
    let alice = start(&coordinator, config(1, "alice"), &sink)
        .await
        .expect("start does not wait for signaling");
    let mut failures = alice.subscribe_failures();

    let failure = timeout(WAIT, failures.recv())
        .await
        .expect("failure in time")
        .expect("failure channel open");
    assert_eq!(failure, SessionFailure::TransportFailed { attempts: 5 });
    assert_eq!(coordinator.dial_count(), 6);
    assert_eq!(alice.connection_state(), ConnectionState::Closed);
}
