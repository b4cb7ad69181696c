//! In-memory [`CapabilitySink`] for tests and demos.
//!
//! Models the offer/answer signaling states of a peer connection closely
//! enough to catch protocol mistakes: answers without an offer fail,
//! remote offers roll back a local offer, and candidates must match the
//! remote description's ICE username fragment.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use huddle_signal::IceCandidate;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};

use crate::error::{SinkError, SinkResult};
use crate::sink::{
    CapabilitySink, MediaConstraints, MediaStream, MediaTrack, SdpKind, SessionDescription,
    SinkEvent, TrackKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug)]
struct State {
    signaling: SignalingState,
    generation: u32,
    local_tracks: Vec<MediaTrack>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_ufrag: Option<String>,
    remote_tracks: HashSet<String>,
    applied: Vec<IceCandidate>,
    rejected: Vec<IceCandidate>,
    offers_created: u32,
    rollbacks: u32,
    releases: u32,
    failing: HashSet<(bool, bool)>,
    unavailable: bool,
    offers_fail: bool,
    remote_descriptions_fail: bool,
    candidates_per_description: u32,
}

pub struct MockSink {
    label: String,
    state: Mutex<State>,
    events_tx: mpsc::UnboundedSender<SinkEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SinkEvent>>>,
    offer_gate: Mutex<Option<Arc<Semaphore>>>,
    in_flight: Arc<AtomicUsize>,
}

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockSink {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.into(),
            state: Mutex::new(State {
                signaling: SignalingState::Stable,
                generation: 0,
                local_tracks: Vec::new(),
                local_description: None,
                remote_description: None,
                remote_ufrag: None,
                remote_tracks: HashSet::new(),
                applied: Vec::new(),
                rejected: Vec::new(),
                offers_created: 0,
                rollbacks: 0,
                releases: 0,
                failing: HashSet::new(),
                unavailable: false,
                offers_fail: false,
                remote_descriptions_fail: false,
                candidates_per_description: 1,
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            offer_gate: Mutex::new(None),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Makes acquisition with exactly these constraints fail with `NoDevices`.
    pub fn fail_acquisition(&self, constraints: MediaConstraints) {
        self.state
            .lock()
            .failing
            .insert((constraints.audio, constraints.video));
    }

    /// Makes every acquisition fail with `Unavailable`.
    pub fn set_unavailable(&self) {
        self.state.lock().unavailable = true;
    }

    /// Makes `create_offer` fail while set.
    pub fn fail_offers(&self, fail: bool) {
        self.state.lock().offers_fail = fail;
    }

    /// Makes `set_remote_description` fail without touching signaling
    /// state, the way a refused rollback does.
    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.state.lock().remote_descriptions_fail = fail;
    }

    pub fn set_candidates_per_description(&self, count: u32) {
        self.state.lock().candidates_per_description = count;
    }

    /// Holds every `create_offer` call until `release_offers` is called.
    pub fn gate_offers(&self) {
        *self.offer_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_offers(&self) {
        if let Some(gate) = self.offer_gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    /// Description operations currently awaiting completion.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Feeds an event as if the platform raised it.
    pub fn emit(&self, event: SinkEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn rejected_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().rejected.clone()
    }

    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers_created
    }

    pub fn rollbacks(&self) -> u32 {
        self.state.lock().rollbacks
    }

    pub fn tracks_released(&self) -> bool {
        self.state.lock().releases > 0
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().local_tracks.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    /// The ICE username fragment of the current local description.
    pub fn local_ufrag(&self) -> Option<String> {
        self.state
            .lock()
            .local_description
            .as_ref()
            .and_then(|description| ufrag_of(&description.sdp))
    }

    fn describe(&self, state: &mut State) -> String {
        state.generation += 1;
        let mut sdp = format!(
            "v=0\r\no=- {generation} 2 IN IP4 127.0.0.1\r\ns={label}\r\nt=0 0\r\na=ice-ufrag:{label}-{generation}\r\n",
            generation = state.generation,
            label = self.label,
        );
        for track in &state.local_tracks {
            let media = match track.kind {
                TrackKind::Audio => "audio 9 UDP/TLS/RTP/SAVPF 111",
                TrackKind::Video => "video 9 UDP/TLS/RTP/SAVPF 96",
            };
            sdp.push_str(&format!("m={media}\r\na=msid:{}-stream {}\r\n", self.label, track.id));
        }
        sdp
    }

    fn emit_local_candidates(&self, state: &State, description: &SessionDescription) {
        let Some(ufrag) = ufrag_of(&description.sdp) else {
            return;
        };
        for index in 0..state.candidates_per_description {
            let candidate = IceCandidate::new(format!(
                "candidate:{index} 1 udp 2122260223 127.0.0.1 {} typ host",
                50000 + index
            ))
            .with_mid("0", 0)
            .with_username_fragment(ufrag.clone());
            let _ = self.events_tx.send(SinkEvent::LocalCandidate(candidate));
        }
    }

    fn emit_remote_tracks(&self, state: &mut State, sdp: &str) {
        let mut kind = None;
        for line in sdp.lines() {
            if let Some(media) = line.strip_prefix("m=") {
                kind = match media.split_whitespace().next() {
                    Some("audio") => Some(TrackKind::Audio),
                    Some("video") => Some(TrackKind::Video),
                    _ => None,
                };
            } else if let Some(msid) = line.strip_prefix("a=msid:") {
                let mut parts = msid.split_whitespace();
                let (Some(stream_id), Some(track_id), Some(kind)) = (parts.next(), parts.next(), kind)
                else {
                    continue;
                };
                if state.remote_tracks.insert(track_id.to_string()) {
                    let _ = self.events_tx.send(SinkEvent::Track {
                        track: MediaTrack {
                            id: track_id.to_string(),
                            kind,
                        },
                        stream_id: stream_id.to_string(),
                    });
                }
            }
        }
    }
}

fn ufrag_of(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("a=ice-ufrag:"))
        .map(|ufrag| ufrag.trim().to_string())
}

#[async_trait]
impl CapabilitySink for MockSink {
    async fn acquire_local_tracks(&self, constraints: MediaConstraints) -> SinkResult<MediaStream> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(SinkError::Unavailable("peer connection cannot be created".into()));
        }
        if state.failing.contains(&(constraints.audio, constraints.video)) {
            return Err(SinkError::NoDevices(format!(
                "audio={} video={}",
                constraints.audio, constraints.video
            )));
        }
        let mut stream = MediaStream::new(format!("{}-stream", self.label));
        if constraints.audio {
            stream.insert(MediaTrack {
                id: format!("{}-audio", self.label),
                kind: TrackKind::Audio,
            });
        }
        if constraints.video {
            stream.insert(MediaTrack {
                id: format!("{}-video", self.label),
                kind: TrackKind::Video,
            });
        }
        state.local_tracks = stream.tracks.clone();
        Ok(stream)
    }

    async fn create_offer(&self) -> SinkResult<SessionDescription> {
        let _guard = InFlight::enter(&self.in_flight);
        let gate = self.offer_gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| SinkError::Description("offer gate closed".into()))?;
        }
        let mut state = self.state.lock();
        if state.offers_fail {
            return Err(SinkError::Description("offer creation failed".into()));
        }
        if state.signaling == SignalingState::HaveRemoteOffer {
            return Err(SinkError::Description("cannot offer while holding a remote offer".into()));
        }
        state.offers_created += 1;
        let sdp = self.describe(&mut state);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> SinkResult<SessionDescription> {
        let _guard = InFlight::enter(&self.in_flight);
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(SinkError::Description("no remote offer to answer".into()));
        }
        let sdp = self.describe(&mut state);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> SinkResult<()> {
        let mut state = self.state.lock();
        state.signaling = match (description.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(SinkError::Description(format!(
                    "cannot set local {kind} in {current:?}"
                )))
            }
        };
        self.emit_local_candidates(&state, &description);
        state.local_description = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> SinkResult<()> {
        let mut state = self.state.lock();
        if state.remote_descriptions_fail {
            return Err(SinkError::Description(format!(
                "remote {} refused in {:?}",
                description.kind, state.signaling
            )));
        }
        state.signaling = match (description.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::HaveLocalOffer) => {
                state.rollbacks += 1;
                SignalingState::HaveRemoteOffer
            }
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(SinkError::Description(format!(
                    "cannot set remote {kind} in {current:?}"
                )))
            }
        };
        state.remote_ufrag = ufrag_of(&description.sdp);
        self.emit_remote_tracks(&mut state, &description.sdp);
        state.remote_description = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SinkResult<()> {
        let mut state = self.state.lock();
        let verdict = match (&state.remote_ufrag, &candidate.username_fragment) {
            _ if state.remote_description.is_none() => Err("no remote description"),
            (Some(expected), Some(got)) if expected != got => Err("username fragment mismatch"),
            _ => Ok(()),
        };
        match verdict {
            Ok(()) => {
                state.applied.push(candidate);
                Ok(())
            }
            Err(reason) => {
                state.rejected.push(candidate);
                Err(SinkError::Candidate(reason.into()))
            }
        }
    }

    fn take_events(&self) -> SinkResult<mpsc::UnboundedReceiver<SinkEvent>> {
        self.events_rx.lock().take().ok_or(SinkError::EventsTaken)
    }

    fn release_local_tracks(&self) {
        let mut state = self.state.lock();
        state.local_tracks.clear();
        state.releases += 1;
    }
}
