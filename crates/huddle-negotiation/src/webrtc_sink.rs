//! [`CapabilitySink`] backed by a webrtc-rs peer connection.
//!
//! Local tracks are sample tracks (opus audio, VP8 video); the host writes
//! encoded samples into them through [`WebRtcSink::local_track`].

use std::sync::Arc;

use async_trait::async_trait;
use huddle_signal::IceCandidate;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{SinkError, SinkResult};
use crate::sink::{
    CapabilitySink, MediaConstraints, MediaStream, MediaTrack, SdpKind, SessionDescription,
    SinkEvent, TrackKind,
};

const LOCAL_STREAM_ID: &str = "huddle-local";

struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
}

pub struct WebRtcSink {
    pc: Arc<RTCPeerConnection>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SinkEvent>>>,
    local: Mutex<Vec<LocalTrack>>,
}

fn build_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn unavailable(err: webrtc::Error) -> SinkError {
    SinkError::Unavailable(err.to_string())
}

fn description(err: webrtc::Error) -> SinkError {
    SinkError::Description(err.to_string())
}

impl WebRtcSink {
    /// Fails with [`SinkError::Unavailable`] when no peer connection can be
    /// built.
    pub async fn new(ice_servers: Vec<String>) -> SinkResult<Arc<Self>> {
        let api = build_api().map_err(unavailable)?;
        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers,
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(unavailable)?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidates = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let candidates = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target: "huddle::sink", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidates.send(SinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(target: "huddle::sink", error = %err, "cannot serialize local candidate"),
                }
            })
        }));

        let tracks = events_tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tracks = tracks.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    other => {
                        debug!(target: "huddle::sink", kind = %other, "ignoring remote track");
                        return;
                    }
                };
                let _ = tracks.send(SinkEvent::Track {
                    track: MediaTrack {
                        id: track.id(),
                        kind,
                    },
                    stream_id: track.stream_id(),
                });
            })
        }));

        let negotiation = events_tx;
        pc.on_negotiation_needed(Box::new(move || {
            let negotiation = negotiation.clone();
            Box::pin(async move {
                let _ = negotiation.send(SinkEvent::NegotiationNeeded);
            })
        }));

        Ok(Arc::new(Self {
            pc,
            events_rx: Mutex::new(Some(events_rx)),
            local: Mutex::new(Vec::new()),
        }))
    }

    /// Sample track the host feeds for `kind`, if one was acquired.
    pub fn local_track(&self, kind: TrackKind) -> Option<Arc<TrackLocalStaticSample>> {
        self.local
            .lock()
            .iter()
            .find(|local| local.kind == kind)
            .map(|local| Arc::clone(&local.track))
    }

    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc)
    }

    async fn add_local_track(&self, kind: TrackKind) -> SinkResult<MediaTrack> {
        let (mime, id) = match kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, "huddle-audio"),
            TrackKind::Video => (MIME_TYPE_VP8, "huddle-video"),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| SinkError::NoDevices(err.to_string()))?;

        // Interceptors only run while RTCP is being read.
        let rtcp = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        self.local.lock().push(LocalTrack {
            kind,
            track,
            sender,
        });
        Ok(MediaTrack {
            id: id.to_owned(),
            kind,
        })
    }

    /// Takes the given kinds off the peer connection again.
    async fn detach(&self, kinds: &[TrackKind]) {
        let detached: Vec<LocalTrack> = {
            let mut local = self.local.lock();
            let (detached, kept) = std::mem::take(&mut *local)
                .into_iter()
                .partition(|track| kinds.contains(&track.kind));
            *local = kept;
            detached
        };
        for local in detached {
            if let Err(err) = self.pc.remove_track(&local.sender).await {
                debug!(target: "huddle::sink", error = %err, kind = ?local.kind, "remove_track failed");
            }
        }
    }

    fn to_rtc(description: SessionDescription) -> SinkResult<RTCSessionDescription> {
        match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(self::description)
    }

    fn from_rtc(description: RTCSessionDescription) -> SinkResult<SessionDescription> {
        match description.sdp_type {
            RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
            RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
            other => Err(SinkError::Description(format!("unexpected sdp type {other}"))),
        }
    }
}

#[async_trait]
impl CapabilitySink for WebRtcSink {
    async fn acquire_local_tracks(&self, constraints: MediaConstraints) -> SinkResult<MediaStream> {
        let wanted = [
            (constraints.audio, TrackKind::Audio),
            (constraints.video, TrackKind::Video),
        ];
        let mut stream = MediaStream::new(LOCAL_STREAM_ID);
        for (_, kind) in wanted.into_iter().filter(|(enabled, _)| *enabled) {
            match self.add_local_track(kind).await {
                Ok(track) => {
                    stream.insert(track);
                }
                Err(err) => {
                    // Half an attempt must not stay attached for the next fallback step.
                    let added: Vec<TrackKind> = stream.tracks.iter().map(|track| track.kind).collect();
                    self.detach(&added).await;
                    return Err(err);
                }
            }
        }
        Ok(stream)
    }

    async fn create_offer(&self) -> SinkResult<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(description)?;
        Self::from_rtc(offer)
    }

    async fn create_answer(&self) -> SinkResult<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(description)?;
        Self::from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> SinkResult<()> {
        let description = Self::to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(self::description)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> SinkResult<()> {
        if description.kind == SdpKind::Offer
            && self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            debug!(target: "huddle::sink", "rolling back local offer");
            // webrtc-rs refuses a local description with an empty body.
            let mut rollback = self
                .pc
                .pending_local_description()
                .await
                .unwrap_or_default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc
                .set_local_description(rollback)
                .await
                .map_err(self::description)?;
        }
        let description = Self::to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(self::description)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SinkResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| SinkError::Candidate(err.to_string()))
    }

    fn take_events(&self) -> SinkResult<mpsc::UnboundedReceiver<SinkEvent>> {
        self.events_rx.lock().take().ok_or(SinkError::EventsTaken)
    }

    fn release_local_tracks(&self) {
        let released: Vec<LocalTrack> = std::mem::take(&mut *self.local.lock());
        if released.is_empty() {
            return;
        }
        debug!(target: "huddle::sink", tracks = released.len(), "releasing local tracks");
        let pc = Arc::clone(&self.pc);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                for local in released {
                    if let Err(err) = pc.remove_track(&local.sender).await {
                        debug!(target: "huddle::sink", error = %err, "remove_track failed");
                    }
                }
            });
        }
    }
}

impl Drop for WebRtcSink {
    fn drop(&mut self) {
        let pc = Arc::clone(&self.pc);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = pc.close().await {
                    debug!(target: "huddle::sink", error = %err, "peer connection close failed");
                }
            });
        }
    }
}
