use std::cmp::Ordering;
use std::fmt;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;

/// Identifier of a session participant.
///
/// Numeric ids (the web app's user ids) order numerically, anything else
/// orders as text, and every numeric id sorts before every text id. Both
/// ends of a session derive negotiation roles from this order.
///
/// Only canonical decimal text becomes numeric: "007" stays text so it never
/// collides with "7" and survives a round trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParticipantId {
    Numeric(u64),
    Text(String),
}

impl ParticipantId {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        match raw.parse::<u64>() {
            Ok(value) if value.to_string() == raw => ParticipantId::Numeric(value),
            _ => ParticipantId::Text(raw),
        }
    }
}

impl From<u64> for ParticipantId {
    fn from(value: u64) -> Self {
        ParticipantId::Numeric(value)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        ParticipantId::new(value)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        ParticipantId::new(value)
    }
}

impl Ord for ParticipantId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ParticipantId::Numeric(a), ParticipantId::Numeric(b)) => a.cmp(b),
            (ParticipantId::Text(a), ParticipantId::Text(b)) => a.cmp(b),
            (ParticipantId::Numeric(_), ParticipantId::Text(_)) => Ordering::Less,
            (ParticipantId::Text(_), ParticipantId::Numeric(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for ParticipantId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Numeric(value) => write!(f, "{value}"),
            ParticipantId::Text(value) => f.write_str(value),
        }
    }
}

impl Serialize for ParticipantId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParticipantId::Numeric(value) => serializer.serialize_u64(*value),
            ParticipantId::Text(value) => serializer.serialize_str(value),
        }
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireId {
            Numeric(u64),
            Text(String),
        }

        Ok(match WireId::deserialize(deserializer)? {
            WireId::Numeric(value) => ParticipantId::Numeric(value),
            WireId::Text(value) => ParticipantId::new(value),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sdp {
    pub sdp: String,
}

impl Sdp {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Offer(Sdp),
    Answer(Sdp),
    Candidate(IceCandidate),
    UserJoin { peer_id: ParticipantId },
    UserLeave { peer_id: ParticipantId },
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Offer(_) => "offer",
            SignalBody::Answer(_) => "answer",
            SignalBody::Candidate(_) => "candidate",
            SignalBody::UserJoin { .. } => "user_join",
            SignalBody::UserLeave { .. } => "user_leave",
        }
    }
}

/// One message on a video session's signaling channel.
///
/// The transport routes these without looking inside; validation happens
/// once, when a frame is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct SignalingMessage {
    pub session_id: String,
    pub sender: Participant,
    pub body: SignalBody,
}

impl SignalingMessage {
    pub fn new(session_id: impl Into<String>, sender: Participant, body: SignalBody) -> Self {
        Self {
            session_id: session_id.into(),
            sender,
            body,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerPayload {
    peer_id: ParticipantId,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    session_id: String,
    user_id: ParticipantId,
    #[serde(default)]
    user_name: String,
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, ChannelError> {
    serde_json::from_value(value)
        .map_err(|err| ChannelError::Decode(format!("invalid {kind} payload: {err}")))
}

impl TryFrom<WireEnvelope> for SignalingMessage {
    type Error = ChannelError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let body = match wire.kind.as_str() {
            "offer" => SignalBody::Offer(payload("offer", wire.payload)?),
            "answer" => SignalBody::Answer(payload("answer", wire.payload)?),
            "candidate" => SignalBody::Candidate(payload("candidate", wire.payload)?),
            "user_join" => {
                let peer: PeerPayload = payload("user_join", wire.payload)?;
                SignalBody::UserJoin {
                    peer_id: peer.peer_id,
                }
            }
            "user_leave" => {
                let peer: PeerPayload = payload("user_leave", wire.payload)?;
                SignalBody::UserLeave {
                    peer_id: peer.peer_id,
                }
            }
            other => return Err(ChannelError::UnknownMessageType(other.to_string())),
        };
        Ok(SignalingMessage {
            session_id: wire.session_id,
            sender: Participant {
                id: wire.user_id,
                name: wire.user_name,
            },
            body,
        })
    }
}

impl From<SignalingMessage> for WireEnvelope {
    fn from(message: SignalingMessage) -> Self {
        let kind = message.kind().to_string();
        let payload = match message.body {
            SignalBody::Offer(sdp) | SignalBody::Answer(sdp) => serde_json::to_value(sdp),
            SignalBody::Candidate(candidate) => serde_json::to_value(candidate),
            SignalBody::UserJoin { peer_id } | SignalBody::UserLeave { peer_id } => {
                serde_json::to_value(PeerPayload { peer_id })
            }
        }
        .unwrap_or(Value::Null);
        WireEnvelope {
            kind,
            payload,
            session_id: message.session_id,
            user_id: message.sender.id,
            user_name: message.sender.name,
        }
    }
}
