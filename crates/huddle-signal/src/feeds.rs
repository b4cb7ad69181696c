//! Payloads for the notification and whiteboard channels.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::ParticipantId;
use crate::transport::{ConnectionState, SignalingTransport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    Notification {
        id: u64,
        category: String,
        title: String,
        #[serde(default)]
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        link: Option<String>,
        created_at: i64,
    },
    UnreadCount {
        count: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub stroke_id: String,
    pub author: ParticipantId,
    pub color: String,
    pub width: f32,
    pub points: Vec<[f32; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WhiteboardEvent {
    Stroke(Stroke),
    Erase { stroke_id: String },
    Clear { author: ParticipantId },
    Snapshot { strokes: Vec<Stroke> },
    SyncRequest,
}

/// Local replica of a board. Applying the same event twice leaves the
/// replica unchanged, so replays after a reconnect are harmless.
#[derive(Debug, Clone, Default)]
pub struct Whiteboard {
    strokes: BTreeMap<String, Stroke>,
}

impl Whiteboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the replica changed.
    pub fn apply(&mut self, event: &WhiteboardEvent) -> bool {
        match event {
            WhiteboardEvent::Stroke(stroke) => {
                if self.strokes.get(&stroke.stroke_id) == Some(stroke) {
                    return false;
                }
                self.strokes.insert(stroke.stroke_id.clone(), stroke.clone());
                true
            }
            WhiteboardEvent::Erase { stroke_id } => self.strokes.remove(stroke_id).is_some(),
            WhiteboardEvent::Clear { .. } => {
                let changed = !self.strokes.is_empty();
                self.strokes.clear();
                changed
            }
            WhiteboardEvent::Snapshot { strokes } => {
                let next: BTreeMap<_, _> = strokes
                    .iter()
                    .map(|stroke| (stroke.stroke_id.clone(), stroke.clone()))
                    .collect();
                let changed = next != self.strokes;
                self.strokes = next;
                changed
            }
            WhiteboardEvent::SyncRequest => false,
        }
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    pub fn stroke(&self, stroke_id: &str) -> Option<&Stroke> {
        self.strokes.get(stroke_id)
    }

    pub fn snapshot(&self) -> WhiteboardEvent {
        WhiteboardEvent::Snapshot {
            strokes: self.strokes.values().cloned().collect(),
        }
    }
}

/// Asks the coordinator for a fresh snapshot every time the channel opens.
/// Whatever was in flight during a drop is not replayed.
pub fn resync_on_open(transport: &Arc<SignalingTransport<WhiteboardEvent>>) -> JoinHandle<()> {
    let mut state = transport.watch_state();
    let weak = Arc::downgrade(transport);
    tokio::spawn(async move {
        loop {
            if *state.borrow_and_update() == ConnectionState::Open {
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                match transport.send(&WhiteboardEvent::SyncRequest) {
                    Ok(()) => debug!(target: "huddle::signal", "whiteboard sync requested"),
                    Err(err) => warn!(target: "huddle::signal", error = %err, "whiteboard sync request failed"),
                }
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroke(id: &str) -> Stroke {
        Stroke {
            stroke_id: id.into(),
            author: ParticipantId::Numeric(1),
            color: "#222".into(),
            width: 2.0,
            points: vec![[0.0, 0.0], [4.0, 3.0]],
        }
    }

    #[test]
    fn replica_is_idempotent() {
        let mut board = Whiteboard::new();
        let event = WhiteboardEvent::Stroke(stroke("s1"));
        assert!(board.apply(&event));
        assert!(!board.apply(&event));
        assert!(board.apply(&WhiteboardEvent::Erase {
            stroke_id: "s1".into()
        }));
        assert!(!board.apply(&WhiteboardEvent::Erase {
            stroke_id: "s1".into()
        }));
        assert!(board.is_empty());
    }

    #[test]
    fn snapshot_replaces_state() {
        let mut board = Whiteboard::new();
        board.apply(&WhiteboardEvent::Stroke(stroke("old")));
        let snapshot = WhiteboardEvent::Snapshot {
            strokes: vec![stroke("a"), stroke("b")],
        };
        assert!(board.apply(&snapshot));
        assert_eq!(board.len(), 2);
        assert!(board.stroke("old").is_none());
        assert_eq!(board.snapshot(), snapshot);
    }

    #[test]
    fn events_use_tagged_json() {
        let json = serde_json::to_value(WhiteboardEvent::SyncRequest).expect("encode");
        assert_eq!(json, serde_json::json!({ "type": "sync_request" }));

        let raw = r#"{"type":"unread_count","count":3}"#;
        let event: NotificationEvent = serde_json::from_str(raw).expect("decode");
        assert_eq!(event, NotificationEvent::UnreadCount { count: 3 });

        let raw = r#"{"type":"stroke","stroke_id":"s9","author":"7","color":"red","width":1.5,"points":[[1,2]]}"#;
        let WhiteboardEvent::Stroke(decoded) = serde_json::from_str(raw).expect("decode") else {
            panic!("expected stroke");
        };
        assert_eq!(decoded.author, ParticipantId::Numeric(7));
    }
}
