use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::time::{sleep, timeout, Instant};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

use huddle_signal::{
    ChannelConfig, ChannelKind, ConnectionState, IceCandidate, Participant, SignalBody,
    SignalingMessage, SignalingTransport, TransportEvent, WsConnector,
};

const TOKEN: &str = "t0k3n";

type Peers = Vec<(u64, mpsc::UnboundedSender<String>)>;

struct Relay {
    rooms: AsyncMutex<HashMap<String, Peers>>,
    next_id: AtomicU64,
    kill: broadcast::Sender<()>,
}

impl Relay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: AsyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            kill: broadcast::channel(4).0,
        })
    }

    async fn peer_count(&self, session_id: &str) -> usize {
        self.rooms
            .lock()
            .await
            .get(session_id)
            .map(|peers| peers.len())
            .unwrap_or(0)
    }

    async fn wait_for_peers(&self, session_id: &str, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.peer_count(session_id).await != count {
            assert!(Instant::now() < deadline, "peers never registered");
            sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn video_socket(
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(relay): State<Arc<Relay>>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.get("token").map(String::as_str) != Some(TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_peer(socket, session_id, relay))
}

async fn serve_peer(socket: WebSocket, session_id: String, relay: Arc<Relay>) {
    let id = relay.next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut kill = relay.kill.subscribe();
    relay
        .rooms
        .lock()
        .await
        .entry(session_id.clone())
        .or_default()
        .push((id, tx));

    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let mut rooms = relay.rooms.lock().await;
                    if let Some(peers) = rooms.get_mut(&session_id) {
                        peers.retain(|(peer, tx)| *peer == id || tx.send(text.clone()).is_ok());
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            outgoing = rx.recv() => match outgoing {
                Some(text) => {
                    if write.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = kill.recv() => break,
        }
    }

    if let Some(peers) = relay.rooms.lock().await.get_mut(&session_id) {
        peers.retain(|(peer, _)| *peer != id);
    }
}

async fn spawn_coordinator() -> (String, Arc<Relay>) {
    let relay = Relay::new();
    let app = Router::new()
        .route("/ws/video/:session_id", get(video_socket))
        .with_state(Arc::clone(&relay));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://localhost:{}", addr.port()), relay)
}

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn config(base: String, token: &str) -> ChannelConfig {
    ChannelConfig {
        coordinator_url: base,
        token: Some(token.to_string()),
        backoff_base: Duration::from_millis(50),
        max_attempts: 5,
        jitter: 0.0,
        keepalive: Some(Duration::from_millis(200)),
    }
}

fn candidate(session: &str, from: u64, seq: u32) -> SignalingMessage {
    SignalingMessage::new(
        session,
        Participant::new(from, format!("user-{from}")),
        SignalBody::Candidate(
            IceCandidate::new(format!("candidate:{seq} 1 udp 2122260223 10.0.0.{from} 5000{seq} typ host"))
                .with_mid("0", 0),
        ),
    )
}

async fn wait_open(transport: &SignalingTransport<SignalingMessage>) {
    let mut rx = transport.watch_state();
    timeout(
        Duration::from_secs(10),
        rx.wait_for(|state| *state == ConnectionState::Open),
    )
    .await
    .expect("opened in time")
    .expect("state channel");
}

#[tokio::test]
async fn relays_signaling_over_websocket_and_survives_a_coordinator_drop() {
    init_tracing();
    let (base, relay) = spawn_coordinator().await;
    let config = config(base, TOKEN);
    let kind = ChannelKind::video("S100");

    let a = SignalingTransport::<SignalingMessage>::from_config(&config, &kind, Arc::new(WsConnector))
        .expect("transport a");
    let b = SignalingTransport::<SignalingMessage>::from_config(&config, &kind, Arc::new(WsConnector))
        .expect("transport b");
    assert_eq!(a.url().host_str(), Some("127.0.0.1"));
    assert_eq!(a.url().scheme(), "ws");
    let mut inbound = b.take_inbound().expect("inbound");

    a.connect().expect("connect a");
    b.connect().expect("connect b");
    wait_open(&a).await;
    wait_open(&b).await;
    relay.wait_for_peers("S100", 2).await;

    for seq in 0..20 {
        a.send(&candidate("S100", 1, seq)).expect("send");
    }
    for seq in 0..20 {
        let message = timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("relayed in time")
            .expect("inbound open");
        assert_eq!(message, candidate("S100", 1, seq));
    }

    let mut events = b.subscribe_events();
    let _ = relay.kill.send(());
    timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(TransportEvent::StateChanged(ConnectionState::Reconnecting)) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("drop noticed");

    wait_open(&a).await;
    wait_open(&b).await;
    relay.wait_for_peers("S100", 2).await;
    assert_eq!(b.attempt(), 0);

    a.send(&candidate("S100", 1, 99)).expect("send after reconnect");
    let message = timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("relayed after reconnect")
        .expect("inbound open");
    assert_eq!(message, candidate("S100", 1, 99));

    a.shutdown(Duration::from_millis(200)).await;
    b.close();
    assert_eq!(a.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn rejected_handshake_exhausts_retries() {
    init_tracing();
    let (base, _relay) = spawn_coordinator().await;
    let mut config = config(base, "wrong");
    config.max_attempts = 2;
    config.backoff_base = Duration::from_millis(10);

    let transport = SignalingTransport::<SignalingMessage>::from_config(
        &config,
        &ChannelKind::video("S200"),
        Arc::new(WsConnector),
    )
    .expect("transport");
    let mut events = transport.subscribe_events();
    transport.connect().expect("connect");

    let attempts = timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(TransportEvent::Failed { attempts }) = events.recv().await {
                return attempts;
            }
        }
    })
    .await
    .expect("failure reported");
    assert_eq!(attempts, 2);
    assert_eq!(transport.state(), ConnectionState::Closed);
}
