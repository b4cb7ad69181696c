use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use huddle_signal::feeds::resync_on_open;
use huddle_signal::{
    ChannelConfig, ChannelKind, NotificationEvent, SignalingTransport, TransportEvent, Whiteboard,
    WhiteboardEvent, WsConnector,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::cli::WhiteboardArgs;
use crate::error::CliError;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

pub async fn notifications(channel: ChannelConfig) -> Result<(), CliError> {
    let transport = SignalingTransport::<NotificationEvent>::from_config(
        &channel,
        &ChannelKind::Notifications,
        Arc::new(WsConnector),
    )?;
    follow(&transport, |event| print_line(&event)).await
}

pub async fn whiteboard(channel: ChannelConfig, args: WhiteboardArgs) -> Result<(), CliError> {
    let board_id = args.board.trim();
    if board_id.is_empty() {
        return Err(CliError::InvalidArgument("--board must not be empty".into()));
    }
    let transport = Arc::new(SignalingTransport::<WhiteboardEvent>::from_config(
        &channel,
        &ChannelKind::whiteboard(board_id),
        Arc::new(WsConnector),
    )?);
    let resync = resync_on_open(&transport);

    let mut replica = Whiteboard::new();
    let outcome = follow(&transport, |event| {
        if replica.apply(&event) {
            debug!(target: "huddle::cli", strokes = replica.len(), "board updated");
        }
        print_line(&event)
    })
    .await;
    resync.abort();
    outcome
}

/// Pumps decoded frames into `handle` until Ctrl-C or the transport gives up.
async fn follow<M, F>(transport: &SignalingTransport<M>, mut handle: F) -> Result<(), CliError>
where
    M: Serialize + DeserializeOwned + Send + 'static,
    F: FnMut(M) -> Result<(), CliError>,
{
    let mut inbound = transport.take_inbound()?;
    let mut events = transport.subscribe_events();
    transport.connect()?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            interrupted = &mut ctrl_c => break interrupted.map_err(CliError::from),
            message = inbound.recv() => match message {
                Some(message) => {
                    if let Err(err) = handle(message) {
                        break Err(err);
                    }
                }
                None => break Ok(()),
            },
            event = events.recv() => match event {
                Ok(TransportEvent::Failed { attempts }) => break Err(CliError::SignalingLost { attempts }),
                Ok(TransportEvent::StateChanged(state)) => {
                    info!(target: "huddle::cli", state = %state, "channel");
                }
                Ok(TransportEvent::Rejected { reason }) => {
                    warn!(target: "huddle::cli", reason = %reason, "skipped undecodable frame");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "huddle::cli", skipped, "missed channel events");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };
    transport.shutdown(SHUTDOWN_GRACE).await;
    outcome
}

fn print_line<T: Serialize>(value: &T) -> Result<(), CliError> {
    let line = serde_json::to_string(value)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}
