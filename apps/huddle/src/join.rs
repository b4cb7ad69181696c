use std::sync::Arc;

use huddle_negotiation::{CapabilitySink, PeerSession, SessionConfig, SessionFailure, WebRtcSink};
use huddle_signal::{ChannelConfig, Participant, ParticipantId, WsConnector};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::JoinArgs;
use crate::error::CliError;

pub async fn run(channel: ChannelConfig, args: JoinArgs) -> Result<(), CliError> {
    let user_id = args.user_id.trim();
    if user_id.is_empty() {
        return Err(CliError::InvalidArgument("--user-id must not be empty".into()));
    }
    let config = SessionConfig {
        session_id: args.session.trim().to_string(),
        local: Participant::new(ParticipantId::new(user_id), args.user_name.clone()),
        channel,
        media: args.media(),
    };
    let ice_servers = args.ice_servers.clone();
    let session = PeerSession::start(config, Arc::new(WsConnector), async move {
        WebRtcSink::new(ice_servers)
            .await
            .map(|sink| sink as Arc<dyn CapabilitySink>)
    })
    .await?;

    info!(
        target: "huddle::cli",
        session = %session.session_id(),
        user = %session.local().id,
        profile = %session.media_profile(),
        tracks = session.local_stream().tracks.len(),
        "joined; press Ctrl-C to leave"
    );

    let outcome = watch_session(&session).await;
    session.leave().await;
    outcome
}

async fn watch_session(session: &PeerSession) -> Result<(), CliError> {
    let mut negotiation = session.watch_negotiation();
    let mut connection = session.watch_connection();
    let mut remote = session.watch_remote_stream();
    let mut failures = session.subscribe_failures();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            interrupted = &mut ctrl_c => {
                interrupted?;
                info!(target: "huddle::cli", "leaving session");
                return Ok(());
            }
            changed = negotiation.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = *negotiation.borrow_and_update();
                info!(target: "huddle::cli", state = %state, "negotiation");
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = *connection.borrow_and_update();
                info!(target: "huddle::cli", state = %state, "signaling");
            }
            changed = remote.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                match remote.borrow_and_update().as_ref() {
                    Some(stream) => info!(
                        target: "huddle::cli",
                        stream = %stream.id,
                        tracks = stream.tracks.len(),
                        "remote media"
                    ),
                    None => info!(target: "huddle::cli", "peer left"),
                }
            }
            failure = failures.recv() => match failure {
                Ok(SessionFailure::TransportFailed { attempts }) => {
                    return Err(CliError::SignalingLost { attempts });
                }
                Ok(failure) => warn!(target: "huddle::cli", error = %failure, "session failure"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "huddle::cli", skipped, "missed session failures");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}
