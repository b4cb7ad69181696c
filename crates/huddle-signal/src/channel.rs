use url::Url;

use crate::error::ChannelError;

/// Logical channels the coordinator serves, one socket each.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Video { session_id: String },
    Notifications,
    Whiteboard { board_id: String },
}

impl ChannelKind {
    pub fn video(session_id: impl Into<String>) -> Self {
        ChannelKind::Video {
            session_id: session_id.into(),
        }
    }

    pub fn whiteboard(board_id: impl Into<String>) -> Self {
        ChannelKind::Whiteboard {
            board_id: board_id.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::Video { .. } => "video",
            ChannelKind::Notifications => "notifications",
            ChannelKind::Whiteboard { .. } => "whiteboard",
        }
    }

    fn segments(&self) -> Result<Vec<&str>, ChannelError> {
        match self {
            ChannelKind::Video { session_id } => Ok(vec!["ws", "video", non_empty(session_id)?]),
            ChannelKind::Notifications => Ok(vec!["ws", "notifications"]),
            ChannelKind::Whiteboard { board_id } => {
                Ok(vec!["ws", "whiteboard", non_empty(board_id)?])
            }
        }
    }
}

fn non_empty(id: &str) -> Result<&str, ChannelError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(ChannelError::InvalidEndpoint("empty channel id".into()));
    }
    Ok(trimmed)
}

/// Builds the socket URL for `kind` under the coordinator `base`.
pub fn endpoint_url(base: &str, kind: &ChannelKind, token: Option<&str>) -> Result<Url, ChannelError> {
    let mut url = Url::parse(base.trim())
        .map_err(|err| ChannelError::InvalidEndpoint(format!("{base}: {err}")))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ChannelError::InvalidEndpoint(format!(
                "unsupported scheme {other}"
            )))
        }
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| ChannelError::InvalidEndpoint(format!("cannot switch {base} to {scheme}")))?;
    }
    if url.host_str() == Some("localhost") {
        url.set_host(Some("127.0.0.1"))
            .map_err(|err| ChannelError::InvalidEndpoint(err.to_string()))?;
    }

    let segments = kind.segments()?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| ChannelError::InvalidEndpoint(format!("{base} cannot be a base")))?;
        path.pop_if_empty();
        path.extend(segments);
    }

    url.set_query(None);
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}
