use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::SinkError;
use crate::sink::{CapabilitySink, MediaConstraints, MediaStream};

/// What a session ended up capturing locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaProfile {
    AudioVideo,
    VideoOnly,
    AudioOnly,
    NoMedia,
}

impl MediaProfile {
    fn constraints(self) -> Option<MediaConstraints> {
        match self {
            MediaProfile::AudioVideo => Some(MediaConstraints::AUDIO_VIDEO),
            MediaProfile::VideoOnly => Some(MediaConstraints::VIDEO_ONLY),
            MediaProfile::AudioOnly => Some(MediaConstraints::AUDIO_ONLY),
            MediaProfile::NoMedia => None,
        }
    }

    /// Profiles to try, best first, without asking for more than `preference`.
    fn fallback_chain(self) -> impl Iterator<Item = MediaProfile> {
        [
            MediaProfile::AudioVideo,
            MediaProfile::VideoOnly,
            MediaProfile::AudioOnly,
        ]
        .into_iter()
        .filter(move |candidate| self.allows(*candidate))
    }

    fn allows(self, other: MediaProfile) -> bool {
        match self {
            MediaProfile::AudioVideo => true,
            MediaProfile::VideoOnly => other == MediaProfile::VideoOnly,
            MediaProfile::AudioOnly => other == MediaProfile::AudioOnly,
            MediaProfile::NoMedia => false,
        }
    }
}

impl fmt::Display for MediaProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaProfile::AudioVideo => "audio+video",
            MediaProfile::VideoOnly => "video-only",
            MediaProfile::AudioOnly => "audio-only",
            MediaProfile::NoMedia => "no-media",
        })
    }
}

/// Walks audio+video, video, audio, none. Device errors only degrade the
/// profile; an unavailable capability is returned as an error.
pub async fn acquire_with_fallback(
    sink: &dyn CapabilitySink,
    preference: MediaProfile,
) -> Result<(MediaStream, MediaProfile), SinkError> {
    for profile in preference.fallback_chain() {
        let Some(constraints) = profile.constraints() else {
            continue;
        };
        match sink.acquire_local_tracks(constraints).await {
            Ok(stream) => {
                info!(target: "huddle::session", profile = %profile, tracks = stream.tracks.len(), "local media acquired");
                return Ok((stream, profile));
            }
            Err(err @ SinkError::Unavailable(_)) => return Err(err),
            Err(err) => {
                warn!(target: "huddle::session", profile = %profile, error = %err, "media acquisition failed; degrading");
            }
        }
    }
    warn!(target: "huddle::session", "continuing without local media");
    Ok((MediaStream::new("local"), MediaProfile::NoMedia))
}
