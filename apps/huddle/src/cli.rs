use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use huddle_negotiation::MediaProfile;
use huddle_signal::ChannelConfig;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "huddle",
    about = "Join huddle video sessions and tail coordinator channels",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub channel: ChannelArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ChannelArgs {
    #[arg(
        long,
        global = true,
        env = "HUDDLE_COORDINATOR_URL",
        value_name = "URL",
        help = "Coordinator base URL (http(s) and ws(s) are both accepted)"
    )]
    pub coordinator: Option<String>,

    #[arg(
        long,
        global = true,
        env = "HUDDLE_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Auth token presented on every channel"
    )]
    pub token: Option<String>,

    #[arg(
        long = "backoff-base-ms",
        global = true,
        env = "HUDDLE_BACKOFF_BASE_MS",
        value_name = "MS",
        help = "First reconnect delay; doubles on every further attempt"
    )]
    pub backoff_base_ms: Option<u64>,

    #[arg(
        long = "max-reconnect-attempts",
        global = true,
        env = "HUDDLE_MAX_RECONNECT_ATTEMPTS",
        value_name = "N",
        help = "Reconnect attempts before giving up"
    )]
    pub max_attempts: Option<u32>,
}

impl ChannelArgs {
    /// Environment defaults with command-line overrides on top.
    pub fn to_config(&self) -> ChannelConfig {
        let mut config = ChannelConfig::from_env();
        if let Some(url) = self.coordinator.as_ref().filter(|url| !url.trim().is_empty()) {
            config.coordinator_url = url.trim().to_string();
        }
        if let Some(token) = self.token.as_ref().filter(|token| !token.is_empty()) {
            config.token = Some(token.clone());
        }
        if let Some(ms) = self.backoff_base_ms {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.max_attempts {
            config.max_attempts = attempts;
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "HUDDLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "HUDDLE_LOG_FILE",
        help = "Append logs to this file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join a two-party video session and stay until Ctrl-C
    Join(JoinArgs),
    /// Print notification events as JSON lines
    Notifications,
    /// Follow a whiteboard and print its events as JSON lines
    Whiteboard(WhiteboardArgs),
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    #[arg(long, env = "HUDDLE_SESSION", value_name = "ID")]
    pub session: String,

    #[arg(long = "user-id", env = "HUDDLE_USER_ID", value_name = "ID")]
    pub user_id: String,

    #[arg(long = "user-name", env = "HUDDLE_USER_NAME", value_name = "NAME", default_value = "")]
    pub user_name: String,

    #[arg(long, conflicts_with = "video_only", help = "Capture audio only")]
    pub audio_only: bool,

    #[arg(long, help = "Capture video only")]
    pub video_only: bool,

    #[arg(long, help = "Join without capturing local media")]
    pub no_media: bool,

    #[arg(
        long = "ice-server",
        env = "HUDDLE_ICE_SERVERS",
        value_delimiter = ',',
        value_name = "URL",
        help = "STUN/TURN server URLs"
    )]
    pub ice_servers: Vec<String>,
}

impl JoinArgs {
    pub fn media(&self) -> MediaProfile {
        if self.no_media {
            MediaProfile::NoMedia
        } else if self.audio_only {
            MediaProfile::AudioOnly
        } else if self.video_only {
            MediaProfile::VideoOnly
        } else {
            MediaProfile::AudioVideo
        }
    }
}

#[derive(Args, Debug)]
pub struct WhiteboardArgs {
    #[arg(long, value_name = "ID")]
    pub board: String,
}
