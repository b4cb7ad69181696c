mod cli;
mod error;
mod join;
mod logging;
mod tail;

use clap::Parser;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).map_err(|err| CliError::Logging(err.to_string()))?;

    let channel = cli.channel.to_config();
    tracing::debug!(
        target: "huddle::cli",
        coordinator = %channel.coordinator_url,
        max_attempts = channel.max_attempts,
        "configuration loaded"
    );

    match cli.command {
        Command::Join(args) => join::run(channel, args).await?,
        Command::Notifications => tail::notifications(channel).await?,
        Command::Whiteboard(args) => tail::whiteboard(channel, args).await?,
    }
    Ok(())
}
