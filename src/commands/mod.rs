mod common;
mod control;
mod list;
mod logs;
mod status;
mod validate;

use anyhow::Result;

use crate::cli::Commands;
use crate::config::AppConfig;

pub async fn run(command: Commands, config: AppConfig) -> Result<()> {
    match command {
        Commands::Run {
            slots,
            leave_running,
        } => crate::daemon::run_foreground(config, slots, leave_running).await,
        Commands::List => list::run(&config),
        Commands::Status { slot, json } => status::run(&config, slot.as_deref(), json),
        Commands::Enable { slot } => control::run(&config, &slot, true),
        Commands::Disable { slot } => control::run(&config, &slot, false),
        Commands::Logs {
            slot,
            lines,
            follow,
        } => logs::run(&config, &slot, lines, follow).await,
        Commands::Validate { path } => validate::run(&config, path.as_deref()),
    }
}
