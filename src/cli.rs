use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::slotfile::validate_slot_name;

const BUILD_VERSION: &str = env!("PGWARDEN_BUILD_VERSION");
const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
USAGE:
  {usage}

COMMANDS:
{subcommands}

OPTIONS:
{options}
{after-help}
";
const HELP_AFTER: &str = "\
Quick Command Map
  Supervise:
    run
  Inspect:
    list/ls/ps, status, logs/log
  Control:
    enable, disable
  Config:
    validate

Examples
  pgwarden run --slots /etc/pgwarden/slots.toml
  pgwarden ps
  pgwarden disable worker
  pgwarden log worker -n 100
";

#[derive(Debug, Parser)]
#[command(
    name = "pgwarden",
    version = BUILD_VERSION,
    about = "Tick-driven supervisor for local process groups",
    help_template = HELP_TEMPLATE,
    after_help = HELP_AFTER
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Supervise every slot in the slot file until interrupted.
    Run {
        #[arg(long)]
        slots: Option<PathBuf>,
        /// Leave supervised processes running on exit so the next daemon re-adopts them.
        #[arg(long)]
        leave_running: bool,
    },
    #[command(visible_aliases = ["ls", "ps"])]
    List,
    Status {
        #[arg(value_parser = parse_slot_name)]
        slot: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Enable {
        #[arg(value_parser = parse_slot_name)]
        slot: String,
    },
    Disable {
        #[arg(value_parser = parse_slot_name)]
        slot: String,
    },
    #[command(visible_alias = "log")]
    Logs {
        #[arg(value_parser = parse_slot_name)]
        slot: String,
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
        #[arg(short, long)]
        follow: bool,
    },
    Validate {
        path: Option<PathBuf>,
    },
}

fn parse_slot_name(value: &str) -> Result<String, String> {
    validate_slot_name(value)
        .map(|()| value.to_string())
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{parse_slot_name, Cli, Commands};

    #[test]
    fn parse_slot_name_rejects_path_like_names() {
        assert_eq!(parse_slot_name("web"), Ok("web".to_string()));
        let err = parse_slot_name("../etc").expect_err("expected parser failure");
        assert!(err.contains("invalid slot name"), "unexpected error: {err}");
    }

    #[test]
    fn ps_alias_maps_to_list() {
        let cli = Cli::try_parse_from(["pgwarden", "ps"]).expect("ps should parse");
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn logs_defaults_to_fifty_lines() {
        let cli = Cli::try_parse_from(["pgwarden", "log", "web"]).expect("log should parse");
        match cli.command {
            Commands::Logs {
                slot,
                lines,
                follow,
            } => {
                assert_eq!(slot, "web");
                assert_eq!(lines, 50);
                assert!(!follow);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_accepts_slot_file_and_leave_running() {
        let cli = Cli::try_parse_from([
            "pgwarden",
            "run",
            "--slots",
            "/etc/pgwarden/slots.toml",
            "--leave-running",
        ])
        .expect("run should parse");
        match cli.command {
            Commands::Run {
                slots,
                leave_running,
            } => {
                assert_eq!(
                    slots.as_deref(),
                    Some(std::path::Path::new("/etc/pgwarden/slots.toml"))
                );
                assert!(leave_running);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
