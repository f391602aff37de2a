use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(
    name = "azure-bot",
    about = "Discord bot that starts, stops and inspects Azure VMs"
)]
pub struct Cli {
    /// Path to the YAML config file (CONFIG_PATH overrides this)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Give up waiting on a start/stop operation after this many seconds
    #[arg(long, value_name = "SECS")]
    pub operation_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Connect to Discord and serve commands (default)
    Run,

    /// Validate the config and print the VM registry
    Check,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default() {
        let cli = Cli::parse_from(["azure-bot"]);
        assert_eq!(cli.command(), Command::Run);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(cli.operation_timeout, None);
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from([
            "azure-bot",
            "--config",
            "bot.yml",
            "-v",
            "--operation-timeout",
            "600",
            "check",
        ]);
        assert_eq!(cli.command(), Command::Check);
        assert_eq!(cli.config, PathBuf::from("bot.yml"));
        assert!(cli.verbose);
        assert_eq!(cli.operation_timeout, Some(600));
    }
}
