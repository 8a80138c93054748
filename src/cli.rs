//! Command-line surface.

use std::path::PathBuf;

use clap::{crate_version, Parser, ValueEnum};

const LOG_FILE: &str = "forgebot.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Poll the forges for labelled items and feed the queue.
    Producer,
    /// Run the worker pool against the queue.
    Consumer,
}

/// CLI structure defining the available run modes and global arguments.
#[derive(Parser)]
#[command(
    author,
    version = crate_version!(),
    about = "Forgebot: label-driven autonomous coding agent",
    long_about = "Forgebot watches GitHub and GitLab for items labelled for the coding \
                  agent and drives an LLM dialogue loop with tool calls to work on them."
)]
pub struct Cli {
    /// Run as producer or consumer
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Keep looping instead of running a single shot
    #[arg(long)]
    pub continuous: bool,

    /// Start the webhook ingress server instead of a polling mode
    #[arg(long)]
    pub webhook: bool,

    /// Start the user-config REST service
    #[arg(long)]
    pub config_api: bool,

    /// Path to the configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Log debug messages to a file
    #[arg(short = 'l', long = "log", help = "Log debug messages to a file")]
    pub log: bool,

    /// Specify a custom log file path
    #[arg(long = "log-file", help = "Specify a custom log file path")]
    pub log_file: Option<String>,
}

impl Cli {
    pub fn log_file_path(&self) -> &str {
        self.log_file.as_deref().unwrap_or(LOG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuous_flag_is_parsed() {
        let cli = Cli::parse_from(["forgebot", "--mode", "producer", "--continuous"]);
        assert_eq!(cli.mode, Some(Mode::Producer));
        assert!(cli.continuous);

        let cli = Cli::parse_from(["forgebot", "--mode", "consumer"]);
        assert_eq!(cli.mode, Some(Mode::Consumer));
        assert!(!cli.continuous);
    }

    #[test]
    fn webhook_flag_needs_no_mode() {
        let cli = Cli::parse_from(["forgebot", "--webhook"]);
        assert!(cli.webhook);
        assert!(cli.mode.is_none());
    }
}
