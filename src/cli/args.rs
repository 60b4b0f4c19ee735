// src/cli/args.rs
// CLI argument definitions (§6 "CLI surface"), clap-derive shape.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "shiftlog")]
#[command(author, version)]
#[command(about = "Generates a personalized activity digest from a chat workspace", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the config file (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Disable colors in output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a digest for a timespan (today, yesterday, last-week,
    /// YYYY-MM-DD, or YYYY-MM-DD..YYYY-MM-DD)
    Summarize {
        #[arg()]
        timespan: String,

        /// Summarize a different user's activity instead of the token owner
        #[arg(long)]
        user: Option<String>,

        /// Bypass fetch-watermark caching and re-fetch every day bucket
        #[arg(long)]
        skip_cache: bool,
    },
    /// Inspect or clear the local SQLite cache
    Cache {
        /// Delete the cache database file
        #[arg(long)]
        clear: bool,

        /// Print row counts per table and their ts range
        #[arg(long)]
        stats: bool,
    },
    /// Write a starter config file (the interactive wizard itself is an
    /// external collaborator — see DESIGN.md)
    Configure {
        /// Overwrite an existing config file instead of refusing
        #[arg(long)]
        reset: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_summarize_with_timespan() {
        let args = CliArgs::parse_from(["shiftlog", "summarize", "yesterday"]);
        match args.command {
            Command::Summarize { timespan, user, skip_cache } => {
                assert_eq!(timespan, "yesterday");
                assert!(user.is_none());
                assert!(!skip_cache);
            }
            _ => panic!("expected Summarize"),
        }
    }

    #[test]
    fn parses_cache_stats() {
        let args = CliArgs::parse_from(["shiftlog", "cache", "--stats"]);
        match args.command {
            Command::Cache { clear, stats } => {
                assert!(!clear);
                assert!(stats);
            }
            _ => panic!("expected Cache"),
        }
    }

    #[test]
    fn parses_configure_reset() {
        let args = CliArgs::parse_from(["shiftlog", "configure", "--reset"]);
        match args.command {
            Command::Configure { reset } => assert!(reset),
            _ => panic!("expected Configure"),
        }
    }
}
