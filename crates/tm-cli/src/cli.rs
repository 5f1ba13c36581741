//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::events::EventsAction;
use crate::commands::sessions::SessionsAction;
use crate::commands::timesheets::TimesheetsAction;

/// Tutoring scheduler and session ledger.
///
/// Proposes and confirms lessons between students and tutors, times the
/// sessions that fulfil them, and settles each session against the student's
/// prepaid hours.
#[derive(Debug, Parser)]
#[command(name = "tm", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory id of the user performing the command.
    #[arg(long = "as", value_name = "USER_ID", global = true)]
    pub as_user: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show event, session and outbox counts.
    Status,

    /// Import users, catalog entries, purchases and assignments (JSONL on stdin).
    Import,

    /// Calendar events.
    #[command(subcommand)]
    Events(EventsAction),

    /// Tutoring sessions.
    #[command(subcommand)]
    Sessions(SessionsAction),

    /// Tutor timesheets.
    #[command(subcommand)]
    Timesheets(TimesheetsAction),

    /// Show a purchase balance and its consumption history.
    Purchase {
        id: String,
        #[arg(long)]
        json: bool,
    },

    /// Deliver queued notifications.
    Notify,
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_actor_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tm",
            "events",
            "accept",
            "evt-1",
            "--as",
            "tutor-1",
        ])
        .unwrap();
        assert_eq!(cli.as_user.as_deref(), Some("tutor-1"));
        assert!(matches!(
            cli.command,
            Some(Commands::Events(EventsAction::Accept { .. }))
        ));
    }
}
