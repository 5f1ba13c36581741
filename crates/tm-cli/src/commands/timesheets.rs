//! Timesheet commands: listing and the admin payout transitions.

use std::fmt::Write as _;
use std::io::Write;

use anyhow::Result;
use clap::Subcommand;
use tm_core::{Actor, Timesheet, TimesheetStatus, UserId};
use tm_db::{Database, TimesheetFilter};

use super::util::{format_money, format_time, write_json};

#[derive(Debug, Subcommand)]
pub enum TimesheetsAction {
    /// List timesheets (tutors: your own; admins: all).
    List {
        #[arg(long)]
        status: Option<TimesheetStatus>,
        /// Admins only: restrict to one tutor.
        #[arg(long)]
        tutor: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Approve a pending timesheet.
    Approve {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Mark an approved timesheet as paid.
    Pay {
        id: i64,
        #[arg(long)]
        json: bool,
    },
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    actor: &Actor,
    action: &TimesheetsAction,
) -> Result<()> {
    let timesheets = match action {
        TimesheetsAction::List {
            status,
            tutor,
            json,
        } => {
            let filter = TimesheetFilter {
                status: *status,
                tutor_id: tutor.as_deref().map(UserId::new).transpose()?,
            };
            let timesheets = db.list_timesheets(actor, &filter)?;
            if *json {
                return write_json(writer, &timesheets);
            }
            timesheets
        }
        TimesheetsAction::Approve { id, json } => {
            let timesheet = db.approve_timesheet(actor, *id)?;
            if *json {
                return write_json(writer, &timesheet);
            }
            vec![timesheet]
        }
        TimesheetsAction::Pay { id, json } => {
            let timesheet = db.mark_timesheet_paid(actor, *id)?;
            if *json {
                return write_json(writer, &timesheet);
            }
            vec![timesheet]
        }
    };
    write!(writer, "{}", format_timesheets(&timesheets))?;
    Ok(())
}

/// Formats timesheets as one row each.
pub fn format_timesheets(timesheets: &[Timesheet]) -> String {
    let mut output = String::new();
    if timesheets.is_empty() {
        writeln!(output, "No timesheets.").unwrap();
        return output;
    }
    for timesheet in timesheets {
        writeln!(
            output,
            "#{:<4} {:<8}  {}  {}  session {}  {} min  {}",
            timesheet.id,
            timesheet.status.as_str(),
            format_time(timesheet.created_at),
            timesheet.tutor_id,
            timesheet.session_id,
            timesheet.minutes,
            format_money(timesheet.amount, &timesheet.currency)
        )
        .unwrap();
    }
    output
}
