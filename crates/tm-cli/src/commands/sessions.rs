//! Session timer commands for tutors, plus scoped reads.

use std::fmt::Write as _;
use std::io::Write;

use anyhow::Result;
use clap::Subcommand;
use tm_core::{
    Actor, DeliveryMode, EventId, PurchaseId, Session, SessionDetail, SessionFilter, SessionId,
    SessionOutcome, SessionStart, SessionStatus, SubjectId,
};
use tm_db::Database;

use super::util::{format_money, format_time, write_json};

#[derive(Debug, Subcommand)]
pub enum SessionsAction {
    /// Start a session on a purchase you are assigned to.
    Start {
        #[arg(long)]
        purchase: String,
        /// Accepted calendar event this session fulfils.
        #[arg(long)]
        event: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        mode: Option<DeliveryMode>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Pause the running timer.
    Pause {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Resume a paused timer.
    Resume {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// End the session and settle it against the purchase.
    End {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Cancel the session without consuming any balance.
    Cancel {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show one session with its segments.
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// List sessions you participate in (admins: all sessions).
    List {
        #[arg(long)]
        status: Option<SessionStatus>,
        #[arg(long)]
        purchase: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    actor: &Actor,
    action: &SessionsAction,
) -> Result<()> {
    match action {
        SessionsAction::Start {
            purchase,
            event,
            subject,
            mode,
            notes,
            json,
        } => {
            let start = SessionStart {
                purchase_id: PurchaseId::new(purchase.as_str())?,
                calendar_event_id: event.as_deref().map(EventId::new).transpose()?,
                subject_id: subject.as_deref().map(SubjectId::new).transpose()?,
                delivery_mode: *mode,
                notes: notes.clone(),
            };
            let detail = db.start_session(actor, &start)?;
            print_detail(writer, &detail, *json)?;
        }
        SessionsAction::Pause { id, json } => {
            let detail = db.pause_session(actor, &SessionId::new(id.as_str())?)?;
            print_detail(writer, &detail, *json)?;
        }
        SessionsAction::Resume { id, json } => {
            let detail = db.resume_session(actor, &SessionId::new(id.as_str())?)?;
            print_detail(writer, &detail, *json)?;
        }
        SessionsAction::End { id, json } => {
            let outcome = db.end_session(actor, &SessionId::new(id.as_str())?)?;
            if *json {
                write_json(writer, &outcome)?;
            } else {
                write!(writer, "{}", format_outcome(&outcome))?;
            }
        }
        SessionsAction::Cancel { id, json } => {
            let detail = db.cancel_session(actor, &SessionId::new(id.as_str())?)?;
            print_detail(writer, &detail, *json)?;
        }
        SessionsAction::Show { id, json } => {
            let detail = db.session(actor, &SessionId::new(id.as_str())?)?;
            print_detail(writer, &detail, *json)?;
        }
        SessionsAction::List {
            status,
            purchase,
            json,
        } => {
            let filter = SessionFilter {
                status: *status,
                purchase_id: purchase.as_deref().map(PurchaseId::new).transpose()?,
            };
            let sessions = db.list_sessions(actor, &filter)?;
            if *json {
                write_json(writer, &sessions)?;
            } else {
                write!(writer, "{}", format_session_list(&sessions))?;
            }
        }
    }
    Ok(())
}

fn print_detail<W: Write>(writer: &mut W, detail: &SessionDetail, json: bool) -> Result<()> {
    if json {
        write_json(writer, detail)
    } else {
        write!(writer, "{}", format_detail(detail))?;
        Ok(())
    }
}

/// Formats a session with its timer segments.
pub fn format_detail(detail: &SessionDetail) -> String {
    let session = &detail.session;
    let mut output = String::new();
    writeln!(output, "session {} ({})", session.id, detail.phase.as_str()).unwrap();
    writeln!(output, "  purchase: {}", session.purchase_id).unwrap();
    writeln!(output, "  student:  {}", session.student_id).unwrap();
    writeln!(output, "  tutor:    {}", session.tutor_id).unwrap();
    writeln!(output, "  started:  {}", format_time(session.started_at)).unwrap();
    if let Some(ended) = session.ended_at {
        writeln!(output, "  ended:    {}", format_time(ended)).unwrap();
    }
    writeln!(output, "  segments:").unwrap();
    for timing in &detail.timings {
        match (timing.ended_at, timing.minutes) {
            (Some(ended), Some(minutes)) => writeln!(
                output,
                "    {} to {}  {minutes} min",
                format_time(timing.started_at),
                format_time(ended)
            )
            .unwrap(),
            _ => writeln!(
                output,
                "    {} to ...  running",
                format_time(timing.started_at)
            )
            .unwrap(),
        }
    }
    if session.status == SessionStatus::Completed {
        writeln!(
            output,
            "  total:    {} min ({} overage)",
            session.total_minutes, session.overage_minutes
        )
        .unwrap();
    }
    output
}

/// Formats a completed session with what its settlement wrote.
pub fn format_outcome(outcome: &SessionOutcome) -> String {
    let mut output = format_detail(&outcome.detail);
    let settlement = &outcome.settlement;
    let timesheet = &outcome.timesheet;
    writeln!(
        output,
        "  billed:   {} min, balance {} -> {} min",
        settlement.billable_minutes,
        settlement.balance_before_minutes,
        settlement.balance_after_minutes
    )
    .unwrap();
    writeln!(
        output,
        "  timesheet #{}: {} min at {}/h = {}",
        timesheet.id,
        timesheet.minutes,
        format_money(timesheet.rate, &timesheet.currency),
        format_money(timesheet.amount, &timesheet.currency)
    )
    .unwrap();
    output
}

/// Formats sessions as one row each.
pub fn format_session_list(sessions: &[Session]) -> String {
    let mut output = String::new();
    if sessions.is_empty() {
        writeln!(output, "No sessions.").unwrap();
        return output;
    }
    for session in sessions {
        writeln!(
            output,
            "{}  {:<11}  {}  {}  {} with {}  {} min",
            session.id,
            session.status.as_str(),
            format_time(session.started_at),
            session.purchase_id,
            session.student_id,
            session.tutor_id,
            session.total_minutes
        )
        .unwrap();
    }
    output
}
