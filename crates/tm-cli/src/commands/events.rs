//! Calendar event commands: list, show, propose and the status transitions.

use std::fmt::Write as _;
use std::io::Write;

use anyhow::Result;
use clap::{Args, Subcommand};
use tm_core::{
    Actor, CalendarEvent, EventDraft, EventFilter, EventId, EventStatus, EventType, LocationType,
    PurchaseId, Reschedule, SubjectId, UserId,
};
use tm_db::Database;

use super::util::{format_time, parse_datetime, write_json};

#[derive(Debug, Subcommand)]
pub enum EventsAction {
    /// List events you participate in (admins: all events).
    List {
        /// Only events of this student.
        #[arg(long)]
        student: Option<String>,
        /// Only events of this tutor.
        #[arg(long)]
        tutor: Option<String>,
        #[arg(long)]
        status: Option<EventStatus>,
        /// Only events ending after this time.
        #[arg(long)]
        from: Option<String>,
        /// Only events starting before this time.
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show one event.
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Propose a new event.
    Propose(ProposeArgs),
    /// Accept a proposed event.
    Accept {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Reject a proposed event.
    Reject {
        id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Cancel a proposed or accepted event.
    Cancel {
        id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Move an event to a new time; prints the new proposal.
    Reschedule {
        id: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Args)]
pub struct ProposeArgs {
    /// Start time (ISO 8601 or relative, e.g. "in 2 hours").
    #[arg(long)]
    pub start: String,
    /// End time (ISO 8601 or relative).
    #[arg(long)]
    pub end: String,
    /// Student id (required for tutors and admins).
    #[arg(long)]
    pub student: Option<String>,
    /// Tutor id (required for students and admins).
    #[arg(long)]
    pub tutor: Option<String>,
    #[arg(long = "type", default_value = "session")]
    pub event_type: EventType,
    #[arg(long)]
    pub subject: Option<String>,
    #[arg(long)]
    pub purchase: Option<String>,
    #[arg(long)]
    pub location_type: Option<LocationType>,
    #[arg(long)]
    pub location: Option<String>,
    #[arg(long)]
    pub meeting_url: Option<String>,
    #[arg(long)]
    pub json: bool,
}

impl ProposeArgs {
    fn to_draft(&self) -> Result<EventDraft> {
        Ok(EventDraft {
            event_type: self.event_type,
            start_at: parse_datetime(&self.start)?,
            end_at: parse_datetime(&self.end)?,
            student_id: self.student.as_deref().map(UserId::new).transpose()?,
            tutor_id: self.tutor.as_deref().map(UserId::new).transpose()?,
            subject_id: self.subject.as_deref().map(SubjectId::new).transpose()?,
            purchase_id: self.purchase.as_deref().map(PurchaseId::new).transpose()?,
            location_type: self.location_type,
            location_details: self.location.clone(),
            meeting_url: self.meeting_url.clone(),
        })
    }
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    actor: &Actor,
    action: &EventsAction,
) -> Result<()> {
    match action {
        EventsAction::List {
            student,
            tutor,
            status,
            from,
            to,
            json,
        } => {
            let filter = EventFilter {
                student_id: student.as_deref().map(UserId::new).transpose()?,
                tutor_id: tutor.as_deref().map(UserId::new).transpose()?,
                status: *status,
                from: from.as_deref().map(parse_datetime).transpose()?,
                to: to.as_deref().map(parse_datetime).transpose()?,
            };
            let events = db.list_events(actor, &filter)?;
            if *json {
                write_json(writer, &events)?;
            } else {
                write!(writer, "{}", format_event_list(&events))?;
            }
        }
        EventsAction::Show { id, json } => {
            let event = db.event(actor, &EventId::new(id.as_str())?)?;
            print_event(writer, &event, *json)?;
        }
        EventsAction::Propose(args) => {
            let event = db.create_event(actor, &args.to_draft()?)?;
            print_event(writer, &event, args.json)?;
        }
        EventsAction::Accept { id, json } => {
            let event = db.accept_event(actor, &EventId::new(id.as_str())?)?;
            print_event(writer, &event, *json)?;
        }
        EventsAction::Reject { id, reason, json } => {
            let event =
                db.reject_event(actor, &EventId::new(id.as_str())?, reason.as_deref())?;
            print_event(writer, &event, *json)?;
        }
        EventsAction::Cancel { id, reason, json } => {
            let event =
                db.cancel_event(actor, &EventId::new(id.as_str())?, reason.as_deref())?;
            print_event(writer, &event, *json)?;
        }
        EventsAction::Reschedule {
            id,
            start,
            end,
            note,
            json,
        } => {
            let change = Reschedule {
                start_at: parse_datetime(start)?,
                end_at: parse_datetime(end)?,
                note: note.clone(),
            };
            let event = db.reschedule_event(actor, &EventId::new(id.as_str())?, &change)?;
            print_event(writer, &event, *json)?;
        }
    }
    Ok(())
}

fn print_event<W: Write>(writer: &mut W, event: &CalendarEvent, json: bool) -> Result<()> {
    if json {
        write_json(writer, event)
    } else {
        write!(writer, "{}", format_event(event))?;
        Ok(())
    }
}

/// Formats one event with its details.
pub fn format_event(event: &CalendarEvent) -> String {
    let mut output = String::new();
    writeln!(output, "event {} ({})", event.id, event.status).unwrap();
    writeln!(output, "  type:     {}", event.event_type).unwrap();
    writeln!(
        output,
        "  when:     {} to {}",
        format_time(event.start_at),
        format_time(event.end_at)
    )
    .unwrap();
    writeln!(output, "  student:  {}", event.student_id).unwrap();
    writeln!(output, "  tutor:    {}", event.tutor_id).unwrap();
    if let Some(subject) = &event.subject_id {
        writeln!(output, "  subject:  {subject}").unwrap();
    }
    if let Some(purchase) = &event.purchase_id {
        writeln!(output, "  purchase: {purchase}").unwrap();
    }
    if let Some(url) = &event.meeting_url {
        writeln!(output, "  meeting:  {url}").unwrap();
    }
    if let Some(location) = &event.location_details {
        writeln!(output, "  location: {location}").unwrap();
    }
    if let Some(original) = &event.reschedule_of {
        writeln!(output, "  moved from event {original}").unwrap();
    }
    if let Some(reason) = &event.decision_reason {
        writeln!(output, "  reason:   {reason}").unwrap();
    }
    output
}

/// Formats events as one row each.
pub fn format_event_list(events: &[CalendarEvent]) -> String {
    let mut output = String::new();
    if events.is_empty() {
        writeln!(output, "No events.").unwrap();
        return output;
    }
    for event in events {
        writeln!(
            output,
            "{}  {:<11}  {} to {}  {} with {}",
            event.id,
            event.status.as_str(),
            format_time(event.start_at),
            format_time(event.end_at),
            event.student_id,
            event.tutor_id
        )
        .unwrap();
    }
    output
}
