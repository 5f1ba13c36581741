//! Calendar scheduler: proposal, acceptance and rescheduling of events, with
//! conflict detection against accepted slots.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::json;
use tm_core::{
    Actor, CalendarEvent, EventAction, EventDraft, EventFilter, EventId, EventStatus, Interval,
    NotificationKind, Reschedule, Role, UserId, ValidationError, can_act_on, storage_precision,
};

use crate::directory::{find_purchase, require_role, subject_exists};
use crate::outbox::enqueue_for_participants;
use crate::{Database, DbError, format_timestamp, new_id, ts};

const EVENT_COLUMNS: &str = "id, type, status, start_at, end_at, student_id, tutor_id, created_by, subject_id, purchase_id, location_type, location_details, meeting_url, reschedule_of, decision_reason, created_at, updated_at";

impl Database {
    /// Lists events visible to `actor`, ordered by start time.
    ///
    /// Students and tutors only ever see events they participate in; the
    /// participant filters only narrow further. Admins may filter freely.
    pub fn list_events(
        &self,
        actor: &Actor,
        filter: &EventFilter,
    ) -> Result<Vec<CalendarEvent>, DbError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        match actor.role {
            Role::Student => {
                clauses.push("student_id = ?");
                values.push(actor.id.to_string());
            }
            Role::Tutor => {
                clauses.push("tutor_id = ?");
                values.push(actor.id.to_string());
            }
            Role::Admin => {}
        }
        if let Some(student_id) = &filter.student_id {
            clauses.push("student_id = ?");
            values.push(student_id.to_string());
        }
        if let Some(tutor_id) = &filter.tutor_id {
            clauses.push("tutor_id = ?");
            values.push(tutor_id.to_string());
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(status.as_str().to_string());
        }
        if let Some(from) = filter.from {
            clauses.push("end_at > ?");
            values.push(format_timestamp(from));
        }
        if let Some(to) = filter.to {
            clauses.push("start_at < ?");
            values.push(format_timestamp(to));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM calendar_events {where_clause} ORDER BY start_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), event_from_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Reads one event the actor participates in (or any event, for admins).
    pub fn event(&self, actor: &Actor, id: &EventId) -> Result<CalendarEvent, DbError> {
        let event = load_event(&self.conn, id)?.ok_or_else(|| DbError::not_found("event", id))?;
        if !can_act_on(actor, &event).may_act() {
            return Err(DbError::Forbidden(format!("not a participant of event {id}")));
        }
        Ok(event)
    }

    /// Proposes a new event between a student and a tutor.
    pub fn create_event(
        &mut self,
        actor: &Actor,
        draft: &EventDraft,
    ) -> Result<CalendarEvent, DbError> {
        self.create_event_at(actor, draft, Utc::now())
    }

    pub(crate) fn create_event_at(
        &mut self,
        actor: &Actor,
        draft: &EventDraft,
        now: DateTime<Utc>,
    ) -> Result<CalendarEvent, DbError> {
        let now = storage_precision(now);
        let interval = draft.interval()?;
        let (student_id, tutor_id) = draft.participants_for(actor)?;

        let tx = self.write_tx()?;
        require_role(&tx, &student_id, Role::Student)?;
        require_role(&tx, &tutor_id, Role::Tutor)?;
        if let Some(subject_id) = &draft.subject_id {
            if !subject_exists(&tx, subject_id)? {
                return Err(ValidationError::UnknownReference {
                    entity: "subject",
                    id: subject_id.to_string(),
                }
                .into());
            }
        }
        if let Some(purchase_id) = &draft.purchase_id {
            let purchase =
                find_purchase(&tx, purchase_id)?.ok_or_else(|| ValidationError::UnknownReference {
                    entity: "purchase",
                    id: purchase_id.to_string(),
                })?;
            if purchase.student_id != student_id {
                return Err(ValidationError::Rejected(format!(
                    "purchase {purchase_id} does not belong to student {student_id}"
                ))
                .into());
            }
        }

        check_conflicts(&tx, &student_id, &tutor_id, &interval, None)?;

        let event = CalendarEvent {
            id: EventId::new(new_id())?,
            event_type: draft.event_type,
            status: EventStatus::Proposed,
            start_at: interval.start,
            end_at: interval.end,
            student_id,
            tutor_id,
            created_by: actor.id.clone(),
            subject_id: draft.subject_id.clone(),
            purchase_id: draft.purchase_id.clone(),
            location_type: draft.location_type,
            location_details: draft.location_details.clone(),
            meeting_url: draft.meeting_url.clone(),
            reschedule_of: None,
            decision_reason: None,
            created_at: now,
            updated_at: now,
        };
        insert_event(&tx, &event)?;
        enqueue_for_participants(
            &tx,
            &event,
            NotificationKind::EventProposed,
            &event_payload(&event),
            now,
        )?;
        tx.commit()?;

        tracing::info!(
            event_id = %event.id,
            student_id = %event.student_id,
            tutor_id = %event.tutor_id,
            created_by = %event.created_by,
            "event proposed"
        );
        Ok(event)
    }

    /// Accepts a proposed event after re-checking conflicts at accept time.
    pub fn accept_event(&mut self, actor: &Actor, id: &EventId) -> Result<CalendarEvent, DbError> {
        self.resolve_event_at(actor, id, EventAction::Accept, None, Utc::now())
    }

    /// Rejects a proposed event, recording the reason.
    pub fn reject_event(
        &mut self,
        actor: &Actor,
        id: &EventId,
        reason: Option<&str>,
    ) -> Result<CalendarEvent, DbError> {
        self.resolve_event_at(actor, id, EventAction::Reject, reason, Utc::now())
    }

    /// Cancels a proposed or accepted event, recording the reason.
    ///
    /// Wallet adjustments for cancellations belong to the commerce side and
    /// are triggered by the `event_cancelled` notice, not computed here.
    pub fn cancel_event(
        &mut self,
        actor: &Actor,
        id: &EventId,
        reason: Option<&str>,
    ) -> Result<CalendarEvent, DbError> {
        self.resolve_event_at(actor, id, EventAction::Cancel, reason, Utc::now())
    }

    pub(crate) fn resolve_event_at(
        &mut self,
        actor: &Actor,
        id: &EventId,
        action: EventAction,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CalendarEvent, DbError> {
        let now = storage_precision(now);
        let tx = self.write_tx()?;
        let mut event = lock_event(&tx, actor, id)?;
        let next = event.status.apply(action)?;

        if action == EventAction::Accept {
            check_conflicts(
                &tx,
                &event.student_id,
                &event.tutor_id,
                &event.interval(),
                Some(&event.id),
            )?;
        }

        event.status = next;
        event.updated_at = now;
        if let Some(reason) = reason {
            event.decision_reason = Some(reason.to_string());
        }
        tx.execute(
            "UPDATE calendar_events SET status = ?, decision_reason = ?, updated_at = ? WHERE id = ?",
            params![
                event.status,
                event.decision_reason,
                format_timestamp(now),
                event.id
            ],
        )?;
        let kind = match action {
            EventAction::Accept => NotificationKind::EventAccepted,
            EventAction::Reject => NotificationKind::EventRejected,
            EventAction::Cancel => NotificationKind::EventCancelled,
            EventAction::Reschedule => NotificationKind::EventRescheduled,
        };
        enqueue_for_participants(&tx, &event, kind, &event_payload(&event), now)?;
        tx.commit()?;

        tracing::info!(
            event_id = %event.id,
            actor = %actor.id,
            status = %event.status,
            "event resolved"
        );
        Ok(event)
    }

    /// Moves an event to a new interval.
    ///
    /// The original becomes `rescheduled` and a new `proposed` event carrying
    /// the same metadata is returned, linked through `reschedule_of`.
    pub fn reschedule_event(
        &mut self,
        actor: &Actor,
        id: &EventId,
        change: &Reschedule,
    ) -> Result<CalendarEvent, DbError> {
        self.reschedule_event_at(actor, id, change, Utc::now())
    }

    pub(crate) fn reschedule_event_at(
        &mut self,
        actor: &Actor,
        id: &EventId,
        change: &Reschedule,
        now: DateTime<Utc>,
    ) -> Result<CalendarEvent, DbError> {
        let now = storage_precision(now);
        let interval = change.interval()?;

        let tx = self.write_tx()?;
        let original = lock_event(&tx, actor, id)?;
        let next = original.status.apply(EventAction::Reschedule)?;
        check_conflicts(
            &tx,
            &original.student_id,
            &original.tutor_id,
            &interval,
            Some(&original.id),
        )?;

        let decision_reason = change.note.clone().or_else(|| original.decision_reason.clone());
        tx.execute(
            "UPDATE calendar_events SET status = ?, decision_reason = ?, updated_at = ? WHERE id = ?",
            params![next, decision_reason, format_timestamp(now), original.id],
        )?;

        let child = CalendarEvent {
            id: EventId::new(new_id())?,
            status: EventStatus::Proposed,
            start_at: interval.start,
            end_at: interval.end,
            created_by: actor.id.clone(),
            reschedule_of: Some(original.id.clone()),
            decision_reason: None,
            created_at: now,
            updated_at: now,
            ..original.clone()
        };
        insert_event(&tx, &child)?;
        enqueue_for_participants(
            &tx,
            &child,
            NotificationKind::EventRescheduled,
            &event_payload(&child),
            now,
        )?;
        tx.commit()?;

        tracing::info!(
            event_id = %original.id,
            new_event_id = %child.id,
            actor = %actor.id,
            "event rescheduled"
        );
        Ok(child)
    }
}

/// Loads an event inside a write transaction and checks the actor's standing.
///
/// The surrounding immediate transaction already holds the write lock, so
/// the row cannot change until commit.
fn lock_event(conn: &Connection, actor: &Actor, id: &EventId) -> Result<CalendarEvent, DbError> {
    let event = load_event(conn, id)?.ok_or_else(|| DbError::not_found("event", id))?;
    if !can_act_on(actor, &event).may_act() {
        return Err(DbError::Forbidden(format!(
            "only participants or admins may act on event {id}"
        )));
    }
    Ok(event)
}

/// Fails with a scheduling conflict if either participant already has an
/// accepted event overlapping `interval`. `exclude` skips the event being
/// accepted or rescheduled.
fn check_conflicts(
    conn: &Connection,
    student_id: &UserId,
    tutor_id: &UserId,
    interval: &Interval,
    exclude: Option<&EventId>,
) -> Result<(), DbError> {
    for participant in [student_id, tutor_id] {
        if let Some(existing) = find_conflict(conn, participant, interval, exclude)? {
            tracing::debug!(
                participant = %participant,
                conflicting_event = %existing.id,
                "scheduling conflict"
            );
            return Err(DbError::SchedulingConflict {
                participant: participant.clone(),
                event_id: existing.id,
                start: format_timestamp(existing.start_at),
                end: format_timestamp(existing.end_at),
            });
        }
    }
    Ok(())
}

/// First accepted event of `participant` overlapping `interval`.
///
/// SQL narrows to accepted slots starting before our end; the half-open
/// overlap test decides.
fn find_conflict(
    conn: &Connection,
    participant: &UserId,
    interval: &Interval,
    exclude: Option<&EventId>,
) -> Result<Option<CalendarEvent>, DbError> {
    let query = format!(
        "
        SELECT {EVENT_COLUMNS}
        FROM calendar_events
        WHERE status = ?1
          AND (student_id = ?2 OR tutor_id = ?2)
          AND start_at < ?3
          AND (?4 IS NULL OR id <> ?4)
        ORDER BY start_at ASC, id ASC
        "
    );
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map(
        params![
            EventStatus::Accepted,
            participant,
            format_timestamp(interval.end),
            exclude,
        ],
        event_from_row,
    )?;
    for row in rows {
        let event = row?;
        if event.status.blocks_slot() && event.interval().overlaps(interval) {
            return Ok(Some(event));
        }
    }
    Ok(None)
}

pub(crate) fn load_event(conn: &Connection, id: &EventId) -> Result<Option<CalendarEvent>, DbError> {
    let query = format!("SELECT {EVENT_COLUMNS} FROM calendar_events WHERE id = ?");
    Ok(conn.query_row(&query, [id], event_from_row).optional()?)
}

fn insert_event(conn: &Connection, event: &CalendarEvent) -> Result<(), DbError> {
    conn.execute(
        &format!(
            "INSERT INTO calendar_events ({EVENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        params![
            event.id,
            event.event_type,
            event.status,
            format_timestamp(event.start_at),
            format_timestamp(event.end_at),
            event.student_id,
            event.tutor_id,
            event.created_by,
            event.subject_id,
            event.purchase_id,
            event.location_type,
            event.location_details,
            event.meeting_url,
            event.reschedule_of,
            event.decision_reason,
            format_timestamp(event.created_at),
            format_timestamp(event.updated_at),
        ],
    )?;
    Ok(())
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<CalendarEvent> {
    Ok(CalendarEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        status: row.get(2)?,
        start_at: ts(row, 3)?,
        end_at: ts(row, 4)?,
        student_id: row.get(5)?,
        tutor_id: row.get(6)?,
        created_by: row.get(7)?,
        subject_id: row.get(8)?,
        purchase_id: row.get(9)?,
        location_type: row.get(10)?,
        location_details: row.get(11)?,
        meeting_url: row.get(12)?,
        reschedule_of: row.get(13)?,
        decision_reason: row.get(14)?,
        created_at: ts(row, 15)?,
        updated_at: ts(row, 16)?,
    })
}

fn event_payload(event: &CalendarEvent) -> serde_json::Value {
    json!({
        "event_id": event.id,
        "status": event.status,
        "start_at": format_timestamp(event.start_at),
        "end_at": format_timestamp(event.end_at),
        "reschedule_of": event.reschedule_of,
        "reason": event.decision_reason,
    })
}
