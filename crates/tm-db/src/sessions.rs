//! Session accounting engine: the pause/resume timer and end-of-session
//! settlement against the purchase balance.
//!
//! The timer phase is never cached. It is read back from `session_timings`
//! on every call: an open segment (`ended_at IS NULL`) means running.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::json;
use tm_core::{
    Actor, EventStatus, NotificationKind, PurchaseId, PurchaseStatus, Role, Session,
    SessionAction, SessionDetail, SessionFilter, SessionId, SessionOutcome, SessionPhase,
    SessionStart, SessionStatus, SessionTiming, UserId, ValidationError, can_act_on, is_tutor_of,
    storage_precision,
};

use crate::calendar::load_event;
use crate::directory::{assigned_tutor, find_purchase, subject_exists};
use crate::ledger::settle_session;
use crate::outbox::enqueue_for_participants;
use crate::{Database, DbError, format_timestamp, new_id, ts, ts_opt};

const SESSION_COLUMNS: &str = "id, purchase_id, calendar_event_id, student_id, tutor_id, subject_id, delivery_mode, notes, status, started_at, ended_at, total_minutes, overage_minutes";

impl Database {
    /// Starts a session on a purchase and opens its first timer segment.
    pub fn start_session(
        &mut self,
        actor: &Actor,
        start: &SessionStart,
    ) -> Result<SessionDetail, DbError> {
        self.start_session_at(actor, start, Utc::now())
    }

    pub(crate) fn start_session_at(
        &mut self,
        actor: &Actor,
        start: &SessionStart,
        now: DateTime<Utc>,
    ) -> Result<SessionDetail, DbError> {
        let now = storage_precision(now);
        if actor.role != Role::Tutor {
            return Err(DbError::Forbidden(
                "only the assigned tutor may start a session".to_string(),
            ));
        }

        let tx = self.write_tx()?;
        let purchase = find_purchase(&tx, &start.purchase_id)?.ok_or_else(|| {
            ValidationError::UnknownReference {
                entity: "purchase",
                id: start.purchase_id.to_string(),
            }
        })?;
        if assigned_tutor(&tx, &purchase.id)?.as_ref() != Some(&actor.id) {
            return Err(DbError::Forbidden(format!(
                "{} is not the assigned tutor for purchase {}",
                actor.id, purchase.id
            )));
        }
        if purchase.status != PurchaseStatus::Active {
            return Err(ValidationError::Rejected(format!(
                "purchase {} is {}, not active",
                purchase.id, purchase.status
            ))
            .into());
        }
        if let Some(running) = in_progress_session(&tx, &purchase.id, &actor.id)? {
            return Err(DbError::SessionInProgress {
                session_id: running,
            });
        }
        if let Some(subject_id) = &start.subject_id {
            if !subject_exists(&tx, subject_id)? {
                return Err(ValidationError::UnknownReference {
                    entity: "subject",
                    id: subject_id.to_string(),
                }
                .into());
            }
        }
        if let Some(event_id) = &start.calendar_event_id {
            let event =
                load_event(&tx, event_id)?.ok_or_else(|| ValidationError::UnknownReference {
                    entity: "event",
                    id: event_id.to_string(),
                })?;
            if event.status != EventStatus::Accepted {
                return Err(ValidationError::Rejected(format!(
                    "event {event_id} is {}, not accepted",
                    event.status
                ))
                .into());
            }
            if event.student_id != purchase.student_id || event.tutor_id != actor.id {
                return Err(ValidationError::Rejected(format!(
                    "event {event_id} is not between this purchase's student and tutor"
                ))
                .into());
            }
        }

        let session = Session {
            id: SessionId::new(new_id())?,
            purchase_id: purchase.id.clone(),
            calendar_event_id: start.calendar_event_id.clone(),
            student_id: purchase.student_id.clone(),
            tutor_id: actor.id.clone(),
            subject_id: start.subject_id.clone(),
            delivery_mode: start.delivery_mode,
            notes: start.notes.clone(),
            status: SessionStatus::InProgress,
            started_at: now,
            ended_at: None,
            total_minutes: 0,
            overage_minutes: 0,
        };
        tx.execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                session.id,
                session.purchase_id,
                session.calendar_event_id,
                session.student_id,
                session.tutor_id,
                session.subject_id,
                session.delivery_mode,
                session.notes,
                session.status,
                format_timestamp(session.started_at),
                session.ended_at.map(format_timestamp),
                session.total_minutes,
                session.overage_minutes,
            ],
        )?;
        open_segment(&tx, &session.id, now)?;
        let detail = load_detail(&tx, &session.id)?;
        tx.commit()?;

        tracing::info!(
            session_id = %session.id,
            purchase_id = %session.purchase_id,
            tutor_id = %session.tutor_id,
            "session started"
        );
        Ok(detail)
    }

    /// Pauses a running session, closing its open segment.
    pub fn pause_session(
        &mut self,
        actor: &Actor,
        id: &SessionId,
    ) -> Result<SessionDetail, DbError> {
        self.pause_session_at(actor, id, Utc::now())
    }

    pub(crate) fn pause_session_at(
        &mut self,
        actor: &Actor,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<SessionDetail, DbError> {
        let now = storage_precision(now);
        let tx = self.write_tx()?;
        let session = lock_session_for_tutor(&tx, actor, id)?;
        let open = open_timing(&tx, id)?;
        SessionPhase::from_parts(session.status, open.is_some()).apply(SessionAction::Pause)?;
        if let Some(segment) = &open {
            close_segment(&tx, segment, now)?;
        }
        let detail = load_detail(&tx, id)?;
        tx.commit()?;

        tracing::info!(session_id = %id, "session paused");
        Ok(detail)
    }

    /// Resumes a paused session with a new segment.
    ///
    /// Resuming a running session fails and leaves the single open segment
    /// untouched.
    pub fn resume_session(
        &mut self,
        actor: &Actor,
        id: &SessionId,
    ) -> Result<SessionDetail, DbError> {
        self.resume_session_at(actor, id, Utc::now())
    }

    pub(crate) fn resume_session_at(
        &mut self,
        actor: &Actor,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<SessionDetail, DbError> {
        let now = storage_precision(now);
        let tx = self.write_tx()?;
        let session = lock_session_for_tutor(&tx, actor, id)?;
        let open = open_timing(&tx, id)?;
        SessionPhase::from_parts(session.status, open.is_some()).apply(SessionAction::Resume)?;
        open_segment(&tx, id, now)?;
        let detail = load_detail(&tx, id)?;
        tx.commit()?;

        tracing::info!(session_id = %id, "session resumed");
        Ok(detail)
    }

    /// Ends a session and settles it against the purchase balance.
    ///
    /// Closes any open segment first, so ending without a pause is fine.
    /// Minutes beyond the remaining balance are recorded as overage.
    pub fn end_session(
        &mut self,
        actor: &Actor,
        id: &SessionId,
    ) -> Result<SessionOutcome, DbError> {
        self.end_session_at(actor, id, Utc::now())
    }

    pub(crate) fn end_session_at(
        &mut self,
        actor: &Actor,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<SessionOutcome, DbError> {
        let now = storage_precision(now);
        let tx = self.write_tx()?;
        let session = lock_session_for_tutor(&tx, actor, id)?;
        let open = open_timing(&tx, id)?;
        SessionPhase::from_parts(session.status, open.is_some()).apply(SessionAction::End)?;
        if let Some(segment) = &open {
            close_segment(&tx, segment, now)?;
        }

        let total_minutes: i64 = tx.query_row(
            "SELECT COALESCE(SUM(minutes), 0) FROM session_timings WHERE session_id = ?",
            [id],
            |row| row.get(0),
        )?;
        let purchase = find_purchase(&tx, &session.purchase_id)?
            .ok_or_else(|| DbError::not_found("purchase", &session.purchase_id))?;
        let (settlement, consumption, timesheet) =
            settle_session(&tx, &session, &purchase, total_minutes, now)?;

        tx.execute(
            "
            UPDATE sessions
            SET status = ?, ended_at = ?, total_minutes = ?, overage_minutes = ?
            WHERE id = ?
            ",
            params![
                SessionStatus::Completed,
                format_timestamp(now),
                settlement.total_minutes,
                settlement.overage_minutes,
                id
            ],
        )?;
        enqueue_for_participants(
            &tx,
            &session,
            NotificationKind::FeedbackRequested,
            &json!({
                "session_id": id,
                "purchase_id": session.purchase_id,
                "ended_at": format_timestamp(now),
                "total_minutes": settlement.total_minutes,
            }),
            now,
        )?;
        let detail = load_detail(&tx, id)?;
        tx.commit()?;

        tracing::info!(
            session_id = %id,
            total_minutes = settlement.total_minutes,
            billable_minutes = settlement.billable_minutes,
            overage_minutes = settlement.overage_minutes,
            "session completed"
        );
        Ok(SessionOutcome {
            detail,
            settlement,
            consumption,
            timesheet,
        })
    }

    /// Cancels an in-progress session. No balance is consumed and no
    /// timesheet is written. Allowed for the session's tutor and admins.
    pub fn cancel_session(
        &mut self,
        actor: &Actor,
        id: &SessionId,
    ) -> Result<SessionDetail, DbError> {
        self.cancel_session_at(actor, id, Utc::now())
    }

    pub(crate) fn cancel_session_at(
        &mut self,
        actor: &Actor,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<SessionDetail, DbError> {
        let now = storage_precision(now);
        let tx = self.write_tx()?;
        let session = load_session(&tx, id)?.ok_or_else(|| DbError::not_found("session", id))?;
        if !(actor.is_admin() || is_tutor_of(actor, &session)) {
            return Err(DbError::Forbidden(format!(
                "only the session's tutor or an admin may cancel session {id}"
            )));
        }
        let open = open_timing(&tx, id)?;
        SessionPhase::from_parts(session.status, open.is_some()).apply(SessionAction::Cancel)?;
        if let Some(segment) = &open {
            close_segment(&tx, segment, now)?;
        }
        tx.execute(
            "UPDATE sessions SET status = ?, ended_at = ? WHERE id = ?",
            params![SessionStatus::Cancelled, format_timestamp(now), id],
        )?;
        let detail = load_detail(&tx, id)?;
        tx.commit()?;

        tracing::info!(session_id = %id, actor = %actor.id, "session cancelled");
        Ok(detail)
    }

    /// Reads a session the actor participates in (or any session, for admins).
    pub fn session(&self, actor: &Actor, id: &SessionId) -> Result<SessionDetail, DbError> {
        let detail = load_detail(&self.conn, id)?;
        if !can_act_on(actor, &detail.session).may_act() {
            return Err(DbError::Forbidden(format!(
                "not a participant of session {id}"
            )));
        }
        Ok(detail)
    }

    /// Lists sessions visible to `actor`, oldest first.
    pub fn list_sessions(
        &self,
        actor: &Actor,
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, DbError> {
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
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(status.as_str().to_string());
        }
        if let Some(purchase_id) = &filter.purchase_id {
            clauses.push("purchase_id = ?");
            values.push(purchase_id.to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions {where_clause} ORDER BY started_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), session_from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }
}

/// Loads a session for a timer operation; only its own tutor may drive it.
fn lock_session_for_tutor(
    conn: &Connection,
    actor: &Actor,
    id: &SessionId,
) -> Result<Session, DbError> {
    let session = load_session(conn, id)?.ok_or_else(|| DbError::not_found("session", id))?;
    if !is_tutor_of(actor, &session) {
        return Err(DbError::Forbidden(format!(
            "only the session's tutor may operate session {id}"
        )));
    }
    Ok(session)
}

fn in_progress_session(
    conn: &Connection,
    purchase_id: &PurchaseId,
    tutor_id: &UserId,
) -> Result<Option<SessionId>, DbError> {
    Ok(conn
        .query_row(
            "SELECT id FROM sessions WHERE purchase_id = ? AND tutor_id = ? AND status = ?",
            params![purchase_id, tutor_id, SessionStatus::InProgress],
            |row| row.get(0),
        )
        .optional()?)
}

fn load_session(conn: &Connection, id: &SessionId) -> Result<Option<Session>, DbError> {
    let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
    Ok(conn.query_row(&query, [id], session_from_row).optional()?)
}

fn load_detail(conn: &Connection, id: &SessionId) -> Result<SessionDetail, DbError> {
    let session = load_session(conn, id)?.ok_or_else(|| DbError::not_found("session", id))?;
    let mut stmt = conn.prepare(
        "SELECT id, session_id, started_at, ended_at, minutes FROM session_timings WHERE session_id = ? ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([id], timing_from_row)?;
    let mut timings = Vec::new();
    for row in rows {
        timings.push(row?);
    }
    let has_open_segment = timings.iter().any(SessionTiming::is_open);
    let phase = SessionPhase::from_parts(session.status, has_open_segment);
    Ok(SessionDetail {
        session,
        phase,
        timings,
    })
}

/// The session's running segment, if any.
fn open_timing(
    conn: &Connection,
    session_id: &SessionId,
) -> Result<Option<SessionTiming>, DbError> {
    Ok(conn
        .query_row(
            "SELECT id, session_id, started_at, ended_at, minutes FROM session_timings WHERE session_id = ? AND ended_at IS NULL",
            [session_id],
            timing_from_row,
        )
        .optional()?)
}

fn open_segment(
    conn: &Connection,
    session_id: &SessionId,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO session_timings (session_id, started_at) VALUES (?, ?)",
        params![session_id, format_timestamp(now)],
    )?;
    Ok(())
}

/// Closes `segment` at `now`, rounding its length up to whole minutes.
fn close_segment(
    conn: &Connection,
    segment: &SessionTiming,
    now: DateTime<Utc>,
) -> Result<i64, DbError> {
    let minutes = segment.minutes_if_closed_at(now);
    conn.execute(
        "UPDATE session_timings SET ended_at = ?, minutes = ? WHERE id = ? AND ended_at IS NULL",
        params![format_timestamp(now), minutes, segment.id],
    )?;
    Ok(minutes)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        purchase_id: row.get(1)?,
        calendar_event_id: row.get(2)?,
        student_id: row.get(3)?,
        tutor_id: row.get(4)?,
        subject_id: row.get(5)?,
        delivery_mode: row.get(6)?,
        notes: row.get(7)?,
        status: row.get(8)?,
        started_at: ts(row, 9)?,
        ended_at: ts_opt(row, 10)?,
        total_minutes: row.get(11)?,
        overage_minutes: row.get(12)?,
    })
}

fn timing_from_row(row: &Row<'_>) -> rusqlite::Result<SessionTiming> {
    Ok(SessionTiming {
        id: row.get(0)?,
        session_id: row.get(1)?,
        started_at: ts(row, 2)?,
        ended_at: ts_opt(row, 3)?,
        minutes: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Barrier;

    use chrono::Duration;
    use tm_core::{ErrorKind, EventAction, EventDraft, EventType, TimesheetStatus};

    use crate::testing::{actor, at, fixture, pid, seed, uid};

    fn t0() -> DateTime<Utc> {
        at("2026-02-01T10:00:00Z")
    }

    fn mins(n: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(n)
    }

    fn start(db: &mut Database, tutor: &str, purchase: &str) -> SessionId {
        let tutor = actor(db, tutor);
        db.start_session_at(&tutor, &SessionStart::new(pid(purchase)), t0())
            .unwrap()
            .session
            .id
    }

    fn open_segments(db: &Database, id: &SessionId) -> i64 {
        db.conn
            .query_row(
                "SELECT COUNT(*) FROM session_timings WHERE session_id = ? AND ended_at IS NULL",
                [id],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn start_opens_running_session() {
        let mut db = fixture();
        let tutor = actor(&db, "tutor-1");
        let detail = db
            .start_session_at(&tutor, &SessionStart::new(pid("purchase-1")), t0())
            .unwrap();
        assert_eq!(detail.phase, SessionPhase::Running);
        assert_eq!(detail.session.status, SessionStatus::InProgress);
        assert_eq!(detail.session.student_id, uid("student-1"));
        assert_eq!(detail.timings.len(), 1);
        assert!(detail.timings[0].is_open());
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn scenario_a_settles_within_balance() {
        let mut db = fixture();
        let id = start(&mut db, "tutor-1", "purchase-1");
        let tutor = actor(&db, "tutor-1");

        let outcome = db.end_session_at(&tutor, &id, mins(45)).unwrap();

        assert_eq!(outcome.detail.phase, SessionPhase::Completed);
        assert_eq!(outcome.detail.session.total_minutes, 45);
        assert_eq!(outcome.detail.session.overage_minutes, 0);
        assert_eq!(outcome.consumption.minutes, 45);
        assert_eq!(outcome.consumption.balance_before_minutes, 120);
        assert_eq!(outcome.consumption.balance_after_minutes, 75);
        assert_eq!(outcome.timesheet.minutes, 45);
        assert_eq!(outcome.timesheet.rate, 40.0);
        assert_eq!(outcome.timesheet.amount, 30.0);
        assert_eq!(outcome.timesheet.status, TimesheetStatus::Pending);

        let purchase = db.purchase(&pid("purchase-1")).unwrap();
        assert_eq!(purchase.sessions_consumed, 0.75);
        assert_eq!(purchase.remaining_minutes(), 75);
    }

    #[test]
    fn scenario_b_records_overage_beyond_balance() {
        let mut db = fixture();
        db.conn
            .execute(
                "UPDATE purchases SET sessions_consumed = 1.8333 WHERE id = 'purchase-1'",
                [],
            )
            .unwrap();
        assert_eq!(
            db.purchase(&pid("purchase-1")).unwrap().remaining_minutes(),
            10
        );

        let id = start(&mut db, "tutor-1", "purchase-1");
        let tutor = actor(&db, "tutor-1");
        let outcome = db.end_session_at(&tutor, &id, mins(30)).unwrap();

        assert_eq!(outcome.settlement.total_minutes, 30);
        assert_eq!(outcome.settlement.billable_minutes, 10);
        assert_eq!(outcome.settlement.overage_minutes, 20);
        assert_eq!(outcome.consumption.balance_after_minutes, 0);
        assert_eq!(outcome.detail.session.overage_minutes, 20);
        assert_eq!(outcome.timesheet.minutes, 10);
        assert_eq!(
            db.purchase(&pid("purchase-1")).unwrap().remaining_minutes(),
            0
        );
    }

    #[test]
    fn pause_resume_segments_sum_with_rounding_up() {
        let mut db = fixture();
        let id = start(&mut db, "tutor-1", "purchase-1");
        let tutor = actor(&db, "tutor-1");

        // 10m01s rounds up to 11.
        let paused = db
            .pause_session_at(&tutor, &id, mins(10) + Duration::seconds(1))
            .unwrap();
        assert_eq!(paused.phase, SessionPhase::Paused);
        assert_eq!(paused.timings[0].minutes, Some(11));

        let resumed = db.resume_session_at(&tutor, &id, mins(20)).unwrap();
        assert_eq!(resumed.phase, SessionPhase::Running);
        assert_eq!(resumed.timings.len(), 2);

        db.pause_session_at(&tutor, &id, mins(25)).unwrap();
        let outcome = db.end_session_at(&tutor, &id, mins(40)).unwrap();

        let segment_sum: i64 = outcome
            .detail
            .timings
            .iter()
            .map(|t| t.minutes.unwrap())
            .sum();
        assert_eq!(segment_sum, 16);
        assert_eq!(outcome.detail.session.total_minutes, segment_sum);
        assert_eq!(
            outcome.settlement.billable_minutes + outcome.settlement.overage_minutes,
            outcome.settlement.total_minutes
        );
        assert_eq!(open_segments(&db, &id), 0);
    }

    #[test]
    fn double_resume_is_a_state_conflict_without_duplicate_segment() {
        let mut db = fixture();
        let id = start(&mut db, "tutor-1", "purchase-1");
        let tutor = actor(&db, "tutor-1");

        db.pause_session_at(&tutor, &id, mins(5)).unwrap();
        db.resume_session_at(&tutor, &id, mins(6)).unwrap();
        let err = db.resume_session_at(&tutor, &id, mins(7)).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert_eq!(err.kind().http_status(), 400);
        assert_eq!(err.code(), "invalid_session_state");
        assert_eq!(open_segments(&db, &id), 1);
    }

    #[test]
    fn pause_when_paused_and_end_when_completed_fail() {
        let mut db = fixture();
        let id = start(&mut db, "tutor-1", "purchase-1");
        let tutor = actor(&db, "tutor-1");

        db.pause_session_at(&tutor, &id, mins(5)).unwrap();
        let err = db.pause_session_at(&tutor, &id, mins(6)).unwrap_err();
        assert_eq!(err.code(), "invalid_session_state");

        db.end_session_at(&tutor, &id, mins(7)).unwrap();
        let err = db.end_session_at(&tutor, &id, mins(8)).unwrap_err();
        assert_eq!(err.code(), "invalid_session_state");
        let err = db.resume_session_at(&tutor, &id, mins(8)).unwrap_err();
        assert_eq!(err.code(), "invalid_session_state");
    }

    #[test]
    fn end_while_paused_does_not_count_the_pause() {
        let mut db = fixture();
        let id = start(&mut db, "tutor-1", "purchase-1");
        let tutor = actor(&db, "tutor-1");
        db.pause_session_at(&tutor, &id, mins(20)).unwrap();
        let outcome = db.end_session_at(&tutor, &id, mins(90)).unwrap();
        assert_eq!(outcome.settlement.total_minutes, 20);
    }

    #[test]
    fn only_the_sessions_tutor_drives_the_timer() {
        let mut db = fixture();
        let id = start(&mut db, "tutor-1", "purchase-1");

        for who in ["tutor-2", "student-1", "admin-1"] {
            let who = actor(&db, who);
            let err = db.pause_session_at(&who, &id, mins(5)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Forbidden);
            assert_eq!(err.kind().http_status(), 403);
        }
        assert_eq!(open_segments(&db, &id), 1);

        let tutor = actor(&db, "tutor-1");
        let err = db
            .pause_session_at(&tutor, &SessionId::new("missing").unwrap(), mins(5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn start_requires_assigned_tutor_and_active_purchase() {
        let mut db = fixture();
        let other = actor(&db, "tutor-2");
        let err = db
            .start_session_at(&other, &SessionStart::new(pid("purchase-1")), t0())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let student = actor(&db, "student-1");
        let err = db
            .start_session_at(&student, &SessionStart::new(pid("purchase-1")), t0())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        db.conn
            .execute(
                "UPDATE purchases SET status = 'expired' WHERE id = 'purchase-1'",
                [],
            )
            .unwrap();
        let tutor = actor(&db, "tutor-1");
        let err = db
            .start_session_at(&tutor, &SessionStart::new(pid("purchase-1")), t0())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = db
            .start_session_at(
                &tutor,
                &SessionStart::new(PurchaseId::new("nope").unwrap()),
                t0(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn second_start_on_same_purchase_is_rejected() {
        let mut db = fixture();
        let first = start(&mut db, "tutor-1", "purchase-1");
        let tutor = actor(&db, "tutor-1");
        let err = db
            .start_session_at(&tutor, &SessionStart::new(pid("purchase-1")), mins(1))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_session_state");
        match err {
            DbError::SessionInProgress { session_id } => assert_eq!(session_id, first),
            other => panic!("expected session in progress, got {other:?}"),
        }

        // A different purchase with the same tutor is independent.
        start(&mut db, "tutor-1", "purchase-bundle");
    }

    #[test]
    fn start_links_only_accepted_event_of_same_pair() {
        let mut db = fixture();
        let student = actor(&db, "student-1");
        let tutor = actor(&db, "tutor-1");
        let event = db
            .create_event_at(
                &student,
                &EventDraft {
                    event_type: EventType::Session,
                    start_at: t0(),
                    end_at: mins(60),
                    student_id: None,
                    tutor_id: Some(uid("tutor-1")),
                    subject_id: None,
                    purchase_id: Some(pid("purchase-1")),
                    location_type: None,
                    location_details: None,
                    meeting_url: None,
                },
                at("2026-01-30T00:00:00Z"),
            )
            .unwrap();

        let mut request = SessionStart::new(pid("purchase-1"));
        request.calendar_event_id = Some(event.id.clone());
        let err = db.start_session_at(&tutor, &request, t0()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        db.resolve_event_at(&tutor, &event.id, EventAction::Accept, None, t0())
            .unwrap();
        let detail = db.start_session_at(&tutor, &request, t0()).unwrap();
        assert_eq!(detail.session.calendar_event_id, Some(event.id));
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn bundle_sessions_pay_the_average_rate() {
        let mut db = fixture();
        let id = start(&mut db, "tutor-1", "purchase-bundle");
        let tutor = actor(&db, "tutor-1");
        let outcome = db.end_session_at(&tutor, &id, mins(10)).unwrap();
        assert_eq!(outcome.timesheet.rate, 33.33);
        assert_eq!(outcome.timesheet.amount, 5.56);
    }

    #[test]
    fn cancel_writes_no_ledger_rows() {
        let mut db = fixture();
        let id = start(&mut db, "tutor-1", "purchase-1");
        let student = actor(&db, "student-1");
        let err = db.cancel_session_at(&student, &id, mins(5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let admin = actor(&db, "admin-1");
        let detail = db.cancel_session_at(&admin, &id, mins(5)).unwrap();
        assert_eq!(detail.phase, SessionPhase::Cancelled);
        assert_eq!(open_segments(&db, &id), 0);

        let consumptions: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM consumptions", [], |row| row.get(0))
            .unwrap();
        let timesheets: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM timesheets", [], |row| row.get(0))
            .unwrap();
        assert_eq!((consumptions, timesheets), (0, 0));
        assert_eq!(
            db.purchase(&pid("purchase-1")).unwrap().remaining_minutes(),
            120
        );

        let tutor = actor(&db, "tutor-1");
        let err = db.end_session_at(&tutor, &id, mins(6)).unwrap_err();
        assert_eq!(err.code(), "invalid_session_state");
        start(&mut db, "tutor-1", "purchase-1");
    }

    #[test]
    fn end_requests_feedback_from_both_participants() {
        let mut db = fixture();
        let id = start(&mut db, "tutor-1", "purchase-1");
        let tutor = actor(&db, "tutor-1");
        db.end_session_at(&tutor, &id, mins(15)).unwrap();

        let pending = db.pending_notifications().unwrap();
        let feedback: Vec<&str> = pending
            .iter()
            .filter(|n| n.kind == NotificationKind::FeedbackRequested)
            .map(|n| n.user_id.as_str())
            .collect();
        assert_eq!(feedback, vec!["student-1", "tutor-1"]);
        assert_eq!(pending[0].payload["session_id"], id.as_str());
    }

    #[test]
    fn reads_are_scoped_to_participants() {
        let mut db = fixture();
        let id = start(&mut db, "tutor-1", "purchase-1");
        start(&mut db, "tutor-2", "purchase-2");

        let student = actor(&db, "student-1");
        assert_eq!(db.session(&student, &id).unwrap().session.id, id);
        let stranger = actor(&db, "student-2");
        assert_eq!(
            db.session(&stranger, &id).unwrap_err().kind(),
            ErrorKind::Forbidden
        );

        assert_eq!(
            db.list_sessions(&student, &SessionFilter::default())
                .unwrap()
                .len(),
            1
        );
        let admin = actor(&db, "admin-1");
        assert_eq!(
            db.list_sessions(&admin, &SessionFilter::default())
                .unwrap()
                .len(),
            2
        );
        let filtered = db
            .list_sessions(
                &admin,
                &SessionFilter {
                    status: Some(SessionStatus::Completed),
                    purchase_id: None,
                },
            )
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn concurrent_starts_on_one_purchase_admit_exactly_one() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("tm.db");
        {
            let mut db = Database::open(&path).unwrap();
            seed(&mut db);
        }

        let barrier = Barrier::new(2);
        let results: Vec<Result<SessionDetail, DbError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        let mut db = Database::open(&path).unwrap();
                        let tutor = db.actor(&uid("tutor-1")).unwrap();
                        barrier.wait();
                        db.start_session_at(&tutor, &SessionStart::new(pid("purchase-1")), t0())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let started = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(started, 1);
        let rejected = results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .next()
            .unwrap();
        assert_eq!(rejected.code(), "invalid_session_state");

        let db = Database::open(&path).unwrap();
        let running: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE status = 'in_progress'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(running, 1);
    }
}
