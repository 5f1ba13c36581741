//! Transactional notification outbox.
//!
//! Operations enqueue notices inside their own transaction. Delivery happens
//! later through a [`NotificationSink`], so a failing channel can never undo
//! a committed schedule or ledger change.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use serde::Serialize;
use serde_json::Value;
use tm_core::{Notification, NotificationKind, NotificationSink, Participants, UserId};

use crate::{Database, DbError, format_timestamp, ts};

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub delivered: usize,
    pub failed: usize,
}

impl Database {
    /// Notices still awaiting delivery that have attempts left, oldest first.
    pub fn pending_notifications(&self) -> Result<Vec<Notification>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, user_id, kind, payload, created_at, attempts
            FROM notification_outbox
            WHERE delivered_at IS NULL AND attempts < ?
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map([self.notification_attempts], notification_from_row)?;
        let mut notifications = Vec::new();
        for row in rows {
            let (notification, payload) = row?;
            notifications.push(Notification {
                payload: serde_json::from_str(&payload)?,
                ..notification
            });
        }
        Ok(notifications)
    }

    /// Delivers pending notices through `sink`.
    ///
    /// Each notice is claimed by bumping its attempt count before the sink
    /// sees it, so concurrent dispatchers never hand the same attempt to the
    /// sink twice. A notice whose claim was taken elsewhere is skipped.
    ///
    /// Delivery is at-least-once: if the process dies after the sink accepts
    /// a notice but before it is marked delivered, the next pass retries it.
    /// A failed delivery is logged and stays queued until it succeeds or runs
    /// out of attempts.
    pub fn dispatch_notifications(
        &mut self,
        sink: &dyn NotificationSink,
    ) -> Result<DispatchStats, DbError> {
        self.dispatch_notifications_at(sink, Utc::now())
    }

    pub(crate) fn dispatch_notifications_at(
        &mut self,
        sink: &dyn NotificationSink,
        now: DateTime<Utc>,
    ) -> Result<DispatchStats, DbError> {
        let mut stats = DispatchStats::default();
        for notification in self.pending_notifications()? {
            if !claim(&self.conn, &notification)? {
                tracing::debug!(
                    notification_id = notification.id,
                    "notification claimed by another dispatcher"
                );
                continue;
            }
            match sink.notify(&notification.user_id, notification.kind, &notification.payload) {
                Ok(()) => {
                    self.conn.execute(
                        "UPDATE notification_outbox SET delivered_at = ?, last_error = NULL WHERE id = ?",
                        params![format_timestamp(now), notification.id],
                    )?;
                    stats.delivered += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        notification_id = notification.id,
                        user_id = %notification.user_id,
                        kind = %notification.kind,
                        error = %err,
                        "notification delivery failed"
                    );
                    self.conn.execute(
                        "UPDATE notification_outbox SET last_error = ? WHERE id = ?",
                        params![err.to_string(), notification.id],
                    )?;
                    stats.failed += 1;
                }
            }
        }
        if stats.delivered + stats.failed > 0 {
            tracing::debug!(
                delivered = stats.delivered,
                failed = stats.failed,
                "notifications dispatched"
            );
        }
        Ok(stats)
    }
}

/// Takes the next attempt on `notification` if nobody else has since it was read.
fn claim(conn: &Connection, notification: &Notification) -> Result<bool, DbError> {
    let changed = conn.execute(
        "UPDATE notification_outbox SET attempts = attempts + 1 WHERE id = ? AND delivered_at IS NULL AND attempts = ?",
        params![notification.id, notification.attempts],
    )?;
    Ok(changed == 1)
}

/// Queues one notice for `user_id` on the caller's transaction.
pub(crate) fn enqueue(
    conn: &Connection,
    user_id: &UserId,
    kind: NotificationKind,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO notification_outbox (user_id, kind, payload, created_at) VALUES (?, ?, ?, ?)",
        params![
            user_id,
            kind,
            serde_json::to_string(payload)?,
            format_timestamp(now)
        ],
    )?;
    Ok(())
}

/// Queues the same notice for the student and then the tutor.
pub(crate) fn enqueue_for_participants<P: Participants>(
    conn: &Connection,
    entity: &P,
    kind: NotificationKind,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    enqueue(conn, entity.student_id(), kind, payload, now)?;
    enqueue(conn, entity.tutor_id(), kind, payload, now)
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<(Notification, String)> {
    Ok((
        Notification {
            id: row.get(0)?,
            user_id: row.get(1)?,
            kind: row.get(2)?,
            payload: Value::Null,
            created_at: ts(row, 4)?,
            attempts: row.get(5)?,
        },
        row.get(3)?,
    ))
}
