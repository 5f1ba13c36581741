//! Aggregate counts for the status summary.

use std::collections::HashMap;

use serde::Serialize;
use tm_core::{EventStatus, SessionStatus, TimesheetStatus};

use crate::{Database, DbError};

/// Row counts across the scheduler, the accounting engine and the outbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Overview {
    /// Every event status in declaration order, including zero counts.
    pub events_by_status: Vec<(EventStatus, i64)>,
    pub sessions_in_progress: i64,
    pub timesheets_pending: i64,
    pub notifications_pending: i64,
}

impl Database {
    pub fn overview(&self) -> Result<Overview, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM calendar_events GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, EventStatus>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        let events_by_status = EventStatus::ALL
            .iter()
            .map(|status| (*status, counts.get(status).copied().unwrap_or(0)))
            .collect();

        let sessions_in_progress = self.conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE status = ?",
            [SessionStatus::InProgress],
            |row| row.get(0),
        )?;
        let timesheets_pending = self.conn.query_row(
            "SELECT COUNT(*) FROM timesheets WHERE status = ?",
            [TimesheetStatus::Pending],
            |row| row.get(0),
        )?;
        let notifications_pending = self.conn.query_row(
            "SELECT COUNT(*) FROM notification_outbox WHERE delivered_at IS NULL AND attempts < ?",
            [self.notification_attempts],
            |row| row.get(0),
        )?;

        Ok(Overview {
            events_by_status,
            sessions_in_progress,
            timesheets_pending,
            notifications_pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tm_core::SessionStart;

    use crate::testing::{actor, at, fixture, pid};

    #[test]
    fn empty_database_reports_zeroes_for_every_status() {
        let db = fixture();
        let overview = db.overview().unwrap();
        assert_eq!(overview.events_by_status.len(), EventStatus::ALL.len());
        assert!(overview.events_by_status.iter().all(|(_, n)| *n == 0));
        assert_eq!(overview.sessions_in_progress, 0);
    }

    #[test]
    fn counts_running_sessions() {
        let mut db = fixture();
        let tutor = actor(&db, "tutor-1");
        db.start_session_at(
            &tutor,
            &SessionStart::new(pid("purchase-1")),
            at("2026-02-01T10:00:00Z"),
        )
        .unwrap();
        assert_eq!(db.overview().unwrap().sessions_in_progress, 1);
    }
}
