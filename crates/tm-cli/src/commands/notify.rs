//! Manual delivery of queued notifications.

use std::io::Write;

use anyhow::Result;
use tm_core::NotificationSink;
use tm_db::Database;

pub fn run<W: Write>(writer: &mut W, db: &mut Database, sink: &dyn NotificationSink) -> Result<()> {
    let stats = db.dispatch_notifications(sink)?;
    writeln!(
        writer,
        "Delivered {} notifications, {} failed.",
        stats.delivered, stats.failed
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;

    use serde_json::Value;
    use tm_core::{
        EventDraft, EventType, NotificationKind, NotifyError, Role, UserId, UserStatus,
    };
    use tm_db::UserRecord;

    #[derive(Default)]
    struct Collect(RefCell<Vec<(String, NotificationKind)>>);

    impl NotificationSink for Collect {
        fn notify(
            &self,
            user_id: &UserId,
            kind: NotificationKind,
            _payload: &Value,
        ) -> Result<(), NotifyError> {
            self.0.borrow_mut().push((user_id.to_string(), kind));
            Ok(())
        }
    }

    fn user(db: &mut Database, id: &str, role: Role) {
        db.upsert_user(&UserRecord {
            id: UserId::new(id).unwrap(),
            role,
            status: UserStatus::Active,
            name: None,
        })
        .unwrap();
    }

    #[test]
    fn delivers_queued_proposal_notices() {
        let mut db = Database::open_in_memory().unwrap();
        user(&mut db, "student-1", Role::Student);
        user(&mut db, "tutor-1", Role::Tutor);
        let student = db.actor(&UserId::new("student-1").unwrap()).unwrap();
        let start = chrono::Utc::now() + chrono::Duration::days(1);
        db.create_event(
            &student,
            &EventDraft {
                event_type: EventType::Session,
                start_at: start,
                end_at: start + chrono::Duration::hours(1),
                student_id: None,
                tutor_id: Some(UserId::new("tutor-1").unwrap()),
                subject_id: None,
                purchase_id: None,
                location_type: None,
                location_details: None,
                meeting_url: None,
            },
        )
        .unwrap();

        let sink = Collect::default();
        let mut output = Vec::new();
        run(&mut output, &mut db, &sink).unwrap();

        let delivered = sink.0.into_inner();
        assert_eq!(delivered.len(), 2);
        assert!(
            delivered
                .iter()
                .all(|(_, kind)| *kind == NotificationKind::EventProposed)
        );
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "Delivered 2 notifications, 0 failed.\n"
        );

        let mut again = Vec::new();
        run(&mut again, &mut db, &Collect::default()).unwrap();
        assert_eq!(
            String::from_utf8(again).unwrap(),
            "Delivered 0 notifications, 0 failed.\n"
        );
    }
}
