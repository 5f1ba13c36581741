//! Shared fixtures for engine tests.

use std::cell::RefCell;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tm_core::{
    Actor, BundleId, NotificationKind, NotificationSink, NotifyError, Purchase, PurchaseId,
    PurchaseStatus, Role, SessionTypeId, SubjectId, UserId, UserStatus,
};

use crate::{
    AssignmentRecord, BundleRecord, Database, SessionTypeRecord, SubjectRecord, UserRecord,
};

pub fn uid(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

pub fn pid(id: &str) -> PurchaseId {
    PurchaseId::new(id).unwrap()
}

pub fn at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .unwrap()
        .with_timezone(&Utc)
}

pub fn actor(db: &Database, id: &str) -> Actor {
    db.actor(&uid(id)).unwrap()
}

/// In-memory database holding the [`seed`] records.
pub fn fixture() -> Database {
    let mut db = Database::open_in_memory().unwrap();
    seed(&mut db);
    db
}

/// Seeds:
///
/// - students `student-1`, `student-2`; tutors `tutor-1`, `tutor-2`; `admin-1`
/// - subject `math`, session type `single` at 40.00/h, bundle `bundle-1`
/// - `purchase-1`: student-1, 2h single, assigned to tutor-1
/// - `purchase-bundle`: student-1, 3h bundle for 100.00, assigned to tutor-1
/// - `purchase-2`: student-2, 1h single, assigned to tutor-2
pub fn seed(db: &mut Database) {
    for (id, role) in [
        ("student-1", Role::Student),
        ("student-2", Role::Student),
        ("tutor-1", Role::Tutor),
        ("tutor-2", Role::Tutor),
        ("admin-1", Role::Admin),
    ] {
        db.upsert_user(&UserRecord {
            id: uid(id),
            role,
            status: UserStatus::Active,
            name: None,
        })
        .unwrap();
    }
    db.upsert_subject(&SubjectRecord {
        id: SubjectId::new("math").unwrap(),
        name: "Mathematics".to_string(),
    })
    .unwrap();
    db.upsert_session_type(&SessionTypeRecord {
        id: SessionTypeId::new("single").unwrap(),
        name: "Single session".to_string(),
        hourly_rate: 40.0,
    })
    .unwrap();
    db.upsert_bundle(&BundleRecord {
        id: BundleId::new("bundle-1").unwrap(),
        name: "Mixed bundle".to_string(),
    })
    .unwrap();

    let purchases = [
        ("purchase-1", "student-1", 2.0, 80.0, true, "tutor-1"),
        ("purchase-bundle", "student-1", 3.0, 100.0, false, "tutor-1"),
        ("purchase-2", "student-2", 1.0, 40.0, true, "tutor-2"),
    ];
    for (id, student, hours, amount, single, tutor) in purchases {
        db.upsert_purchase(&Purchase {
            id: pid(id),
            student_id: uid(student),
            status: PurchaseStatus::Active,
            sessions_purchased: hours,
            sessions_consumed: 0.0,
            amount,
            currency: "USD".to_string(),
            session_type_id: single.then(|| SessionTypeId::new("single").unwrap()),
            bundle_id: (!single).then(|| BundleId::new("bundle-1").unwrap()),
        })
        .unwrap();
        db.assign_tutor(&AssignmentRecord {
            purchase_id: pid(id),
            tutor_id: uid(tutor),
        })
        .unwrap();
    }
}

/// Sink that records every delivery.
#[derive(Default)]
pub struct RecordingSink {
    sent: RefCell<Vec<(UserId, NotificationKind, Value)>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<(UserId, NotificationKind, Value)> {
        self.sent.borrow().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(
        &self,
        user_id: &UserId,
        kind: NotificationKind,
        payload: &Value,
    ) -> Result<(), NotifyError> {
        self.sent
            .borrow_mut()
            .push((user_id.clone(), kind, payload.clone()));
        Ok(())
    }
}

/// Sink whose channel is always down.
pub struct FailingSink;

impl NotificationSink for FailingSink {
    fn notify(&self, _: &UserId, _: NotificationKind, _: &Value) -> Result<(), NotifyError> {
        Err(NotifyError("channel down".to_string()))
    }
}
