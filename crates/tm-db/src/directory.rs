//! Participant directory, assignment registry, purchases and catalog.
//!
//! These records belong to collaborating subsystems. They are stored here so
//! the engines can read them inside their own transactions; the write
//! methods exist for seeding and imports, not as an admin surface.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tm_core::{
    Actor, BundleId, Purchase, PurchaseId, RateSource, Role, SessionTypeId, SubjectId, UserId,
    UserStatus, ValidationError,
};

use crate::{Database, DbError, format_timestamp};

/// A directory user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub role: Role,
    #[serde(default = "default_user_status")]
    pub status: UserStatus,
    #[serde(default)]
    pub name: Option<String>,
}

const fn default_user_status() -> UserStatus {
    UserStatus::Active
}

/// A catalog subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub id: SubjectId,
    pub name: String,
}

/// A catalog session type with its hourly tutor rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTypeRecord {
    pub id: SessionTypeId,
    pub name: String,
    pub hourly_rate: f64,
}

/// A catalog bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub id: BundleId,
    pub name: String,
}

/// The single tutor bound to a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub purchase_id: PurchaseId,
    pub tutor_id: UserId,
}

impl Database {
    /// Inserts or replaces a directory user.
    pub fn upsert_user(&mut self, user: &UserRecord) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO users (id, role, status, name) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                role = excluded.role,
                status = excluded.status,
                name = COALESCE(excluded.name, users.name)
            ",
            params![user.id, user.role, user.status, user.name],
        )?;
        Ok(())
    }

    pub fn upsert_subject(&mut self, subject: &SubjectRecord) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO subjects (id, name) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            ",
            params![subject.id, subject.name],
        )?;
        Ok(())
    }

    pub fn upsert_session_type(&mut self, session_type: &SessionTypeRecord) -> Result<(), DbError> {
        if session_type.hourly_rate.is_nan() || session_type.hourly_rate < 0.0 {
            return Err(ValidationError::InvalidValue {
                field: "hourly_rate",
                value: session_type.hourly_rate.to_string(),
            }
            .into());
        }
        self.conn.execute(
            "
            INSERT INTO session_types (id, name, hourly_rate) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                hourly_rate = excluded.hourly_rate
            ",
            params![session_type.id, session_type.name, session_type.hourly_rate],
        )?;
        Ok(())
    }

    pub fn upsert_bundle(&mut self, bundle: &BundleRecord) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO bundles (id, name) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            ",
            params![bundle.id, bundle.name],
        )?;
        Ok(())
    }

    /// Inserts a purchase, or refreshes its commerce-owned fields.
    ///
    /// `sessions_consumed` is only taken on insert. Afterwards it belongs to
    /// settlement and an import never rewinds it.
    pub fn upsert_purchase(&mut self, purchase: &Purchase) -> Result<(), DbError> {
        if purchase.session_type_id.is_some() == purchase.bundle_id.is_some() {
            return Err(ValidationError::Rejected(format!(
                "purchase {} must reference exactly one of session_type_id or bundle_id",
                purchase.id
            ))
            .into());
        }
        let tx = self.write_tx()?;
        require_role(&tx, &purchase.student_id, Role::Student)?;
        tx.execute(
            "
            INSERT INTO purchases
            (id, student_id, status, sessions_purchased, sessions_consumed, amount, currency, session_type_id, bundle_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                student_id = excluded.student_id,
                status = excluded.status,
                sessions_purchased = excluded.sessions_purchased,
                amount = excluded.amount,
                currency = excluded.currency,
                session_type_id = excluded.session_type_id,
                bundle_id = excluded.bundle_id
            ",
            params![
                purchase.id,
                purchase.student_id,
                purchase.status,
                purchase.sessions_purchased,
                purchase.sessions_consumed,
                purchase.amount,
                purchase.currency,
                purchase.session_type_id,
                purchase.bundle_id,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Binds a tutor to a purchase, replacing any previous assignment.
    pub fn assign_tutor(&mut self, assignment: &AssignmentRecord) -> Result<(), DbError> {
        self.assign_tutor_at(assignment, Utc::now())
    }

    fn assign_tutor_at(
        &mut self,
        assignment: &AssignmentRecord,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let tx = self.write_tx()?;
        if find_purchase(&tx, &assignment.purchase_id)?.is_none() {
            return Err(ValidationError::UnknownReference {
                entity: "purchase",
                id: assignment.purchase_id.to_string(),
            }
            .into());
        }
        require_role(&tx, &assignment.tutor_id, Role::Tutor)?;
        tx.execute(
            "
            INSERT INTO assignments (purchase_id, tutor_id, assigned_at) VALUES (?, ?, ?)
            ON CONFLICT(purchase_id) DO UPDATE SET
                tutor_id = excluded.tutor_id,
                assigned_at = excluded.assigned_at
            ",
            params![
                assignment.purchase_id,
                assignment.tutor_id,
                format_timestamp(now)
            ],
        )?;
        tx.commit()?;
        tracing::info!(
            purchase_id = %assignment.purchase_id,
            tutor_id = %assignment.tutor_id,
            "tutor assigned"
        );
        Ok(())
    }

    /// Resolves an authenticated actor from the directory.
    ///
    /// Disabled accounts cannot act.
    pub fn actor(&self, user_id: &UserId) -> Result<Actor, DbError> {
        let user =
            find_user(&self.conn, user_id)?.ok_or_else(|| DbError::not_found("user", user_id))?;
        if user.status == UserStatus::Disabled {
            return Err(DbError::Forbidden(format!("user {user_id} is disabled")));
        }
        Ok(Actor::new(user.id, user.role))
    }

    /// Reads a purchase with its current balance.
    pub fn purchase(&self, purchase_id: &PurchaseId) -> Result<Purchase, DbError> {
        find_purchase(&self.conn, purchase_id)?
            .ok_or_else(|| DbError::not_found("purchase", purchase_id))
    }
}

pub(crate) fn find_user(conn: &Connection, id: &UserId) -> Result<Option<UserRecord>, DbError> {
    Ok(conn
        .query_row(
            "SELECT id, role, status, name FROM users WHERE id = ?",
            [id],
            |row| {
                Ok(UserRecord {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    status: row.get(2)?,
                    name: row.get(3)?,
                })
            },
        )
        .optional()?)
}

/// Checks that `id` names an active user holding `role`.
///
/// Unknown ids and role mismatches are client errors on the payload.
pub(crate) fn require_role(conn: &Connection, id: &UserId, role: Role) -> Result<(), DbError> {
    let user = find_user(conn, id)?.ok_or_else(|| ValidationError::UnknownReference {
        entity: "user",
        id: id.to_string(),
    })?;
    if user.role != role {
        return Err(ValidationError::RoleMismatch {
            id: id.to_string(),
            expected: role,
            actual: user.role,
        }
        .into());
    }
    if user.status == UserStatus::Disabled {
        return Err(ValidationError::Rejected(format!("user {id} is disabled")).into());
    }
    Ok(())
}

pub(crate) fn subject_exists(conn: &Connection, id: &SubjectId) -> Result<bool, DbError> {
    Ok(conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [id], |_| Ok(()))
        .optional()?
        .is_some())
}

const PURCHASE_COLUMNS: &str = "id, student_id, status, sessions_purchased, sessions_consumed, amount, currency, session_type_id, bundle_id";

fn purchase_from_row(row: &Row<'_>) -> rusqlite::Result<Purchase> {
    Ok(Purchase {
        id: row.get(0)?,
        student_id: row.get(1)?,
        status: row.get(2)?,
        sessions_purchased: row.get(3)?,
        sessions_consumed: row.get(4)?,
        amount: row.get(5)?,
        currency: row.get(6)?,
        session_type_id: row.get(7)?,
        bundle_id: row.get(8)?,
    })
}

pub(crate) fn find_purchase(
    conn: &Connection,
    id: &PurchaseId,
) -> Result<Option<Purchase>, DbError> {
    let query = format!("SELECT {PURCHASE_COLUMNS} FROM purchases WHERE id = ?");
    Ok(conn.query_row(&query, [id], purchase_from_row).optional()?)
}

pub(crate) fn assigned_tutor(
    conn: &Connection,
    purchase_id: &PurchaseId,
) -> Result<Option<UserId>, DbError> {
    Ok(conn
        .query_row(
            "SELECT tutor_id FROM assignments WHERE purchase_id = ?",
            [purchase_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Resolves where the purchase's hourly payout rate comes from.
pub(crate) fn rate_source(conn: &Connection, purchase: &Purchase) -> Result<RateSource, DbError> {
    if let Some(session_type_id) = &purchase.session_type_id {
        let hourly_rate: f64 = conn
            .query_row(
                "SELECT hourly_rate FROM session_types WHERE id = ?",
                [session_type_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| DbError::not_found("session type", session_type_id))?;
        return Ok(RateSource::SessionType { hourly_rate });
    }
    Ok(RateSource::Bundle {
        amount: purchase.amount,
        hours_purchased: purchase.sessions_purchased,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{fixture, uid};
    use tm_core::ErrorKind;

    #[test]
    fn actor_resolves_role_and_rejects_disabled() {
        let mut db = fixture();
        let actor = db.actor(&uid("student-1")).unwrap();
        assert_eq!(actor.role, Role::Student);

        db.upsert_user(&UserRecord {
            id: uid("student-1"),
            role: Role::Student,
            status: UserStatus::Disabled,
            name: None,
        })
        .unwrap();
        let err = db.actor(&uid("student-1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = db.actor(&uid("nobody")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn require_role_reports_mismatch_as_validation() {
        let db = fixture();
        let err = require_role(&db.conn, &uid("student-1"), Role::Tutor).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("expected a tutor"));

        let err = require_role(&db.conn, &uid("ghost"), Role::Tutor).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn assignment_requires_tutor_and_existing_purchase() {
        let mut db = fixture();
        let err = db
            .assign_tutor(&AssignmentRecord {
                purchase_id: PurchaseId::new("purchase-1").unwrap(),
                tutor_id: uid("student-1"),
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = db
            .assign_tutor(&AssignmentRecord {
                purchase_id: PurchaseId::new("missing").unwrap(),
                tutor_id: uid("tutor-1"),
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        db.assign_tutor(&AssignmentRecord {
            purchase_id: PurchaseId::new("purchase-1").unwrap(),
            tutor_id: uid("tutor-2"),
        })
        .unwrap();
        let tutor = assigned_tutor(&db.conn, &PurchaseId::new("purchase-1").unwrap()).unwrap();
        assert_eq!(tutor, Some(uid("tutor-2")));
    }

    #[test]
    fn purchase_reimport_keeps_consumed_hours() {
        let mut db = fixture();
        let id = PurchaseId::new("purchase-1").unwrap();
        db.conn
            .execute(
                "UPDATE purchases SET sessions_consumed = 0.5 WHERE id = ?",
                [&id],
            )
            .unwrap();
        let mut purchase = db.purchase(&id).unwrap();
        purchase.sessions_consumed = 0.0;
        purchase.amount = 90.0;
        db.upsert_purchase(&purchase).unwrap();

        let stored = db.purchase(&id).unwrap();
        assert!((stored.sessions_consumed - 0.5).abs() < f64::EPSILON);
        assert!((stored.amount - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn purchase_must_reference_one_rate_source() {
        let mut db = fixture();
        let mut purchase = db.purchase(&PurchaseId::new("purchase-1").unwrap()).unwrap();
        purchase.bundle_id = Some(BundleId::new("bundle-1").unwrap());
        assert!(db.upsert_purchase(&purchase).is_err());
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn rate_source_prefers_session_type_then_bundle_average() {
        let db = fixture();
        let single = db.purchase(&PurchaseId::new("purchase-1").unwrap()).unwrap();
        assert_eq!(rate_source(&db.conn, &single).unwrap().hourly_rate(), 40.0);

        let bundle = db.purchase(&PurchaseId::new("purchase-bundle").unwrap()).unwrap();
        assert_eq!(rate_source(&db.conn, &bundle).unwrap().hourly_rate(), 33.33);
    }
}
