//! Ledger writes for settled sessions and the timesheet payout lifecycle.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tm_core::ledger::minutes_to_hours;
use tm_core::{
    Actor, Consumption, Purchase, PurchaseId, Role, Session, Settlement, Timesheet,
    TimesheetAction, TimesheetStatus, UserId, debit, payout_amount, round_hours, settle,
    storage_precision,
};

use crate::directory::{assigned_tutor, find_purchase, rate_source};
use crate::{Database, DbError, format_timestamp, ts};

/// Filters for listing timesheets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimesheetFilter {
    pub status: Option<TimesheetStatus>,
    /// Only honoured for admins; tutors always see their own.
    pub tutor_id: Option<UserId>,
}

const TIMESHEET_COLUMNS: &str =
    "id, tutor_id, session_id, minutes, rate, amount, currency, status, created_at, updated_at";

impl Database {
    /// Lists timesheets. Tutors see their own, admins all; students none.
    pub fn list_timesheets(
        &self,
        actor: &Actor,
        filter: &TimesheetFilter,
    ) -> Result<Vec<Timesheet>, DbError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();
        match actor.role {
            Role::Student => {
                return Err(DbError::Forbidden(
                    "students have no access to timesheets".to_string(),
                ));
            }
            Role::Tutor => {
                clauses.push("tutor_id = ?");
                values.push(actor.id.to_string());
            }
            Role::Admin => {
                if let Some(tutor_id) = &filter.tutor_id {
                    clauses.push("tutor_id = ?");
                    values.push(tutor_id.to_string());
                }
            }
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(status.as_str().to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let query =
            format!("SELECT {TIMESHEET_COLUMNS} FROM timesheets {where_clause} ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), timesheet_from_row)?;
        let mut timesheets = Vec::new();
        for row in rows {
            timesheets.push(row?);
        }
        Ok(timesheets)
    }

    /// Approves a pending timesheet. Admin only.
    pub fn approve_timesheet(&mut self, actor: &Actor, id: i64) -> Result<Timesheet, DbError> {
        self.transition_timesheet_at(actor, id, TimesheetAction::Approve, Utc::now())
    }

    /// Marks an approved timesheet as paid. Admin only.
    pub fn mark_timesheet_paid(&mut self, actor: &Actor, id: i64) -> Result<Timesheet, DbError> {
        self.transition_timesheet_at(actor, id, TimesheetAction::MarkPaid, Utc::now())
    }

    pub(crate) fn transition_timesheet_at(
        &mut self,
        actor: &Actor,
        id: i64,
        action: TimesheetAction,
        now: DateTime<Utc>,
    ) -> Result<Timesheet, DbError> {
        if !actor.is_admin() {
            return Err(DbError::Forbidden(
                "only admins may change timesheet status".to_string(),
            ));
        }
        let now = storage_precision(now);
        let tx = self.write_tx()?;
        let mut timesheet =
            find_timesheet(&tx, id)?.ok_or_else(|| DbError::not_found("timesheet", id))?;
        timesheet.status = timesheet.status.apply(action)?;
        timesheet.updated_at = now;
        tx.execute(
            "UPDATE timesheets SET status = ?, updated_at = ? WHERE id = ?",
            params![timesheet.status, format_timestamp(now), id],
        )?;
        tx.commit()?;

        tracing::info!(
            timesheet_id = id,
            actor = %actor.id,
            status = %timesheet.status,
            "timesheet updated"
        );
        Ok(timesheet)
    }

    /// Consumption history of a purchase, oldest first.
    ///
    /// Visible to admins, the purchasing student and the assigned tutor.
    pub fn consumptions(
        &self,
        actor: &Actor,
        purchase_id: &PurchaseId,
    ) -> Result<Vec<Consumption>, DbError> {
        let purchase = find_purchase(&self.conn, purchase_id)?
            .ok_or_else(|| DbError::not_found("purchase", purchase_id))?;
        let allowed = match actor.role {
            Role::Admin => true,
            Role::Student => purchase.student_id == actor.id,
            Role::Tutor => {
                assigned_tutor(&self.conn, purchase_id)?.as_ref() == Some(&actor.id)
            }
        };
        if !allowed {
            return Err(DbError::Forbidden(format!(
                "no access to purchase {purchase_id}"
            )));
        }

        let mut stmt = self.conn.prepare(
            "
            SELECT id, purchase_id, session_id, minutes, balance_before_minutes, balance_after_minutes, created_at
            FROM consumptions
            WHERE purchase_id = ?
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map([purchase_id], |row| {
            Ok(Consumption {
                id: row.get(0)?,
                purchase_id: row.get(1)?,
                session_id: row.get(2)?,
                minutes: row.get(3)?,
                balance_before_minutes: row.get(4)?,
                balance_after_minutes: row.get(5)?,
                created_at: ts(row, 6)?,
            })
        })?;
        let mut consumptions = Vec::new();
        for row in rows {
            consumptions.push(row?);
        }
        Ok(consumptions)
    }
}

/// Settles `total_minutes` of `session` against `purchase` on the caller's
/// transaction: debits the balance, appends the consumption and writes the
/// timesheet for the billable minutes.
pub(crate) fn settle_session(
    conn: &Connection,
    session: &Session,
    purchase: &Purchase,
    total_minutes: i64,
    now: DateTime<Utc>,
) -> Result<(Settlement, Consumption, Timesheet), DbError> {
    let settlement = settle(total_minutes, purchase.remaining_minutes());
    let balance_after = debit(
        settlement.balance_before_minutes,
        settlement.billable_minutes,
    )?;

    let consumed =
        round_hours(purchase.sessions_consumed + minutes_to_hours(settlement.billable_minutes));
    conn.execute(
        "UPDATE purchases SET sessions_consumed = ? WHERE id = ?",
        params![consumed, purchase.id],
    )?;

    conn.execute(
        "
        INSERT INTO consumptions
        (purchase_id, session_id, minutes, balance_before_minutes, balance_after_minutes, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ",
        params![
            purchase.id,
            session.id,
            settlement.billable_minutes,
            settlement.balance_before_minutes,
            balance_after,
            format_timestamp(now),
        ],
    )?;
    let consumption = Consumption {
        id: conn.last_insert_rowid(),
        purchase_id: purchase.id.clone(),
        session_id: session.id.clone(),
        minutes: settlement.billable_minutes,
        balance_before_minutes: settlement.balance_before_minutes,
        balance_after_minutes: balance_after,
        created_at: now,
    };

    let rate = rate_source(conn, purchase)?.hourly_rate();
    let amount = payout_amount(settlement.billable_minutes, rate);
    conn.execute(
        "
        INSERT INTO timesheets
        (tutor_id, session_id, minutes, rate, amount, currency, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            session.tutor_id,
            session.id,
            settlement.billable_minutes,
            rate,
            amount,
            purchase.currency,
            TimesheetStatus::Pending,
            format_timestamp(now),
            format_timestamp(now),
        ],
    )?;
    let timesheet = Timesheet {
        id: conn.last_insert_rowid(),
        tutor_id: session.tutor_id.clone(),
        session_id: session.id.clone(),
        minutes: settlement.billable_minutes,
        rate,
        amount,
        currency: purchase.currency.clone(),
        status: TimesheetStatus::Pending,
        created_at: now,
        updated_at: now,
    };

    tracing::debug!(
        session_id = %session.id,
        purchase_id = %purchase.id,
        billable = settlement.billable_minutes,
        overage = settlement.overage_minutes,
        balance_after,
        "session settled"
    );
    Ok((settlement, consumption, timesheet))
}

fn find_timesheet(conn: &Connection, id: i64) -> Result<Option<Timesheet>, DbError> {
    let query = format!("SELECT {TIMESHEET_COLUMNS} FROM timesheets WHERE id = ?");
    Ok(conn.query_row(&query, [id], timesheet_from_row).optional()?)
}

fn timesheet_from_row(row: &Row<'_>) -> rusqlite::Result<Timesheet> {
    Ok(Timesheet {
        id: row.get(0)?,
        tutor_id: row.get(1)?,
        session_id: row.get(2)?,
        minutes: row.get(3)?,
        rate: row.get(4)?,
        amount: row.get(5)?,
        currency: row.get(6)?,
        status: row.get(7)?,
        created_at: ts(row, 8)?,
        updated_at: ts(row, 9)?,
    })
}
