//! Balance arithmetic: purchases, settlement, consumption and timesheets.
//!
//! Purchase balances are held in hours by the commerce side. Everything the
//! engine computes is in whole minutes; conversion happens only at the edges
//! through [`hours_to_minutes`] and [`round_hours`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Machine, TransitionError};
use crate::session::SessionDetail;
use crate::types::{BundleId, PurchaseId, SessionId, SessionTypeId, UserId, define_str_enum};

/// Decimal places kept for consumed hours.
const HOURS_SCALE: f64 = 10_000.0;

/// Decimal places kept for money.
const MONEY_SCALE: f64 = 100.0;

/// Rounds a monetary amount to 2 decimals, halves away from zero.
#[must_use]
pub fn round_money(value: f64) -> f64 {
    (value * MONEY_SCALE).round() / MONEY_SCALE
}

/// Rounds an hour quantity to the stored precision (4 decimals).
#[must_use]
pub fn round_hours(value: f64) -> f64 {
    (value * HOURS_SCALE).round() / HOURS_SCALE
}

/// Converts a stored hour quantity to whole minutes, absorbing the
/// rounding residue of [`round_hours`].
#[must_use]
#[expect(
    clippy::cast_possible_truncation,
    reason = "balances are bounded far below i64::MAX minutes"
)]
pub fn hours_to_minutes(hours: f64) -> i64 {
    (hours * 60.0).round() as i64
}

#[must_use]
#[expect(
    clippy::cast_precision_loss,
    reason = "minute counts are far below 2^52"
)]
pub fn minutes_to_hours(minutes: i64) -> f64 {
    minutes as f64 / 60.0
}

define_str_enum!(
    /// Commerce-side purchase status. Only active purchases can be consumed.
    PurchaseStatus, "purchase status" {
        Pending => "pending",
        Active => "active",
        Expired => "expired",
        Refunded => "refunded",
    }
);

/// A prepaid block of tutoring hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: PurchaseId,
    pub student_id: UserId,
    pub status: PurchaseStatus,
    /// Hours bought.
    pub sessions_purchased: f64,
    /// Hours consumed so far.
    pub sessions_consumed: f64,
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub session_type_id: Option<SessionTypeId>,
    #[serde(default)]
    pub bundle_id: Option<BundleId>,
}

impl Purchase {
    /// Remaining balance in whole minutes, never negative.
    #[must_use]
    pub fn remaining_minutes(&self) -> i64 {
        let purchased = hours_to_minutes(self.sessions_purchased);
        let consumed = hours_to_minutes(self.sessions_consumed);
        (purchased - consumed).max(0)
    }
}

/// Where a purchase's hourly payout rate comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateSource {
    /// A discrete session type with its own hourly rate.
    SessionType { hourly_rate: f64 },
    /// A bundle: the rate is the purchase amount averaged over its hours.
    /// Bundles may mix session types at different rates; per-item
    /// consumption is not tracked, so the average is used for all of them.
    Bundle { amount: f64, hours_purchased: f64 },
}

impl RateSource {
    /// Effective hourly rate, rounded to money precision.
    #[must_use]
    pub fn hourly_rate(&self) -> f64 {
        match *self {
            Self::SessionType { hourly_rate } => round_money(hourly_rate),
            Self::Bundle {
                amount,
                hours_purchased,
            } => {
                if hours_purchased <= 0.0 {
                    0.0
                } else {
                    round_money(amount / hours_purchased)
                }
            }
        }
    }
}

/// Payout for `minutes` at an hourly `rate`: `minutes / 60 * rate`, 2 decimals.
#[must_use]
pub fn payout_amount(minutes: i64, rate: f64) -> f64 {
    round_money(minutes_to_hours(minutes) * rate)
}

/// Outcome of settling a session against a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub total_minutes: i64,
    pub billable_minutes: i64,
    pub overage_minutes: i64,
    pub balance_before_minutes: i64,
    pub balance_after_minutes: i64,
}

/// Splits worked minutes into billable and overage against `remaining_minutes`.
///
/// `billable = min(total, remaining)`, `overage = total - billable`.
/// Running past the balance is recorded as overage, never rejected.
#[must_use]
pub fn settle(total_minutes: i64, remaining_minutes: i64) -> Settlement {
    let total = total_minutes.max(0);
    let before = remaining_minutes.max(0);
    let billable = total.min(before);
    Settlement {
        total_minutes: total,
        billable_minutes: billable,
        overage_minutes: total - billable,
        balance_before_minutes: before,
        balance_after_minutes: before - billable,
    }
}

/// A debit that would take a balance below zero.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot debit {requested} minutes from a balance of {available}")]
pub struct InsufficientBalance {
    pub available: i64,
    pub requested: i64,
}

/// Returns the balance after debiting `minutes` from `balance_before`.
pub const fn debit(balance_before: i64, minutes: i64) -> Result<i64, InsufficientBalance> {
    if minutes < 0 || minutes > balance_before {
        return Err(InsufficientBalance {
            available: balance_before,
            requested: minutes,
        });
    }
    Ok(balance_before - minutes)
}

/// Append-only ledger entry for one session's balance debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumption {
    pub id: i64,
    pub purchase_id: PurchaseId,
    pub session_id: SessionId,
    pub minutes: i64,
    pub balance_before_minutes: i64,
    pub balance_after_minutes: i64,
    pub created_at: DateTime<Utc>,
}

define_str_enum!(
    /// Payout status of a timesheet.
    TimesheetStatus, "timesheet status" {
        Pending => "pending",
        Approved => "approved",
        Paid => "paid",
    }
);

define_str_enum!(
    /// Admin actions on a timesheet.
    TimesheetAction, "timesheet action" {
        Approve => "approve",
        MarkPaid => "mark_paid",
    }
);

impl TimesheetStatus {
    /// `pending -approve-> approved -mark_paid-> paid`; nothing else.
    pub fn apply(self, action: TimesheetAction) -> Result<Self, TransitionError> {
        match (self, action) {
            (Self::Pending, TimesheetAction::Approve) => Ok(Self::Approved),
            (Self::Approved, TimesheetAction::MarkPaid) => Ok(Self::Paid),
            (state, action) => Err(TransitionError::new(
                Machine::Timesheet,
                state.as_str(),
                action.as_str(),
            )),
        }
    }
}

/// Payout-facing record for one completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timesheet {
    pub id: i64,
    pub tutor_id: UserId,
    pub session_id: SessionId,
    pub minutes: i64,
    /// Hourly rate snapshotted at settlement.
    pub rate: f64,
    pub amount: f64,
    pub currency: String,
    pub status: TimesheetStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A completed session together with the ledger rows its settlement wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    #[serde(flatten)]
    pub detail: SessionDetail,
    pub settlement: Settlement,
    pub consumption: Consumption,
    pub timesheet: Timesheet,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn purchase(purchased_hours: f64, consumed_hours: f64) -> Purchase {
        Purchase {
            id: PurchaseId::new("p-1").unwrap(),
            student_id: UserId::new("s-1").unwrap(),
            status: PurchaseStatus::Active,
            sessions_purchased: purchased_hours,
            sessions_consumed: consumed_hours,
            amount: 120.0,
            currency: "USD".to_string(),
            session_type_id: None,
            bundle_id: None,
        }
    }

    #[test]
    fn remaining_minutes_from_hours() {
        assert_eq!(purchase(2.0, 0.0).remaining_minutes(), 120);
        assert_eq!(purchase(2.0, 0.75).remaining_minutes(), 75);
        assert_eq!(purchase(1.0, 2.0).remaining_minutes(), 0);
    }

    #[test]
    fn remaining_minutes_absorb_stored_rounding() {
        // 50 minutes stored as 0.8333 hours.
        let consumed = round_hours(minutes_to_hours(50));
        assert!((consumed - 0.8333).abs() < 1e-9);
        assert_eq!(purchase(1.0, consumed).remaining_minutes(), 10);
    }

    #[test]
    fn settle_within_balance() {
        let s = settle(45, 120);
        assert_eq!(s.billable_minutes, 45);
        assert_eq!(s.overage_minutes, 0);
        assert_eq!(s.balance_after_minutes, 75);
    }

    #[test]
    fn settle_records_overage() {
        let s = settle(30, 10);
        assert_eq!(s.billable_minutes, 10);
        assert_eq!(s.overage_minutes, 20);
        assert_eq!(s.balance_after_minutes, 0);
        assert_eq!(s.billable_minutes + s.overage_minutes, s.total_minutes);
    }

    #[test]
    fn settle_properties_hold_across_inputs() {
        for total in [0, 1, 9, 10, 11, 59, 60, 61, 600] {
            for remaining in [0, 1, 10, 60, 120] {
                let s = settle(total, remaining);
                assert_eq!(s.billable_minutes + s.overage_minutes, total);
                assert!(s.billable_minutes <= remaining);
                assert_eq!(
                    s.balance_after_minutes + s.billable_minutes,
                    s.balance_before_minutes
                );
            }
        }
    }

    #[test]
    fn debit_never_goes_negative() {
        assert_eq!(debit(10, 10), Ok(0));
        assert_eq!(
            debit(10, 11),
            Err(InsufficientBalance {
                available: 10,
                requested: 11
            })
        );
        assert!(debit(10, -1).is_err());
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn rates_and_payouts() {
        assert_eq!(RateSource::SessionType { hourly_rate: 40.0 }.hourly_rate(), 40.0);
        let bundle = RateSource::Bundle {
            amount: 100.0,
            hours_purchased: 3.0,
        };
        assert_eq!(bundle.hourly_rate(), 33.33);
        let empty = RateSource::Bundle {
            amount: 100.0,
            hours_purchased: 0.0,
        };
        assert_eq!(empty.hourly_rate(), 0.0);

        assert_eq!(payout_amount(45, 40.0), 30.0);
        assert_eq!(payout_amount(10, 33.33), 5.56);
        assert_eq!(payout_amount(0, 40.0), 0.0);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn money_rounds_half_away_from_zero() {
        assert_eq!(round_money(2.675_000_1), 2.68);
        assert_eq!(round_money(1.005_000_1), 1.01);
        assert_eq!(round_money(0.004), 0.0);
    }

    #[test]
    fn timesheet_transition_table() {
        assert_eq!(
            TimesheetStatus::Pending.apply(TimesheetAction::Approve),
            Ok(TimesheetStatus::Approved)
        );
        assert_eq!(
            TimesheetStatus::Approved.apply(TimesheetAction::MarkPaid),
            Ok(TimesheetStatus::Paid)
        );
        let err = TimesheetStatus::Pending
            .apply(TimesheetAction::MarkPaid)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_timesheet_state");
        assert!(TimesheetStatus::Paid.apply(TimesheetAction::Approve).is_err());
    }
}
