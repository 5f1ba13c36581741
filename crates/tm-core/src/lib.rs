//! Core domain logic for tutoring session scheduling and accounting.
//!
//! This crate contains the fundamental types and pure logic for:
//! - Calendar events: proposal/acceptance lifecycle and its transition table
//! - Sessions: the pause/resume timer state machine and segment minutes
//! - Ledger arithmetic: settlement into billable/overage minutes, rates, payouts
//! - Capability checks: participant/admin standing for every operation

pub mod access;
pub mod calendar;
mod error;
pub mod interval;
pub mod ledger;
pub mod notification;
pub mod session;
mod types;

pub use access::{Participants, Standing, can_act_on, is_tutor_of};
pub use calendar::{
    CalendarEvent, EventAction, EventDraft, EventFilter, EventStatus, EventType, LocationType,
    ParticipantError, Reschedule,
};
pub use error::{ErrorKind, Machine, TransitionError};
pub use interval::{Interval, minutes_ceil, overlaps, storage_precision};
pub use ledger::{
    Consumption, InsufficientBalance, Purchase, PurchaseStatus, RateSource, SessionOutcome,
    Settlement, Timesheet, TimesheetAction, TimesheetStatus, debit, payout_amount, round_hours,
    round_money, settle,
};
pub use notification::{Notification, NotificationKind, NotificationSink, NotifyError};
pub use session::{
    DeliveryMode, Session, SessionAction, SessionDetail, SessionFilter, SessionPhase,
    SessionStart, SessionStatus, SessionTiming,
};
pub use types::{
    Actor, BundleId, EventId, PurchaseId, Role, SessionId, SessionTypeId, SubjectId, UserId,
    UserStatus, ValidationError,
};
