//! Error kinds shared by every operation, and the state-machine rejection type.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Caller-facing classification of a failure.
///
/// Each kind maps onto one HTTP status so a transport binding can translate
/// errors without inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing input, role mismatch, unknown reference.
    Validation,
    /// The addressed entity does not exist.
    NotFound,
    /// The actor lacks the role or participant standing.
    Forbidden,
    /// The operation is not valid for the entity's current state.
    StateConflict,
    /// The requested interval overlaps an accepted event.
    SchedulingConflict,
    /// A debit would drive a balance negative. Settlement records overage
    /// instead, so this only signals a broken ledger invariant.
    InsufficientBalance,
    /// Storage or other infrastructure failure.
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::StateConflict => "state_conflict",
            Self::SchedulingConflict => "scheduling_conflict",
            Self::InsufficientBalance => "insufficient_balance",
            Self::Internal => "internal_error",
        }
    }

    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Validation | Self::StateConflict | Self::InsufficientBalance => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::SchedulingConflict => 409,
            Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The state machines whose transitions are checked centrally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    CalendarEvent,
    Session,
    Timesheet,
}

impl Machine {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CalendarEvent => "calendar event",
            Self::Session => "session",
            Self::Timesheet => "timesheet",
        }
    }

    /// Code surfaced for illegal transitions of this machine.
    #[must_use]
    pub const fn invalid_state_code(self) -> &'static str {
        match self {
            Self::CalendarEvent => "invalid_event_state",
            Self::Session => "invalid_session_state",
            Self::Timesheet => "invalid_timesheet_state",
        }
    }
}

/// An action that is not in a machine's transition table for the current state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot {action} {} while {state}", .machine.as_str())]
pub struct TransitionError {
    pub machine: Machine,
    pub state: &'static str,
    pub action: &'static str,
}

impl TransitionError {
    pub const fn new(machine: Machine, state: &'static str, action: &'static str) -> Self {
        Self {
            machine,
            state,
            action,
        }
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.machine.invalid_state_code()
    }
}
