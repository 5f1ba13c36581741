//! Tutoring sessions and their timer state machine.
//!
//! A session's timer is not stored as a flag. It is derived from whether an
//! open [`SessionTiming`] segment exists, so the phase survives restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::Participants;
use crate::error::{Machine, TransitionError};
use crate::interval::minutes_ceil;
use crate::types::{EventId, PurchaseId, SessionId, SubjectId, UserId, define_str_enum};

define_str_enum!(
    /// Stored session status.
    SessionStatus, "session status" {
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

define_str_enum!(
    /// Timer operations on a session.
    SessionAction, "session action" {
        Pause => "pause",
        Resume => "resume",
        End => "end",
        Cancel => "cancel",
    }
);

define_str_enum!(
    /// How the session is delivered.
    DeliveryMode, "delivery mode" {
        Online => "online",
        InPerson => "in_person",
    }
);

/// Session status combined with the derived timer sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl SessionPhase {
    /// Derives the phase from the stored status and open-segment presence.
    #[must_use]
    pub const fn from_parts(status: SessionStatus, has_open_segment: bool) -> Self {
        match status {
            SessionStatus::InProgress if has_open_segment => Self::Running,
            SessionStatus::InProgress => Self::Paused,
            SessionStatus::Completed => Self::Completed,
            SessionStatus::Cancelled => Self::Cancelled,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Applies `action` using the session transition table.
    ///
    /// | from            | action | to        |
    /// |-----------------|--------|-----------|
    /// | running         | pause  | paused    |
    /// | paused          | resume | running   |
    /// | running, paused | end    | completed |
    /// | running, paused | cancel | cancelled |
    pub fn apply(self, action: SessionAction) -> Result<Self, TransitionError> {
        match (self, action) {
            (Self::Running, SessionAction::Pause) => Ok(Self::Paused),
            (Self::Paused, SessionAction::Resume) => Ok(Self::Running),
            (Self::Running | Self::Paused, SessionAction::End) => Ok(Self::Completed),
            (Self::Running | Self::Paused, SessionAction::Cancel) => Ok(Self::Cancelled),
            (phase, action) => Err(TransitionError::new(
                Machine::Session,
                phase.as_str(),
                action.as_str(),
            )),
        }
    }
}

/// A stored tutoring session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub purchase_id: PurchaseId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_event_id: Option<EventId>,
    pub student_id: UserId,
    pub tutor_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<SubjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub total_minutes: i64,
    pub overage_minutes: i64,
}

impl Participants for Session {
    fn student_id(&self) -> &UserId {
        &self.student_id
    }

    fn tutor_id(&self) -> &UserId {
        &self.tutor_id
    }
}

/// One contiguous running interval of a session's timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTiming {
    pub id: i64,
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    /// `None` while the segment is running.
    pub ended_at: Option<DateTime<Utc>>,
    /// Computed on close, rounded up to the next whole minute.
    pub minutes: Option<i64>,
}

impl SessionTiming {
    pub const fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Minutes this segment is worth if closed at `now`.
    #[must_use]
    pub fn minutes_if_closed_at(&self, now: DateTime<Utc>) -> i64 {
        minutes_ceil(self.started_at, now)
    }
}

/// A session together with its segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: Session,
    pub phase: SessionPhase,
    pub timings: Vec<SessionTiming>,
}

/// Payload for starting a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    pub purchase_id: PurchaseId,
    #[serde(default)]
    pub calendar_event_id: Option<EventId>,
    #[serde(default)]
    pub subject_id: Option<SubjectId>,
    #[serde(default)]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SessionStart {
    pub const fn new(purchase_id: PurchaseId) -> Self {
        Self {
            purchase_id,
            calendar_event_id: None,
            subject_id: None,
            delivery_mode: None,
            notes: None,
        }
    }
}

/// Filters for listing sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub purchase_id: Option<PurchaseId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;

    #[test]
    fn phase_derives_from_open_segment() {
        assert_eq!(
            SessionPhase::from_parts(SessionStatus::InProgress, true),
            SessionPhase::Running
        );
        assert_eq!(
            SessionPhase::from_parts(SessionStatus::InProgress, false),
            SessionPhase::Paused
        );
        assert_eq!(
            SessionPhase::from_parts(SessionStatus::Completed, false),
            SessionPhase::Completed
        );
    }

    #[test]
    fn timer_transition_table() {
        use SessionAction::{Cancel, End, Pause, Resume};
        use SessionPhase::{Cancelled, Completed, Paused, Running};

        assert_eq!(Running.apply(Pause), Ok(Paused));
        assert_eq!(Paused.apply(Resume), Ok(Running));
        assert_eq!(Running.apply(End), Ok(Completed));
        assert_eq!(Paused.apply(End), Ok(Completed));
        assert_eq!(Running.apply(Cancel), Ok(Cancelled));

        assert!(Running.apply(Resume).is_err());
        assert!(Paused.apply(Pause).is_err());
        for done in [Completed, Cancelled] {
            for action in SessionAction::ALL {
                assert!(done.apply(*action).is_err());
            }
        }
    }

    #[test]
    fn double_resume_is_invalid_session_state() {
        let err = SessionPhase::Running
            .apply(SessionAction::Resume)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_session_state");
        assert_eq!(err.to_string(), "cannot resume session while running");
    }

    #[test]
    fn open_segment_minutes_round_up() {
        let start = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let timing = SessionTiming {
            id: 1,
            session_id: SessionId::new("s").unwrap(),
            started_at: start,
            ended_at: None,
            minutes: None,
        };
        assert!(timing.is_open());
        assert_eq!(
            timing.minutes_if_closed_at(start + Duration::seconds(61)),
            2
        );
    }
}
