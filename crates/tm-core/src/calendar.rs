//! Calendar events: proposed or resolved time slots between one student and
//! one tutor, and the transition table that governs their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::Participants;
use crate::error::{Machine, TransitionError};
use crate::interval::{Interval, storage_precision};
use crate::types::{
    Actor, EventId, PurchaseId, Role, SubjectId, UserId, ValidationError, define_str_enum,
};

define_str_enum!(
    /// What a calendar slot is for.
    EventType, "event type" {
        Session => "session",
        Exam => "exam",
        Target => "target",
        Other => "other",
    }
);

define_str_enum!(
    /// Lifecycle status of a calendar event.
    EventStatus, "event status" {
        Proposed => "proposed",
        Accepted => "accepted",
        Rejected => "rejected",
        Cancelled => "cancelled",
        Rescheduled => "rescheduled",
    }
);

define_str_enum!(
    /// Transitions a participant can request on an event.
    EventAction, "event action" {
        Accept => "accept",
        Reject => "reject",
        Cancel => "cancel",
        Reschedule => "reschedule",
    }
);

define_str_enum!(
    /// Where the event takes place.
    LocationType, "location type" {
        Online => "online",
        InPerson => "in_person",
    }
);

impl EventStatus {
    /// Applies `action` using the event transition table.
    ///
    /// | from       | action     | to          |
    /// |------------|------------|-------------|
    /// | proposed   | accept     | accepted    |
    /// | proposed   | reject     | rejected    |
    /// | proposed   | cancel     | cancelled   |
    /// | accepted   | cancel     | cancelled   |
    /// | proposed   | reschedule | rescheduled |
    /// | accepted   | reschedule | rescheduled |
    pub fn apply(self, action: EventAction) -> Result<Self, TransitionError> {
        match (self, action) {
            (Self::Proposed, EventAction::Accept) => Ok(Self::Accepted),
            (Self::Proposed, EventAction::Reject) => Ok(Self::Rejected),
            (Self::Proposed | Self::Accepted, EventAction::Cancel) => Ok(Self::Cancelled),
            (Self::Proposed | Self::Accepted, EventAction::Reschedule) => Ok(Self::Rescheduled),
            (state, action) => Err(TransitionError::new(
                Machine::CalendarEvent,
                state.as_str(),
                action.as_str(),
            )),
        }
    }

    /// No action leaves a terminal status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        EventAction::ALL
            .iter()
            .all(|action| self.apply(*action).is_err())
    }

    /// Only accepted events occupy a slot for conflict detection.
    #[must_use]
    pub const fn blocks_slot(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// A stored calendar event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: EventId,
    pub event_type: EventType,
    pub status: EventStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub student_id: UserId,
    pub tutor_id: UserId,
    pub created_by: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<SubjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_id: Option<PurchaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_type: Option<LocationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reschedule_of: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CalendarEvent {
    #[must_use]
    pub const fn interval(&self) -> Interval {
        Interval {
            start: self.start_at,
            end: self.end_at,
        }
    }
}

impl Participants for CalendarEvent {
    fn student_id(&self) -> &UserId {
        &self.student_id
    }

    fn tutor_id(&self) -> &UserId {
        &self.tutor_id
    }
}

/// Payload for proposing a new event.
///
/// The counterpart id is inferred from the creator's role: a student
/// supplies `tutor_id`, a tutor supplies `student_id`, an admin both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    pub event_type: EventType,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    #[serde(default)]
    pub student_id: Option<UserId>,
    #[serde(default)]
    pub tutor_id: Option<UserId>,
    #[serde(default)]
    pub subject_id: Option<SubjectId>,
    #[serde(default)]
    pub purchase_id: Option<PurchaseId>,
    #[serde(default)]
    pub location_type: Option<LocationType>,
    #[serde(default)]
    pub location_details: Option<String>,
    #[serde(default)]
    pub meeting_url: Option<String>,
}

/// Why a draft's participants could not be resolved.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParticipantError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// The creator named someone else in their own role.
    #[error("{0}")]
    NotSelf(&'static str),
}

impl EventDraft {
    /// Resolves `(student_id, tutor_id)` for this draft as created by `actor`.
    pub fn participants_for(&self, actor: &Actor) -> Result<(UserId, UserId), ParticipantError> {
        match actor.role {
            Role::Student => {
                if let Some(student) = &self.student_id {
                    if *student != actor.id {
                        return Err(ParticipantError::NotSelf(
                            "students can only propose events for themselves",
                        ));
                    }
                }
                let tutor = self
                    .tutor_id
                    .clone()
                    .ok_or(ValidationError::Missing { field: "tutor_id" })?;
                Ok((actor.id.clone(), tutor))
            }
            Role::Tutor => {
                if let Some(tutor) = &self.tutor_id {
                    if *tutor != actor.id {
                        return Err(ParticipantError::NotSelf(
                            "tutors can only propose events for themselves",
                        ));
                    }
                }
                let student = self
                    .student_id
                    .clone()
                    .ok_or(ValidationError::Missing { field: "student_id" })?;
                Ok((student, actor.id.clone()))
            }
            Role::Admin => {
                let student = self
                    .student_id
                    .clone()
                    .ok_or(ValidationError::Missing { field: "student_id" })?;
                let tutor = self
                    .tutor_id
                    .clone()
                    .ok_or(ValidationError::Missing { field: "tutor_id" })?;
                Ok((student, tutor))
            }
        }
    }

    /// The requested slot at storage precision.
    pub fn interval(&self) -> Result<Interval, ValidationError> {
        Interval::new(storage_precision(self.start_at), storage_precision(self.end_at))
    }
}

/// Payload for moving an event to a new interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reschedule {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

impl Reschedule {
    /// The new slot at storage precision.
    pub fn interval(&self) -> Result<Interval, ValidationError> {
        Interval::new(storage_precision(self.start_at), storage_precision(self.end_at))
    }
}

/// Filters for listing events. Non-admin actors are always scoped to
/// their own events regardless of the participant filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub student_id: Option<UserId>,
    pub tutor_id: Option<UserId>,
    pub status: Option<EventStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}
