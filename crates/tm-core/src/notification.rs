//! Notices for participants and the sink they are delivered to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{UserId, define_str_enum};

define_str_enum!(
    /// What happened that a participant should hear about.
    NotificationKind, "notification kind" {
        EventProposed => "event_proposed",
        EventAccepted => "event_accepted",
        EventRejected => "event_rejected",
        EventCancelled => "event_cancelled",
        EventRescheduled => "event_rescheduled",
        FeedbackRequested => "feedback_requested",
    }
);

/// A queued notice awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
}

/// Delivery failure reported by a sink.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Best-effort delivery channel (email, push, chat).
///
/// Delivery only happens after the originating transaction commits; a
/// failing sink never rolls back scheduling or ledger state.
pub trait NotificationSink {
    fn notify(
        &self,
        user_id: &UserId,
        kind: NotificationKind,
        payload: &Value,
    ) -> Result<(), NotifyError>;
}
