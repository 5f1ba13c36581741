//! Storage layer and engines for tutoring sessions.
//!
//! Provides the ledger store, the calendar scheduler and the session
//! accounting engine on top of `rusqlite`.
//!
//! # Consistency
//!
//! Every mutating operation runs inside one `BEGIN IMMEDIATE` transaction.
//! SQLite has no row locks; an immediate transaction takes the database's
//! reserved write lock up front, which serializes the purchase-balance and
//! accepted-slot read-check-write sequences the same way `SELECT ... FOR
//! UPDATE` would on the contended rows. Contending writers wait up to the
//! configured busy timeout, then fail with no partial state.
//!
//! Any error returned from inside an operation drops the transaction, which
//! rolls it back.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! Independent workers should open their own `Database` on the same file;
//! cross-worker consistency comes from the transaction boundary alone.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 UTC with millisecond precision
//! (e.g., `2026-01-15T10:30:00.000Z`), so lexicographic ordering matches
//! chronological ordering and interval predicates can run in SQL.
//!
//! ## Invariants held by the schema
//!
//! - `calendar_events`: `end_at > start_at`
//! - `sessions`: one `in_progress` row per `(purchase_id, tutor_id)`
//! - `session_timings`: one open (`ended_at IS NULL`) row per session
//! - `consumptions`: one row per session, `balance_after = balance_before - minutes`,
//!   `minutes <= balance_before`
//! - `timesheets`: one row per session

mod calendar;
mod directory;
mod ledger;
mod outbox;
mod overview;
mod sessions;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use thiserror::Error;
use tm_core::{
    ErrorKind, EventId, InsufficientBalance, ParticipantError, SessionId, TransitionError, UserId,
    ValidationError,
};
use uuid::Uuid;

pub use directory::{
    AssignmentRecord, BundleRecord, SessionTypeRecord, SubjectRecord, UserRecord,
};
pub use ledger::TimesheetFilter;
pub use outbox::DispatchStats;
pub use overview::Overview;

/// Default time a transaction waits on a contending writer.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Default number of delivery attempts per queued notification.
pub const DEFAULT_NOTIFICATION_ATTEMPTS: i64 = 5;

/// Database and engine errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Malformed input, role mismatch or a missing reference.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The addressed entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    /// The actor lacks the role or participant standing.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The entity's state machine rejects the operation.
    #[error(transparent)]
    InvalidState(#[from] TransitionError),
    /// Another session is already running for this purchase and tutor.
    #[error("session {session_id} is already in progress for this purchase")]
    SessionInProgress { session_id: SessionId },
    /// The interval overlaps an accepted event of one of the participants.
    #[error(
        "scheduling conflict: {participant} already has accepted event {event_id} ({start} to {end})"
    )]
    SchedulingConflict {
        participant: UserId,
        event_id: EventId,
        start: String,
        end: String,
    },
    /// A ledger debit would leave a negative balance.
    #[error(transparent)]
    InsufficientBalance(#[from] InsufficientBalance),
    /// A notification payload could not be encoded or decoded.
    #[error("invalid notification payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<ParticipantError> for DbError {
    fn from(err: ParticipantError) -> Self {
        match err {
            ParticipantError::Invalid(err) => Self::Validation(err),
            ParticipantError::NotSelf(message) => Self::Forbidden(message.to_string()),
        }
    }
}

impl DbError {
    /// Caller-facing classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::InvalidState(_) | Self::SessionInProgress { .. } => ErrorKind::StateConflict,
            Self::SchedulingConflict { .. } => ErrorKind::SchedulingConflict,
            Self::InsufficientBalance(_) => ErrorKind::InsufficientBalance,
            Self::Sqlite(_) | Self::Payload(_) => ErrorKind::Internal,
        }
    }

    /// Machine-readable code. State errors name the machine that refused.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidState(err) => err.code(),
            Self::SessionInProgress { .. } => "invalid_session_state",
            other => other.kind().code(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for consistency and thread safety.
pub struct Database {
    conn: Connection,
    notification_attempts: i64,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        Self::open_with(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens a database with an explicit busy timeout for contended writes.
    pub fn open_with(path: &Path, busy_timeout: Duration) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let db = Self {
            conn,
            notification_attempts: DEFAULT_NOTIFICATION_ATTEMPTS,
        };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            notification_attempts: DEFAULT_NOTIFICATION_ATTEMPTS,
        };
        db.init()?;
        Ok(db)
    }

    /// Sets how many times a queued notification is attempted before it is
    /// left undelivered.
    #[must_use]
    pub fn with_notification_attempts(mut self, attempts: i64) -> Self {
        self.notification_attempts = attempts.max(1);
        self
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            -- Participant directory, catalog and commerce records. Owned by
            -- collaborators; the engines only read them, except
            -- purchases.sessions_consumed which settlement writes.
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                role TEXT NOT NULL CHECK (role IN ('student', 'tutor', 'admin')),
                status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'disabled')),
                name TEXT
            );

            CREATE TABLE IF NOT EXISTS subjects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_types (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                hourly_rate REAL NOT NULL CHECK (hourly_rate >= 0)
            );

            CREATE TABLE IF NOT EXISTS bundles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            -- sessions_purchased / sessions_consumed are hours.
            CREATE TABLE IF NOT EXISTS purchases (
                id TEXT PRIMARY KEY,
                student_id TEXT NOT NULL,
                status TEXT NOT NULL,
                sessions_purchased REAL NOT NULL CHECK (sessions_purchased >= 0),
                sessions_consumed REAL NOT NULL DEFAULT 0 CHECK (sessions_consumed >= 0),
                amount REAL NOT NULL DEFAULT 0,
                currency TEXT NOT NULL,
                session_type_id TEXT,
                bundle_id TEXT,
                CHECK ((session_type_id IS NULL) <> (bundle_id IS NULL)),
                FOREIGN KEY (student_id) REFERENCES users(id),
                FOREIGN KEY (session_type_id) REFERENCES session_types(id),
                FOREIGN KEY (bundle_id) REFERENCES bundles(id)
            );

            CREATE TABLE IF NOT EXISTS assignments (
                purchase_id TEXT PRIMARY KEY,
                tutor_id TEXT NOT NULL,
                assigned_at TEXT NOT NULL,
                FOREIGN KEY (purchase_id) REFERENCES purchases(id),
                FOREIGN KEY (tutor_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS calendar_events (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                student_id TEXT NOT NULL,
                tutor_id TEXT NOT NULL,
                created_by TEXT NOT NULL,
                subject_id TEXT,
                purchase_id TEXT,
                location_type TEXT,
                location_details TEXT,
                meeting_url TEXT,
                reschedule_of TEXT,
                decision_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (end_at > start_at),
                FOREIGN KEY (student_id) REFERENCES users(id),
                FOREIGN KEY (tutor_id) REFERENCES users(id),
                FOREIGN KEY (created_by) REFERENCES users(id),
                FOREIGN KEY (subject_id) REFERENCES subjects(id),
                FOREIGN KEY (purchase_id) REFERENCES purchases(id),
                FOREIGN KEY (reschedule_of) REFERENCES calendar_events(id)
            );

            CREATE INDEX IF NOT EXISTS idx_events_student ON calendar_events(student_id, status, start_at);
            CREATE INDEX IF NOT EXISTS idx_events_tutor ON calendar_events(tutor_id, status, start_at);

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                purchase_id TEXT NOT NULL,
                calendar_event_id TEXT,
                student_id TEXT NOT NULL,
                tutor_id TEXT NOT NULL,
                subject_id TEXT,
                delivery_mode TEXT,
                notes TEXT,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                total_minutes INTEGER NOT NULL DEFAULT 0,
                overage_minutes INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (purchase_id) REFERENCES purchases(id),
                FOREIGN KEY (calendar_event_id) REFERENCES calendar_events(id),
                FOREIGN KEY (student_id) REFERENCES users(id),
                FOREIGN KEY (tutor_id) REFERENCES users(id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_in_progress
                ON sessions(purchase_id, tutor_id) WHERE status = 'in_progress';
            CREATE INDEX IF NOT EXISTS idx_sessions_tutor ON sessions(tutor_id, status);
            CREATE INDEX IF NOT EXISTS idx_sessions_student ON sessions(student_id, status);

            -- A NULL ended_at marks the running segment; minutes are set on close.
            CREATE TABLE IF NOT EXISTS session_timings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                minutes INTEGER,
                CHECK ((ended_at IS NULL) = (minutes IS NULL)),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_timings_one_open
                ON session_timings(session_id) WHERE ended_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_timings_session ON session_timings(session_id);

            CREATE TABLE IF NOT EXISTS consumptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                purchase_id TEXT NOT NULL,
                session_id TEXT NOT NULL UNIQUE,
                minutes INTEGER NOT NULL CHECK (minutes >= 0),
                balance_before_minutes INTEGER NOT NULL,
                balance_after_minutes INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                CHECK (minutes <= balance_before_minutes),
                CHECK (balance_after_minutes = balance_before_minutes - minutes),
                FOREIGN KEY (purchase_id) REFERENCES purchases(id),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE TABLE IF NOT EXISTS timesheets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tutor_id TEXT NOT NULL,
                session_id TEXT NOT NULL UNIQUE,
                minutes INTEGER NOT NULL CHECK (minutes >= 0),
                rate REAL NOT NULL,
                amount REAL NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (tutor_id) REFERENCES users(id),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE INDEX IF NOT EXISTS idx_timesheets_tutor ON timesheets(tutor_id, status);

            -- Notices enqueued inside operation transactions, delivered after commit.
            CREATE TABLE IF NOT EXISTS notification_outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                delivered_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_pending ON notification_outbox(delivered_at, id);
            ",
        )?;
        Ok(())
    }

    /// Starts a write transaction holding the database write lock until
    /// commit or rollback.
    fn write_tx(&mut self) -> Result<Transaction<'_>, DbError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|parsed| parsed.with_timezone(&Utc))
}

/// Reads a required timestamp column.
pub(crate) fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

/// Reads a nullable timestamp column.
pub(crate) fn ts_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        parse_timestamp(&raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
        })
    })
    .transpose()
}

#[cfg(test)]
pub(crate) mod testing;
