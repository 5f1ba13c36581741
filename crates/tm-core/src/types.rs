//! Core type definitions with validation.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types and operation payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// A string did not match any variant of a closed set.
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    /// An interval whose end does not come after its start.
    #[error("end_at ({end}) must be after start_at ({start})")]
    InvalidInterval { start: String, end: String },

    /// A field required for this actor was not supplied.
    #[error("{field} is required")]
    Missing { field: &'static str },

    /// A participant id resolved to a user with the wrong role.
    #[error("user {id} is a {actual}, expected a {expected}")]
    RoleMismatch {
        id: String,
        expected: Role,
        actual: Role,
    },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    UnknownReference { entity: &'static str, id: String },

    /// The payload is well-formed but contradicts stored state.
    #[error("{0}")]
    Rejected(String),
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                self.0.to_sql()
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = String::column_result(value)?;
                Self::new(raw).map_err(|err| FromSqlError::Other(Box::new(err)))
            }
        }
    };
}

/// Generates a closed string enum stored as TEXT, with `as_str`, `Display`,
/// `FromStr` and SQL conversions. Variant strings must be the `snake_case`
/// form of the variant name so serde and SQL agree.
macro_rules! define_str_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// String representation for database storage.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::types::ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err($crate::types::ValidationError::InvalidValue {
                        field: $field_name,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl ::rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> ::rusqlite::Result<::rusqlite::types::ToSqlOutput<'_>> {
                Ok(::rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl ::rusqlite::types::FromSql for $name {
            fn column_result(
                value: ::rusqlite::types::ValueRef<'_>,
            ) -> ::rusqlite::types::FromSqlResult<Self> {
                let raw = value.as_str()?;
                raw.parse()
                    .map_err(|err| ::rusqlite::types::FromSqlError::Other(Box::new(err)))
            }
        }
    };
}

pub(crate) use define_str_enum;

define_string_id!(
    /// A participant (student, tutor or admin) identifier from the directory.
    UserId, "user ID"
);

define_string_id!(
    /// A calendar event identifier.
    EventId, "event ID"
);

define_string_id!(
    /// A tutoring session identifier.
    SessionId, "session ID"
);

define_string_id!(
    /// A purchase (prepaid hour balance) identifier.
    PurchaseId, "purchase ID"
);

define_string_id!(
    /// A catalog subject identifier.
    SubjectId, "subject ID"
);

define_string_id!(
    /// A catalog session type identifier. Session types carry an hourly rate.
    SessionTypeId, "session type ID"
);

define_string_id!(
    /// A catalog bundle identifier.
    BundleId, "bundle ID"
);

define_str_enum!(
    /// Directory role of a user.
    Role, "role" {
        Student => "student",
        Tutor => "tutor",
        Admin => "admin",
    }
);

define_str_enum!(
    /// Directory account status.
    UserStatus, "user status" {
        Active => "active",
        Disabled => "disabled",
    }
);

/// An authenticated caller: who is acting and in which role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub const fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }

    pub const fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }
}
