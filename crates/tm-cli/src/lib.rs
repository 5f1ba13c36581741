//! Tutoring scheduler CLI library.
//!
//! This crate provides the CLI interface over the scheduling and accounting
//! engines in `tm-db`.

mod cli;
pub mod commands;
mod config;
pub mod sink;

pub use cli::{Cli, Commands};
pub use config::Config;

use tm_core::ValidationError;
use tm_db::DbError;

/// Machine-readable code for a command failure.
pub fn error_code(err: &anyhow::Error) -> &'static str {
    if let Some(db) = err.downcast_ref::<DbError>() {
        return db.code();
    }
    if err.downcast_ref::<ValidationError>().is_some() {
        return "validation_error";
    }
    "error"
}

#[cfg(test)]
mod tests {
    use super::*;

    use tm_core::{Machine, TransitionError};

    #[test]
    fn error_code_names_engine_failures() {
        let err = anyhow::Error::new(DbError::Forbidden("not a participant".to_string()));
        assert_eq!(error_code(&err), "forbidden");

        let err = anyhow::Error::new(DbError::InvalidState(TransitionError::new(
            Machine::Session,
            "running",
            "resume",
        )))
        .context("sessions resume");
        assert_eq!(error_code(&err), "invalid_session_state");
    }

    #[test]
    fn error_code_falls_back_for_other_errors() {
        let err = anyhow::Error::new(tm_core::UserId::new("").unwrap_err());
        assert_eq!(error_code(&err), "validation_error");
        assert_eq!(error_code(&anyhow::anyhow!("boom")), "error");
    }
}
