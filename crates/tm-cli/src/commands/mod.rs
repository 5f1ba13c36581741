//! CLI subcommand implementations.

pub mod events;
pub mod import;
pub mod notify;
pub mod purchases;
pub mod sessions;
pub mod status;
pub mod timesheets;
pub mod util;
