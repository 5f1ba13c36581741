//! Status command for showing what the engines are holding.

use std::io::Write;

use anyhow::Result;
use tm_db::Database;

use crate::Config;

pub fn run<W: Write>(writer: &mut W, db: &Database, config: &Config) -> Result<()> {
    let overview = db.overview()?;

    writeln!(writer, "Tutoring scheduler status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;
    writeln!(writer, "Events:")?;
    for (status, count) in &overview.events_by_status {
        writeln!(writer, "- {status}: {count}")?;
    }
    writeln!(writer, "Sessions in progress: {}", overview.sessions_in_progress)?;
    writeln!(writer, "Timesheets pending: {}", overview.timesheets_pending)?;
    writeln!(
        writer,
        "Notifications pending: {}",
        overview.notifications_pending
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use insta::assert_snapshot;
    use tm_core::{Role, UserId, UserStatus};
    use tm_db::UserRecord;

    #[test]
    fn status_command_outputs_counts() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("tm.db");
        let mut db = Database::open(&db_path).unwrap();
        db.upsert_user(&UserRecord {
            id: UserId::new("student-1").unwrap(),
            role: Role::Student,
            status: UserStatus::Active,
            name: None,
        })
        .unwrap();

        let config = Config {
            database_path: db_path.clone(),
            ..Config::default()
        };
        let mut output = Vec::new();
        run(&mut output, &db, &config).unwrap();

        let output = String::from_utf8(output).unwrap();
        let output = output.replace(&db_path.display().to_string(), "[TEMP]/tm.db");
        assert_snapshot!(output, @r"
        Tutoring scheduler status
        Database: [TEMP]/tm.db
        Events:
        - proposed: 0
        - accepted: 0
        - rejected: 0
        - cancelled: 0
        - rescheduled: 0
        Sessions in progress: 0
        Timesheets pending: 0
        Notifications pending: 0
        ");
    }
}
