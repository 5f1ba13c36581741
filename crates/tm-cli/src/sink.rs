//! Notification channels available to the CLI.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use serde_json::{Value, json};
use tm_core::{NotificationKind, NotificationSink, NotifyError, UserId};

use crate::Config;

/// Emits each notice as a tracing event.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(
        &self,
        user_id: &UserId,
        kind: NotificationKind,
        payload: &Value,
    ) -> Result<(), NotifyError> {
        tracing::info!(user_id = %user_id, kind = %kind, %payload, "notification");
        Ok(())
    }
}

/// Appends each notice to a JSONL mailbox file.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl NotificationSink for FileSink {
    fn notify(
        &self,
        user_id: &UserId,
        kind: NotificationKind,
        payload: &Value,
    ) -> Result<(), NotifyError> {
        let line = json!({
            "user_id": user_id,
            "kind": kind,
            "payload": payload,
        });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| NotifyError(format!("{}: {err}", self.path.display())))?;
        writeln!(file, "{line}").map_err(|err| NotifyError(err.to_string()))
    }
}

/// Picks the configured channel.
pub fn sink_for(config: &Config) -> Box<dyn NotificationSink> {
    match &config.notification_log {
        Some(path) => Box::new(FileSink::new(path.clone())),
        None => Box::new(LogSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_appends_json_lines() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("notices.jsonl");
        let sink = FileSink::new(path.clone());
        let user = UserId::new("student-1").unwrap();

        sink.notify(
            &user,
            NotificationKind::EventAccepted,
            &json!({"event_id": "e-1"}),
        )
        .unwrap();
        sink.notify(&user, NotificationKind::FeedbackRequested, &json!({}))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "event_accepted");
        assert_eq!(lines[0]["payload"]["event_id"], "e-1");
        assert_eq!(lines[1]["user_id"], "student-1");
    }

    #[test]
    fn file_sink_reports_unwritable_path() {
        let temp = tempfile::tempdir().unwrap();
        let sink = FileSink::new(temp.path().join("missing-dir").join("notices.jsonl"));
        let err = sink
            .notify(
                &UserId::new("tutor-1").unwrap(),
                NotificationKind::EventProposed,
                &json!({}),
            )
            .unwrap_err();
        assert!(err.to_string().contains("missing-dir"));
    }
}
