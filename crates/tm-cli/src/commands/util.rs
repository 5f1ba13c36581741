//! Shared utilities for CLI commands.

use std::io::Write;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;

/// Pre-compiled regex for relative time parsing, in either direction.
static RELATIVE_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:in\s+(\d+)\s+(minute|hour|day|week)s?|(\d+)\s+(minute|hour|day|week)s?\s+ago)$")
        .unwrap()
});

/// Conservative bounds for relative time parsing (~1000 years in minutes).
const MAX_RELATIVE_MINUTES: i64 = 1000 * 365 * 24 * 60;

/// Parse a datetime string as ISO 8601, `now`, or a relative offset.
///
/// Supports:
/// - ISO 8601: "2026-03-01T10:00:00Z"
/// - Future: "in 2 hours", "in 30 minutes", "in 1 day"
/// - Past: "2 hours ago", "1 week ago"
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    parse_datetime_at(s, Utc::now())
}

fn parse_datetime_at(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if s == "now" {
        return Ok(now);
    }

    let Some(caps) = RELATIVE_TIME_RE.captures(s) else {
        anyhow::bail!(
            "Invalid datetime: {s}. Use ISO 8601 (e.g., 2026-03-01T10:00:00Z) or relative (e.g., 'in 2 hours', '30 minutes ago')"
        );
    };
    let (amount, unit, future) = match (caps.get(1), caps.get(2), caps.get(3), caps.get(4)) {
        (Some(n), Some(unit), _, _) => (n.as_str(), unit.as_str(), true),
        (_, _, Some(n), Some(unit)) => (n.as_str(), unit.as_str(), false),
        _ => anyhow::bail!("Invalid datetime: {s}"),
    };

    let n: i64 = amount
        .parse()
        .context("failed to parse number in relative time")?;
    let (max_for_unit, minutes_per_unit) = match unit {
        "minute" => (MAX_RELATIVE_MINUTES, 1),
        "hour" => (MAX_RELATIVE_MINUTES / 60, 60),
        "day" => (MAX_RELATIVE_MINUTES / (60 * 24), 60 * 24),
        "week" => (MAX_RELATIVE_MINUTES / (60 * 24 * 7), 60 * 24 * 7),
        unit => anyhow::bail!("Unknown time unit: {unit}"),
    };
    if n > max_for_unit {
        anyhow::bail!("Relative time value too large: {n} {unit}");
    }

    let duration = Duration::minutes(n * minutes_per_unit);
    Ok(if future { now + duration } else { now - duration })
}

/// Formats a timestamp for tables: UTC, minute precision.
pub fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

/// Formats a money amount with two decimals and its currency.
pub fn format_money(amount: f64, currency: &str) -> String {
    format!("{amount:.2} {currency}")
}

/// Writes `value` as pretty JSON followed by a newline.
pub fn write_json<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, value).context("failed to encode JSON")?;
    writeln!(writer)?;
    Ok(())
}
