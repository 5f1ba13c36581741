//! Import command for seeding directory, catalog and purchase records.
//!
//! Input is JSON lines, one record per line, tagged by `type`:
//!
//! ```text
//! {"type":"user","id":"tutor-1","role":"tutor"}
//! {"type":"purchase","id":"p-1","student_id":"student-1","hours":2,"amount":80,"session_type_id":"single"}
//! {"type":"assignment","purchase_id":"p-1","tutor_id":"tutor-1"}
//! ```

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::Deserialize;
use tm_core::{BundleId, Purchase, PurchaseId, PurchaseStatus, SessionTypeId, UserId};
use tm_db::{
    AssignmentRecord, BundleRecord, Database, SessionTypeRecord, SubjectRecord, UserRecord,
};

use crate::Config;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ImportRecord {
    User(UserRecord),
    Subject(SubjectRecord),
    SessionType(SessionTypeRecord),
    Bundle(BundleRecord),
    Purchase(ImportPurchase),
    Assignment(AssignmentRecord),
}

#[derive(Debug, Deserialize)]
struct ImportPurchase {
    id: PurchaseId,
    student_id: UserId,
    #[serde(default = "default_purchase_status")]
    status: PurchaseStatus,
    #[serde(alias = "hours")]
    sessions_purchased: f64,
    #[serde(default)]
    sessions_consumed: f64,
    amount: f64,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    session_type_id: Option<SessionTypeId>,
    #[serde(default)]
    bundle_id: Option<BundleId>,
}

const fn default_purchase_status() -> PurchaseStatus {
    PurchaseStatus::Active
}

impl ImportPurchase {
    fn to_purchase(&self, default_currency: &str) -> Purchase {
        Purchase {
            id: self.id.clone(),
            student_id: self.student_id.clone(),
            status: self.status,
            sessions_purchased: self.sessions_purchased,
            sessions_consumed: self.sessions_consumed,
            amount: self.amount,
            currency: self
                .currency
                .clone()
                .filter(|currency| !currency.trim().is_empty())
                .unwrap_or_else(|| default_currency.to_string()),
            session_type_id: self.session_type_id.clone(),
            bundle_id: self.bundle_id.clone(),
        }
    }
}

pub fn run<R: BufRead, W: Write>(
    reader: R,
    writer: &mut W,
    db: &mut Database,
    config: &Config,
) -> Result<usize> {
    let records = parse_records(reader)?;
    for (line, record) in &records {
        apply(db, record, &config.default_currency)
            .with_context(|| format!("failed to import record on line {line}"))?;
    }
    writeln!(writer, "Imported {} records.", records.len())?;
    Ok(records.len())
}

fn parse_records<R: BufRead>(reader: R) -> Result<Vec<(usize, ImportRecord)>> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: ImportRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid record on line {}", idx + 1))?;
        records.push((idx + 1, record));
    }
    Ok(records)
}

fn apply(db: &mut Database, record: &ImportRecord, default_currency: &str) -> Result<()> {
    match record {
        ImportRecord::User(user) => db.upsert_user(user)?,
        ImportRecord::Subject(subject) => db.upsert_subject(subject)?,
        ImportRecord::SessionType(session_type) => db.upsert_session_type(session_type)?,
        ImportRecord::Bundle(bundle) => db.upsert_bundle(bundle)?,
        ImportRecord::Purchase(purchase) => {
            db.upsert_purchase(&purchase.to_purchase(default_currency))?;
        }
        ImportRecord::Assignment(assignment) => db.assign_tutor(assignment)?,
    }
    Ok(())
}
