//! Purchase balance and consumption history.

use std::fmt::Write as _;
use std::io::Write;

use anyhow::Result;
use serde::Serialize;
use tm_core::{Actor, Consumption, Purchase, PurchaseId};
use tm_db::Database;

use super::util::{format_time, write_json};

#[derive(Debug, Serialize)]
struct PurchaseReport {
    #[serde(flatten)]
    purchase: Purchase,
    remaining_minutes: i64,
    consumptions: Vec<Consumption>,
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    actor: &Actor,
    id: &str,
    json: bool,
) -> Result<()> {
    let purchase_id = PurchaseId::new(id)?;
    // Authorizes the read before the purchase itself is exposed.
    let consumptions = db.consumptions(actor, &purchase_id)?;
    let purchase = db.purchase(&purchase_id)?;
    if json {
        let report = PurchaseReport {
            remaining_minutes: purchase.remaining_minutes(),
            purchase,
            consumptions,
        };
        return write_json(writer, &report);
    }
    write!(writer, "{}", format_purchase(&purchase, &consumptions))?;
    Ok(())
}

/// Formats a purchase balance followed by its consumption history.
pub fn format_purchase(purchase: &Purchase, consumptions: &[Consumption]) -> String {
    let mut output = String::new();
    writeln!(output, "purchase {} ({})", purchase.id, purchase.status).unwrap();
    writeln!(output, "  student:   {}", purchase.student_id).unwrap();
    writeln!(
        output,
        "  remaining: {} min of {} h",
        purchase.remaining_minutes(),
        purchase.sessions_purchased
    )
    .unwrap();
    if consumptions.is_empty() {
        writeln!(output, "  no sessions settled yet").unwrap();
        return output;
    }
    writeln!(output, "  consumptions:").unwrap();
    for consumption in consumptions {
        writeln!(
            output,
            "    {}  session {}  {} min  {} -> {}",
            format_time(consumption.created_at),
            consumption.session_id,
            consumption.minutes,
            consumption.balance_before_minutes,
            consumption.balance_after_minutes
        )
        .unwrap();
    }
    output
}
