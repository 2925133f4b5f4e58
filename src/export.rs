// src/export.rs
//
// The XML ledger document handed to the downstream accounting system.
// This is the one wire format the service owns; everything else is JSON.
// Serialized through quick-xml's serde support so escaping is handled by
// the library.

use serde::Serialize;
use uuid::Uuid;

use crate::invoice_batches::InvoiceBatch;

#[derive(Debug, Serialize)]
#[serde(rename = "LedgerDocument")]
pub struct LedgerDocument {
    #[serde(rename = "@documentId")]
    pub document_id: String,
    #[serde(rename = "@generatedAt")]
    pub generated_at: String,
    #[serde(rename = "BatchName")]
    pub batch_name: String,
    #[serde(rename = "PeriodStart")]
    pub period_start: String,
    #[serde(rename = "PeriodEnd")]
    pub period_end: String,
    #[serde(rename = "Entry")]
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Serialize)]
pub struct LedgerEntry {
    #[serde(rename = "@bookingRef")]
    pub booking_ref: String,
    #[serde(rename = "@currency")]
    pub currency: String,
    #[serde(rename = "AccountCode")]
    pub account_code: String,
    #[serde(rename = "Amount")]
    pub amount: String,
    #[serde(rename = "EntryDate")]
    pub entry_date: String,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Invoice line joined with its account's ledger code at export time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExportLine {
    pub booking_ref: String,
    pub description: Option<String>,
    pub account_external_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub entry_date: String,
}

/// Minor units to the downstream decimal form, e.g. -1205 -> "-12.05".
pub fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

pub fn build_document(batch: &InvoiceBatch, lines: &[ExportLine]) -> LedgerDocument {
    let entries = lines
        .iter()
        .map(|l| LedgerEntry {
            booking_ref: l.booking_ref.clone(),
            currency: l.currency.clone(),
            account_code: l.account_external_id.clone(),
            amount: format_amount(l.amount_cents),
            entry_date: l.entry_date.clone(),
            description: l.description.clone(),
        })
        .collect();

    LedgerDocument {
        document_id: Uuid::new_v4().to_string(),
        generated_at: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        batch_name: batch.name.clone(),
        period_start: batch.period_start.to_string(),
        period_end: batch.period_end.to_string(),
        entries,
    }
}

pub fn render_document(doc: &LedgerDocument) -> Result<String, quick_xml::DeError> {
    let body = quick_xml::se::to_string(doc)?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body}"))
}
