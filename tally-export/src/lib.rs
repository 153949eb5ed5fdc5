#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Idempotent journal export. Every entry derives a content-addressed
//! external id; the export ledger's conditional insert makes a replay a
//! counted no-op instead of a double posting.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tracing::info;

use tally_audit::AppendEvent;
use tally_audit::AuditEventKind;
use tally_audit::AuditSink;
use tally_journal::Clock;
use tally_journal::ConditionalInsert;
use tally_journal::EntryStatus;
use tally_journal::ExportRecord;
use tally_journal::ExportStatus;
use tally_journal::JournalEntry;
use tally_journal::StorageError;
use tally_journal::Store;
use tally_journal::TenantId;

pub type ExportResult<T> = Result<T, ExportError>;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("entry {0} is not posted and cannot be exported")]
    NotPosted(String),
    #[error("entry {je_id} references unknown account {account_code}")]
    UnknownAccount { je_id: String, account_code: String },
    #[error("csv write failure: {0}")]
    Csv(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("audit sink failure: {0}")]
    Audit(String),
}

/// Export header row, fixed order.
const COLUMNS: [&str; 11] = [
    "ExternalId",
    "JournalId",
    "Date",
    "AccountCode",
    "AccountName",
    "Debit",
    "Credit",
    "Memo",
    "Currency",
    "RuleVersion",
    "ModelVersion",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub target: String,
    pub new_count: usize,
    pub skipped_duplicate_count: usize,
    /// CSV body containing only the newly exported entries.
    pub csv: String,
}

/// Canonical payload hashed into the external id: tenant, target, entry
/// identity and the lines in sorted order with integer minor amounts.
fn canonical_payload(tenant: &TenantId, target: &str, entry: &JournalEntry) -> String {
    let mut lines: Vec<String> = entry
        .lines
        .iter()
        .map(|line| {
            format!(
                "{}:{}:{}",
                line.account_code, line.debit_minor, line.credit_minor
            )
        })
        .collect();
    lines.sort();
    format!(
        "{tenant}|{target}|{}|{}|{}|{}",
        entry.posted_at,
        entry.currency,
        entry.txn_id.as_deref().unwrap_or(""),
        lines.join(";")
    )
}

/// Full 64-hex external id for one entry and target.
#[must_use]
pub fn external_id(tenant: &TenantId, target: &str, entry: &JournalEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_payload(tenant, target, entry).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Spreadsheet formula injection defense: a leading `= + - @`, tab or CR
/// gets a quote prefix.
#[must_use]
pub fn sanitize_field(value: &str) -> String {
    match value.chars().next() {
        Some('=' | '+' | '-' | '@' | '\t' | '\r') => format!("'{value}"),
        _ => value.to_owned(),
    }
}

fn decimal_minor(minor: i64) -> String {
    format!("{}.{:02}", minor / 100, (minor % 100).abs())
}

pub struct Exporter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl Exporter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            clock,
            audit,
        }
    }

    /// Exports a batch of posted entries to `target`. Replays of already
    /// exported payloads bump the ledger row and are reported, not
    /// re-emitted.
    pub async fn export_csv(
        &self,
        tenant: &TenantId,
        target: &str,
        entries: &[JournalEntry],
    ) -> ExportResult<ExportSummary> {
        let accounts = self.store.list_accounts(tenant).await?;
        let account_names: HashMap<&str, &str> = accounts
            .iter()
            .map(|account| (account.code.as_str(), account.name.as_str()))
            .collect();

        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        writer
            .write_record(COLUMNS)
            .map_err(|err| ExportError::Csv(err.to_string()))?;

        let mut new_count = 0_usize;
        let mut skipped_duplicate_count = 0_usize;

        for entry in entries {
            if entry.status != EntryStatus::Posted {
                return Err(ExportError::NotPosted(entry.je_id.clone()));
            }
            let full_id = external_id(tenant, target, entry);
            let now = self.clock.now();
            let inserted = self
                .store
                .insert_export_record_if_absent(ExportRecord {
                    je_id: entry.je_id.clone(),
                    tenant_id: tenant.clone(),
                    external_id: full_id.clone(),
                    target: target.to_owned(),
                    first_exported_at: now,
                    last_attempt_at: now,
                    attempts: 1,
                    status: ExportStatus::Posted,
                })
                .await?;

            let outcome = match inserted {
                ConditionalInsert::Inserted => {
                    self.write_entry_rows(&mut writer, entry, &full_id, &account_names)?;
                    new_count += 1;
                    "posted"
                }
                ConditionalInsert::Duplicate => {
                    let mut record = self
                        .store
                        .export_record(tenant, target, &full_id)
                        .await?
                        .ok_or_else(|| {
                            StorageError::NotFound(format!("export record {full_id}"))
                        })?;
                    record.attempts += 1;
                    record.last_attempt_at = now;
                    record.status = ExportStatus::SkippedDuplicate;
                    self.store.update_export_record(record).await?;
                    skipped_duplicate_count += 1;
                    "skipped_duplicate"
                }
            };

            self.audit
                .append(AppendEvent {
                    tenant_id: tenant.clone(),
                    entity_id: entry.je_id.clone(),
                    kind: AuditEventKind::ExportAttempt,
                    actor: "exporter".into(),
                    payload: serde_json::json!({
                        "target": target,
                        "external_id": full_id,
                        "outcome": outcome,
                    }),
                })
                .await
                .map_err(|err| ExportError::Audit(err.to_string()))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|err| ExportError::Csv(err.to_string()))?;
        let csv = String::from_utf8(bytes).map_err(|err| ExportError::Csv(err.to_string()))?;

        info!(
            tenant = tenant.as_str(),
            target,
            new_count,
            skipped_duplicate_count,
            "export batch finished"
        );
        Ok(ExportSummary {
            target: target.to_owned(),
            new_count,
            skipped_duplicate_count,
            csv,
        })
    }

    fn write_entry_rows(
        &self,
        writer: &mut csv::Writer<Vec<u8>>,
        entry: &JournalEntry,
        full_id: &str,
        account_names: &HashMap<&str, &str>,
    ) -> ExportResult<()> {
        for line in &entry.lines {
            let name = account_names.get(line.account_code.as_str()).ok_or_else(|| {
                ExportError::UnknownAccount {
                    je_id: entry.je_id.clone(),
                    account_code: line.account_code.clone(),
                }
            })?;
            let debit = if line.debit_minor > 0 {
                decimal_minor(line.debit_minor)
            } else {
                String::new()
            };
            let credit = if line.credit_minor > 0 {
                decimal_minor(line.credit_minor)
            } else {
                String::new()
            };
            // First 32 hex on the wire; the ledger keeps all 64.
            let record: [String; 11] = [
                full_id[..32].to_owned(),
                sanitize_field(&entry.je_id),
                entry.posted_at.to_string(),
                sanitize_field(&line.account_code),
                sanitize_field(name),
                debit,
                credit,
                sanitize_field(line.memo.as_deref().unwrap_or("")),
                entry.currency.clone(),
                sanitize_field(entry.rule_version_id.as_deref().unwrap_or("")),
                sanitize_field(entry.model_version_id.as_deref().unwrap_or("")),
            ];
            writer
                .write_record(&record)
                .map_err(|err| ExportError::Csv(err.to_string()))?;
        }
        Ok(())
    }
}
