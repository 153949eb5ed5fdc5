#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

use tally_journal::Clock;
use tally_journal::TenantId;
use tally_journal::Transaction;
use tally_journal::is_iso4217;

mod csv_parser;
mod ofx_parser;
mod pdf_parser;

pub use csv_parser::CsvStatementParser;
pub use ofx_parser::OfxStatementParser;
pub use pdf_parser::OcrProvider;
pub use pdf_parser::OcrText;
pub use pdf_parser::PdfStatementParser;
pub use pdf_parser::embedded_text;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported statement format: {0}")]
    UnsupportedFormat(String),
    #[error("input of {size} bytes exceeds the {cap} byte cap")]
    TooLarge { size: usize, cap: usize },
    #[error("statement headers unusable: {0}")]
    Header(String),
    #[error("csv error: {0}")]
    Csv(String),
    #[error("ocr provider failure: {0}")]
    Ocr(String),
    #[error("empty statement: {0}")]
    Empty(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementFormat {
    Csv,
    Ofx,
    Pdf,
}

impl StatementFormat {
    /// Infers the format from the file name extension, falling back to
    /// payload magic.
    pub fn infer(file_name: &str, bytes: &[u8]) -> IngestResult<Self> {
        let lowered = file_name.to_lowercase();
        if lowered.ends_with(".csv") || lowered.ends_with(".txt") {
            return Ok(StatementFormat::Csv);
        }
        if lowered.ends_with(".ofx") || lowered.ends_with(".qfx") {
            return Ok(StatementFormat::Ofx);
        }
        if lowered.ends_with(".pdf") {
            return Ok(StatementFormat::Pdf);
        }
        if bytes.starts_with(b"%PDF-") {
            return Ok(StatementFormat::Pdf);
        }
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]);
        if head.contains("OFXHEADER") || head.contains("<OFX>") {
            return Ok(StatementFormat::Ofx);
        }
        if head.contains(',') || head.contains(';') || head.contains('\t') {
            return Ok(StatementFormat::Csv);
        }
        Err(IngestError::UnsupportedFormat(file_name.to_owned()))
    }
}

/// One unparseable row. The batch keeps going; the caller reports these
/// individually.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DedupeMetrics {
    pub kept: usize,
    /// Duplicates dropped, whether within the batch or against already
    /// ingested transactions.
    pub dropped: usize,
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub transactions: Vec<Transaction>,
    pub row_errors: Vec<RowError>,
    pub dedupe: DedupeMetrics,
    /// Field confidences reported by the OCR provider, when the PDF path
    /// ran. Feeds the drift monitor.
    pub ocr_confidences: Vec<f64>,
}

/// Raw parsed row before it becomes a canonical transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    /// Zero-based data row index in the source file.
    pub row_index: usize,
    pub posted_at: NaiveDate,
    pub amount_minor: i64,
    pub currency: Option<String>,
    pub description: String,
    pub counterparty: Option<String>,
    pub memo: Option<String>,
    pub mcc: Option<String>,
    pub source_row_ref: String,
}

#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub rows: Vec<ParsedRow>,
    pub row_errors: Vec<RowError>,
    pub ocr_confidences: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Hard byte cap on a single statement upload.
    pub max_bytes: usize,
    /// Currency assumed when the statement does not carry one per row.
    pub default_currency: String,
    /// Candidate date formats tried in order.
    pub date_formats: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
            default_currency: "USD".into(),
            date_formats: vec![
                "%Y-%m-%d".into(),
                "%Y/%m/%d".into(),
                "%m/%d/%Y".into(),
                "%m-%d-%Y".into(),
                "%d %b %Y".into(),
            ],
        }
    }
}

pub(crate) fn parse_date(raw: &str, formats: &[String]) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    formats
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}

/// Parses a decimal money string into minor units, two fraction digits.
/// Thousands separators are tolerated; anything else malformed is an
/// error on that row.
pub(crate) fn parse_amount_minor(raw: &str) -> Result<i64, String> {
    let cleaned = raw.trim().replace([',', '$'], "");
    if cleaned.is_empty() {
        return Err("amount is empty".into());
    }
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => match cleaned.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
            Some(inner) => (true, inner),
            None => (false, cleaned.as_str()),
        },
    };
    let mut parts = digits.splitn(2, '.');
    let whole = parts.next().unwrap_or("0");
    let fraction = parts.next().unwrap_or("");
    if whole.is_empty() && fraction.is_empty() {
        return Err(format!("unparseable amount {raw:?}"));
    }
    if !whole.chars().all(|ch| ch.is_ascii_digit())
        || !fraction.chars().all(|ch| ch.is_ascii_digit())
    {
        return Err(format!("unparseable amount {raw:?}"));
    }
    let whole_value: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|err| format!("amount overflow in {raw:?}: {err}"))?
    };
    let fraction_minor = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map_err(|err| err.to_string())? * 10,
        _ => fraction[..2]
            .parse::<i64>()
            .map_err(|err| err.to_string())?,
    };
    let mut amount = whole_value
        .checked_mul(100)
        .and_then(|value| value.checked_add(fraction_minor))
        .ok_or_else(|| format!("amount overflow in {raw:?}"))?;
    if negative {
        amount = -amount;
    }
    Ok(amount)
}

fn txn_id_for(tenant: &TenantId, row: &ParsedRow, currency: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [
        tenant.as_str(),
        &row.posted_at.to_string(),
        &row.amount_minor.to_string(),
        currency,
        &row.description,
        row.counterparty.as_deref().unwrap_or(""),
    ] {
        hasher.update(field.as_bytes());
        hasher.update(b"|");
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("txn-{}", &digest[..16])
}

/// Statement ingestion front door. Parses, canonicalizes and dedupes one
/// uploaded file into a batch of transactions.
pub struct Ingestor {
    config: IngestConfig,
    clock: Arc<dyn Clock>,
    ocr: Option<Arc<dyn OcrProvider>>,
}

impl Ingestor {
    pub fn new(config: IngestConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            ocr: None,
        }
    }

    #[must_use]
    pub fn with_ocr(mut self, ocr: Arc<dyn OcrProvider>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    /// Ingests one statement, inferring the format from the file name
    /// and payload magic. `known_dedupe_keys` holds keys of already
    /// stored transactions; matching rows are dropped and counted.
    pub async fn ingest(
        &self,
        tenant: &TenantId,
        source_file_id: &str,
        file_name: &str,
        bytes: &[u8],
        known_dedupe_keys: &HashSet<String>,
    ) -> IngestResult<IngestOutcome> {
        let format = StatementFormat::infer(file_name, bytes)?;
        self.ingest_as(tenant, source_file_id, format, bytes, known_dedupe_keys)
            .await
    }

    /// Ingests one statement of a declared format.
    pub async fn ingest_as(
        &self,
        tenant: &TenantId,
        source_file_id: &str,
        format: StatementFormat,
        bytes: &[u8],
        known_dedupe_keys: &HashSet<String>,
    ) -> IngestResult<IngestOutcome> {
        if bytes.len() > self.config.max_bytes {
            return Err(IngestError::TooLarge {
                size: bytes.len(),
                cap: self.config.max_bytes,
            });
        }
        let parsed = match format {
            StatementFormat::Csv => {
                CsvStatementParser::new(&self.config).parse(bytes)?
            }
            StatementFormat::Ofx => OfxStatementParser::new(&self.config).parse(bytes)?,
            StatementFormat::Pdf => {
                PdfStatementParser::new(&self.config, self.ocr.clone())
                    .parse(bytes)
                    .await?
            }
        };
        debug!(
            rows = parsed.rows.len(),
            row_errors = parsed.row_errors.len(),
            "parsed statement {source_file_id}"
        );

        if parsed.rows.is_empty() && parsed.row_errors.is_empty() {
            return Err(IngestError::Empty(source_file_id.to_owned()));
        }

        let mut row_errors = parsed.row_errors;
        let mut seen: HashSet<String> = HashSet::new();
        let mut dedupe = DedupeMetrics::default();
        let mut transactions = Vec::new();
        let ingested_at = self.clock.now();

        for row in parsed.rows {
            let currency = row
                .currency
                .clone()
                .unwrap_or_else(|| self.config.default_currency.clone());
            if !is_iso4217(&currency) {
                row_errors.push(RowError {
                    row: row.row_index,
                    reason: format!("invalid ISO-4217 currency code {currency}"),
                });
                continue;
            }
            let txn = Transaction {
                txn_id: txn_id_for(tenant, &row, &currency),
                tenant_id: tenant.clone(),
                posted_at: row.posted_at,
                amount_minor: row.amount_minor,
                currency,
                description_raw: row.description,
                counterparty_raw: row.counterparty,
                counterparty_norm: None,
                memo: row.memo,
                mcc: row.mcc,
                source_file_id: source_file_id.to_owned(),
                source_row_ref: row.source_row_ref,
                ingested_at,
            };
            if let Err(err) = txn.validate() {
                row_errors.push(RowError {
                    row: row.row_index,
                    reason: err.to_string(),
                });
                continue;
            }
            let key = txn.dedupe_key();
            if known_dedupe_keys.contains(&key) || !seen.insert(key) {
                dedupe.dropped += 1;
                continue;
            }
            dedupe.kept += 1;
            transactions.push(txn);
        }

        if dedupe.dropped > 0 {
            warn!(
                dropped = dedupe.dropped,
                "dropped duplicate rows from {source_file_id}"
            );
        }

        Ok(IngestOutcome {
            transactions,
            row_errors,
            dedupe,
            ocr_confidences: parsed.ocr_confidences,
        })
    }
}
