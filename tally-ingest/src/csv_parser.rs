use csv::ReaderBuilder;
use csv::StringRecord;

use crate::IngestConfig;
use crate::IngestError;
use crate::IngestResult;
use crate::ParseOutput;
use crate::ParsedRow;
use crate::RowError;
use crate::parse_amount_minor;
use crate::parse_date;

const DATE_SYNONYMS: &[&str] = &[
    "date",
    "posted_at",
    "posted date",
    "post date",
    "transaction date",
    "txn date",
];
const DESCRIPTION_SYNONYMS: &[&str] = &[
    "description",
    "desc",
    "details",
    "narrative",
    "transaction description",
];
const AMOUNT_SYNONYMS: &[&str] = &["amount", "amt", "transaction amount", "value"];
const DEBIT_SYNONYMS: &[&str] = &["debit", "debit amount", "withdrawal", "money out"];
const CREDIT_SYNONYMS: &[&str] = &["credit", "credit amount", "deposit", "money in"];
const MEMO_SYNONYMS: &[&str] = &["memo", "note", "notes", "reference"];
const COUNTERPARTY_SYNONYMS: &[&str] = &["counterparty", "payee", "merchant", "vendor", "name"];
const CURRENCY_SYNONYMS: &[&str] = &["currency", "ccy", "currency code"];
const MCC_SYNONYMS: &[&str] = &["mcc", "mcc code", "category code"];

#[derive(Debug, Default)]
struct ColumnMap {
    date: Option<usize>,
    description: Option<usize>,
    amount: Option<usize>,
    debit: Option<usize>,
    credit: Option<usize>,
    memo: Option<usize>,
    counterparty: Option<usize>,
    currency: Option<usize>,
    mcc: Option<usize>,
}

impl ColumnMap {
    fn detect(headers: &StringRecord) -> IngestResult<Self> {
        let mut map = Self::default();
        for (index, header) in headers.iter().enumerate() {
            let key = header.trim().to_lowercase();
            let slot = if DATE_SYNONYMS.contains(&key.as_str()) {
                &mut map.date
            } else if DESCRIPTION_SYNONYMS.contains(&key.as_str()) {
                &mut map.description
            } else if AMOUNT_SYNONYMS.contains(&key.as_str()) {
                &mut map.amount
            } else if DEBIT_SYNONYMS.contains(&key.as_str()) {
                &mut map.debit
            } else if CREDIT_SYNONYMS.contains(&key.as_str()) {
                &mut map.credit
            } else if MEMO_SYNONYMS.contains(&key.as_str()) {
                &mut map.memo
            } else if COUNTERPARTY_SYNONYMS.contains(&key.as_str()) {
                &mut map.counterparty
            } else if CURRENCY_SYNONYMS.contains(&key.as_str()) {
                &mut map.currency
            } else if MCC_SYNONYMS.contains(&key.as_str()) {
                &mut map.mcc
            } else {
                continue;
            };
            if slot.is_none() {
                *slot = Some(index);
            }
        }
        if map.date.is_none() {
            return Err(IngestError::Header("no recognizable date column".into()));
        }
        if map.description.is_none() {
            return Err(IngestError::Header(
                "no recognizable description column".into(),
            ));
        }
        if map.amount.is_none() && (map.debit.is_none() || map.credit.is_none()) {
            return Err(IngestError::Header(
                "need a signed amount column or a debit/credit pair".into(),
            ));
        }
        Ok(map)
    }
}

/// Picks the delimiter whose count in the header line is highest.
fn detect_delimiter(header_line: &str) -> u8 {
    let candidates = [b',', b';', b'\t', b'|'];
    let mut best = b',';
    let mut best_count = 0;
    for candidate in candidates {
        let count = header_line.bytes().filter(|b| *b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

pub struct CsvStatementParser<'a> {
    config: &'a IngestConfig,
}

impl<'a> CsvStatementParser<'a> {
    pub fn new(config: &'a IngestConfig) -> Self {
        Self { config }
    }

    pub fn parse(&self, bytes: &[u8]) -> IngestResult<ParseOutput> {
        let text = String::from_utf8_lossy(bytes);
        let header_line = text.lines().next().unwrap_or("");
        let delimiter = detect_delimiter(header_line);

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(text.as_bytes());
        let headers = reader
            .headers()
            .map_err(|err| IngestError::Csv(err.to_string()))?
            .clone();
        let map = ColumnMap::detect(&headers)?;

        let mut rows = Vec::new();
        let mut row_errors = Vec::new();
        for (row_index, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    row_errors.push(RowError {
                        row: row_index,
                        reason: format!("csv error: {err}"),
                    });
                    continue;
                }
            };
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            match self.build_row(row_index, &record, &map) {
                Ok(row) => rows.push(row),
                Err(reason) => row_errors.push(RowError {
                    row: row_index,
                    reason,
                }),
            }
        }

        Ok(ParseOutput {
            rows,
            row_errors,
            ocr_confidences: Vec::new(),
        })
    }

    fn build_row(
        &self,
        row_index: usize,
        record: &StringRecord,
        map: &ColumnMap,
    ) -> Result<ParsedRow, String> {
        let field = |index: Option<usize>| -> Option<String> {
            index
                .and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };

        let date_raw =
            field(map.date).ok_or_else(|| "date field is empty".to_owned())?;
        let posted_at = parse_date(&date_raw, &self.config.date_formats)
            .ok_or_else(|| format!("unparseable date {date_raw:?}"))?;

        let description =
            field(map.description).ok_or_else(|| "description field is empty".to_owned())?;

        // A signed amount column wins; otherwise reconcile the
        // debit/credit pair into a bank-perspective signed amount.
        let amount_minor = if let Some(raw) = field(map.amount) {
            parse_amount_minor(&raw)?
        } else {
            let debit = field(map.debit)
                .map(|raw| parse_amount_minor(&raw))
                .transpose()?
                .unwrap_or(0);
            let credit = field(map.credit)
                .map(|raw| parse_amount_minor(&raw))
                .transpose()?
                .unwrap_or(0);
            if debit != 0 && credit != 0 {
                return Err("row carries both a debit and a credit".into());
            }
            credit - debit.abs()
        };

        Ok(ParsedRow {
            row_index,
            posted_at,
            amount_minor,
            currency: field(map.currency).map(|c| c.to_uppercase()),
            description,
            counterparty: field(map.counterparty),
            memo: field(map.memo),
            mcc: field(map.mcc),
            source_row_ref: format!("row:{}", row_index + 2),
        })
    }
}
